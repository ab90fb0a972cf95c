// ── Scheduled-rule timers ──
//
// Each scheduled rule owns one timer task. Handles live in an arena keyed
// by rule id and are cancelled explicitly on stop and reload. An action
// that panics ends its timer and is reported on the arena's fault
// channel, which the controller supervises.

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// A parsed cron expression.
///
/// Five-field expressions (`min hour dom mon dow`) get a leading `0`
/// seconds field; six and seven field expressions are taken as-is.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, String> {
        let trimmed = expression.trim();
        let normalized = match trimmed.split_whitespace().count() {
            5 => format!("0 {trimmed}"),
            6 | 7 => trimmed.to_owned(),
            n => return Err(format!("expected 5 to 7 fields, found {n}")),
        };
        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| e.to_string())?;
        Ok(Self {
            expression: trimmed.to_owned(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First firing strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

// Cancelling lets an in-flight action finish; the loop exits at its next
// wait.
struct TimerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owned timer handles, one per scheduled rule id.
pub struct ScheduleArena {
    timers: HashMap<String, TimerHandle>,
    faults: watch::Sender<Option<String>>,
}

impl Default for ScheduleArena {
    fn default() -> Self {
        Self::new()
    }
}

impl ScheduleArena {
    pub fn new() -> Self {
        let (faults, _) = watch::channel(None);
        Self {
            timers: HashMap::new(),
            faults,
        }
    }

    /// Holds the first panic raised by a timer action, if any.
    pub fn faults(&self) -> watch::Receiver<Option<String>> {
        self.faults.subscribe()
    }

    /// Start a timer for `rule_id` that calls `fire` at every occurrence
    /// of `schedule` until cancelled. Replaces any existing timer for the
    /// same id.
    pub fn spawn<F, Fut>(&mut self, rule_id: &str, schedule: CronSchedule, fire: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel(rule_id);

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let id = rule_id.to_owned();
        let faults = self.faults.clone();
        let task = tokio::spawn(async move {
            let mut last_fired = Utc::now();
            loop {
                let Some(next) = schedule.next_after(last_fired.max(Utc::now())) else {
                    debug!(rule = %id, "schedule has no further occurrences");
                    break;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                trace!(rule = %id, %next, "timer armed");

                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(wait) => {}
                }
                if token.is_cancelled() {
                    break;
                }
                last_fired = next;
                if let Err(e) = tokio::spawn(fire()).await {
                    if e.is_panic() {
                        error!(rule = %id, "scheduled action panicked, timer stopped");
                        faults.send_if_modified(|current| {
                            if current.is_some() {
                                return false;
                            }
                            *current = Some(format!("timer for rule '{id}' panicked: {e}"));
                            true
                        });
                        break;
                    }
                }
            }
        });

        self.timers
            .insert(rule_id.to_owned(), TimerHandle { cancel, task });
    }

    pub fn cancel(&mut self, rule_id: &str) -> bool {
        match self.timers.remove(rule_id) {
            Some(handle) => {
                handle.cancel.cancel();
                drop(handle.task);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (id, handle) in self.timers.drain() {
            trace!(rule = %id, "cancelling timer");
            handle.cancel.cancel();
        }
    }

    pub fn contains(&self, rule_id: &str) -> bool {
        self.timers.contains_key(rule_id)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

impl Drop for ScheduleArena {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn five_field_expressions_get_a_seconds_field() {
        let schedule = CronSchedule::parse("30 6 * * *").unwrap();
        let base = DateTime::parse_from_rfc3339("2026-05-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let next = schedule.next_after(base).unwrap();
        assert_eq!(next.to_rfc3339(), "2026-05-01T06:30:00+00:00");
        assert_eq!(schedule.expression(), "30 6 * * *");
    }

    #[test]
    fn rejects_wrong_field_count_and_garbage() {
        assert!(CronSchedule::parse("* *").is_err());
        assert!(CronSchedule::parse("a b c d e").is_err());
    }

    #[tokio::test]
    async fn cancelled_timer_stops_firing() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut arena = ScheduleArena::new();
        let counter = Arc::clone(&fired);
        arena.spawn("every-second", CronSchedule::parse("* * * * * *").unwrap(), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(arena.contains("every-second"));

        tokio::time::timeout(Duration::from_secs(3), async {
            while fired.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        assert!(arena.cancel("every-second"));
        assert!(arena.is_empty());
        let after_cancel = fired.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), after_cancel);
        assert!(arena.faults().borrow().is_none());
    }

    #[tokio::test]
    async fn panicking_action_is_reported_as_a_fault() {
        let mut arena = ScheduleArena::new();
        let mut faults = arena.faults();
        arena.spawn("boom", CronSchedule::parse("* * * * * *").unwrap(), || async {
            panic!("actuator bus exploded");
        });

        let fault = tokio::time::timeout(Duration::from_secs(3), faults.wait_for(Option::is_some))
            .await
            .unwrap()
            .unwrap()
            .clone()
            .unwrap();
        assert!(fault.contains("boom"), "got {fault}");
    }
}
