// ── Message transport ──
//
// Store-and-forward facade over a `BrokerLink`. Every outbound message is
// written to the persistent queue first; while the link is up it is also
// handed to the session straight away, tagged with its queue id. The
// entry is flagged sent only when the broker's PUBACK for that tag comes
// back. Whatever is left unsent goes out from the flusher, which runs on
// every (re)connect, after a failed direct publish is followed by a good
// one, and on a fixed retry tick.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use edgectl_api::{BrokerLink, DeliveryTag, LinkEvent, LinkState, Topics};
use serde::Serialize;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::ControlCommand;
use crate::error::CoreError;
use crate::queue::PersistentQueue;

/// Outcome of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the broker session. The queue entry is flagged sent when
    /// the broker acknowledges it.
    Sent,
    /// Buffered; will go out on the next flush.
    Queued,
    /// Neither delivered nor buffered (link down and storage failing).
    Dropped,
}

pub struct MessageTransport {
    link: Arc<dyn BrokerLink>,
    queue: Arc<PersistentQueue>,
    topics: Topics,
    drain_limit: u32,
    flush_lock: Mutex<()>,
    /// Queue ids handed to the session and not yet acknowledged.
    in_flight: std::sync::Mutex<HashSet<i64>>,
    flush_wanted: Notify,
    /// Set when a direct publish failed while the link looked up.
    backlog: AtomicBool,
}

impl MessageTransport {
    pub fn new(
        link: Arc<dyn BrokerLink>,
        queue: Arc<PersistentQueue>,
        topics: Topics,
        drain_limit: u32,
    ) -> Self {
        Self {
            link,
            queue,
            topics,
            drain_limit: drain_limit.max(1),
            flush_lock: Mutex::new(()),
            in_flight: std::sync::Mutex::new(HashSet::new()),
            flush_wanted: Notify::new(),
            backlog: AtomicBool::new(false),
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn queue(&self) -> &Arc<PersistentQueue> {
        &self.queue
    }

    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }

    // ── In-flight bookkeeping ────────────────────────────────────────

    /// Returns `false` if the entry is already awaiting an ack.
    fn claim(&self, id: i64) -> bool {
        self.in_flight.lock().map_or(true, |mut ids| ids.insert(id))
    }

    fn release(&self, id: i64) {
        if let Ok(mut ids) = self.in_flight.lock() {
            ids.remove(&id);
        }
    }

    fn forget_in_flight(&self) {
        if let Ok(mut ids) = self.in_flight.lock() {
            if !ids.is_empty() {
                debug!(count = ids.len(), "unacknowledged messages will be resent");
            }
            ids.clear();
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().map_or(0, |ids| ids.len())
    }

    // ── Outbound ─────────────────────────────────────────────────────

    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Delivery {
        let id = self.queue.enqueue(topic, &payload).await;

        if !self.link.state().is_connected() {
            return if id.is_some() {
                Delivery::Queued
            } else {
                warn!(topic, "link down and queue unavailable, message dropped");
                Delivery::Dropped
            };
        }

        if id.is_some_and(|id| !self.claim(id)) {
            // A concurrent flush picked it up first.
            return Delivery::Queued;
        }

        match self.link.publish(topic, payload, id).await {
            Ok(()) => {
                if self.backlog.swap(false, Ordering::SeqCst) {
                    self.flush_wanted.notify_one();
                }
                Delivery::Sent
            }
            Err(e) => {
                debug!(topic, error = %e, "direct publish failed, left queued");
                match id {
                    Some(id) => {
                        self.release(id);
                        self.backlog.store(true, Ordering::SeqCst);
                        Delivery::Queued
                    }
                    None => Delivery::Dropped,
                }
            }
        }
    }

    pub async fn publish_json<T: Serialize + Sync>(
        &self,
        topic: &str,
        value: &T,
    ) -> Result<Delivery, CoreError> {
        let payload = serde_json::to_vec(value)?;
        Ok(self.publish(topic, payload).await)
    }

    /// The broker confirmed entry `id`: flag it sent.
    pub async fn acknowledge(&self, id: DeliveryTag) {
        if let Err(e) = self.queue.mark_sent(id).await {
            warn!(id, error = %e, "failed to flag entry sent, it will be resent");
        }
        self.release(id);
    }

    /// Hand every unsent queue entry that is not already awaiting an ack
    /// to the session, oldest first, in batches of `drain_limit`. Stops
    /// at the first publish failure and returns how many entries went
    /// out.
    pub async fn flush(&self) -> Result<usize, CoreError> {
        let _guard = self.flush_lock.lock().await;
        let mut handed_over = 0;
        let mut cursor = 0;

        loop {
            if !self.link.state().is_connected() {
                break;
            }
            let batch = self.queue.drain_after(cursor, self.drain_limit).await?;
            let Some(last) = batch.last() else {
                break;
            };
            cursor = last.id;
            for entry in batch {
                if !self.claim(entry.id) {
                    continue;
                }
                let id = entry.id;
                if let Err(e) = self.link.publish(&entry.topic, entry.payload, Some(id)).await {
                    self.release(id);
                    self.backlog.store(true, Ordering::SeqCst);
                    debug!(id, error = %e, "flush interrupted");
                    return Ok(handed_over);
                }
                handed_over += 1;
            }
        }

        if handed_over > 0 {
            info!(count = handed_over, "flushed queued messages");
        }
        Ok(handed_over)
    }

    /// Run [`flush`](Self::flush) whenever one is requested and on every
    /// `retry_interval` tick, until cancelled.
    pub async fn run_flusher(self: Arc<Self>, retry_interval: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(retry_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = self.flush_wanted.notified() => {}
                _ = interval.tick() => {}
            }
            if let Err(e) = self.flush().await {
                warn!(error = %e, "queue flush failed");
            }
        }
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.link.disconnect().await {
            warn!(error = %e, "broker disconnect failed");
        }
    }

    // ── Link events ──────────────────────────────────────────────────

    async fn subscribe_commands(&self) {
        for topic in self.topics.command_subscriptions() {
            if let Err(e) = self.link.subscribe(&topic).await {
                warn!(topic = %topic, error = %e, "command subscription failed");
            }
        }
    }

    /// Route an inbound message to the engine. Malformed payloads are
    /// logged and dropped.
    async fn dispatch(&self, topic: &str, payload: &[u8], commands: &mpsc::Sender<ControlCommand>) {
        let Some(kind) = self.topics.classify(topic) else {
            debug!(topic, "ignoring message on unrelated topic");
            return;
        };
        match ControlCommand::decode(kind, payload) {
            Ok(command) => {
                info!(command = command.name(), "received command");
                if commands.send(command).await.is_err() {
                    debug!("command channel closed, dropping command");
                }
            }
            Err(e) => warn!(topic, error = %e, "dropping malformed command"),
        }
    }

    /// Consume link events until cancelled or the session ends.
    ///
    /// On every (re)connect: subscribe to the command topics, then wake
    /// the flusher so inbound commands are not held up by the backlog.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<LinkEvent>,
        commands: mpsc::Sender<ControlCommand>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                debug!("link event channel closed");
                break;
            };

            match event {
                LinkEvent::Connected => {
                    info!("broker connected");
                    self.subscribe_commands().await;
                    self.flush_wanted.notify_one();
                }
                LinkEvent::Disconnected { reason } => {
                    warn!(reason = %reason, "broker connection lost, buffering outbound messages");
                    self.forget_in_flight();
                }
                LinkEvent::Acked { tag } => self.acknowledge(tag).await,
                LinkEvent::Message { topic, payload } => {
                    self.dispatch(&topic, &payload, &commands).await;
                }
            }
        }
    }
}

// ── MemoryLink ───────────────────────────────────────────────────────

/// In-process `BrokerLink` that records publishes.
///
/// Starts disconnected. Used for `--offline` runs, where everything stays
/// queued, and as the broker stand-in in tests. Tagged publishes are
/// held as unacknowledged until [`take_unacked`](Self::take_unacked), or
/// acknowledged at once when an event sink is attached with
/// [`ack_into`](Self::ack_into).
#[derive(Default)]
pub struct MemoryLink {
    connected: AtomicBool,
    fail_publishes: AtomicBool,
    published: std::sync::Mutex<Vec<(String, Vec<u8>)>>,
    subscriptions: std::sync::Mutex<Vec<String>>,
    unacked: std::sync::Mutex<Vec<DeliveryTag>>,
    ack_sink: std::sync::Mutex<Option<mpsc::Sender<LinkEvent>>>,
}

impl MemoryLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make publishes fail while the link still reports connected.
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Acknowledge every later tagged publish with a [`LinkEvent::Acked`]
    /// on `events`.
    pub fn ack_into(&self, events: mpsc::Sender<LinkEvent>) {
        if let Ok(mut sink) = self.ack_sink.lock() {
            *sink = Some(events);
        }
    }

    /// Tags published but not yet acknowledged, oldest first.
    pub fn take_unacked(&self) -> Vec<DeliveryTag> {
        self.unacked
            .lock()
            .map(|mut tags| std::mem::take(&mut *tags))
            .unwrap_or_default()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    pub fn published_to(&self, topic: &str) -> Vec<serde_json::Value> {
        self.published()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .filter_map(|(_, p)| serde_json::from_slice(&p).ok())
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    fn settle(&self, tag: DeliveryTag) {
        let sink = self.ack_sink.lock().ok().and_then(|s| s.clone());
        let acked = sink.is_some_and(|sink| sink.try_send(LinkEvent::Acked { tag }).is_ok());
        if !acked {
            if let Ok(mut unacked) = self.unacked.lock() {
                unacked.push(tag);
            }
        }
    }
}

#[async_trait]
impl BrokerLink for MemoryLink {
    fn state(&self) -> LinkState {
        if self.connected.load(Ordering::SeqCst) {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        }
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        tag: Option<DeliveryTag>,
    ) -> Result<(), edgectl_api::Error> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(edgectl_api::Error::NotConnected);
        }
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(edgectl_api::Error::Connection("injected publish failure".into()));
        }
        if let Ok(mut published) = self.published.lock() {
            published.push((topic.to_owned(), payload));
        }
        if let Some(tag) = tag {
            self.settle(tag);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), edgectl_api::Error> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(edgectl_api::Error::NotConnected);
        }
        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.push(topic.to_owned());
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), edgectl_api::Error> {
        self.set_connected(false);
        Ok(())
    }
}
