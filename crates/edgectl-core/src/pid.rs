// ── PID controller ──
//
// Discrete single-loop PID over irregular sampling intervals. `dt` is
// measured with a monotonic clock so wall-clock jumps cannot produce a
// negative interval.

use std::time::Instant;

use crate::model::PidParams;

/// Intervals shorter than this are treated as "same instant".
const MIN_DT_SECS: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct PidController {
    params: PidParams,
    integral: f64,
    last_error: f64,
    last_time: Instant,
    last_output: f64,
}

impl PidController {
    pub fn new(params: PidParams) -> Self {
        Self::new_at(params, Instant::now())
    }

    pub fn new_at(params: PidParams, now: Instant) -> Self {
        Self {
            last_output: 0.0_f64.max(params.output_min).min(params.output_max),
            params,
            integral: 0.0,
            last_error: 0.0,
            last_time: now,
        }
    }

    pub fn update(&mut self, measured: f64) -> f64 {
        self.update_at(measured, Instant::now())
    }

    /// Advance the loop with a sample taken at `now`.
    ///
    /// When `now` is not meaningfully after the previous sample the
    /// integral and derivative terms are left untouched for this call, so
    /// the output stays finite and deterministic. A non-finite `measured`
    /// is ignored: no state changes and the previous output is returned.
    pub fn update_at(&mut self, measured: f64, now: Instant) -> f64 {
        if !measured.is_finite() {
            return self.last_output;
        }
        let p = &self.params;
        let dt = now.saturating_duration_since(self.last_time).as_secs_f64();
        let error = p.setpoint - measured;

        let (integral_step, derivative) = if dt > MIN_DT_SECS {
            (error * dt, (error - self.last_error) / dt)
        } else {
            (0.0, 0.0)
        };

        self.integral += integral_step;
        let raw = p.kp * error + p.ki * self.integral + p.kd * derivative;
        let output = raw.clamp(p.output_min, p.output_max);

        // Anti-windup: do not accumulate while saturated.
        if raw < p.output_min || raw > p.output_max {
            self.integral -= integral_step;
        }

        self.last_error = error;
        self.last_time = now;
        self.last_output = output;
        output
    }

    pub fn reset(&mut self) {
        self.reset_at(Instant::now());
    }

    pub fn reset_at(&mut self, now: Instant) {
        self.integral = 0.0;
        self.last_error = 0.0;
        self.last_time = now;
    }

    /// Retarget without clearing accumulated state.
    pub fn set_setpoint(&mut self, setpoint: f64) {
        self.params.setpoint = setpoint;
    }

    pub fn params(&self) -> &PidParams {
        &self.params
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn params() -> PidParams {
        PidParams {
            kp: 1.0,
            ki: 0.0,
            kd: 0.0,
            setpoint: 50.0,
            output_min: 0.0,
            output_max: 100.0,
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn proportional_only_tracks_error() {
        let t0 = Instant::now();
        let mut pid = PidController::new_at(params(), t0);
        let out = pid.update_at(30.0, t0 + Duration::from_secs(1));
        assert!(close(out, 20.0));
    }

    #[test]
    fn saturated_output_is_clamped_and_integral_frozen() {
        let t0 = Instant::now();
        let mut pid = PidController::new_at(
            PidParams {
                ki: 0.5,
                ..params()
            },
            t0,
        );

        let mut t = t0;
        for _ in 0..10 {
            t += Duration::from_secs(1);
            let out = pid.update_at(-1000.0, t);
            assert!(close(out, 100.0));
            assert!(close(pid.integral(), 0.0));
        }
    }

    #[test]
    fn clamps_low_side() {
        let t0 = Instant::now();
        let mut pid = PidController::new_at(params(), t0);
        let out = pid.update_at(80.0, t0 + Duration::from_secs(1));
        assert!(close(out, 0.0));
    }

    #[test]
    fn zero_dt_is_finite_and_deterministic() {
        let t0 = Instant::now();
        let mut pid = PidController::new_at(
            PidParams {
                ki: 1.0,
                kd: 1.0,
                ..params()
            },
            t0,
        );

        let first = pid.update_at(40.0, t0);
        let second = pid.update_at(40.0, t0);
        assert!(first.is_finite());
        assert!(second.is_finite());
        assert!(close(first, second));
        assert!(close(first, 10.0));
        assert!(close(pid.integral(), 0.0));
    }

    #[test]
    fn non_finite_measurement_leaves_state_untouched() {
        let t0 = Instant::now();
        let mut pid = PidController::new_at(
            PidParams {
                kp: 0.0,
                ki: 1.0,
                ..params()
            },
            t0,
        );

        let before = pid.update_at(45.0, t0 + Duration::from_secs(2));
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let out = pid.update_at(bad, t0 + Duration::from_secs(3));
            assert!(close(out, before));
            assert!(close(pid.integral(), 10.0));
        }

        // dt spans the ignored samples: 2s more at error 5.
        let out = pid.update_at(45.0, t0 + Duration::from_secs(4));
        assert!(close(out, 20.0));
    }

    #[test]
    fn integral_accumulates_below_saturation() {
        let t0 = Instant::now();
        let mut pid = PidController::new_at(
            PidParams {
                kp: 0.0,
                ki: 1.0,
                ..params()
            },
            t0,
        );

        pid.update_at(45.0, t0 + Duration::from_secs(2));
        assert!(close(pid.integral(), 10.0));
        let out = pid.update_at(45.0, t0 + Duration::from_secs(4));
        assert!(close(out, 20.0));
    }

    #[test]
    fn derivative_uses_error_change_over_dt() {
        let t0 = Instant::now();
        let mut pid = PidController::new_at(
            PidParams {
                kp: 0.0,
                kd: 2.0,
                ..params()
            },
            t0,
        );
        pid.update_at(50.0, t0 + Duration::from_secs(1));
        // error goes 0 -> 10 over 2s: derivative 5, times kd 2
        let out = pid.update_at(40.0, t0 + Duration::from_secs(3));
        assert!(close(out, 10.0));
    }

    #[test]
    fn reset_clears_state_but_setpoint_change_does_not() {
        let t0 = Instant::now();
        let mut pid = PidController::new_at(
            PidParams {
                kp: 0.0,
                ki: 1.0,
                ..params()
            },
            t0,
        );
        pid.update_at(45.0, t0 + Duration::from_secs(1));
        pid.set_setpoint(60.0);
        assert!(close(pid.integral(), 5.0));
        assert!(close(pid.params().setpoint, 60.0));

        pid.reset_at(t0 + Duration::from_secs(2));
        assert!(close(pid.integral(), 0.0));
    }
}
