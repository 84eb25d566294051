//! Per-(master, slave) PID servo.
//!
//! Each selected sync instance drives one servo against its slave clock. The
//! servo filters offset measurements (outlier rejection, FIR smoothing),
//! smooths the measured mean path delay, and turns the result into either a
//! step or a frequency slew according to the step policy.

pub mod filters;

use bitflags::bitflags;
use serde::Deserialize;

use crate::config::ServoConfig;
use crate::time::{TimeSpec, NSEC_PER_SEC};

pub use filters::{FirFilter, MeanPathDelayFilter, OutlierFilter};

/// When the servo may step rather than slew.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepPolicy {
    /// Never step; always slew, however large the offset.
    SlewOnly,
    /// Step whenever the offset magnitude exceeds the threshold.
    #[default]
    SlewAndStep,
    /// Step at most once, on the first over-threshold measurement.
    StepOnceAtStartup,
}

bitflags! {
    /// Externally-driven servo control bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ServoCtl: u32 {
        /// Measurements update filters and PID state.
        const DISCIPLINING_ENABLED = 1 << 0;
        /// A leap second is imminent: suppress every adjustment.
        const LEAP_SECOND_GUARD = 1 << 1;
        /// This servo's instance is elected; corrections may be applied.
        const CLOCK_CONTROL_ENABLED = 1 << 2;
    }
}

/// What the servo wants done to the slave clock for one measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Correction {
    None,
    /// Step by this signed amount.
    Step(TimeSpec),
    /// Slew at this rate in ppb.
    Slew(f64),
}

/// Lifetime counters, surfaced in statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServoCounters {
    pub clock_steps: u64,
    pub outliers: u64,
    pub outliers_num_samples: u64,
}

/// PID servo for one (master, slave) pairing.
pub struct Servo {
    name: String,
    kp: f64,
    ki: f64,
    kd: f64,
    step_threshold_ns: i64,
    step_policy: StepPolicy,
    max_freq_adj_ppb: f64,
    integral: f64,
    last_error: Option<f64>,
    last_update: Option<TimeSpec>,
    outlier: OutlierFilter,
    fir: FirFilter,
    mpd: MeanPathDelayFilter,
    ctl: ServoCtl,
    stepped_at_startup: bool,
    clock_steps: u64,
}

impl Servo {
    pub fn new(name: &str, cfg: &ServoConfig) -> Self {
        Self {
            name: name.to_string(),
            kp: cfg.kp,
            ki: cfg.ki,
            kd: cfg.kd,
            step_threshold_ns: (cfg.step_threshold_s * NSEC_PER_SEC as f64) as i64,
            step_policy: cfg.step_policy,
            max_freq_adj_ppb: cfg.max_freq_adj_ppb,
            integral: 0.0,
            last_error: None,
            last_update: None,
            outlier: OutlierFilter::new(cfg.outlier_filter_size, cfg.outlier_threshold),
            fir: FirFilter::new(cfg.fir_filter_size),
            mpd: MeanPathDelayFilter::new(cfg.mpd_filter_size, cfg.mpd_ageing),
            ctl: ServoCtl::DISCIPLINING_ENABLED,
            stepped_at_startup: false,
            clock_steps: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ctl(&self) -> ServoCtl {
        self.ctl
    }

    /// Apply a control mask: bits in `mask` take the value given in `flags`.
    pub fn control(&mut self, mask: ServoCtl, flags: ServoCtl) {
        self.ctl = (self.ctl - mask) | (flags & mask);
    }

    pub fn counters(&self) -> ServoCounters {
        ServoCounters {
            clock_steps: self.clock_steps,
            outliers: self.outlier.outliers,
            outliers_num_samples: self.outlier.num_samples,
        }
    }

    /// Current integral term, exposed for convergence checks.
    pub fn integral(&self) -> f64 {
        self.integral
    }

    /// Runtime coefficient adjustment (`pid_adjust` command). `None` keeps
    /// the current value; `reset` clears accumulated state.
    pub fn adjust_pid(&mut self, kp: Option<f64>, ki: Option<f64>, kd: Option<f64>, reset: bool) {
        if let Some(kp) = kp {
            self.kp = kp;
        }
        if let Some(ki) = ki {
            self.ki = ki;
        }
        if let Some(kd) = kd {
            self.kd = kd;
        }
        if reset {
            self.reset();
        }
        log::info!(
            "servo {}: pid kp={} ki={} kd={}{}",
            self.name,
            self.kp,
            self.ki,
            self.kd,
            if reset { " (state reset)" } else { "" }
        );
    }

    /// Clear all accumulated state; used after a step or a master change.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = None;
        self.last_update = None;
        self.outlier.reset();
        self.fir.reset();
        self.mpd.reset();
    }

    /// Feed a path-delay measurement and return the filtered mean.
    pub fn update_path_delay(&mut self, delay_ns: f64) -> f64 {
        self.mpd.update(delay_ns)
    }

    pub fn mean_path_delay(&self) -> f64 {
        self.mpd.mean()
    }

    /// Feed one offset-from-master measurement (slave minus master, ns) and
    /// decide the correction. The caller applies it to the slave clock.
    pub fn update(&mut self, offset_ns: i64, timestamp: TimeSpec) -> Correction {
        if self.ctl.contains(ServoCtl::LEAP_SECOND_GUARD) {
            log::debug!("servo {}: leap guard active, measurement suppressed", self.name);
            return Correction::None;
        }
        if !self.ctl.contains(ServoCtl::DISCIPLINING_ENABLED) {
            return Correction::None;
        }

        // Step decision uses the unfiltered magnitude.
        if offset_ns.abs() > self.step_threshold_ns {
            let may_step = match self.step_policy {
                StepPolicy::SlewOnly => false,
                StepPolicy::SlewAndStep => true,
                StepPolicy::StepOnceAtStartup => !self.stepped_at_startup,
            };
            if may_step {
                self.stepped_at_startup = true;
                self.clock_steps += 1;
                self.reset();
                if !self.ctl.contains(ServoCtl::CLOCK_CONTROL_ENABLED) {
                    return Correction::None;
                }
                return Correction::Step(TimeSpec::from_ns(-offset_ns));
            }
        }

        if !self.outlier.accept(offset_ns as f64) {
            log::debug!("servo {}: outlier {offset_ns}ns discarded", self.name);
            return Correction::None;
        }
        let error = self.fir.update(offset_ns as f64);

        let dt = match self.last_update {
            Some(prev) if timestamp > prev => (timestamp - prev).as_secs_f64(),
            _ => 1.0,
        };
        self.last_update = Some(timestamp);

        self.integral += self.ki * error * dt;
        let derivative = match self.last_error {
            Some(prev) => (error - prev) / dt,
            None => 0.0,
        };
        self.last_error = Some(error);

        let raw = self.kp * error + self.integral + self.kd * derivative;
        // Positive offset means the slave runs ahead: slow it down.
        let ppb = (-raw).clamp(-self.max_freq_adj_ppb, self.max_freq_adj_ppb);
        if (-raw).abs() > self.max_freq_adj_ppb {
            log::warn!("servo {}: frequency correction saturated at {ppb} ppb", self.name);
        }
        if !self.ctl.contains(ServoCtl::CLOCK_CONTROL_ENABLED) {
            // Keep observing, apply nothing.
            return Correction::None;
        }
        Correction::Slew(ppb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServoConfig;

    fn servo() -> Servo {
        let mut s = Servo::new("test", &ServoConfig::default());
        s.control(ServoCtl::CLOCK_CONTROL_ENABLED, ServoCtl::CLOCK_CONTROL_ENABLED);
        s
    }

    fn ts(sec: i64) -> TimeSpec {
        TimeSpec::new(sec, 0)
    }

    #[test]
    fn test_over_threshold_offset_steps() {
        let mut s = servo();
        // 2 s offset, default threshold 0.9 s.
        match s.update(2 * NSEC_PER_SEC, ts(0)) {
            Correction::Step(amount) => assert_eq!(amount.as_ns(), -2 * NSEC_PER_SEC),
            other => panic!("expected step, got {other:?}"),
        }
        assert_eq!(s.counters().clock_steps, 1);
    }

    #[test]
    fn test_slew_only_policy_never_steps() {
        let mut cfg = ServoConfig::default();
        cfg.step_policy = StepPolicy::SlewOnly;
        let mut s = Servo::new("t", &cfg);
        s.control(ServoCtl::CLOCK_CONTROL_ENABLED, ServoCtl::CLOCK_CONTROL_ENABLED);
        match s.update(5 * NSEC_PER_SEC, ts(0)) {
            Correction::Slew(_) => {}
            other => panic!("expected slew, got {other:?}"),
        }
        assert_eq!(s.counters().clock_steps, 0);
    }

    #[test]
    fn test_step_once_at_startup() {
        let mut cfg = ServoConfig::default();
        cfg.step_policy = StepPolicy::StepOnceAtStartup;
        let mut s = Servo::new("t", &cfg);
        s.control(ServoCtl::CLOCK_CONTROL_ENABLED, ServoCtl::CLOCK_CONTROL_ENABLED);
        assert!(matches!(s.update(2 * NSEC_PER_SEC, ts(0)), Correction::Step(_)));
        // A later excursion may only slew.
        assert!(matches!(s.update(2 * NSEC_PER_SEC, ts(1)), Correction::Slew(_)));
    }

    #[test]
    fn test_zero_offset_preserves_integral_state() {
        let mut s = servo();
        // An initial transient, then convergence to zero error.
        for i in 0..4 {
            s.update(100, ts(i));
        }
        for i in 4..16 {
            s.update(0, ts(i));
        }
        let integral = s.integral();
        assert!(integral.abs() > 0.0);
        let c = s.update(0, ts(30));
        assert!((s.integral() - integral).abs() < 1e-12);
        // The correction holds the accumulated frequency, adding nothing.
        match c {
            Correction::Slew(ppb) => assert!((ppb + integral).abs() < 1e-9),
            other => panic!("expected slew, got {other:?}"),
        }
    }

    #[test]
    fn test_leap_guard_suppresses_all_adjustments() {
        let mut s = servo();
        s.update(500, ts(0));
        s.control(ServoCtl::LEAP_SECOND_GUARD, ServoCtl::LEAP_SECOND_GUARD);
        let integral = s.integral();
        assert_eq!(s.update(2 * NSEC_PER_SEC, ts(1)), Correction::None);
        assert_eq!(s.update(500, ts(2)), Correction::None);
        assert!((s.integral() - integral).abs() < 1e-12);
        // Clearing the guard resumes from the next measurement.
        s.control(ServoCtl::LEAP_SECOND_GUARD, ServoCtl::empty());
        assert!(!matches!(s.update(500, ts(3)), Correction::None));
    }

    #[test]
    fn test_observe_only_when_control_disabled() {
        let mut s = servo();
        s.control(ServoCtl::CLOCK_CONTROL_ENABLED, ServoCtl::empty());
        // Filters and PID state still advance, output is suppressed.
        assert_eq!(s.update(1000, ts(0)), Correction::None);
        assert_eq!(s.update(1000, ts(1)), Correction::None);
        assert!(s.integral().abs() > 0.0);
    }

    #[test]
    fn test_path_delay_filtering() {
        let mut s = servo();
        s.update_path_delay(1000.0);
        s.update_path_delay(1100.0);
        let m = s.update_path_delay(1050.0);
        assert!(m > 1000.0 && m < 1100.0);
    }
}
