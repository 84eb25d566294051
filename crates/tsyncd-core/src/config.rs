//! Daemon configuration tree.
//!
//! The native configuration-file dialect of the daemon is parsed outside the
//! core; the core accepts this typed tree, which the CLI deserializes from
//! JSON. Every field carries the default the daemon ships with.

use serde::Deserialize;

use crate::servo::StepPolicy;
use crate::sync::ptp::PtpProfile;

/// Policy for threads that have been asked to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ZombiePolicy {
    /// Free thread bookkeeping as soon as the join completes.
    #[default]
    Immediate,
    /// Keep the name and exit code queryable until the process exits.
    DeferToExit,
}

/// Which sync module a configured instance runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    Ptp,
    Pps,
    Freerun,
    NtpHelper,
}

impl std::fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ptp => write!(f, "ptp"),
            Self::Pps => write!(f, "pps"),
            Self::Freerun => write!(f, "freerun"),
            Self::NtpHelper => write!(f, "ntp_helper"),
        }
    }
}

/// One configured sync instance.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    pub name: String,
    pub module: ModuleKind,
    /// Interface the instance binds to. Freerun may instead name a clock.
    #[serde(default)]
    pub interface: Option<String>,
    /// Smaller is stronger. Mirrors the selector's first ordering key.
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// PTP-only knobs; ignored by other modules.
    #[serde(default)]
    pub ptp: PtpConfig,
    /// Freerun-only: explicit local reference clock name ("system" or an
    /// interface name). `None` selects by descent from `interface`.
    #[serde(default)]
    pub clock: Option<String>,
}

fn default_priority() -> u8 {
    128
}

/// PTP port and protocol parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct PtpConfig {
    #[serde(default)]
    pub profile: PtpProfile,
    #[serde(default = "default_domain")]
    pub domain: u8,
    /// log2 seconds between our own Announce transmissions when master.
    #[serde(default = "default_announce_interval")]
    pub log_announce_interval: i8,
    #[serde(default = "default_sync_interval")]
    pub log_sync_interval: i8,
    #[serde(default = "default_delay_req_interval")]
    pub log_delay_req_interval: i8,
    /// Multiples of the announce interval before a foreign master expires.
    #[serde(default = "default_announce_timeout")]
    pub announce_receipt_timeout: u8,
    /// Cap on tracked foreign masters per port.
    #[serde(default = "default_foreign_cap")]
    pub foreign_record_cap: usize,
    /// Window in which a hardware timestamp must arrive before the
    /// corresponding alarm is raised, in seconds.
    #[serde(default = "default_ts_window")]
    pub timestamp_window_s: f64,
}

fn default_domain() -> u8 {
    0
}
fn default_announce_interval() -> i8 {
    1
}
fn default_sync_interval() -> i8 {
    0
}
fn default_delay_req_interval() -> i8 {
    0
}
fn default_announce_timeout() -> u8 {
    3
}
fn default_foreign_cap() -> usize {
    16
}
fn default_ts_window() -> f64 {
    2.0
}

impl Default for PtpConfig {
    fn default() -> Self {
        Self {
            profile: PtpProfile::default(),
            domain: default_domain(),
            log_announce_interval: default_announce_interval(),
            log_sync_interval: default_sync_interval(),
            log_delay_req_interval: default_delay_req_interval(),
            announce_receipt_timeout: default_announce_timeout(),
            foreign_record_cap: default_foreign_cap(),
            timestamp_window_s: default_ts_window(),
        }
    }
}

/// Servo coefficients and filter sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct ServoConfig {
    #[serde(default = "default_kp")]
    pub kp: f64,
    #[serde(default = "default_ki")]
    pub ki: f64,
    #[serde(default = "default_kd")]
    pub kd: f64,
    /// Step threshold in seconds. Clamped to 0.1..=10.0 on load.
    #[serde(default = "default_step_threshold")]
    pub step_threshold_s: f64,
    #[serde(default)]
    pub step_policy: StepPolicy,
    #[serde(default = "default_outlier_window")]
    pub outlier_filter_size: usize,
    /// Std-dev multiple above which a sample is discarded.
    #[serde(default = "default_outlier_threshold")]
    pub outlier_threshold: f64,
    #[serde(default = "default_mpd_size")]
    pub mpd_filter_size: usize,
    /// Ageing factor applied per slot of the mean-path-delay average.
    #[serde(default = "default_mpd_ageing")]
    pub mpd_ageing: f64,
    #[serde(default = "default_fir_size")]
    pub fir_filter_size: usize,
    /// Largest clock frequency correction the servo will request, in ppb.
    #[serde(default = "default_max_freq_adj")]
    pub max_freq_adj_ppb: f64,
}

fn default_kp() -> f64 {
    0.4
}
fn default_ki() -> f64 {
    0.03
}
fn default_kd() -> f64 {
    0.0
}
fn default_step_threshold() -> f64 {
    0.9
}
fn default_outlier_window() -> usize {
    60
}
fn default_outlier_threshold() -> f64 {
    3.0
}
fn default_mpd_size() -> usize {
    8
}
fn default_mpd_ageing() -> f64 {
    1.05
}
fn default_fir_size() -> usize {
    4
}
fn default_max_freq_adj() -> f64 {
    50_000_000.0
}

impl Default for ServoConfig {
    fn default() -> Self {
        Self {
            kp: default_kp(),
            ki: default_ki(),
            kd: default_kd(),
            step_threshold_s: default_step_threshold(),
            step_policy: StepPolicy::default(),
            outlier_filter_size: default_outlier_window(),
            outlier_threshold: default_outlier_threshold(),
            mpd_filter_size: default_mpd_size(),
            mpd_ageing: default_mpd_ageing(),
            fir_filter_size: default_fir_size(),
            max_freq_adj_ppb: default_max_freq_adj(),
        }
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
    #[serde(default)]
    pub servo: ServoConfig,
    /// Seconds between selection ticks.
    #[serde(default = "default_selection_interval")]
    pub selection_interval_s: f64,
    /// Seconds between periodic statistics blocks.
    #[serde(default = "default_stats_interval")]
    pub stats_interval_s: f64,
    /// Seconds between saved-state writes.
    #[serde(default = "default_save_state_interval")]
    pub save_state_interval_s: f64,
    #[serde(default = "default_lock_path")]
    pub lock_path: String,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default = "default_control_path")]
    pub control_path: String,
    #[serde(default)]
    pub zombie_policy: ZombiePolicy,
    /// Message-pool sizing: envelopes in the global pool.
    #[serde(default = "default_global_pool")]
    pub global_pool_msgs: usize,
    /// Envelopes in each thread-local pool.
    #[serde(default = "default_local_pool")]
    pub local_pool_msgs: usize,
    /// Envelopes in the realtime-stats pool.
    #[serde(default = "default_rt_stats_pool")]
    pub rt_stats_pool_msgs: usize,
}

fn default_selection_interval() -> f64 {
    1.0
}
fn default_stats_interval() -> f64 {
    60.0
}
fn default_save_state_interval() -> f64 {
    10.0
}
fn default_lock_path() -> String {
    "/var/run/kernel_clock".to_string()
}
fn default_state_dir() -> String {
    "/var/lib/sfptpd".to_string()
}
fn default_control_path() -> String {
    "/run/tsyncd.sock".to_string()
}
fn default_global_pool() -> usize {
    128
}
fn default_local_pool() -> usize {
    32
}
fn default_rt_stats_pool() -> usize {
    64
}

impl Default for Config {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config deserializes")
    }
}

impl Config {
    /// Load from a JSON file, applying range clamps and cross-checks.
    pub fn load(path: &str) -> crate::error::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut cfg: Config = serde_json::from_str(&text)
            .map_err(|e| crate::error::Error::Config(format!("{path}: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&mut self) -> crate::error::Result<()> {
        self.servo.step_threshold_s = self.servo.step_threshold_s.clamp(0.1, 10.0);
        let mut seen = std::collections::HashSet::new();
        for inst in &self.instances {
            if !seen.insert(inst.name.clone()) {
                return Err(crate::error::Error::Config(format!(
                    "duplicate instance name '{}'",
                    inst.name
                )));
            }
            if inst.module != ModuleKind::Freerun && inst.interface.is_none() {
                return Err(crate::error::Error::Config(format!(
                    "instance '{}' ({}) requires an interface",
                    inst.name, inst.module
                )));
            }
        }
        Ok(())
    }
}
