//! Device configuration.
//!
//! Loaded from JSON (default location `~/.gpu-control/config.json`, or the
//! path in `GPU_CONTROL_CONFIG`). Every field has a default, so a config
//! file only needs to name what it changes:
//!
//! ```json
//! {
//!   "can_railgate": true,
//!   "clk_arb": { "gpc_cap_mhz": 1800 },
//!   "channel": { "num_gpfifo_entries": 512, "watchdog_enabled": false }
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::clk_arb::backend::ClockTableConfig;
use crate::error::{GpuControlError, Result};

/// Clock arbiter tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Disabled arbiter: `Device` comes up without clock control.
    pub enabled: bool,
    /// Records in the arbiter-wide notification queue.
    pub notification_queue_size: u32,
    /// Records in each client event queue.
    pub event_queue_size: u32,
    /// Cap on frequency points accepted per rebuild.
    pub max_f_points: usize,
    /// GPC cap granularity.
    pub freq_step_mhz: u16,
    /// Board limit on gpc2clk, rounded down to `freq_step_mhz`.
    pub gpc_cap_mhz: Option<u16>,
    /// Bound on waiting for the first arbiter pass at init.
    pub init_timeout_ms: u64,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            notification_queue_size: 256,
            event_queue_size: 32,
            max_f_points: 256,
            freq_step_mhz: 15,
            gpc_cap_mhz: None,
            init_timeout_ms: 5000,
        }
    }
}

/// Per-channel defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// GPFIFO ring size; must be a power of two.
    pub num_gpfifo_entries: u32,
    /// Preallocated job slots; 0 means unbounded.
    pub num_inflight_jobs: u32,
    /// Private command buffer words reserved per in-flight job.
    pub priv_cmdbuf_words_per_job: u32,
    pub watchdog_enabled: bool,
    pub watchdog_timeout_ms: u64,
    pub max_channels: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            num_gpfifo_entries: 1024,
            num_inflight_jobs: 128,
            priv_cmdbuf_words_per_job: 16,
            watchdog_enabled: true,
            watchdog_timeout_ms: 5000,
            max_channels: 512,
        }
    }
}

/// Top-level device configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: String,
    /// The GPU may power-gate between submits.
    pub can_railgate: bool,
    /// Video-protected-region resizing is active.
    pub vpr_resize: bool,
    /// Syncpoints are available; otherwise semaphores track jobs.
    pub has_syncpoints: bool,
    pub num_syncpoints: u32,
    /// Open channel count above which per-channel syncs are created per
    /// submit and destroyed when idle. 0 keeps one sync per channel.
    pub aggressive_sync_destroy_thresh: u32,
    pub clk_arb: ArbiterConfig,
    pub channel: ChannelConfig,
    /// Table for the simulated clock backend.
    pub clock_table: ClockTableConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "gpu0".to_string(),
            can_railgate: false,
            vpr_resize: false,
            has_syncpoints: true,
            num_syncpoints: 256,
            aggressive_sync_destroy_thresh: 0,
            clk_arb: ArbiterConfig::default(),
            channel: ChannelConfig::default(),
            clock_table: ClockTableConfig::default(),
        }
    }
}

impl DeviceConfig {
    /// Reject values the core cannot run with.
    pub fn validate(&self) -> Result<()> {
        let arb = &self.clk_arb;
        for (name, size) in [
            ("notification_queue_size", arb.notification_queue_size),
            ("event_queue_size", arb.event_queue_size),
        ] {
            if !size.is_power_of_two() {
                return Err(GpuControlError::Config(format!(
                    "{} {} is not a power of two",
                    name, size
                )));
            }
        }
        if arb.max_f_points == 0 {
            return Err(GpuControlError::Config("max_f_points must be non-zero".into()));
        }
        if arb.freq_step_mhz == 0 {
            return Err(GpuControlError::Config("freq_step_mhz must be non-zero".into()));
        }
        let entries = self.channel.num_gpfifo_entries;
        if entries < 4 || !entries.is_power_of_two() {
            return Err(GpuControlError::Config(format!(
                "num_gpfifo_entries {} is not a power of two >= 4",
                entries
            )));
        }
        if self.has_syncpoints && self.num_syncpoints == 0 {
            return Err(GpuControlError::Config("num_syncpoints must be non-zero".into()));
        }
        Ok(())
    }
}

/// Default config path: `$GPU_CONTROL_CONFIG`, else
/// `~/.gpu-control/config.json`.
pub fn default_config_path() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("GPU_CONTROL_CONFIG") {
        return Some(PathBuf::from(p));
    }
    dirs::home_dir().map(|h| h.join(".gpu-control").join("config.json"))
}

/// Load and validate the config at the default path.
///
/// A missing file yields the default configuration.
pub fn load_config() -> Result<DeviceConfig> {
    match default_config_path() {
        Some(path) => Ok(load_config_from(&path)?.unwrap_or_default()),
        None => Ok(DeviceConfig::default()),
    }
}

/// Load config from a specific path.
///
/// Returns `Ok(None)` if the file does not exist, `Config` on unreadable,
/// malformed or invalid contents.
pub fn load_config_from(path: &Path) -> Result<Option<DeviceConfig>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            log::warn!("gpu-control: failed to read config {:?}: {}", path, e);
            return Err(GpuControlError::Config(format!("{:?}: {}", path, e)));
        }
    };

    let cfg: DeviceConfig = serde_json::from_str(&contents).map_err(|e| {
        log::warn!("gpu-control: failed to parse config {:?}: {}", path, e);
        GpuControlError::Config(format!("{:?}: {}", path, e))
    })?;
    cfg.validate()?;
    log::debug!("gpu-control: loaded config {:?}", path);
    Ok(Some(cfg))
}
