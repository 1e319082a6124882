//! Clock domain query / programming backend.
//!
//! The arbiter never touches clock hardware directly. Everything it needs
//! (ranges, candidate points, slave-clock resolution, pstate bounds and the
//! final programming step) goes through [`ClockBackend`].
//! [`TableClockBackend`] is a table-driven in-process implementation used for
//! simulation, tests and benchmarks.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::types::{ClockDomain, Pstate, PstateClkInfo, SlaveFreq};
use crate::error::{GpuControlError, Result};

/// Source of clock-domain facts and sink for programmed clocks.
pub trait ClockBackend: Send + Sync {
    /// Mask of `ClockDomain::bit()` for the domains this GPU arbitrates.
    fn clk_domains(&self) -> u32;

    /// Hardware min/max of a domain in MHz.
    fn clk_range(&self, domain: ClockDomain) -> Result<(u16, u16)>;

    /// Default target when no session requests anything.
    fn clk_default(&self, domain: ClockDomain) -> Result<u16>;

    /// Candidate frequency points, ascending, at most `max_points`.
    fn f_points(&self, domain: ClockDomain, max_points: usize) -> Result<Vec<u16>>;

    /// Dependent-domain frequencies for one gpc2clk point.
    fn slave_clks(&self, gpc_mhz: u16) -> Result<SlaveFreq>;

    /// Tier bounds, `None` when the tier is not described for the domain.
    fn pstate_clk_info(&self, pstate: Pstate, domain: ClockDomain) -> Option<PstateClkInfo>;

    /// Lowest stable DVCO frequency of the GPC clock.
    fn dvco_min_mhz(&self) -> u16 {
        0
    }

    /// Reload cached VF points from the power controller.
    fn refresh_vf_cache(&self) -> Result<()> {
        Ok(())
    }

    /// Program the GPC clock tree and the memory clock.
    fn program_clocks(&self, gpc: &SlaveFreq, mclk_mhz: u16) -> Result<()>;

    /// Measured frequency of a domain in Hz.
    fn measure_freq_hz(&self, domain: ClockDomain) -> u64;
}

// ============================================================================
// Table-driven backend
// ============================================================================

/// Static description of a clock table, loadable from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockTableConfig {
    pub gpc2clk_min_mhz: u16,
    pub gpc2clk_max_mhz: u16,
    pub gpc2clk_default_mhz: u16,
    /// `None` disables the memory clock domain.
    pub mclk_mhz: Option<(u16, u16)>,
    pub mclk_default_mhz: u16,
    pub dvco_min_mhz: u16,
    /// Candidate gpc2clk points, ascending.
    pub f_points: Vec<u16>,
    /// Slave clock ratios in percent of the gpc2clk point.
    pub sys_percent: u16,
    pub xbar_percent: u16,
    pub nvd_percent: u16,
    pub host_percent: u16,
    /// Per-tier gpc2clk bounds.
    pub pstates: Vec<(Pstate, PstateClkInfo)>,
}

impl Default for ClockTableConfig {
    fn default() -> Self {
        let f_points: Vec<u16> = (0..32).map(|i| 600 + i * 45).collect();
        Self {
            gpc2clk_min_mhz: 600,
            gpc2clk_max_mhz: 2000,
            gpc2clk_default_mhz: 1200,
            mclk_mhz: Some((405, 3003)),
            mclk_default_mhz: 3003,
            dvco_min_mhz: 500,
            f_points,
            sys_percent: 80,
            xbar_percent: 90,
            nvd_percent: 75,
            host_percent: 50,
            pstates: vec![
                (
                    Pstate::P0,
                    PstateClkInfo {
                        min_mhz: 600,
                        max_mhz: 2000,
                        nominal_mhz: 1500,
                    },
                ),
                (
                    Pstate::P8,
                    PstateClkInfo {
                        min_mhz: 600,
                        max_mhz: 900,
                        nominal_mhz: 600,
                    },
                ),
            ],
        }
    }
}

fn scale(mhz: u16, percent: u16) -> u16 {
    ((mhz as u32 * percent as u32) / 100) as u16
}

/// In-process [`ClockBackend`] driven by a [`ClockTableConfig`].
#[derive(Debug)]
pub struct TableClockBackend {
    table: RwLock<ClockTableConfig>,
    programmed: Mutex<Option<(SlaveFreq, u16)>>,
}

impl TableClockBackend {
    pub fn new(table: ClockTableConfig) -> Self {
        Self {
            table: RwLock::new(table),
            programmed: Mutex::new(None),
        }
    }

    /// Replace the candidate points, as a VBIOS/PMU table update would.
    pub fn set_f_points(&self, points: Vec<u16>) {
        self.table.write().f_points = points;
    }

    pub fn set_gpc2clk_range(&self, min_mhz: u16, max_mhz: u16) {
        let mut t = self.table.write();
        t.gpc2clk_min_mhz = min_mhz;
        t.gpc2clk_max_mhz = max_mhz;
    }

    /// Last clocks handed to `program_clocks`.
    pub fn programmed(&self) -> Option<(SlaveFreq, u16)> {
        *self.programmed.lock()
    }
}

impl Default for TableClockBackend {
    fn default() -> Self {
        Self::new(ClockTableConfig::default())
    }
}

impl ClockBackend for TableClockBackend {
    fn clk_domains(&self) -> u32 {
        let t = self.table.read();
        let mut mask = ClockDomain::Gpc2clk.bit();
        if t.mclk_mhz.is_some() {
            mask |= ClockDomain::Mclk.bit();
        }
        mask
    }

    fn clk_range(&self, domain: ClockDomain) -> Result<(u16, u16)> {
        let t = self.table.read();
        let (min, max) = match domain {
            ClockDomain::Gpc2clk => (t.gpc2clk_min_mhz, t.gpc2clk_max_mhz),
            ClockDomain::Mclk => t.mclk_mhz.ok_or_else(|| GpuControlError::InvalidRange {
                domain,
                reason: "domain not present".into(),
            })?,
        };
        if min > max {
            return Err(GpuControlError::InvalidRange {
                domain,
                reason: format!("min {} > max {}", min, max),
            });
        }
        Ok((min, max))
    }

    fn clk_default(&self, domain: ClockDomain) -> Result<u16> {
        let t = self.table.read();
        match domain {
            ClockDomain::Gpc2clk => Ok(t.gpc2clk_default_mhz),
            ClockDomain::Mclk if t.mclk_mhz.is_some() => Ok(t.mclk_default_mhz),
            ClockDomain::Mclk => Err(GpuControlError::InvalidArgument(
                "mclk domain not present".into(),
            )),
        }
    }

    fn f_points(&self, domain: ClockDomain, max_points: usize) -> Result<Vec<u16>> {
        let t = self.table.read();
        match domain {
            ClockDomain::Gpc2clk => Ok(t.f_points.iter().copied().take(max_points).collect()),
            ClockDomain::Mclk => {
                let (min, max) = t.mclk_mhz.ok_or_else(|| GpuControlError::InvalidRange {
                    domain,
                    reason: "domain not present".into(),
                })?;
                let mut points = vec![min];
                if max != min {
                    points.push(max);
                }
                points.truncate(max_points);
                Ok(points)
            }
        }
    }

    fn slave_clks(&self, gpc_mhz: u16) -> Result<SlaveFreq> {
        let t = self.table.read();
        Ok(SlaveFreq {
            gpc_mhz,
            sys_mhz: scale(gpc_mhz, t.sys_percent),
            xbar_mhz: scale(gpc_mhz, t.xbar_percent),
            nvd_mhz: scale(gpc_mhz, t.nvd_percent),
            host_mhz: scale(gpc_mhz, t.host_percent),
        })
    }

    fn pstate_clk_info(&self, pstate: Pstate, domain: ClockDomain) -> Option<PstateClkInfo> {
        if domain != ClockDomain::Gpc2clk {
            return None;
        }
        self.table
            .read()
            .pstates
            .iter()
            .find(|(p, _)| *p == pstate)
            .map(|(_, info)| *info)
    }

    fn dvco_min_mhz(&self) -> u16 {
        self.table.read().dvco_min_mhz
    }

    fn program_clocks(&self, gpc: &SlaveFreq, mclk_mhz: u16) -> Result<()> {
        *self.programmed.lock() = Some((*gpc, mclk_mhz));
        Ok(())
    }

    fn measure_freq_hz(&self, domain: ClockDomain) -> u64 {
        let programmed = *self.programmed.lock();
        let mhz = match (domain, programmed) {
            // gpc2clk runs at twice the measured gpcclk.
            (ClockDomain::Gpc2clk, Some((gpc, _))) => gpc.gpc_mhz as u64 / 2,
            (ClockDomain::Mclk, Some((_, mclk))) => mclk as u64,
            (_, None) => 0,
        };
        mhz * 1_000_000
    }
}
