//! Shared value types for the clock arbiter.
//!
//! Poll bits are plain `u32` masks using the Linux values. Alarm bits live
//! next to the alarm word in [`super::alarm`].

use serde::{Deserialize, Serialize};

/// Clock domains the arbiter arbitrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClockDomain {
    /// Memory clock.
    Mclk,
    /// GPC clock (2x domain, the primary arbitration domain).
    Gpc2clk,
}

impl ClockDomain {
    pub const ALL: [ClockDomain; 2] = [ClockDomain::Mclk, ClockDomain::Gpc2clk];

    /// Bit of this domain in a `clk_domains()` mask.
    pub fn bit(self) -> u32 {
        match self {
            ClockDomain::Mclk => 1 << 0,
            ClockDomain::Gpc2clk => 1 << 1,
        }
    }
}

/// Poll readiness bits (Linux values).
pub mod poll {
    pub const POLLIN: u32 = 0x0001;
    pub const POLLPRI: u32 = 0x0002;
    pub const POLLHUP: u32 = 0x0010;
    pub const POLLRDNORM: u32 = 0x0040;
}

/// Power-state tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Pstate {
    P0,
    P5,
    P8,
}

impl Pstate {
    pub const ALL: [Pstate; 3] = [Pstate::P0, Pstate::P5, Pstate::P8];

    /// Bit of this tier in a `VfPoint::pstates` mask.
    pub fn bit(self) -> u32 {
        match self {
            Pstate::P0 => 1 << 0,
            Pstate::P5 => 1 << 5,
            Pstate::P8 => 1 << 8,
        }
    }
}

/// Frequency bounds of one clock domain in one power-state tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PstateClkInfo {
    pub min_mhz: u16,
    pub max_mhz: u16,
    pub nominal_mhz: u16,
}

/// Dependent-domain frequencies resolved for one gpc2clk point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveFreq {
    pub gpc_mhz: u16,
    pub sys_mhz: u16,
    pub xbar_mhz: u16,
    pub nvd_mhz: u16,
    pub host_mhz: u16,
}

/// One accepted entry of the VF table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VfPoint {
    pub gpc_mhz: u16,
    pub sys_mhz: u16,
    pub xbar_mhz: u16,
    pub nvd_mhz: u16,
    pub host_mhz: u16,
    /// Mask of `Pstate::bit()` tiers this point satisfies.
    pub pstates: u32,
}

impl VfPoint {
    pub fn from_slaves(slaves: SlaveFreq) -> Self {
        Self {
            gpc_mhz: slaves.gpc_mhz,
            sys_mhz: slaves.sys_mhz,
            xbar_mhz: slaves.xbar_mhz,
            nvd_mhz: slaves.nvd_mhz,
            host_mhz: slaves.host_mhz,
            pstates: 0,
        }
    }

    pub fn slaves(&self) -> SlaveFreq {
        SlaveFreq {
            gpc_mhz: self.gpc_mhz,
            sys_mhz: self.sys_mhz,
            xbar_mhz: self.xbar_mhz,
            nvd_mhz: self.nvd_mhz,
            host_mhz: self.host_mhz,
        }
    }

    pub fn supports(&self, pstate: Pstate) -> bool {
        self.pstates & pstate.bit() != 0
    }
}

/// A clock configuration: what a session wants, or what the arbiter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbTarget {
    pub gpc2clk_mhz: u16,
    pub mclk_mhz: u16,
    pub pstate: Pstate,
}

impl ArbTarget {
    /// Idle target a new session starts with.
    pub const IDLE: ArbTarget = ArbTarget {
        gpc2clk_mhz: 0,
        mclk_mhz: 0,
        pstate: Pstate::P8,
    };

    pub fn mhz(&self, domain: ClockDomain) -> u16 {
        match domain {
            ClockDomain::Mclk => self.mclk_mhz,
            ClockDomain::Gpc2clk => self.gpc2clk_mhz,
        }
    }
}

impl Default for ArbTarget {
    fn default() -> Self {
        ArbTarget::IDLE
    }
}
