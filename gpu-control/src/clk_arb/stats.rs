//! Clock switch latency statistics.
//!
//! Updated once per successful arbiter pass. Mean and variance use
//! Welford's running update so no sample history is kept.

use std::fmt;

/// Latency statistics of clock switches, in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ArbSwitchStats {
    pub switch_num: u64,
    pub switch_min_us: u64,
    pub switch_max_us: u64,
    pub switch_avg_us: f64,
    m2: f64,
}

impl ArbSwitchStats {
    pub fn record(&mut self, us: u64) {
        self.switch_num += 1;
        if self.switch_num == 1 {
            self.switch_min_us = us;
            self.switch_max_us = us;
        } else {
            self.switch_min_us = self.switch_min_us.min(us);
            self.switch_max_us = self.switch_max_us.max(us);
        }
        let x = us as f64;
        let delta = x - self.switch_avg_us;
        self.switch_avg_us += delta / self.switch_num as f64;
        self.m2 += delta * (x - self.switch_avg_us);
    }

    /// Population standard deviation.
    pub fn switch_std_us(&self) -> f64 {
        if self.switch_num == 0 {
            return 0.0;
        }
        (self.m2 / self.switch_num as f64).sqrt()
    }
}

impl fmt::Display for ArbSwitchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Clock Switch Stats")?;
        writeln!(f, "  num:  {:>10}", self.switch_num)?;
        writeln!(f, "  min:  {:>10} us", self.switch_min_us)?;
        writeln!(f, "  max:  {:>10} us", self.switch_max_us)?;
        writeln!(f, "  avg:  {:>10.1} us", self.switch_avg_us)?;
        writeln!(f, "  std:  {:>10.1} us", self.switch_std_us())
    }
}
