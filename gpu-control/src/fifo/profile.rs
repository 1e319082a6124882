//! Submit profiler.
//!
//! Records when a submit passes each stage:
//! entry -> job tracking -> append -> end.

use std::fmt;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStage {
    Entry,
    JobTracking,
    Append,
    End,
}

/// Per-stage timestamps and counters for one submit.
///
/// All `_us` fields are microseconds since [`SubmitProfile::begin`].
#[derive(Debug, Clone, Default)]
pub struct SubmitProfile {
    // ---- Stage timestamps (microseconds) ----

    /// Preconditions checked.
    pub entry_us: u64,
    /// Job slot, sync commands and fences prepared.
    pub job_tracking_us: u64,
    /// Entries appended to the ring.
    pub append_us: u64,
    /// PUT published.
    pub end_us: u64,

    // ---- Counters ----

    /// Caller entries submitted.
    pub num_entries: u32,
    /// Submit went through job tracking.
    pub tracked: bool,
    /// A wait command was inserted.
    pub wait_cmd: bool,

    start: Option<Instant>,
}

impl SubmitProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self) {
        self.start = Some(Instant::now());
    }

    pub fn mark(&mut self, stage: SubmitStage) {
        let us = self
            .start
            .map_or(0, |s| s.elapsed().as_micros() as u64);
        match stage {
            SubmitStage::Entry => self.entry_us = us,
            SubmitStage::JobTracking => self.job_tracking_us = us,
            SubmitStage::Append => self.append_us = us,
            SubmitStage::End => self.end_us = us,
        }
    }

    /// Time spent preparing job tracking.
    pub fn tracking_cost_us(&self) -> u64 {
        if !self.tracked {
            return 0;
        }
        self.job_tracking_us.saturating_sub(self.entry_us)
    }

    /// Entries appended per microsecond of append stage.
    pub fn append_rate(&self) -> f64 {
        let append = self
            .append_us
            .saturating_sub(self.job_tracking_us.max(self.entry_us));
        if append == 0 {
            return 0.0;
        }
        self.num_entries as f64 / append as f64
    }
}

impl fmt::Display for SubmitProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Submit Profile")?;
        writeln!(f, "  Stages:")?;
        writeln!(f, "    entry:        {:>8} us", self.entry_us)?;
        writeln!(f, "    job_tracking: {:>8} us", self.job_tracking_us)?;
        writeln!(f, "    append:       {:>8} us", self.append_us)?;
        writeln!(f, "    end:          {:>8} us", self.end_us)?;
        writeln!(f, "  Counters:")?;
        writeln!(f, "    num_entries:  {:>8}", self.num_entries)?;
        writeln!(f, "    tracked:      {:>8}", self.tracked)?;
        writeln!(f, "    wait_cmd:     {:>8}", self.wait_cmd)?;
        if self.tracked {
            writeln!(f, "  Derived:")?;
            writeln!(f, "    tracking:     {:>8} us", self.tracking_cost_us())?;
        }
        Ok(())
    }
}
