//! USERD: the per-channel GP_GET / GP_PUT words shared with the host engine.

use std::collections::HashMap;

use parking_lot::Mutex;

pub trait Userd: Send + Sync {
    /// Set up the channel's USERD for a ring of `entry_num` slots.
    fn init_mem(&self, chid: u32, entry_num: u32);

    /// Read the hardware fetch position.
    fn gp_get(&self, chid: u32) -> u32;

    /// Publish a new put position to the hardware.
    fn gp_put(&self, chid: u32, put: u32);
}

#[derive(Debug, Default, Clone, Copy)]
struct UserdState {
    entry_num: u32,
    get: u32,
    put: u32,
    get_reads: u64,
    put_writes: u64,
}

/// In-process USERD. The "GPU" fetches entries when a test calls
/// [`SimUserd::consume`].
#[derive(Debug, Default)]
pub struct SimUserd {
    channels: Mutex<HashMap<u32, UserdState>>,
}

impl SimUserd {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch up to `count` entries; returns how many were fetched.
    pub fn consume(&self, chid: u32, count: u32) -> u32 {
        let mut channels = self.channels.lock();
        let Some(s) = channels.get_mut(&chid) else {
            return 0;
        };
        if s.entry_num == 0 {
            return 0;
        }
        let pending = s.put.wrapping_sub(s.get) & (s.entry_num - 1);
        let n = count.min(pending);
        s.get = (s.get + n) & (s.entry_num - 1);
        n
    }

    /// Fetch everything published so far.
    pub fn consume_all(&self, chid: u32) -> u32 {
        self.consume(chid, u32::MAX)
    }

    pub fn get_reads(&self, chid: u32) -> u64 {
        self.channels.lock().get(&chid).map_or(0, |s| s.get_reads)
    }

    pub fn put_writes(&self, chid: u32) -> u64 {
        self.channels.lock().get(&chid).map_or(0, |s| s.put_writes)
    }

    /// The last put the hardware saw.
    pub fn hw_put(&self, chid: u32) -> u32 {
        self.channels.lock().get(&chid).map_or(0, |s| s.put)
    }
}

impl Userd for SimUserd {
    fn init_mem(&self, chid: u32, entry_num: u32) {
        self.channels.lock().insert(
            chid,
            UserdState {
                entry_num,
                ..UserdState::default()
            },
        );
    }

    fn gp_get(&self, chid: u32) -> u32 {
        let mut channels = self.channels.lock();
        match channels.get_mut(&chid) {
            Some(s) => {
                s.get_reads += 1;
                s.get
            }
            None => 0,
        }
    }

    fn gp_put(&self, chid: u32, put: u32) {
        if let Some(s) = self.channels.lock().get_mut(&chid) {
            s.put = put;
            s.put_writes += 1;
        }
    }
}
