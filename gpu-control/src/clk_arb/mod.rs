// Clock arbiter module

pub mod alarm;
pub mod arbiter;
pub mod backend;
pub mod notification;
pub mod notify;
pub mod session;
pub mod stats;
pub mod types;
pub mod vf_table;

pub use arbiter::{ClkArbWorkItem, ClkArbiter};
pub use backend::{ClockBackend, ClockTableConfig, TableClockBackend};
pub use session::{ClkDev, ClkDevKind, ClkSession};
pub use types::*;
