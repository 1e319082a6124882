// Submission core module

pub mod channel;
pub mod fence;
pub mod gpfifo;
pub mod job;
pub mod priv_cmdbuf;
pub mod profile;
pub mod submit;
pub mod sync;
pub mod syncpoint;
pub mod userd;
pub mod vm;
pub mod watchdog;

pub use channel::{Channel, ChannelSetupArgs};
pub use fence::{Fence, SyncFdTable, SyncPrimitive, UserFence};
pub use gpfifo::{GpfifoEntry, GpfifoRing};
pub use submit::{
    submit_gpfifo, submit_gpfifo_kernel, submit_gpfifo_user, ChannelFence, GpfifoSource,
    SubmitFlags, UserBuffer, UserGpfifo,
};
pub use syncpoint::{Semaphore, SyncpointManager};
pub use userd::{SimUserd, Userd};
pub use vm::{AddressSpace, Vm};
