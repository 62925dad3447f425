//! Host side USB access.
//!
//! A [`Context`] owns a platform [`Backend`], the devices it discovered and
//! the machinery to run asynchronous [`Transfer`]s: a registry of transfers
//! in flight ordered by deadline, one event handling thread at a time and
//! hotplug notifications. Blocking control, bulk and interrupt helpers are
//! built on top of the asynchronous engine.
//!
//! ```no_run
//! # fn main() -> usbhost::Result<()> {
//! let ctx = usbhost::init()?;
//! for device in ctx.devices()?.iter() {
//!     println!("{}", device);
//! }
//! ctx.exit()
//! # }
//! ```
pub mod backend;
pub mod context;
pub mod control_transfer;
pub mod descriptors;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod flying;
pub mod hotplug;
pub mod os;
mod sync;
pub mod transfer;

pub use backend::{Backend, BackendData, Capabilities, Completion, PollSource, ReadyFd};
#[cfg(target_os = "linux")]
pub use context::init;
pub use context::{init_default_with, Context, Options};
pub use control_transfer::ControlSetup;
pub use descriptors::{ConfigDescriptor, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor};
pub use device::{Device, DeviceHandle, DeviceInfo, DeviceList};
pub use endpoint::{Direction, Endpoint};
pub use error::{Error, Result};
pub use events::{EventWaiters, EventsLock, WaitOutcome};
pub use flying::{DeadlineTimer, TimerFdTimer};
pub use hotplug::{HotplugEvent, HotplugEvents, HotplugFilter, HotplugFlags, HotplugHandle};
#[cfg(target_os = "linux")]
pub use os::linux::LinuxBackend;
pub use transfer::{IsoPacket, Transfer, TransferFlags, TransferState, TransferStatus, TransferType};
