//! The capability set a platform backend provides to the core.
use crate::context::Context;
use crate::device::{Device, DeviceHandle};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::transfer::{Transfer, TransferState, TransferStatus};
use bitflags::bitflags;
use nix::poll::PollFlags;
use std::any::Any;
use std::os::unix::io::RawFd;
use std::time::Instant;

bitflags! {
    pub struct Capabilities: u32 {
        const HAS_HOTPLUG = 0x01;
        const HAS_HID_ACCESS = 0x02;
        const SUPPORTS_DETACH_KERNEL_DRIVER = 0x04;
    }
}

/// Per-handle state a backend keeps, recovered with
/// [`DeviceHandle::backend_data`].
pub type BackendData = Box<dyn Any + Send + Sync>;

/// A descriptor the event loop polls on behalf of the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSource {
    pub fd: RawFd,
    pub events: PollFlags,
}

/// Readiness reported by one poll pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyFd {
    pub fd: RawFd,
    pub revents: PollFlags,
}

/// What a transfer that finished outside the event handler turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Status(TransferStatus),
    /// The backend finished a cancellation; the core picks the outcome.
    Cancelled,
}

/// Platform I/O. Every method may be called from any thread.
///
/// Hooks that receive a [`TransferState`] run with the transfer lock held:
/// they must not call back into the core for the same transfer. Backends
/// never complete a transfer from inside `submit_transfer` or
/// `cancel_transfer`; completions go through
/// [`Context::handle_transfer_completion`] from `handle_events` or through
/// [`Context::signal_transfer_completion`]. Only the first path delivers
/// callbacks, and only on the thread holding the events lock.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    fn init(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    fn exit(&self, _ctx: &Context) {}

    /// Enumerates attached devices. Only used by backends without hotplug.
    fn get_device_list(&self, _ctx: &Context) -> Result<Vec<Device>> {
        Err(Error::NotSupported)
    }

    /// Lets a hotplug backend catch up on events before a device list is
    /// built.
    fn hotplug_poll(&self, _ctx: &Context) {}

    fn open(&self, handle: &DeviceHandle) -> Result<BackendData>;

    fn close(&self, handle: &DeviceHandle);

    /// Raw configuration descriptor `index`, `wTotalLength` bytes.
    fn get_config_descriptor(&self, device: &Device, index: u8) -> Result<Vec<u8>>;

    fn get_active_config_descriptor(&self, device: &Device) -> Result<Vec<u8>>;

    /// `NotSupported` makes the core ask the device with a control request.
    fn get_configuration(&self, _handle: &DeviceHandle) -> Result<u8> {
        Err(Error::NotSupported)
    }

    /// `None` puts the device in the unconfigured state.
    fn set_configuration(&self, _handle: &DeviceHandle, _config: Option<u8>) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn claim_interface(&self, handle: &DeviceHandle, iface: u8) -> Result<()>;

    fn release_interface(&self, handle: &DeviceHandle, iface: u8) -> Result<()>;

    fn set_interface_alt_setting(&self, _handle: &DeviceHandle, _iface: u8, _alt: u8) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn clear_halt(&self, _handle: &DeviceHandle, _endpoint: Endpoint) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn reset_device(&self, _handle: &DeviceHandle) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn kernel_driver_active(&self, _handle: &DeviceHandle, _iface: u8) -> Result<bool> {
        Err(Error::NotSupported)
    }

    fn detach_kernel_driver(&self, _handle: &DeviceHandle, _iface: u8) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn attach_kernel_driver(&self, _handle: &DeviceHandle, _iface: u8) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn submit_transfer(&self, transfer: &Transfer, state: &mut TransferState) -> Result<()>;

    fn cancel_transfer(&self, transfer: &Transfer, state: &mut TransferState) -> Result<()>;

    /// Drops backend private data attached to a transfer.
    fn clear_transfer_priv(&self, state: &mut TransferState) {
        state.take_backend_data();
    }

    /// Turns a transfer queued with `signal_transfer_completion` into its
    /// outcome.
    fn finalize_completion(&self, _state: &mut TransferState) -> Result<Completion> {
        Err(Error::NotSupported)
    }

    /// Whether the backend enforces this transfer's timeout itself.
    fn handles_timeout(&self, _state: &TransferState) -> bool {
        false
    }

    fn poll_sources(&self) -> Vec<PollSource> {
        Vec::new()
    }

    /// Called by the handling thread with the backend descriptors that
    /// polled ready.
    fn handle_events(&self, _ctx: &Context, _ready: &[ReadyFd]) -> Result<()> {
        Ok(())
    }

    fn clock_now(&self) -> Instant {
        Instant::now()
    }
}
