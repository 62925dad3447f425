//! Linux backend: sysfs for discovery, usbfs for I/O.
//!
//! Every open handle owns a `/dev/bus/usb/BBB/DDD` descriptor. Transfers
//! become one URB each; the event loop polls the descriptors for `POLLOUT`
//! and reaps finished URBs without blocking. There is no hotplug monitor, the
//! device list is rebuilt from sysfs on every [`Context::devices`] call.
mod constants;
mod enumerate;
#[cfg(feature = "mio")]
mod mio;
mod usbfs;
mod usbfsurb;

use self::constants::*;
use self::usbfsurb::{UrbSlot, UsbFsUrb};
use crate::backend::{Backend, BackendData, Capabilities, PollSource, ReadyFd};
use crate::context::Context;
use crate::control_transfer::{ControlSetup, CONTROL_SETUP_SIZE};
use crate::descriptors;
use crate::device::{Device, DeviceHandle, DeviceInfo, HandleInner};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::transfer::{Transfer, TransferState, TransferStatus, TransferType};
use nix::poll::PollFlags;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Weak;

const MAX_INTERFACES: u8 = 32;

/// Per device data: where it lives in sysfs and its cached descriptors.
struct LinuxDevice {
    dir: PathBuf,
    descriptors: Vec<u8>,
}

struct InFlight {
    slot: UrbSlot,
    transfer: Transfer,
}

/// Key of a transfer's URB in [`LinuxHandle::urbs`].
struct UrbKey(usize);

/// Per handle data.
struct LinuxHandle {
    file: Mutex<Option<File>>,
    caps: u32,
    urbs: Mutex<HashMap<usize, InFlight>>,
}

impl LinuxHandle {
    fn fd(&self) -> Result<RawFd> {
        self.file
            .lock()
            .as_ref()
            .map(|f| f.as_raw_fd())
            .ok_or(Error::NoDevice)
    }
}

pub struct LinuxBackend {
    sysfs_root: PathBuf,
    devfs_root: PathBuf,
    handles: Mutex<HashMap<RawFd, Weak<HandleInner>>>,
}

impl Default for LinuxBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LinuxBackend {
    pub fn new() -> Self {
        Self::with_roots(SYSFS_DEVICES, DEVFS_ROOT)
    }

    /// Reads devices from `sysfs_root` (normally `/sys/bus/usb/devices`)
    /// and opens them below `devfs_root` (normally `/dev/bus/usb`).
    pub fn with_roots<P: AsRef<Path>, Q: AsRef<Path>>(sysfs_root: P, devfs_root: Q) -> Self {
        LinuxBackend {
            sysfs_root: sysfs_root.as_ref().to_path_buf(),
            devfs_root: devfs_root.as_ref().to_path_buf(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn device_data(device: &Device) -> Result<&LinuxDevice> {
        device.backend_data::<LinuxDevice>().ok_or(Error::NotFound)
    }

    fn handle_data(handle: &DeviceHandle) -> Result<&LinuxHandle> {
        handle.backend_data::<LinuxHandle>().ok_or(Error::NoDevice)
    }

    fn handle_fd(handle: &DeviceHandle) -> Result<RawFd> {
        Self::handle_data(handle)?.fd()
    }

    fn claimed(handle: &DeviceHandle) -> impl Iterator<Item = u8> {
        let mask = handle.claimed_interfaces();
        (0..MAX_INTERFACES).filter(move |i| mask & (1 << i) != 0)
    }

    fn claim(fd: RawFd, handle: &DeviceHandle, iface: u8) -> Result<()> {
        if handle.auto_detach_kernel_driver() {
            match usbfs::disconnect_driver(fd, iface) {
                Ok(()) | Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        usbfs::claim_interface(fd, iface)
    }

    fn disconnected(&self, ctx: &Context, fd: RawFd, handle: &DeviceHandle) {
        log::debug!("device {} disconnected", handle.device());
        self.handles.lock().remove(&fd);
        if handle.device().is_attached() {
            ctx.disconnect_device(handle.device());
        }
        ctx.handle_disconnect(handle);
    }

    /// Reaps one URB. `false` once the kernel has nothing left.
    fn reap(&self, ctx: &Context, data: &LinuxHandle) -> Result<bool> {
        let fd = data.fd()?;
        let urb = match usbfs::reap_urb_ndelay(fd)? {
            Some(urb) => urb,
            None => return Ok(false),
        };
        let entry = data.urbs.lock().remove(&(urb as usize));
        let InFlight { slot, transfer } = match entry {
            Some(entry) => entry,
            None => {
                log::warn!("reaped unknown urb {:p}", urb);
                return Ok(true);
            }
        };
        log::trace!("reaped urb for {:?}\n{}", transfer, slot.urb());

        let status = slot.urb().transfer_status();
        let cancelled = transfer.with_state(|state| {
            let copy_back = match state.kind() {
                TransferType::Control => ControlSetup::from_bytes(state.buffer())
                    .map_or(false, |setup| setup.is_in()),
                _ => state.endpoint().is_in(),
            };
            if copy_back {
                let offset = match state.kind() {
                    TransferType::Control => CONTROL_SETUP_SIZE,
                    _ => 0,
                };
                let received = slot.received(offset);
                let buf = state.buffer_mut();
                let n = received.len().min(buf.len().saturating_sub(offset));
                buf[offset..offset + n].copy_from_slice(&received[..n]);
            }
            state.set_transferred(slot.urb().actual_length.max(0) as usize);
            status.is_none() || (state.is_cancelling() && status != Some(TransferStatus::Completed))
        });

        match status {
            Some(status) if !cancelled => ctx.handle_transfer_completion(&transfer, status),
            _ => ctx.handle_transfer_cancellation(&transfer),
        }
        Ok(true)
    }
}

impl Backend for LinuxBackend {
    fn name(&self) -> &'static str {
        "linux usbfs"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::SUPPORTS_DETACH_KERNEL_DRIVER
    }

    fn exit(&self, _ctx: &Context) {
        self.handles.lock().clear();
    }

    fn get_device_list(&self, ctx: &Context) -> Result<Vec<Device>> {
        let found = enumerate::scan(&self.sysfs_root)?;
        let mut by_name: HashMap<String, Device> = HashMap::new();
        let mut devices = Vec::with_capacity(found.len());
        for sd in found {
            let device = match ctx.device_by_session_id(sd.session_id()) {
                Some(device) if device.is_attached() => device,
                _ => {
                    let descriptor = match descriptors::parse_device(&sd.descriptors) {
                        Ok(d) => d,
                        Err(e) => {
                            log::warn!("{}: bad device descriptor: {}", sd.name, e);
                            continue;
                        }
                    };
                    let info = DeviceInfo {
                        bus_number: sd.bus_number,
                        device_address: sd.device_address,
                        port_number: sd.port_number,
                        parent: sd.parent_name().and_then(|p| by_name.get(&p).cloned()),
                    };
                    let data = LinuxDevice {
                        dir: sd.dir.clone(),
                        descriptors: sd.descriptors.clone(),
                    };
                    match ctx.alloc_device(sd.session_id(), info, descriptor, Box::new(data)) {
                        Ok(device) => device,
                        Err(e) => {
                            log::warn!("{}: {}", sd.name, e);
                            continue;
                        }
                    }
                }
            };
            by_name.insert(sd.name, device.clone());
            devices.push(device);
        }
        Ok(devices)
    }

    fn open(&self, handle: &DeviceHandle) -> Result<BackendData> {
        let device = handle.device();
        let path = self.devfs_root.join(format!(
            "{:03}/{:03}",
            device.bus_number(),
            device.device_address()
        ));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&path)
            .map_err(|e| match e.raw_os_error() {
                Some(libc::EACCES) => {
                    log::error!("couldn't open {}: Permission denied", path.display());
                    Error::Access
                }
                Some(libc::ENOENT) => Error::NoDevice,
                _ => {
                    log::error!("open {} failed: {}", path.display(), e);
                    Error::Io
                }
            })?;
        let fd = file.as_raw_fd();
        let caps = usbfs::capabilities(fd);
        log::debug!("opened {} fd {} caps 0x{:02x}", path.display(), fd, caps);
        self.handles.lock().insert(fd, handle.downgrade());
        Ok(Box::new(LinuxHandle {
            file: Mutex::new(Some(file)),
            caps,
            urbs: Mutex::new(HashMap::new()),
        }))
    }

    fn close(&self, handle: &DeviceHandle) {
        let data = match Self::handle_data(handle) {
            Ok(data) => data,
            Err(_) => return,
        };
        if let Ok(fd) = data.fd() {
            for iface in Self::claimed(handle) {
                if let Err(e) = usbfs::release_interface(fd, iface) {
                    log::debug!("release interface {} on close: {}", iface, e);
                }
            }
            self.handles.lock().remove(&fd);
        }
        // closing the descriptor kills every URB before the slots go away
        drop(data.file.lock().take());
        data.urbs.lock().clear();
    }

    fn get_config_descriptor(&self, device: &Device, index: u8) -> Result<Vec<u8>> {
        let dev = Self::device_data(device)?;
        enumerate::config_blobs(&dev.descriptors)
            .get(index as usize)
            .map(|blob| blob.to_vec())
            .ok_or(Error::NotFound)
    }

    fn get_active_config_descriptor(&self, device: &Device) -> Result<Vec<u8>> {
        let dev = Self::device_data(device)?;
        let value = enumerate::active_configuration(&dev.dir)?;
        if value == 0 {
            return Err(Error::NotFound);
        }
        enumerate::config_blobs(&dev.descriptors)
            .into_iter()
            .find(|blob| blob.get(5) == Some(&value))
            .map(|blob| blob.to_vec())
            .ok_or(Error::NotFound)
    }

    fn get_configuration(&self, handle: &DeviceHandle) -> Result<u8> {
        enumerate::active_configuration(&Self::device_data(handle.device())?.dir)
    }

    fn set_configuration(&self, handle: &DeviceHandle, config: Option<u8>) -> Result<()> {
        usbfs::set_configuration(Self::handle_fd(handle)?, config)
    }

    fn claim_interface(&self, handle: &DeviceHandle, iface: u8) -> Result<()> {
        Self::claim(Self::handle_fd(handle)?, handle, iface)
    }

    fn release_interface(&self, handle: &DeviceHandle, iface: u8) -> Result<()> {
        let fd = Self::handle_fd(handle)?;
        usbfs::release_interface(fd, iface)?;
        if handle.auto_detach_kernel_driver() {
            if let Err(e) = usbfs::connect_driver(fd, iface) {
                log::debug!("reattaching kernel driver to interface {}: {}", iface, e);
            }
        }
        Ok(())
    }

    fn set_interface_alt_setting(&self, handle: &DeviceHandle, iface: u8, alt: u8) -> Result<()> {
        usbfs::set_interface(Self::handle_fd(handle)?, iface, alt)
    }

    fn clear_halt(&self, handle: &DeviceHandle, endpoint: Endpoint) -> Result<()> {
        usbfs::clear_halt(Self::handle_fd(handle)?, endpoint.address())
    }

    /// Claimed interfaces are released around the reset and claimed again
    /// afterwards.
    fn reset_device(&self, handle: &DeviceHandle) -> Result<()> {
        let fd = Self::handle_fd(handle)?;
        for iface in Self::claimed(handle) {
            if let Err(e) = usbfs::release_interface(fd, iface) {
                log::debug!("release interface {} before reset: {}", iface, e);
            }
        }
        let res = usbfs::reset(fd);
        for iface in Self::claimed(handle) {
            if let Err(e) = Self::claim(fd, handle, iface) {
                log::warn!("failed to re-claim interface {} after reset: {}", iface, e);
            }
        }
        res
    }

    fn kernel_driver_active(&self, handle: &DeviceHandle, iface: u8) -> Result<bool> {
        match usbfs::get_driver(Self::handle_fd(handle)?, iface)? {
            Some(name) => Ok(name != USBFS_DRIVER_NAME),
            None => Ok(false),
        }
    }

    fn detach_kernel_driver(&self, handle: &DeviceHandle, iface: u8) -> Result<()> {
        usbfs::disconnect_driver(Self::handle_fd(handle)?, iface)
    }

    fn attach_kernel_driver(&self, handle: &DeviceHandle, iface: u8) -> Result<()> {
        usbfs::connect_driver(Self::handle_fd(handle)?, iface)
    }

    fn submit_transfer(&self, transfer: &Transfer, state: &mut TransferState) -> Result<()> {
        let handle = state.handle().cloned().ok_or(Error::NoDevice)?;
        let data = Self::handle_data(&handle)?;
        let fd = data.fd()?;
        let typ = UsbFsUrb::urb_type(state.kind())?;
        let ep = state.endpoint();
        let length = state.length();
        if state.buffer().len() < length {
            return Err(Error::InvalidParam);
        }
        let buffer = if ep.is_in() && state.kind() != TransferType::Control {
            vec![0; length]
        } else {
            state.buffer()[..length].to_vec()
        };

        let mut slot = UrbSlot::new(typ, ep, buffer)?;
        slot.urb_mut().set_flags(state.flags(), data.caps)?;
        if state.kind() == TransferType::BulkStream {
            slot.urb_mut().stream_id = state.stream_id();
        }
        let key = slot.key();
        let urb = slot.as_mut_ptr();
        data.urbs.lock().insert(
            key,
            InFlight {
                slot,
                transfer: transfer.clone(),
            },
        );
        if let Err(e) = usbfs::submit_urb(fd, urb) {
            data.urbs.lock().remove(&key);
            return Err(e);
        }
        state.set_backend_data(UrbKey(key));
        Ok(())
    }

    fn cancel_transfer(&self, _transfer: &Transfer, state: &mut TransferState) -> Result<()> {
        let key = match state.backend_data::<UrbKey>() {
            Some(key) => key.0,
            None => return Err(Error::NotFound),
        };
        let handle = state.handle().cloned().ok_or(Error::NotFound)?;
        let data = Self::handle_data(&handle)?;
        let fd = data.fd()?;
        let urbs = data.urbs.lock();
        if !urbs.contains_key(&key) {
            return Err(Error::NotFound);
        }
        usbfs::discard_urb(fd, key as *const UsbFsUrb)
    }

    fn poll_sources(&self) -> Vec<PollSource> {
        self.handles
            .lock()
            .keys()
            .map(|&fd| PollSource {
                fd,
                events: PollFlags::POLLOUT,
            })
            .collect()
    }

    fn handle_events(&self, ctx: &Context, ready: &[ReadyFd]) -> Result<()> {
        for r in ready {
            let weak = self.handles.lock().get(&r.fd).cloned();
            let handle = match weak.as_ref().and_then(DeviceHandle::upgrade) {
                Some(handle) => handle,
                None => {
                    log::debug!("event on unknown fd {}", r.fd);
                    continue;
                }
            };
            let data = match Self::handle_data(&handle) {
                Ok(data) => data,
                Err(_) => continue,
            };

            if r.revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP) {
                if data.caps & USBFS_CAP_REAP_AFTER_DISCONNECT != 0 {
                    while let Ok(true) = self.reap(ctx, data) {}
                }
                self.disconnected(ctx, r.fd, &handle);
                continue;
            }

            loop {
                match self.reap(ctx, data) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(Error::NoDevice) => {
                        self.disconnected(ctx, r.fd, &handle);
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}
