//! Devices and open device handles.
use crate::backend::{BackendData, Capabilities};
use crate::context::{Context, ContextInner};
use crate::control_transfer::{REQUEST_GET_CONFIGURATION, RECIPIENT_DEVICE, REQUEST_TYPE_STANDARD};
use crate::descriptors::{self, ConfigDescriptor, DeviceDescriptor, EndpointDescriptor};
use crate::endpoint::{Endpoint, ENDPOINT_IN};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Bus topology a backend reports when it creates a device.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub bus_number: u8,
    pub device_address: u8,
    /// Port on the parent hub, 0 for root hubs.
    pub port_number: u8,
    pub parent: Option<Device>,
}

pub(crate) struct DeviceInner {
    ctx: Weak<ContextInner>,
    session_id: u64,
    info: DeviceInfo,
    descriptor: DeviceDescriptor,
    attached: Mutex<bool>,
    backend_data: Box<dyn Any + Send + Sync>,
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        log::debug!(
            "destroy device {}.{}",
            self.info.bus_number,
            self.info.device_address
        );
    }
}

#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Device {}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:03}:{:03} {:04x}:{:04x}",
            self.inner.info.bus_number,
            self.inner.info.device_address,
            self.inner.descriptor.id_vendor,
            self.inner.descriptor.id_product
        )
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Device({})", self)
    }
}

impl Device {
    pub(crate) fn new(
        ctx: Weak<ContextInner>,
        session_id: u64,
        info: DeviceInfo,
        descriptor: DeviceDescriptor,
        backend_data: Box<dyn Any + Send + Sync>,
    ) -> Self {
        Device {
            inner: Arc::new(DeviceInner {
                ctx,
                session_id,
                info,
                descriptor,
                attached: Mutex::new(false),
                backend_data,
            }),
        }
    }

    /// `NoDevice` once the owning context is gone.
    pub fn context(&self) -> Result<Context> {
        self.inner
            .ctx
            .upgrade()
            .map(|inner| Context { inner })
            .ok_or(Error::NoDevice)
    }

    pub fn session_id(&self) -> u64 {
        self.inner.session_id
    }

    pub fn bus_number(&self) -> u8 {
        self.inner.info.bus_number
    }

    pub fn device_address(&self) -> u8 {
        self.inner.info.device_address
    }

    pub fn port_number(&self) -> u8 {
        self.inner.info.port_number
    }

    pub fn parent(&self) -> Option<Device> {
        self.inner.info.parent.clone()
    }

    /// Fills `ports` with the port path from the root hub down to this
    /// device and returns how many entries were written.
    pub fn port_numbers(&self, ports: &mut [u8]) -> Result<usize> {
        if ports.is_empty() {
            return Err(Error::InvalidParam);
        }
        let mut i = ports.len();
        let mut dev = Some(self.clone());
        while let Some(d) = dev {
            // root hubs are listed with port 0
            if d.port_number() == 0 {
                break;
            }
            if i == 0 {
                log::warn!("port numbers array is too small");
                return Err(Error::Overflow);
            }
            i -= 1;
            ports[i] = d.port_number();
            dev = d.parent();
        }
        let count = ports.len() - i;
        ports.copy_within(i.., 0);
        Ok(count)
    }

    pub fn port_path(&self) -> Vec<u8> {
        let mut path = Vec::new();
        let mut dev = Some(self.clone());
        while let Some(d) = dev {
            if d.port_number() == 0 {
                break;
            }
            path.push(d.port_number());
            dev = d.parent();
        }
        path.reverse();
        path
    }

    pub fn is_attached(&self) -> bool {
        *self.inner.attached.lock()
    }

    pub(crate) fn set_attached(&self, attached: bool) {
        *self.inner.attached.lock() = attached;
    }

    pub fn backend_data<T: Any>(&self) -> Option<&T> {
        self.inner.backend_data.downcast_ref::<T>()
    }

    pub fn device_descriptor(&self) -> DeviceDescriptor {
        self.inner.descriptor.clone()
    }

    pub fn config_descriptor(&self, index: u8) -> Result<ConfigDescriptor> {
        if index >= self.inner.descriptor.num_configurations {
            return Err(Error::NotFound);
        }
        let ctx = self.context()?;
        let raw = ctx.backend().get_config_descriptor(self, index)?;
        Ok(descriptors::parse_configuration(&raw)?)
    }

    pub fn active_config_descriptor(&self) -> Result<ConfigDescriptor> {
        let ctx = self.context()?;
        let raw = ctx.backend().get_active_config_descriptor(self)?;
        Ok(descriptors::parse_configuration(&raw)?)
    }

    pub fn config_descriptor_by_value(&self, value: u8) -> Result<ConfigDescriptor> {
        let ctx = self.context()?;
        for index in 0..self.inner.descriptor.num_configurations {
            let raw = ctx.backend().get_config_descriptor(self, index)?;
            if raw.len() > 5 && raw[5] == value {
                return Ok(descriptors::parse_configuration(&raw)?);
            }
        }
        Err(Error::NotFound)
    }

    fn find_endpoint(&self, endpoint: Endpoint) -> Result<EndpointDescriptor> {
        let config = self.active_config_descriptor().map_err(|e| {
            log::error!("could not retrieve active config descriptor: {}", e);
            Error::Other
        })?;
        config
            .interfaces
            .iter()
            .flat_map(|i| i.endpoints.iter())
            .find(|ep| ep.endpoint_address == endpoint.address())
            .cloned()
            .ok_or(Error::NotFound)
    }

    /// `wMaxPacketSize` of `endpoint` in the active configuration.
    pub fn max_packet_size(&self, endpoint: Endpoint) -> Result<u16> {
        Ok(self.find_endpoint(endpoint)?.max_packet_size)
    }

    pub fn max_iso_packet_size(&self, endpoint: Endpoint) -> Result<usize> {
        Ok(self.find_endpoint(endpoint)?.max_iso_packet_size())
    }

    /// Opens the device. `NoDevice` if it is no longer attached.
    pub fn open(&self) -> Result<DeviceHandle> {
        let ctx = self.context()?;
        if !self.is_attached() {
            return Err(Error::NoDevice);
        }
        let handle = DeviceHandle {
            inner: Arc::new(HandleInner {
                ctx: ctx.clone(),
                device: self.clone(),
                claimed: Mutex::new(0),
                auto_detach_kernel_driver: AtomicBool::new(false),
                backend_data: OnceLock::new(),
                closed: AtomicBool::new(false),
            }),
        };
        let data = match ctx.backend().open(&handle) {
            Ok(data) => data,
            Err(e) => {
                handle.inner.closed.store(true, Ordering::SeqCst);
                return Err(e);
            }
        };
        if handle.inner.backend_data.set(data).is_err() {
            log::warn!("backend data for {} set twice", self);
        }
        ctx.register_handle(&handle);
        log::debug!("opened {}", self);
        Ok(handle)
    }
}

/// Devices returned by [`Context::devices`]. Dropping the list releases
/// its references.
#[derive(Debug, Clone)]
pub struct DeviceList {
    devices: Vec<Device>,
}

impl DeviceList {
    pub(crate) fn new(devices: Vec<Device>) -> Self {
        DeviceList { devices }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Device> {
        self.devices.iter()
    }
}

impl Deref for DeviceList {
    type Target = [Device];
    fn deref(&self) -> &[Device] {
        &self.devices
    }
}

impl IntoIterator for DeviceList {
    type Item = Device;
    type IntoIter = std::vec::IntoIter<Device>;
    fn into_iter(self) -> Self::IntoIter {
        self.devices.into_iter()
    }
}

pub(crate) struct HandleInner {
    ctx: Context,
    device: Device,
    /// Bitmask of claimed interfaces.
    claimed: Mutex<u32>,
    auto_detach_kernel_driver: AtomicBool,
    backend_data: OnceLock<BackendData>,
    closed: AtomicBool,
}

impl HandleInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if !self.is_closed() {
            log::debug!("handle for {} dropped without close", self.device);
        }
    }
}

/// An open device. Clones share the same handle; [`DeviceHandle::close`]
/// closes it for all of them.
#[derive(Clone)]
pub struct DeviceHandle {
    inner: Arc<HandleInner>,
}

impl PartialEq for DeviceHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for DeviceHandle {}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DeviceHandle({})", self.inner.device)
    }
}

const MAX_INTERFACES: u8 = 32;

impl DeviceHandle {
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn backend_data<T: Any>(&self) -> Option<&T> {
        self.inner.backend_data.get()?.downcast_ref::<T>()
    }

    pub(crate) fn downgrade(&self) -> Weak<HandleInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<HandleInner>) -> Option<DeviceHandle> {
        weak.upgrade().map(|inner| DeviceHandle { inner })
    }

    pub(crate) fn is_same(&self, other: &Weak<HandleInner>) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.inner), other.as_ptr())
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::NoDevice);
        }
        Ok(())
    }

    fn check_attached(&self) -> Result<()> {
        self.check_open()?;
        if !self.inner.device.is_attached() {
            return Err(Error::NoDevice);
        }
        Ok(())
    }

    /// Bitmask of claimed interfaces.
    pub fn claimed_interfaces(&self) -> u32 {
        *self.inner.claimed.lock()
    }

    pub fn auto_detach_kernel_driver(&self) -> bool {
        self.inner.auto_detach_kernel_driver.load(Ordering::SeqCst)
    }

    pub fn claim_interface(&self, iface: u8) -> Result<()> {
        if iface >= MAX_INTERFACES {
            return Err(Error::InvalidParam);
        }
        self.check_attached()?;
        let mut claimed = self.inner.claimed.lock();
        if *claimed & (1 << iface) != 0 {
            return Ok(());
        }
        self.inner.ctx.backend().claim_interface(self, iface)?;
        *claimed |= 1 << iface;
        Ok(())
    }

    pub fn release_interface(&self, iface: u8) -> Result<()> {
        if iface >= MAX_INTERFACES {
            return Err(Error::InvalidParam);
        }
        self.check_open()?;
        let mut claimed = self.inner.claimed.lock();
        if *claimed & (1 << iface) == 0 {
            return Err(Error::NotFound);
        }
        self.inner.ctx.backend().release_interface(self, iface)?;
        *claimed &= !(1 << iface);
        Ok(())
    }

    pub fn set_interface_alt_setting(&self, iface: u8, alt: u8) -> Result<()> {
        if iface >= MAX_INTERFACES {
            return Err(Error::InvalidParam);
        }
        let claimed = *self.inner.claimed.lock();
        self.check_attached()?;
        if claimed & (1 << iface) == 0 {
            return Err(Error::NotFound);
        }
        self.inner.ctx.backend().set_interface_alt_setting(self, iface, alt)
    }

    /// The active configuration value, 0 when unconfigured.
    pub fn get_configuration(&self) -> Result<u8> {
        self.check_open()?;
        match self.inner.ctx.backend().get_configuration(self) {
            Err(Error::NotSupported) => {
                log::debug!("falling back to control message");
                let mut config = [0u8; 1];
                let timeout = self.inner.ctx.options().control_timeout;
                let n = self.control_transfer(
                    ENDPOINT_IN | REQUEST_TYPE_STANDARD | RECIPIENT_DEVICE,
                    REQUEST_GET_CONFIGURATION,
                    0,
                    0,
                    &mut config,
                    timeout,
                )?;
                if n == 0 {
                    log::error!("zero bytes returned in ctrl transfer?");
                    return Err(Error::Io);
                }
                Ok(config[0])
            }
            other => other,
        }
    }

    /// `None` selects the unconfigured state.
    pub fn set_configuration(&self, config: Option<u8>) -> Result<()> {
        self.check_open()?;
        self.inner.ctx.backend().set_configuration(self, config)
    }

    pub fn clear_halt(&self, endpoint: Endpoint) -> Result<()> {
        self.check_attached()?;
        self.inner.ctx.backend().clear_halt(self, endpoint)
    }

    pub fn reset_device(&self) -> Result<()> {
        self.check_attached()?;
        self.inner.ctx.backend().reset_device(self)
    }

    pub fn kernel_driver_active(&self, iface: u8) -> Result<bool> {
        if iface >= MAX_INTERFACES {
            return Err(Error::InvalidParam);
        }
        self.check_attached()?;
        self.inner.ctx.backend().kernel_driver_active(self, iface)
    }

    pub fn detach_kernel_driver(&self, iface: u8) -> Result<()> {
        if iface >= MAX_INTERFACES {
            return Err(Error::InvalidParam);
        }
        self.check_attached()?;
        self.inner.ctx.backend().detach_kernel_driver(self, iface)
    }

    pub fn attach_kernel_driver(&self, iface: u8) -> Result<()> {
        if iface >= MAX_INTERFACES {
            return Err(Error::InvalidParam);
        }
        self.check_attached()?;
        self.inner.ctx.backend().attach_kernel_driver(self, iface)
    }

    pub fn set_auto_detach_kernel_driver(&self, enable: bool) -> Result<()> {
        if !self
            .inner
            .ctx
            .has_capability(Capabilities::SUPPORTS_DETACH_KERNEL_DRIVER)
        {
            return Err(Error::NotSupported);
        }
        self.inner
            .auto_detach_kernel_driver
            .store(enable, Ordering::SeqCst);
        Ok(())
    }

    /// Closes the handle. Transfers still registered for it are unlinked
    /// and lose their handle; the application keeps the transfer objects.
    /// Closing twice is a no-op.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let ctx = &self.inner.ctx;
        log::debug!("closing {}", self.inner.device);

        self.excise_transfers();

        let handling_events = ctx.is_handling_thread();
        let lock = if handling_events {
            None
        } else {
            {
                let mut ev = ctx.inner.event_data.lock();
                let pending = ev.pending();
                ev.device_close += 1;
                if !pending {
                    ctx.inner.event_pipe.signal();
                }
            }
            Some(ctx.lock_events())
        };

        ctx.backend().close(self);
        ctx.unregister_handle(self);

        if let Some(lock) = lock {
            {
                let mut ev = ctx.inner.event_data.lock();
                ev.device_close -= 1;
                if !ev.pending() {
                    ctx.inner.event_pipe.clear();
                }
            }
            drop(lock);
        }
    }

    fn excise_transfers(&self) {
        let ctx = &self.inner.ctx;
        let now = ctx.backend().clock_now();
        let mut registry = ctx.inner.flying.lock();
        let (removed, res) = registry.remove_where(
            |t| {
                let mut state = t.lock();
                if state.handle.as_ref() != Some(self) {
                    return false;
                }
                if let Some((level, what)) = state.close_anomaly() {
                    log::log!(level, "closing {} with {}", self.inner.device, what);
                }
                state.handle = None;
                true
            },
            now,
        );
        drop(registry);
        if let Err(e) = res {
            log::warn!("failed to rearm timer after close: {}", e);
        }
        for t in removed {
            log::debug!("removed {:?} from the in-flight list because its handle closed", t);
        }
    }
}
