//! The library context: owns the backend, the device list, the open handles,
//! the flying-transfer registry and the event machinery.
use crate::backend::{Backend, Capabilities};
use crate::descriptors::DeviceDescriptor;
use crate::device::{Device, DeviceHandle, DeviceInfo, DeviceList, HandleInner};
use crate::error::{Error, Result};
use crate::events::{EventData, EventLock, EventPipe};
use crate::flying::{DeadlineTimer, Registry, TimeoutFlags, TimerFdTimer};
use crate::hotplug::{HotplugCallbacks, HotplugEvent, HotplugMessage};
use crate::transfer::Transfer;
use parking_lot::{const_mutex, Mutex};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Runtime knobs of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Bound used by [`Context::handle_events`].
    pub handle_events_timeout: Duration,
    /// Timeout of control requests the library issues on its own behalf.
    pub control_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            handle_events_timeout: Duration::from_secs(60),
            control_timeout: Duration::from_millis(1000),
        }
    }
}

pub(crate) struct ContextInner {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) options: Options,
    pub(crate) devices: Mutex<Vec<Device>>,
    pub(crate) open_handles: Mutex<Vec<Weak<HandleInner>>>,
    pub(crate) flying: Mutex<Registry>,
    pub(crate) event_data: Mutex<EventData>,
    pub(crate) event_pipe: EventPipe,
    pub(crate) events: EventLock,
    pub(crate) hotplug: Mutex<HotplugCallbacks>,
    pub(crate) initialized: AtomicBool,
    exited: AtomicBool,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        log::debug!("context with backend {} destroyed", self.backend.name());
    }
}

#[derive(Clone)]
pub struct Context {
    pub(crate) inner: Arc<ContextInner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Context({}, {:p})", self.inner.backend.name(), Arc::as_ptr(&self.inner))
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Context {}

struct DefaultContext {
    ctx: Context,
    users: usize,
}

static DEFAULT_CONTEXT: Mutex<Option<DefaultContext>> = const_mutex(None);

/// Returns the shared default context over the platform backend, creating
/// it on first use. Every `init` must be paired with one [`Context::exit`].
#[cfg(target_os = "linux")]
pub fn init() -> Result<Context> {
    init_default_with(|| Ok(Arc::new(crate::os::linux::LinuxBackend::new())))
}

/// Same as [`init`] with a caller supplied backend, only consulted when the
/// default context does not exist yet.
pub fn init_default_with<F>(factory: F) -> Result<Context>
where
    F: FnOnce() -> Result<Arc<dyn Backend>>,
{
    let mut default = DEFAULT_CONTEXT.lock();
    if let Some(d) = default.as_mut() {
        d.users += 1;
        log::debug!("default context now has {} users", d.users);
        return Ok(d.ctx.clone());
    }
    let ctx = Context::new(factory()?)?;
    *default = Some(DefaultContext {
        ctx: ctx.clone(),
        users: 1,
    });
    log::debug!("created default context");
    Ok(ctx)
}

impl Context {
    /// An independent context.
    pub fn new(backend: Arc<dyn Backend>) -> Result<Context> {
        Self::with_options(backend, Options::default())
    }

    pub fn with_options(backend: Arc<dyn Backend>, options: Options) -> Result<Context> {
        let timer: Box<dyn DeadlineTimer> = Box::new(TimerFdTimer::new()?);
        Self::with_timer(backend, options, timer)
    }

    /// Context whose transfer deadlines are driven by `timer`.
    pub fn with_timer(
        backend: Arc<dyn Backend>,
        options: Options,
        timer: Box<dyn DeadlineTimer>,
    ) -> Result<Context> {
        let ctx = Context {
            inner: Arc::new(ContextInner {
                backend,
                options,
                devices: Mutex::new(Vec::new()),
                open_handles: Mutex::new(Vec::new()),
                flying: Mutex::new(Registry::new(timer)),
                event_data: Mutex::new(EventData::default()),
                event_pipe: EventPipe::new()?,
                events: EventLock::default(),
                hotplug: Mutex::new(HotplugCallbacks::default()),
                initialized: AtomicBool::new(false),
                exited: AtomicBool::new(false),
            }),
        };
        log::debug!("initialising backend {}", ctx.inner.backend.name());
        ctx.inner.backend.init(&ctx)?;
        ctx.inner.initialized.store(true, Ordering::SeqCst);
        Ok(ctx)
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    pub fn options(&self) -> Options {
        self.inner.options
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.backend.capabilities()
    }

    pub fn has_capability(&self, capability: Capabilities) -> bool {
        self.capabilities().contains(capability)
    }

    /// Releases one user of the context. The last user tears it down:
    /// hotplug callbacks are dropped, outstanding events drained and the
    /// backend shut down. Fails with `Busy` while handles are still open.
    pub fn exit(self) -> Result<()> {
        {
            let mut default = DEFAULT_CONTEXT.lock();
            if let Some(d) = default.as_mut() {
                if d.ctx == self {
                    if d.users > 1 {
                        d.users -= 1;
                        log::debug!("default context now has {} users", d.users);
                        return Ok(());
                    }
                    if self.has_open_handles() {
                        log::warn!("application left some devices open");
                        return Err(Error::Busy);
                    }
                    *default = None;
                }
            }
        }
        if self.has_open_handles() {
            log::warn!("application left some devices open");
            return Err(Error::Busy);
        }
        self.teardown();
        Ok(())
    }

    fn teardown(&self) {
        if self.inner.exited.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("tearing down context");
        self.deregister_all_hotplug_callbacks();

        // flush queued hotplug messages and completions
        if self.has_pending_events() {
            if let Err(e) = self.handle_events_timeout(Duration::ZERO) {
                log::warn!("error draining events on exit: {}", e);
            }
        }
        self.inner.event_data.lock().hotplug_msgs.clear();
        self.inner.backend.exit(self);
        self.inner.devices.lock().clear();
        self.inner.initialized.store(false, Ordering::SeqCst);
    }

    fn has_open_handles(&self) -> bool {
        let mut handles = self.inner.open_handles.lock();
        handles.retain(|h| h.strong_count() > 0);
        handles
            .iter()
            .filter_map(|h| h.upgrade())
            .any(|h| !h.is_closed())
    }

    pub(crate) fn has_pending_events(&self) -> bool {
        self.inner.event_data.lock().pending()
    }

    /// Creates a device for a backend. The descriptor is sanitised and the
    /// device is not yet linked into the context; see
    /// [`Context::connect_device`].
    pub fn alloc_device(
        &self,
        session_id: u64,
        info: DeviceInfo,
        descriptor: DeviceDescriptor,
        backend_data: Box<dyn Any + Send + Sync>,
    ) -> Result<Device> {
        if descriptor.num_configurations > 8 {
            log::error!("too many configurations ({})", descriptor.num_configurations);
            return Err(Error::Io);
        }
        if descriptor.num_configurations < 1 {
            log::debug!("zero configurations, maybe an unauthorized device");
        }
        Ok(Device::new(
            Arc::downgrade(&self.inner),
            session_id,
            info,
            descriptor,
            backend_data,
        ))
    }

    pub fn device_by_session_id(&self, session_id: u64) -> Option<Device> {
        self.inner
            .devices
            .lock()
            .iter()
            .find(|d| d.session_id() == session_id)
            .cloned()
    }

    /// Links a device into the context and announces its arrival.
    pub fn connect_device(&self, device: &Device) {
        device.set_attached(true);
        {
            let mut devices = self.inner.devices.lock();
            if !devices.contains(device) {
                devices.push(device.clone());
            }
        }
        self.hotplug_notification(device, HotplugEvent::Arrived);
    }

    /// Marks a device gone, unlinks it and announces its departure.
    pub fn disconnect_device(&self, device: &Device) {
        device.set_attached(false);
        self.inner.devices.lock().retain(|d| d != device);
        self.hotplug_notification(device, HotplugEvent::Left);
    }

    fn hotplug_notification(&self, device: &Device, event: HotplugEvent) {
        if !self.has_capability(Capabilities::HAS_HOTPLUG)
            || !self.inner.initialized.load(Ordering::SeqCst)
        {
            return;
        }
        self.queue_hotplug_message(HotplugMessage {
            event,
            device: Some(device.clone()),
        });
    }

    pub(crate) fn queue_hotplug_message(&self, message: HotplugMessage) {
        let mut ev = self.inner.event_data.lock();
        let pending = ev.pending();
        ev.hotplug_msgs.push_back(message);
        if !pending {
            self.inner.event_pipe.signal();
        }
    }

    /// Snapshot of the attached devices.
    pub fn devices(&self) -> Result<DeviceList> {
        let backend = &self.inner.backend;
        if self.has_capability(Capabilities::HAS_HOTPLUG) {
            backend.hotplug_poll(self);
            let devices = self.inner.devices.lock();
            return Ok(DeviceList::new(
                devices.iter().filter(|d| d.is_attached()).cloned().collect(),
            ));
        }

        let discovered = backend.get_device_list(self)?;
        let mut devices = self.inner.devices.lock();
        for old in devices.iter() {
            if !discovered.contains(old) {
                log::debug!("device {} vanished", old);
                old.set_attached(false);
            }
        }
        for dev in &discovered {
            dev.set_attached(true);
        }
        *devices = discovered.clone();
        Ok(DeviceList::new(discovered))
    }

    /// Opens the first device matching `vendor_id` and `product_id`.
    pub fn open_device_with_vid_pid(&self, vendor_id: u16, product_id: u16) -> Result<Option<DeviceHandle>> {
        for device in self.devices()?.iter() {
            let desc = device.device_descriptor();
            if desc.id_vendor == vendor_id && desc.id_product == product_id {
                return device.open().map(Some);
            }
        }
        Ok(None)
    }

    pub(crate) fn register_handle(&self, handle: &DeviceHandle) {
        let mut handles = self.inner.open_handles.lock();
        handles.retain(|h| h.strong_count() > 0);
        handles.push(handle.downgrade());
    }

    pub(crate) fn unregister_handle(&self, handle: &DeviceHandle) {
        self.inner
            .open_handles
            .lock()
            .retain(|h| h.strong_count() > 0 && !handle.is_same(h));
    }

    pub(crate) fn remove_flying(&self, transfer: &Transfer) -> Result<bool> {
        let now = self.inner.backend.clock_now();
        self.inner.flying.lock().remove(transfer, now)
    }

    pub(crate) fn transfer_timed_out(&self, transfer: &Transfer) -> bool {
        self.inner
            .flying
            .lock()
            .timeout_flags(transfer)
            .map_or(false, |f| f.contains(TimeoutFlags::TIMED_OUT))
    }

    /// Number of transfers currently registered as in flight.
    pub fn flying_transfers(&self) -> usize {
        self.inner.flying.lock().len()
    }
}
