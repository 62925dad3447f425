//! Hotplug notifications, delivered by the event handling thread.
use crate::backend::Capabilities;
use crate::context::Context;
use crate::device::Device;
use crate::error::{Error, Result};
use bitflags::bitflags;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HotplugEvent {
    Arrived,
    Left,
}

bitflags! {
    pub struct HotplugEvents: u8 {
        const ARRIVED = 0x01;
        const LEFT = 0x02;
    }
}

bitflags! {
    pub struct HotplugFlags: u8 {
        /// Report already attached devices as arrivals at registration.
        const ENUMERATE = 0x01;
    }
}

impl From<HotplugEvent> for HotplugEvents {
    fn from(event: HotplugEvent) -> Self {
        match event {
            HotplugEvent::Arrived => HotplugEvents::ARRIVED,
            HotplugEvent::Left => HotplugEvents::LEFT,
        }
    }
}

/// Which devices and events a callback wants. `None` matches anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotplugFilter {
    pub events: HotplugEvents,
    pub flags: HotplugFlags,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub dev_class: Option<u8>,
}

impl Default for HotplugFilter {
    fn default() -> Self {
        HotplugFilter {
            events: HotplugEvents::all(),
            flags: HotplugFlags::empty(),
            vendor_id: None,
            product_id: None,
            dev_class: None,
        }
    }
}

impl HotplugFilter {
    pub fn new(events: HotplugEvents) -> Self {
        HotplugFilter {
            events,
            ..Default::default()
        }
    }

    pub fn enumerate(mut self) -> Self {
        self.flags |= HotplugFlags::ENUMERATE;
        self
    }

    pub fn vendor_id(mut self, vendor_id: u16) -> Self {
        self.vendor_id = Some(vendor_id);
        self
    }

    pub fn product_id(mut self, product_id: u16) -> Self {
        self.product_id = Some(product_id);
        self
    }

    pub fn dev_class(mut self, dev_class: u8) -> Self {
        self.dev_class = Some(dev_class);
        self
    }

    pub fn matches(&self, device: &Device, event: HotplugEvent) -> bool {
        if !self.events.contains(event.into()) {
            return false;
        }
        let desc = device.device_descriptor();
        self.vendor_id.map_or(true, |v| v == desc.id_vendor)
            && self.product_id.map_or(true, |p| p == desc.id_product)
            && self.dev_class.map_or(true, |c| c == desc.device_class)
    }
}

/// Returning `true` deregisters the callback.
pub type HotplugFn = Box<dyn FnMut(&Context, &Device, HotplugEvent) -> bool + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HotplugHandle(u32);

pub(crate) struct HotplugCallback {
    handle: HotplugHandle,
    filter: HotplugFilter,
    needs_free: AtomicBool,
    cb: Mutex<HotplugFn>,
}

impl HotplugCallback {
    fn call(&self, ctx: &Context, device: &Device, event: HotplugEvent) {
        if self.needs_free.load(Ordering::SeqCst) || !self.filter.matches(device, event) {
            return;
        }
        let mut cb = self.cb.lock();
        let f = &mut *cb;
        if f(ctx, device, event) {
            self.needs_free.store(true, Ordering::SeqCst);
        }
    }
}

pub(crate) struct HotplugCallbacks {
    callbacks: Vec<Arc<HotplugCallback>>,
    next_handle: u32,
}

impl Default for HotplugCallbacks {
    fn default() -> Self {
        HotplugCallbacks {
            callbacks: Vec::new(),
            next_handle: 1,
        }
    }
}

/// One arrival or departure queued for the handling thread. A message
/// without a device only wakes the handler to sweep deregistered callbacks.
pub(crate) struct HotplugMessage {
    pub(crate) event: HotplugEvent,
    pub(crate) device: Option<Device>,
}

impl Context {
    pub fn register_hotplug_callback<F>(&self, filter: HotplugFilter, callback: F) -> Result<HotplugHandle>
    where
        F: FnMut(&Context, &Device, HotplugEvent) -> bool + Send + 'static,
    {
        if !self.has_capability(Capabilities::HAS_HOTPLUG) {
            return Err(Error::NotSupported);
        }
        if filter.events.is_empty() {
            return Err(Error::InvalidParam);
        }

        let callback = {
            let mut list = self.inner.hotplug.lock();
            let handle = HotplugHandle(list.next_handle);
            list.next_handle = list.next_handle.wrapping_add(1).max(1);
            let cb = Arc::new(HotplugCallback {
                handle,
                filter,
                needs_free: AtomicBool::new(false),
                cb: Mutex::new(Box::new(callback)),
            });
            list.callbacks.push(cb.clone());
            cb
        };
        log::debug!("new hotplug cb {:?}", callback.handle);

        if filter.flags.contains(HotplugFlags::ENUMERATE) {
            let devices = self.devices()?;
            for device in devices.iter() {
                callback.call(self, device, HotplugEvent::Arrived);
            }
            if callback.needs_free.load(Ordering::SeqCst) {
                self.sweep_hotplug_callbacks();
            }
        }
        Ok(callback.handle)
    }

    /// Marks the callback for removal. It is dropped by the handling
    /// thread and never called again.
    pub fn deregister_hotplug_callback(&self, handle: HotplugHandle) {
        if !self.has_capability(Capabilities::HAS_HOTPLUG) {
            return;
        }
        log::debug!("deregister hotplug cb {:?}", handle);
        let found = {
            let list = self.inner.hotplug.lock();
            match list.callbacks.iter().find(|c| c.handle == handle) {
                Some(cb) => {
                    cb.needs_free.store(true, Ordering::SeqCst);
                    true
                }
                None => false,
            }
        };
        if found {
            self.queue_hotplug_message(HotplugMessage {
                event: HotplugEvent::Left,
                device: None,
            });
        }
    }

    pub(crate) fn deregister_all_hotplug_callbacks(&self) {
        self.inner.hotplug.lock().callbacks.clear();
    }

    pub fn hotplug_callbacks(&self) -> usize {
        self.inner
            .hotplug
            .lock()
            .callbacks
            .iter()
            .filter(|c| !c.needs_free.load(Ordering::SeqCst))
            .count()
    }

    fn sweep_hotplug_callbacks(&self) {
        self.inner
            .hotplug
            .lock()
            .callbacks
            .retain(|c| !c.needs_free.load(Ordering::SeqCst));
    }

    /// Runs matching callbacks for one message, outside the list lock.
    pub(crate) fn dispatch_hotplug(&self, message: HotplugMessage) {
        if let Some(device) = message.device.as_ref() {
            let callbacks: Vec<Arc<HotplugCallback>> = self.inner.hotplug.lock().callbacks.clone();
            log::debug!("hotplug {:?} for {}", message.event, device);
            for cb in callbacks {
                cb.call(self, device, message.event);
            }
        }
        self.sweep_hotplug_callbacks();
        // a departure message holds the last reference to its device
        drop(message);
    }
}
