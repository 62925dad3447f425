#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use usbhost::descriptors::DeviceDescriptor;
use usbhost::{
    Backend, BackendData, Capabilities, Completion, Context, Device, DeviceHandle, DeviceInfo,
    Error, Result, Transfer, TransferState, TransferStatus,
};

pub const CONFIG: [u8; 25] = [
    0x09, 0x02, 0x19, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32, // config
    0x09, 0x04, 0x00, 0x00, 0x01, 0xff, 0x00, 0x00, 0x00, // interface 0
    0x07, 0x05, 0x81, 0x02, 0x40, 0x00, 0x00, // ep 0x81 bulk
];

/// Outcome the next finalize reports, stored as the transfer's backend data.
struct Outcome(Completion);

/// An in-memory backend. Transfers stay in flight until the test completes
/// them; cancellation queues a `Cancelled` completion unless disabled.
#[derive(Default)]
pub struct MockBackend {
    pub hotplug: bool,
    pub submitted: Mutex<Vec<Transfer>>,
    pub submit_error: Mutex<Option<Error>>,
    pub cancel_error: Mutex<Option<Error>>,
    pub open_error: Mutex<Option<Error>>,
    /// Do not queue a completion when a cancel is accepted.
    pub hold_cancels: Mutex<bool>,
    pub devices: Mutex<Vec<Device>>,
    pub closes: AtomicUsize,
    pub cancels: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(MockBackend::default())
    }

    pub fn with_hotplug() -> Arc<Self> {
        Arc::new(MockBackend {
            hotplug: true,
            ..Default::default()
        })
    }

    pub fn context(self: &Arc<Self>) -> Context {
        Context::new(self.clone()).unwrap()
    }

    /// Creates and connects a device.
    pub fn add_device(&self, ctx: &Context, address: u8, vendor: u16, product: u16) -> Device {
        let device = ctx
            .alloc_device(
                address as u64,
                DeviceInfo {
                    bus_number: 1,
                    device_address: address,
                    port_number: address,
                    parent: None,
                },
                descriptor(vendor, product),
                Box::new(()),
            )
            .unwrap();
        self.devices.lock().push(device.clone());
        ctx.connect_device(&device);
        device
    }

    pub fn remove_device(&self, ctx: &Context, device: &Device) {
        self.devices.lock().retain(|d| d != device);
        ctx.disconnect_device(device);
    }

    /// Queues a completion for the event handler.
    pub fn complete(&self, ctx: &Context, transfer: &Transfer, status: TransferStatus, transferred: usize) {
        transfer.with_state(|s| {
            s.set_transferred(transferred);
            s.set_backend_data(Outcome(Completion::Status(status)));
        });
        ctx.signal_transfer_completion(transfer);
    }

    /// Queues the completion of a cancellation the backend finished.
    pub fn complete_cancelled(&self, ctx: &Context, transfer: &Transfer) {
        transfer.with_state(|s| s.set_backend_data(Outcome(Completion::Cancelled)));
        ctx.signal_transfer_completion(transfer);
    }

    /// Waits for the `n`th submission, from any thread.
    pub fn wait_submitted(&self, n: usize) -> Transfer {
        let start = Instant::now();
        loop {
            if let Some(t) = self.submitted.lock().get(n - 1) {
                return t.clone();
            }
            assert!(start.elapsed() < Duration::from_secs(5), "no submission");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn last_submitted(&self) -> Transfer {
        self.submitted.lock().last().cloned().unwrap()
    }
}

pub fn descriptor(vendor: u16, product: u16) -> DeviceDescriptor {
    DeviceDescriptor {
        length: 18,
        kind: 1,
        bcd_usb: 0x0200,
        device_class: 0,
        device_sub_class: 0,
        device_protocol: 0,
        max_packet_size0: 64,
        id_vendor: vendor,
        id_product: product,
        bcd_device: 0x0100,
        imanufacturer: 1,
        iproduct: 2,
        iserial_number: 3,
        num_configurations: 1,
    }
}

impl Backend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn capabilities(&self) -> Capabilities {
        if self.hotplug {
            Capabilities::HAS_HOTPLUG
        } else {
            Capabilities::empty()
        }
    }

    fn get_device_list(&self, _ctx: &Context) -> Result<Vec<Device>> {
        Ok(self.devices.lock().clone())
    }

    fn open(&self, _handle: &DeviceHandle) -> Result<BackendData> {
        match *self.open_error.lock() {
            Some(e) => Err(e),
            None => Ok(Box::new(())),
        }
    }

    fn close(&self, _handle: &DeviceHandle) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn get_config_descriptor(&self, _device: &Device, index: u8) -> Result<Vec<u8>> {
        if index == 0 {
            Ok(CONFIG.to_vec())
        } else {
            Err(Error::NotFound)
        }
    }

    fn get_active_config_descriptor(&self, _device: &Device) -> Result<Vec<u8>> {
        Ok(CONFIG.to_vec())
    }

    fn claim_interface(&self, _handle: &DeviceHandle, _iface: u8) -> Result<()> {
        Ok(())
    }

    fn release_interface(&self, _handle: &DeviceHandle, _iface: u8) -> Result<()> {
        Ok(())
    }

    fn submit_transfer(&self, transfer: &Transfer, _state: &mut TransferState) -> Result<()> {
        if let Some(e) = *self.submit_error.lock() {
            return Err(e);
        }
        self.submitted.lock().push(transfer.clone());
        Ok(())
    }

    fn cancel_transfer(&self, transfer: &Transfer, state: &mut TransferState) -> Result<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = *self.cancel_error.lock() {
            return Err(e);
        }
        if !*self.hold_cancels.lock() {
            state.set_backend_data(Outcome(Completion::Cancelled));
            let ctx = state.handle().map(|h| h.context().clone());
            if let Some(ctx) = ctx {
                ctx.signal_transfer_completion(transfer);
            }
        }
        Ok(())
    }

    fn finalize_completion(&self, state: &mut TransferState) -> Result<Completion> {
        match state.take_backend_data() {
            Some(data) => match data.downcast::<Outcome>() {
                Ok(outcome) => Ok(outcome.0),
                Err(_) => Err(Error::Other),
            },
            None => Err(Error::Other),
        }
    }
}

/// Runs the event loop until `done` or `limit` passes.
pub fn pump_until(ctx: &Context, limit: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while !done() {
        if start.elapsed() > limit {
            return false;
        }
        match ctx.handle_events_timeout(Duration::from_millis(20)) {
            Ok(()) | Err(Error::Interrupted) => {}
            Err(e) => panic!("handle_events failed: {}", e),
        }
    }
    true
}

/// Callback that counts invocations and records the last status.
pub fn recorder() -> (Arc<Mutex<Vec<TransferStatus>>>, impl FnMut(&Transfer) + Send + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |t: &Transfer| sink.lock().push(t.status()))
}
