//! Asynchronous transfers.
//!
//! A [`Transfer`] is owned by the application. Submitting it hands the core a
//! registry membership until the single completion for that submission has
//! been delivered through the callback.
use crate::backend::Completion;
use crate::context::Context;
use crate::control_transfer::{ControlSetup, CONTROL_SETUP_SIZE};
use crate::device::{Device, DeviceHandle};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
    BulkStream,
}

impl TransferType {
    /// Decodes the transfer type bits of an endpoint's `bmAttributes`.
    pub fn from_attributes(bm_attributes: u8) -> Self {
        match bm_attributes & 0x03 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }
}

/// Outcome of one submission, reported exactly once through the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            TransferStatus::Completed => "LIBUSB_TRANSFER_COMPLETED",
            TransferStatus::Error => "LIBUSB_TRANSFER_ERROR",
            TransferStatus::TimedOut => "LIBUSB_TRANSFER_TIMED_OUT",
            TransferStatus::Cancelled => "LIBUSB_TRANSFER_CANCELLED",
            TransferStatus::Stall => "LIBUSB_TRANSFER_STALL",
            TransferStatus::NoDevice => "LIBUSB_TRANSFER_NO_DEVICE",
            TransferStatus::Overflow => "LIBUSB_TRANSFER_OVERFLOW",
        };
        write!(f, "{}", name)
    }
}

bitflags! {
    /// Caller controlled behaviour of a transfer.
    pub struct TransferFlags: u8 {
        /// A completion shorter than requested is reported as `Error`.
        const SHORT_NOT_OK = 0x01;
        /// Terminate an OUT transfer that is a multiple of the packet size
        /// with a zero length packet.
        const ADD_ZERO_PACKET = 0x08;
    }
}

bitflags! {
    /// Core bookkeeping, guarded by the per-transfer lock.
    pub struct StateFlags: u8 {
        const IN_FLIGHT = 0x01;
        const CANCELLING = 0x02;
        const DEVICE_DISAPPEARED = 0x04;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IsoPacket {
    pub length: u32,
    pub actual_length: u32,
    pub status: Option<TransferStatus>,
}

pub type TransferCallback = Box<dyn FnMut(&Transfer) + Send>;

pub struct TransferState {
    pub(crate) handle: Option<DeviceHandle>,
    endpoint: Endpoint,
    kind: TransferType,
    buffer: Vec<u8>,
    length: usize,
    timeout: Duration,
    flags: TransferFlags,
    stream_id: u32,
    iso_packets: Vec<IsoPacket>,
    callback: Option<TransferCallback>,
    status: TransferStatus,
    actual_length: usize,
    transferred: usize,
    pub(crate) state_flags: StateFlags,
    device_ref: Option<Device>,
    backend_data: Option<Box<dyn Any + Send>>,
}

impl TransferState {
    fn new(iso_packets: usize) -> Self {
        TransferState {
            handle: None,
            endpoint: Endpoint::CONTROL,
            kind: TransferType::Bulk,
            buffer: vec![],
            length: 0,
            timeout: Duration::ZERO,
            flags: TransferFlags::empty(),
            stream_id: 0,
            iso_packets: vec![IsoPacket::default(); iso_packets],
            callback: None,
            status: TransferStatus::Completed,
            actual_length: 0,
            transferred: 0,
            state_flags: StateFlags::empty(),
            device_ref: None,
            backend_data: None,
        }
    }

    pub fn handle(&self) -> Option<&DeviceHandle> {
        self.handle.as_ref()
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn kind(&self) -> TransferType {
        self.kind
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Bytes to transfer, the setup packet included for control transfers.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Zero means no timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn flags(&self) -> TransferFlags {
        self.flags
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn iso_packets(&self) -> &[IsoPacket] {
        &self.iso_packets
    }

    pub fn iso_packets_mut(&mut self) -> &mut [IsoPacket] {
        &mut self.iso_packets
    }

    /// Bytes moved so far by the backend. Becomes the transfer's actual
    /// length on completion.
    pub fn transferred(&self) -> usize {
        self.transferred
    }

    pub fn set_transferred(&mut self, transferred: usize) {
        self.transferred = transferred;
    }

    pub fn is_cancelling(&self) -> bool {
        self.state_flags.contains(StateFlags::CANCELLING)
    }

    pub fn device_disappeared(&self) -> bool {
        self.state_flags.contains(StateFlags::DEVICE_DISAPPEARED)
    }

    /// What closing the handle under this transfer is worth reporting.
    /// Nothing unless the backend owns it and the device is still there.
    pub(crate) fn close_anomaly(&self) -> Option<(log::Level, &'static str)> {
        if !self.state_flags.contains(StateFlags::IN_FLIGHT) || self.device_disappeared() {
            None
        } else if self.is_cancelling() {
            Some((log::Level::Warn, "a cancellation still pending"))
        } else {
            Some((log::Level::Error, "a transfer in flight and no cancel requested"))
        }
    }

    pub fn backend_data<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.backend_data.as_mut()?.downcast_mut::<T>()
    }

    pub fn set_backend_data<T: Any + Send>(&mut self, data: T) {
        self.backend_data = Some(Box::new(data));
    }

    pub fn take_backend_data(&mut self) -> Option<Box<dyn Any + Send>> {
        self.backend_data.take()
    }
}

struct TransferInner {
    state: Mutex<TransferState>,
}

/// Cheaply clonable. Clones refer to the same transfer.
#[derive(Clone)]
pub struct Transfer {
    inner: Arc<TransferInner>,
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Transfer({:p})", Arc::as_ptr(&self.inner))
    }
}

impl PartialEq for Transfer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Transfer {}

impl Transfer {
    /// An empty transfer with room for `iso_packets` isochronous packet
    /// descriptors.
    pub fn new(iso_packets: usize) -> Self {
        Transfer {
            inner: Arc::new(TransferInner {
                state: Mutex::new(TransferState::new(iso_packets)),
            }),
        }
    }

    /// `buffer` starts with the 8 byte setup packet; its `wLength` decides
    /// the transfer length.
    pub fn control<F>(handle: &DeviceHandle, buffer: Vec<u8>, timeout: Duration, callback: F) -> Self
    where
        F: FnMut(&Transfer) + Send + 'static,
    {
        let length = match ControlSetup::from_bytes(&buffer) {
            Some(setup) => CONTROL_SETUP_SIZE + setup.length as usize,
            None => buffer.len(),
        };
        let t = Transfer::new(0);
        {
            let mut s = t.lock();
            s.handle = Some(handle.clone());
            s.endpoint = Endpoint::CONTROL;
            s.kind = TransferType::Control;
            s.length = length;
            s.buffer = buffer;
            s.timeout = timeout;
            s.callback = Some(Box::new(callback));
        }
        t
    }

    pub fn bulk<F>(
        handle: &DeviceHandle,
        endpoint: Endpoint,
        buffer: Vec<u8>,
        timeout: Duration,
        callback: F,
    ) -> Self
    where
        F: FnMut(&Transfer) + Send + 'static,
    {
        Self::filled(handle, endpoint, TransferType::Bulk, buffer, timeout, callback)
    }

    pub fn bulk_stream<F>(
        handle: &DeviceHandle,
        endpoint: Endpoint,
        stream_id: u32,
        buffer: Vec<u8>,
        timeout: Duration,
        callback: F,
    ) -> Self
    where
        F: FnMut(&Transfer) + Send + 'static,
    {
        let t = Self::filled(handle, endpoint, TransferType::BulkStream, buffer, timeout, callback);
        t.lock().stream_id = stream_id;
        t
    }

    pub fn interrupt<F>(
        handle: &DeviceHandle,
        endpoint: Endpoint,
        buffer: Vec<u8>,
        timeout: Duration,
        callback: F,
    ) -> Self
    where
        F: FnMut(&Transfer) + Send + 'static,
    {
        Self::filled(handle, endpoint, TransferType::Interrupt, buffer, timeout, callback)
    }

    /// One packet descriptor per entry of `packet_lengths`.
    pub fn isochronous<F>(
        handle: &DeviceHandle,
        endpoint: Endpoint,
        buffer: Vec<u8>,
        packet_lengths: &[u32],
        timeout: Duration,
        callback: F,
    ) -> Self
    where
        F: FnMut(&Transfer) + Send + 'static,
    {
        let t = Self::filled(handle, endpoint, TransferType::Isochronous, buffer, timeout, callback);
        t.lock().iso_packets = packet_lengths
            .iter()
            .map(|&length| IsoPacket {
                length,
                ..IsoPacket::default()
            })
            .collect();
        t
    }

    fn filled<F>(
        handle: &DeviceHandle,
        endpoint: Endpoint,
        kind: TransferType,
        buffer: Vec<u8>,
        timeout: Duration,
        callback: F,
    ) -> Self
    where
        F: FnMut(&Transfer) + Send + 'static,
    {
        let t = Transfer::new(0);
        {
            let mut s = t.lock();
            s.handle = Some(handle.clone());
            s.endpoint = endpoint;
            s.kind = kind;
            s.length = buffer.len();
            s.buffer = buffer;
            s.timeout = timeout;
            s.callback = Some(Box::new(callback));
        }
        t
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TransferState> {
        self.inner.state.lock()
    }

    /// Runs `f` with the transfer state locked. Must not be called from a
    /// backend hook that already holds the lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut TransferState) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn status(&self) -> TransferStatus {
        self.lock().status
    }

    pub fn actual_length(&self) -> usize {
        self.lock().actual_length
    }

    pub fn endpoint(&self) -> Endpoint {
        self.lock().endpoint
    }

    pub fn kind(&self) -> TransferType {
        self.lock().kind
    }

    /// `None` once the handle was closed under the transfer.
    pub fn handle(&self) -> Option<DeviceHandle> {
        self.lock().handle.clone()
    }

    pub fn is_in_flight(&self) -> bool {
        self.lock().state_flags.contains(StateFlags::IN_FLIGHT)
    }

    pub fn flags(&self) -> TransferFlags {
        self.lock().flags
    }

    pub fn set_flags(&self, flags: TransferFlags) {
        self.lock().flags = flags;
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.lock().timeout = timeout;
    }

    pub fn set_callback<F>(&self, callback: F)
    where
        F: FnMut(&Transfer) + Send + 'static,
    {
        self.lock().callback = Some(Box::new(callback));
    }

    /// Replaces the data buffer, the length follows the new buffer. `Busy`
    /// while the transfer is in flight.
    pub fn set_buffer(&self, buffer: Vec<u8>) -> Result<()> {
        let mut s = self.lock();
        if s.state_flags.contains(StateFlags::IN_FLIGHT) {
            return Err(Error::Busy);
        }
        s.length = buffer.len();
        s.buffer = buffer;
        Ok(())
    }

    pub fn take_buffer(&self) -> Result<Vec<u8>> {
        let mut s = self.lock();
        if s.state_flags.contains(StateFlags::IN_FLIGHT) {
            return Err(Error::Busy);
        }
        s.length = 0;
        Ok(std::mem::take(&mut s.buffer))
    }

    pub fn with_buffer<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.lock().buffer)
    }

    /// The data stage of a completed control transfer.
    pub fn control_data(&self) -> Vec<u8> {
        let s = self.lock();
        let end = (CONTROL_SETUP_SIZE + s.actual_length).min(s.buffer.len());
        s.buffer.get(CONTROL_SETUP_SIZE..end).unwrap_or(&[]).to_vec()
    }

    pub fn iso_packets(&self) -> Vec<IsoPacket> {
        self.lock().iso_packets.clone()
    }

    /// Hands the transfer to the backend.
    ///
    /// Errors are reported synchronously and the callback is not invoked.
    /// On success exactly one completion follows through the callback.
    pub fn submit(&self) -> Result<()> {
        let handle = self.lock().handle.clone().ok_or(Error::InvalidParam)?;
        if handle.is_closed() {
            return Err(Error::NoDevice);
        }
        let ctx = handle.context().clone();
        let backend = ctx.backend();

        let mut registry = ctx.inner.flying.lock();
        let mut state = self.lock();
        if state.state_flags.contains(StateFlags::IN_FLIGHT) {
            return Err(Error::Busy);
        }
        state.transferred = 0;
        state.actual_length = 0;
        state.state_flags = StateFlags::empty();

        let now = backend.clock_now();
        // a timeout past the clock's range never expires
        let deadline = if state.timeout.is_zero() {
            None
        } else {
            now.checked_add(state.timeout)
        };
        let os_handles_timeout = backend.handles_timeout(&state);
        registry.insert(self.clone(), deadline, os_handles_timeout, now)?;
        drop(registry);

        log::debug!(
            "submit {:?} {:?} ep 0x{:02x} length {}",
            self,
            state.kind,
            state.endpoint.address(),
            state.length
        );
        match backend.submit_transfer(self, &mut state) {
            Ok(()) => {
                state.state_flags.insert(StateFlags::IN_FLIGHT);
                state.device_ref = Some(handle.device().clone());
                Ok(())
            }
            Err(err) => {
                drop(state);
                if let Err(e) = ctx.remove_flying(self) {
                    log::warn!("failed to rearm timer after failed submit: {}", e);
                }
                Err(err)
            }
        }
    }

    /// Asks the backend to cancel. The completion, `Cancelled` or
    /// `TimedOut` or `NoDevice`, arrives later through the callback.
    pub fn cancel(&self) -> Result<()> {
        let mut state = self.lock();
        if !state.state_flags.contains(StateFlags::IN_FLIGHT)
            || state.state_flags.contains(StateFlags::CANCELLING)
        {
            return Err(Error::NotFound);
        }
        let ctx = match state.handle.as_ref() {
            Some(handle) => handle.context().clone(),
            None => return Err(Error::NotFound),
        };
        let res = ctx.backend().cancel_transfer(self, &mut state);
        if let Err(err) = res {
            if err != Error::NotFound && err != Error::NoDevice {
                log::error!("cancel transfer failed: {}", err);
            }
            if err == Error::NoDevice {
                state.state_flags.insert(StateFlags::DEVICE_DISAPPEARED);
            }
        }
        state.state_flags.insert(StateFlags::CANCELLING);
        res
    }
}

impl Context {
    /// Completes a transfer: unlinks it from the registry, records the
    /// outcome, runs the callback once and releases the pinned device.
    /// The callback runs even when the handle was closed meanwhile.
    ///
    /// Backends call this from their event handling once an I/O finished.
    /// Only the thread holding the event lock may deliver completions, the
    /// callback is out of the transfer while it runs. Other threads go
    /// through `signal_transfer_completion`.
    pub fn handle_transfer_completion(&self, transfer: &Transfer, status: TransferStatus) {
        if let Err(e) = self.remove_flying(transfer) {
            log::warn!("failed to rearm timer after completion: {}", e);
        }

        let (mut callback, device_ref) = {
            let mut state = transfer.lock();
            if !state.state_flags.contains(StateFlags::IN_FLIGHT) {
                log::debug!("completion for {:?} which is not in flight, ignored", transfer);
                return;
            }
            state.state_flags.remove(StateFlags::IN_FLIGHT);
            self.backend().clear_transfer_priv(&mut state);
            let device_ref = state.device_ref.take();
            if state.handle.is_none() {
                log::debug!("completion for {:?} after its handle was closed", transfer);
            }

            let mut status = status;
            if status == TransferStatus::Completed && state.flags.contains(TransferFlags::SHORT_NOT_OK) {
                let mut requested = state.length;
                if state.kind == TransferType::Control {
                    requested = requested.saturating_sub(CONTROL_SETUP_SIZE);
                }
                if requested != state.transferred {
                    log::debug!(
                        "interpreting short transfer as error {}/{}",
                        state.transferred,
                        requested
                    );
                    status = TransferStatus::Error;
                }
            }
            state.status = status;
            state.actual_length = state.transferred;
            (state.callback.take(), device_ref)
        };

        if let Some(cb) = callback.as_mut() {
            cb(transfer);
        }
        if let Some(cb) = callback {
            let mut state = transfer.lock();
            if state.callback.is_none() {
                state.callback = Some(cb);
            }
        }

        self.inner.events.notify_waiters();
        drop(device_ref);
    }

    /// Completes a transfer the backend finished cancelling, choosing
    /// `NoDevice`, `TimedOut` or `Cancelled` for it.
    pub fn handle_transfer_cancellation(&self, transfer: &Transfer) {
        let disappeared = transfer
            .lock()
            .state_flags
            .contains(StateFlags::DEVICE_DISAPPEARED);
        let status = if disappeared {
            TransferStatus::NoDevice
        } else if self.transfer_timed_out(transfer) {
            TransferStatus::TimedOut
        } else {
            TransferStatus::Cancelled
        };
        self.handle_transfer_completion(transfer, status);
    }

    /// Queues a transfer finished outside the event handler. The handling
    /// thread later asks the backend to finalize it.
    pub fn signal_transfer_completion(&self, transfer: &Transfer) {
        let mut ev = self.inner.event_data.lock();
        let pending = ev.pending();
        ev.completed.push_back(transfer.clone());
        if !pending {
            self.inner.event_pipe.signal();
        }
    }

    /// Completes every in-flight transfer of `handle` with `NoDevice`.
    ///
    /// Delivers callbacks inline, so call it from the event handling thread.
    pub fn handle_disconnect(&self, handle: &DeviceHandle) {
        if !self.is_handling_thread() {
            log::warn!("disconnect of {} delivered outside the event handler", handle.device());
        }
        let doomed: Vec<Transfer> = {
            let registry = self.inner.flying.lock();
            registry
                .transfers()
                .filter(|t| {
                    let s = t.lock();
                    s.state_flags.contains(StateFlags::IN_FLIGHT)
                        && s.handle.as_ref().map_or(false, |h| h == handle)
                })
                .cloned()
                .collect()
        };
        for transfer in doomed {
            log::debug!("completing {:?} after disconnect", transfer);
            transfer.lock().state_flags.insert(StateFlags::DEVICE_DISAPPEARED);
            self.handle_transfer_completion(&transfer, TransferStatus::NoDevice);
        }
    }

    pub(crate) fn finalize_completed(&self, transfer: &Transfer) {
        let res = {
            let mut state = transfer.lock();
            self.backend().finalize_completion(&mut state)
        };
        match res {
            Ok(Completion::Status(status)) => self.handle_transfer_completion(transfer, status),
            Ok(Completion::Cancelled) => self.handle_transfer_cancellation(transfer),
            Err(err) => {
                log::error!("backend failed to finalize {:?}: {}", transfer, err);
                self.handle_transfer_completion(transfer, TransferStatus::Error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_bits() {
        assert_eq!(TransferType::from_attributes(0x00), TransferType::Control);
        assert_eq!(TransferType::from_attributes(0x05), TransferType::Isochronous);
        assert_eq!(TransferType::from_attributes(0x02), TransferType::Bulk);
        assert_eq!(TransferType::from_attributes(0x03), TransferType::Interrupt);
    }

    #[test]
    fn fresh_transfer() {
        let t = Transfer::new(3);
        assert!(!t.is_in_flight());
        assert_eq!(t.iso_packets().len(), 3);
        assert!(t.handle().is_none());
        assert_eq!(t.submit(), Err(Error::InvalidParam));
        assert_eq!(t.cancel(), Err(Error::NotFound));
        assert_eq!(t.clone(), t);
        assert_ne!(Transfer::new(0), t);
    }

    #[test]
    fn buffer_accessors() {
        let t = Transfer::new(0);
        t.set_buffer(vec![1, 2, 3]).unwrap();
        assert_eq!(t.with_state(|s| s.length()), 3);
        assert_eq!(t.with_buffer(|b| b.to_vec()), vec![1, 2, 3]);
        assert_eq!(t.take_buffer().unwrap(), vec![1, 2, 3]);
        assert_eq!(t.with_state(|s| s.length()), 0);
    }

    #[test]
    fn close_reports_only_transfers_in_flight() {
        let t = Transfer::new(0);
        // registered but still inside submit
        assert_eq!(t.with_state(|s| s.close_anomaly()), None);

        t.lock().state_flags = StateFlags::IN_FLIGHT;
        assert_eq!(t.with_state(|s| s.close_anomaly()).map(|a| a.0), Some(log::Level::Error));
        t.lock().state_flags.insert(StateFlags::CANCELLING);
        assert_eq!(t.with_state(|s| s.close_anomaly()).map(|a| a.0), Some(log::Level::Warn));
        t.lock().state_flags.insert(StateFlags::DEVICE_DISAPPEARED);
        assert_eq!(t.with_state(|s| s.close_anomaly()), None);
    }
}
