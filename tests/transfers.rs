mod common;

use common::{descriptor, pump_until, recorder, MockBackend};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use usbhost::control_transfer::{REQUEST_GET_DESCRIPTOR, REQUEST_TYPE_VENDOR};
use usbhost::endpoint::ENDPOINT_IN;
use usbhost::{ControlSetup, DeviceInfo, Endpoint, Error, Transfer, TransferFlags, TransferStatus};

const LIMIT: Duration = Duration::from_secs(5);

#[test]
fn double_submit_is_busy() {
    let mock = MockBackend::new();
    let ctx = mock.context();
    let handle = mock.add_device(&ctx, 2, 0x1234, 0x5678).open().unwrap();
    let (seen, cb) = recorder();
    let t = Transfer::bulk(&handle, Endpoint::in_ep(1), vec![0; 64], Duration::ZERO, cb);

    t.submit().unwrap();
    assert_eq!(t.submit(), Err(Error::Busy));
    assert_eq!(ctx.flying_transfers(), 1);
    assert_eq!(t.set_buffer(vec![0; 8]), Err(Error::Busy));

    mock.complete(&ctx, &t, TransferStatus::Completed, 10);
    assert!(pump_until(&ctx, LIMIT, || !seen.lock().is_empty()));
    assert_eq!(*seen.lock(), vec![TransferStatus::Completed]);
    assert_eq!(t.actual_length(), 10);
    assert_eq!(ctx.flying_transfers(), 0);
    assert!(!t.is_in_flight());

    handle.close();
    ctx.exit().unwrap();
}

#[test]
fn failed_submit_has_no_callback() {
    let mock = MockBackend::new();
    let ctx = mock.context();
    let handle = mock.add_device(&ctx, 2, 1, 1).open().unwrap();
    *mock.submit_error.lock() = Some(Error::Io);
    let (seen, cb) = recorder();
    let t = Transfer::bulk(&handle, Endpoint::out_ep(1), vec![1, 2, 3], Duration::from_secs(1), cb);

    assert_eq!(t.submit(), Err(Error::Io));
    assert_eq!(ctx.flying_transfers(), 0);
    assert_eq!(ctx.next_timeout(), None);
    ctx.handle_events_timeout(Duration::ZERO).unwrap();
    assert!(seen.lock().is_empty());
    assert!(!t.is_in_flight());
    handle.close();
}

#[test]
fn completion_is_delivered_once() {
    let mock = MockBackend::new();
    let ctx = mock.context();
    let handle = mock.add_device(&ctx, 2, 1, 1).open().unwrap();
    let (seen, cb) = recorder();
    let t = Transfer::bulk(&handle, Endpoint::in_ep(1), vec![0; 64], Duration::ZERO, cb);
    t.submit().unwrap();

    mock.complete(&ctx, &t, TransferStatus::Completed, 64);
    assert!(pump_until(&ctx, LIMIT, || !seen.lock().is_empty()));
    // a stray second completion for the same submission is ignored
    mock.complete(&ctx, &t, TransferStatus::Stall, 0);
    ctx.handle_events_timeout(Duration::ZERO).unwrap();
    assert_eq!(*seen.lock(), vec![TransferStatus::Completed]);
    assert_eq!(t.status(), TransferStatus::Completed);
    handle.close();
}

#[test]
fn short_not_ok_turns_short_reads_into_errors() {
    let mock = MockBackend::new();
    let ctx = mock.context();
    let handle = mock.add_device(&ctx, 2, 1, 1).open().unwrap();

    let (seen, cb) = recorder();
    let t = Transfer::bulk(&handle, Endpoint::in_ep(1), vec![0; 64], Duration::ZERO, cb);
    t.set_flags(TransferFlags::SHORT_NOT_OK);
    t.submit().unwrap();
    mock.complete(&ctx, &t, TransferStatus::Completed, 10);
    assert!(pump_until(&ctx, LIMIT, || !seen.lock().is_empty()));
    assert_eq!(*seen.lock(), vec![TransferStatus::Error]);

    // the setup packet does not count against a control transfer
    let (seen, cb) = recorder();
    let setup = ControlSetup::new(ENDPOINT_IN | REQUEST_TYPE_VENDOR, 1, 0, 0, 4);
    let t = Transfer::control(&handle, setup.fill_buffer(&[]), Duration::ZERO, cb);
    t.set_flags(TransferFlags::SHORT_NOT_OK);
    t.submit().unwrap();
    mock.complete(&ctx, &t, TransferStatus::Completed, 4);
    assert!(pump_until(&ctx, LIMIT, || !seen.lock().is_empty()));
    assert_eq!(*seen.lock(), vec![TransferStatus::Completed]);
    handle.close();
}

#[test]
fn cancel_completes_as_cancelled() {
    let mock = MockBackend::new();
    let ctx = mock.context();
    let handle = mock.add_device(&ctx, 2, 1, 1).open().unwrap();
    let (seen, cb) = recorder();
    let t = Transfer::bulk(&handle, Endpoint::in_ep(1), vec![0; 64], Duration::ZERO, cb);

    assert_eq!(t.cancel(), Err(Error::NotFound));
    t.submit().unwrap();
    t.cancel().unwrap();
    // a second cancel while the first is pending
    assert_eq!(t.cancel(), Err(Error::NotFound));
    assert!(pump_until(&ctx, LIMIT, || !seen.lock().is_empty()));
    assert_eq!(*seen.lock(), vec![TransferStatus::Cancelled]);
    assert_eq!(mock.cancels.load(Ordering::SeqCst), 1);
    handle.close();
}

#[test]
fn cancel_on_vanished_device_reports_no_device() {
    let mock = MockBackend::new();
    let ctx = mock.context();
    let handle = mock.add_device(&ctx, 2, 1, 1).open().unwrap();
    let (seen, cb) = recorder();
    let t = Transfer::bulk(&handle, Endpoint::in_ep(1), vec![0; 64], Duration::ZERO, cb);
    t.submit().unwrap();

    *mock.cancel_error.lock() = Some(Error::NoDevice);
    assert_eq!(t.cancel(), Err(Error::NoDevice));
    assert!(t.is_in_flight());
    mock.complete_cancelled(&ctx, &t);
    assert!(pump_until(&ctx, LIMIT, || !seen.lock().is_empty()));
    assert_eq!(*seen.lock(), vec![TransferStatus::NoDevice]);
    handle.close();
}

#[test]
fn expired_deadline_times_out() {
    let mock = MockBackend::new();
    let ctx = mock.context();
    let handle = mock.add_device(&ctx, 2, 1, 1).open().unwrap();
    let (seen, cb) = recorder();
    let slow = Transfer::bulk(&handle, Endpoint::in_ep(1), vec![0; 8], Duration::from_secs(60), |_| {});
    let t = Transfer::bulk(&handle, Endpoint::in_ep(2), vec![0; 8], Duration::from_millis(30), cb);
    slow.submit().unwrap();
    t.submit().unwrap();

    let next = ctx.next_timeout().unwrap();
    assert!(next <= Duration::from_millis(30));
    assert!(pump_until(&ctx, LIMIT, || !seen.lock().is_empty()));
    assert_eq!(*seen.lock(), vec![TransferStatus::TimedOut]);
    assert_eq!(mock.cancels.load(Ordering::SeqCst), 1);
    assert!(slow.is_in_flight());
    assert!(ctx.next_timeout().unwrap() > Duration::from_secs(50));

    slow.cancel().unwrap();
    assert!(pump_until(&ctx, LIMIT, || !slow.is_in_flight()));
    assert_eq!(slow.status(), TransferStatus::Cancelled);
    handle.close();
}

#[test]
fn callback_can_resubmit() {
    let mock = MockBackend::new();
    let ctx = mock.context();
    let handle = mock.add_device(&ctx, 2, 1, 1).open().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let t = Transfer::interrupt(&handle, Endpoint::in_ep(3), vec![0; 8], Duration::ZERO, move |t| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            t.submit().unwrap();
        }
    });
    t.submit().unwrap();
    mock.complete(&ctx, &t, TransferStatus::Completed, 8);
    assert!(pump_until(&ctx, LIMIT, || calls.load(Ordering::SeqCst) == 1));
    assert!(t.is_in_flight());
    assert_eq!(ctx.flying_transfers(), 1);

    mock.complete(&ctx, &t, TransferStatus::Completed, 8);
    assert!(pump_until(&ctx, LIMIT, || calls.load(Ordering::SeqCst) == 2));
    assert!(!t.is_in_flight());
    handle.close();
}

#[test]
fn sync_control_transfer_copies_the_reply() {
    let mock = MockBackend::new();
    let ctx = mock.context();
    let handle = mock.add_device(&ctx, 2, 1, 1).open().unwrap();

    let device = mock.clone();
    let ctx2 = ctx.clone();
    let responder = thread::spawn(move || {
        let t = device.wait_submitted(1);
        t.with_state(|s| s.buffer_mut()[8..12].copy_from_slice(b"\x04\x03\x09\x04"));
        device.complete(&ctx2, &t, TransferStatus::Completed, 4);
    });

    assert_eq!(handle.read_languages(), Ok(vec![0x0409]));
    responder.join().unwrap();

    let setup = ControlSetup::from_bytes(&mock.last_submitted().take_buffer().unwrap()).unwrap();
    assert_eq!(setup.request, REQUEST_GET_DESCRIPTOR);
    assert_eq!(setup.value, 0x0300);
    handle.close();
}

#[test]
fn get_configuration_falls_back_to_a_control_request() {
    let mock = MockBackend::new();
    let ctx = mock.context();
    let handle = mock.add_device(&ctx, 2, 1, 1).open().unwrap();

    let device = mock.clone();
    let ctx2 = ctx.clone();
    let responder = thread::spawn(move || {
        let t = device.wait_submitted(1);
        t.with_state(|s| s.buffer_mut()[8] = 1);
        device.complete(&ctx2, &t, TransferStatus::Completed, 1);
    });
    assert_eq!(handle.get_configuration(), Ok(1));
    responder.join().unwrap();
    handle.close();
}

#[test]
fn sync_bulk_maps_stall_to_pipe() {
    let mock = MockBackend::new();
    let ctx = mock.context();
    let handle = mock.add_device(&ctx, 2, 1, 1).open().unwrap();

    let device = mock.clone();
    let ctx2 = ctx.clone();
    let responder = thread::spawn(move || {
        let t = device.wait_submitted(1);
        device.complete(&ctx2, &t, TransferStatus::Stall, 0);
    });
    let mut buf = [0u8; 16];
    assert_eq!(
        handle.read_bulk(Endpoint::in_ep(1), &mut buf, Duration::from_secs(1)),
        Err(Error::Pipe)
    );
    responder.join().unwrap();
    assert_eq!(
        handle.write_bulk(Endpoint::in_ep(1), &buf, Duration::from_secs(1)),
        Err(Error::InvalidParam)
    );
    handle.close();
}

#[test]
fn disconnect_fails_every_transfer_of_the_handle() {
    let mock = MockBackend::new();
    let ctx = mock.context();
    let handle = mock.add_device(&ctx, 2, 1, 1).open().unwrap();
    let other = mock.add_device(&ctx, 3, 1, 2).open().unwrap();
    let (seen, cb) = recorder();
    let a = Transfer::bulk(&handle, Endpoint::in_ep(1), vec![0; 8], Duration::from_secs(5), cb);
    let b = Transfer::bulk(&other, Endpoint::in_ep(1), vec![0; 8], Duration::ZERO, |_| {});
    a.submit().unwrap();
    b.submit().unwrap();

    let lock = ctx.lock_events();
    ctx.handle_disconnect(&handle);
    ctx.unlock_events(lock);
    assert_eq!(*seen.lock(), vec![TransferStatus::NoDevice]);
    assert!(!a.is_in_flight());
    assert!(b.is_in_flight());
    assert_eq!(ctx.flying_transfers(), 1);

    b.cancel().unwrap();
    assert!(pump_until(&ctx, LIMIT, || !b.is_in_flight()));
    handle.close();
    other.close();
}

#[test]
fn resubmit_from_a_disconnect_keeps_the_callback() {
    let mock = MockBackend::new();
    let ctx = mock.context();
    let handle = mock.add_device(&ctx, 2, 1, 1).open().unwrap();
    let (seen, mut record) = recorder();
    let t = Transfer::bulk(&handle, Endpoint::in_ep(1), vec![0; 8], Duration::ZERO, move |t| {
        record(t);
        if t.status() == TransferStatus::NoDevice {
            t.submit().unwrap();
        }
    });
    t.submit().unwrap();

    let lock = ctx.lock_events();
    ctx.handle_disconnect(&handle);
    ctx.unlock_events(lock);
    assert!(t.is_in_flight());

    mock.complete(&ctx, &t, TransferStatus::Completed, 8);
    assert!(pump_until(&ctx, LIMIT, || seen.lock().len() == 2));
    assert_eq!(*seen.lock(), vec![TransferStatus::NoDevice, TransferStatus::Completed]);
    handle.close();
}

#[test]
fn unbounded_timeout_never_expires() {
    let mock = MockBackend::new();
    let ctx = mock.context();
    let handle = mock.add_device(&ctx, 2, 1, 1).open().unwrap();
    let (seen, cb) = recorder();
    let t = Transfer::bulk(&handle, Endpoint::in_ep(1), vec![0; 8], Duration::MAX, cb);

    t.submit().unwrap();
    assert_eq!(ctx.flying_transfers(), 1);
    assert_eq!(ctx.next_timeout(), None);
    ctx.handle_timeouts().unwrap();
    assert!(t.is_in_flight());
    assert_eq!(mock.cancels.load(Ordering::SeqCst), 0);

    t.cancel().unwrap();
    assert!(pump_until(&ctx, LIMIT, || !seen.lock().is_empty()));
    assert_eq!(*seen.lock(), vec![TransferStatus::Cancelled]);
    handle.close();
}

#[test]
fn deadline_behind_a_pending_timeout_is_serviced() {
    let mock = MockBackend::new();
    *mock.hold_cancels.lock() = true;
    let ctx = mock.context();
    let handle = mock.add_device(&ctx, 2, 1, 1).open().unwrap();
    let stuck = Transfer::bulk(&handle, Endpoint::in_ep(1), vec![0; 8], Duration::from_millis(20), |_| {});
    stuck.submit().unwrap();
    assert!(pump_until(&ctx, LIMIT, || mock.cancels.load(Ordering::SeqCst) == 1));
    // the backend has not reported the cancellation yet
    assert!(stuck.is_in_flight());

    let (seen, cb) = recorder();
    let t = Transfer::bulk(&handle, Endpoint::in_ep(2), vec![0; 8], Duration::from_millis(50), cb);
    t.submit().unwrap();
    assert!(ctx.next_timeout().unwrap() <= Duration::from_millis(50));

    let begin = Instant::now();
    while mock.cancels.load(Ordering::SeqCst) < 2 {
        assert!(begin.elapsed() < Duration::from_secs(1), "deadline never fired");
        ctx.handle_events_timeout(Duration::from_secs(3)).unwrap();
    }
    assert!(begin.elapsed() < Duration::from_secs(1));

    mock.complete_cancelled(&ctx, &stuck);
    mock.complete_cancelled(&ctx, &t);
    assert!(pump_until(&ctx, LIMIT, || !seen.lock().is_empty()));
    assert_eq!(*seen.lock(), vec![TransferStatus::TimedOut]);
    assert_eq!(stuck.status(), TransferStatus::TimedOut);
    handle.close();
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[test]
fn transfer_pins_its_device_past_close() {
    let mock = MockBackend::new();
    let ctx = mock.context();
    let released = Arc::new(AtomicBool::new(false));
    let device = ctx
        .alloc_device(
            7,
            DeviceInfo::default(),
            descriptor(1, 1),
            Box::new(DropFlag(released.clone())),
        )
        .unwrap();
    ctx.connect_device(&device);
    let handle = device.open().unwrap();
    let (seen, cb) = recorder();
    let t = Transfer::bulk(&handle, Endpoint::in_ep(1), vec![0; 8], Duration::ZERO, cb);
    t.submit().unwrap();

    ctx.disconnect_device(&device);
    handle.close();
    drop(handle);
    drop(device);
    assert!(!released.load(Ordering::SeqCst));

    mock.complete(&ctx, &t, TransferStatus::NoDevice, 0);
    assert!(pump_until(&ctx, LIMIT, || !seen.lock().is_empty()));
    assert_eq!(*seen.lock(), vec![TransferStatus::NoDevice]);
    assert!(released.load(Ordering::SeqCst));
    ctx.exit().unwrap();
}
