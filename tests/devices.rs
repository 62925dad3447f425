mod common;

use common::{descriptor, MockBackend};
use std::sync::atomic::Ordering;
use usbhost::{DeviceInfo, Endpoint, Error};

#[test]
fn interface_claims() {
    let mock = MockBackend::new();
    let ctx = mock.context();
    let handle = mock.add_device(&ctx, 2, 1, 1).open().unwrap();

    assert_eq!(handle.claim_interface(32), Err(Error::InvalidParam));
    assert_eq!(handle.release_interface(0), Err(Error::NotFound));
    handle.claim_interface(0).unwrap();
    // claiming twice is fine
    handle.claim_interface(0).unwrap();
    handle.claim_interface(3).unwrap();
    assert_eq!(handle.claimed_interfaces(), 0b1001);
    assert_eq!(handle.set_interface_alt_setting(1, 0), Err(Error::NotFound));
    handle.release_interface(0).unwrap();
    assert_eq!(handle.claimed_interfaces(), 0b1000);
    // the mock cannot detach kernel drivers
    assert_eq!(handle.set_auto_detach_kernel_driver(true), Err(Error::NotSupported));
    assert!(!handle.auto_detach_kernel_driver());

    handle.close();
    assert_eq!(handle.claim_interface(0), Err(Error::NoDevice));
    assert_eq!(handle.get_configuration(), Err(Error::NoDevice));
}

#[test]
fn detached_devices_refuse_to_open() {
    let mock = MockBackend::new();
    let ctx = mock.context();
    let device = mock.add_device(&ctx, 2, 1, 1);
    let handle = device.open().unwrap();
    mock.remove_device(&ctx, &device);

    assert!(!device.is_attached());
    assert_eq!(device.open().err(), Some(Error::NoDevice));
    assert_eq!(handle.claim_interface(0), Err(Error::NoDevice));
    handle.close();
}

#[test]
fn failed_open_leaves_nothing_open() {
    let mock = MockBackend::new();
    let ctx = mock.context();
    let device = mock.add_device(&ctx, 2, 1, 1);
    *mock.open_error.lock() = Some(Error::Access);

    assert_eq!(device.open().err(), Some(Error::Access));
    assert_eq!(mock.closes.load(Ordering::SeqCst), 0);
    ctx.exit().unwrap();
}

#[test]
fn exit_with_open_handles_is_busy() {
    let mock = MockBackend::new();
    let ctx = mock.context();
    let handle = mock.add_device(&ctx, 2, 1, 1).open().unwrap();
    assert_eq!(ctx.clone().exit(), Err(Error::Busy));
    handle.close();
    ctx.exit().unwrap();
}

#[test]
fn port_paths_follow_parents() {
    let mock = MockBackend::new();
    let ctx = mock.context();
    let alloc = |session: u64, port: u8, parent| {
        ctx.alloc_device(
            session,
            DeviceInfo {
                bus_number: 1,
                device_address: session as u8,
                port_number: port,
                parent,
            },
            descriptor(1, session as u16),
            Box::new(()),
        )
        .unwrap()
    };
    let root = alloc(1, 0, None);
    let hub = alloc(2, 1, Some(root.clone()));
    let leaf = alloc(3, 4, Some(hub.clone()));

    let mut ports = [0u8; 7];
    assert_eq!(leaf.port_numbers(&mut ports), Ok(2));
    assert_eq!(&ports[..2], &[1, 4]);
    assert_eq!(leaf.port_path(), vec![1, 4]);
    assert_eq!(root.port_numbers(&mut ports), Ok(0));
    assert_eq!(leaf.port_numbers(&mut [0u8; 1]), Err(Error::Overflow));
    assert_eq!(leaf.port_numbers(&mut []), Err(Error::InvalidParam));
    assert_eq!(leaf.parent(), Some(hub));
}

#[test]
fn too_many_configurations_are_rejected() {
    let mock = MockBackend::new();
    let ctx = mock.context();
    let mut desc = descriptor(1, 1);
    desc.num_configurations = 9;
    let res = ctx.alloc_device(9, DeviceInfo::default(), desc, Box::new(()));
    assert_eq!(res.err(), Some(Error::Io));
}

#[test]
fn configuration_descriptors() {
    let mock = MockBackend::new();
    let ctx = mock.context();
    let device = mock.add_device(&ctx, 2, 0x1234, 0x5678);

    let config = device.config_descriptor(0).unwrap();
    assert_eq!(config.configuration_value, 1);
    assert_eq!(config.interfaces.len(), 1);
    assert_eq!(config.interfaces[0].endpoints[0].endpoint_address, 0x81);
    assert_eq!(device.config_descriptor(1).err(), Some(Error::NotFound));
    assert_eq!(device.config_descriptor_by_value(1).unwrap(), config);
    assert_eq!(device.config_descriptor_by_value(2).err(), Some(Error::NotFound));

    assert_eq!(device.max_packet_size(Endpoint::in_ep(1)), Ok(64));
    assert_eq!(device.max_packet_size(Endpoint::in_ep(2)), Err(Error::NotFound));
}

#[test]
fn device_lists_and_lookup() {
    let mock = MockBackend::new();
    let ctx = mock.context();
    mock.add_device(&ctx, 2, 0x1234, 0x0001);
    let second = mock.add_device(&ctx, 3, 0x1234, 0x0002);

    let list = ctx.devices().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(ctx.device_by_session_id(3), Some(second.clone()));
    assert_eq!(format!("{}", second), "001:003 1234:0002");

    let handle = ctx.open_device_with_vid_pid(0x1234, 0x0002).unwrap().unwrap();
    assert_eq!(handle.device(), &second);
    assert!(ctx.open_device_with_vid_pid(0xdead, 0xbeef).unwrap().is_none());
    handle.close();
    drop(list);
}
