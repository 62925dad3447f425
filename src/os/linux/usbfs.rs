//! usbfs ioctls on `/dev/bus/usb/BBB/DDD`.
use super::constants::*;
use super::usbfsurb::UsbFsUrb;
use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::{
    convert_ioctl_res, ioc, ioctl_none, ioctl_read, ioctl_readwrite, ioctl_readwrite_bad,
    ioctl_write_ptr_bad, request_code_none, request_code_read, request_code_readwrite,
    request_code_write,
};
use std::ffi::CStr;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;

#[repr(C)]
pub(crate) struct UsbFsSetInterface {
    interface: libc::c_uint,
    altsetting: libc::c_uint,
}

#[repr(C)]
pub(crate) struct UsbFsGetDriver {
    interface: libc::c_uint,
    driver: [libc::c_char; USBFS_MAXDRIVERNAME + 1],
}

#[repr(C)]
pub(crate) struct UsbFsIoctl {
    interface: libc::c_int,
    code: libc::c_int,
    data: *mut libc::c_void,
}

ioctl_read!(usbfs_set_interface, b'U', 4, UsbFsSetInterface);
ioctl_read!(usbfs_set_configuration, b'U', 5, libc::c_int);
ioctl_readwrite_bad!(
    usbfs_get_driver,
    request_code_write!(b'U', 8, mem::size_of::<UsbFsGetDriver>()),
    UsbFsGetDriver
);
ioctl_read!(usbfs_submit_urb, b'U', 10, UsbFsUrb);
ioctl_write_ptr_bad!(usbfs_discard_urb, request_code_none!(b'U', 11), UsbFsUrb);
ioctl_readwrite_bad!(
    usbfs_reap_urb_ndelay,
    request_code_write!(b'U', 13, mem::size_of::<*mut libc::c_void>()),
    *mut UsbFsUrb
);
ioctl_read!(usbfs_claim_interface, b'U', 15, libc::c_uint);
ioctl_read!(usbfs_release_interface, b'U', 16, libc::c_uint);
ioctl_readwrite!(usbfs_ioctl, b'U', 18, UsbFsIoctl);
ioctl_none!(usbfs_reset, b'U', 20);
ioctl_read!(usbfs_clear_halt, b'U', 21, libc::c_uint);
ioctl_read!(usbfs_get_capabilities, b'U', 26, u32);

const USBFS_DISCONNECT: libc::c_int = request_code_none!(b'U', 22) as libc::c_int;
const USBFS_CONNECT: libc::c_int = request_code_none!(b'U', 23) as libc::c_int;

/// Capability bits, 0 on kernels without `USBDEVFS_GET_CAPABILITIES`.
pub(crate) fn capabilities(fd: RawFd) -> u32 {
    let mut caps = 0u32;
    match unsafe { usbfs_get_capabilities(fd, &mut caps) } {
        Ok(_) => caps,
        Err(e) => {
            log::debug!("get capabilities failed: {}", e);
            0
        }
    }
}

pub(crate) fn claim_interface(fd: RawFd, iface: u8) -> Result<()> {
    let mut iface = iface as libc::c_uint;
    match unsafe { usbfs_claim_interface(fd, &mut iface) } {
        Ok(_) => Ok(()),
        Err(Errno::ENOENT) => Err(Error::NotFound),
        Err(e) => {
            log::debug!("claim interface {} failed: {}", iface, e);
            Err(e.into())
        }
    }
}

pub(crate) fn release_interface(fd: RawFd, iface: u8) -> Result<()> {
    let mut iface = iface as libc::c_uint;
    unsafe { usbfs_release_interface(fd, &mut iface) }?;
    Ok(())
}

pub(crate) fn set_interface(fd: RawFd, iface: u8, alt: u8) -> Result<()> {
    let mut setintf = UsbFsSetInterface {
        interface: iface as libc::c_uint,
        altsetting: alt as libc::c_uint,
    };
    match unsafe { usbfs_set_interface(fd, &mut setintf) } {
        Ok(_) => Ok(()),
        Err(Errno::EINVAL) => Err(Error::NotFound),
        Err(e) => Err(e.into()),
    }
}

/// `None` unconfigures the device.
pub(crate) fn set_configuration(fd: RawFd, config: Option<u8>) -> Result<()> {
    let mut value: libc::c_int = config.map_or(-1, |c| c as libc::c_int);
    match unsafe { usbfs_set_configuration(fd, &mut value) } {
        Ok(_) => Ok(()),
        Err(Errno::EINVAL) => Err(Error::NotFound),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn clear_halt(fd: RawFd, endpoint: u8) -> Result<()> {
    let mut ep = endpoint as libc::c_uint;
    match unsafe { usbfs_clear_halt(fd, &mut ep) } {
        Ok(_) => Ok(()),
        Err(Errno::ENOENT) => Err(Error::NotFound),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn reset(fd: RawFd) -> Result<()> {
    match unsafe { usbfs_reset(fd) } {
        Ok(_) => Ok(()),
        // the device was re-enumerated under a new address
        Err(Errno::ENODEV) => Err(Error::NotFound),
        Err(e) => Err(e.into()),
    }
}

/// Driver bound to `iface`, `None` when there is none.
pub(crate) fn get_driver(fd: RawFd, iface: u8) -> Result<Option<String>> {
    let mut getdrv = UsbFsGetDriver {
        interface: iface as libc::c_uint,
        driver: [0; USBFS_MAXDRIVERNAME + 1],
    };
    match unsafe { usbfs_get_driver(fd, &mut getdrv) } {
        Ok(_) => {
            let name = unsafe { CStr::from_ptr(getdrv.driver.as_ptr()) };
            Ok(Some(name.to_string_lossy().into_owned()))
        }
        Err(Errno::ENODATA) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn driver_ioctl(fd: RawFd, iface: u8, code: libc::c_int) -> Result<()> {
    let mut command = UsbFsIoctl {
        interface: iface as libc::c_int,
        code,
        data: ptr::null_mut(),
    };
    match unsafe { usbfs_ioctl(fd, &mut command) } {
        Ok(_) => Ok(()),
        Err(Errno::ENODATA) => Err(Error::NotFound),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn disconnect_driver(fd: RawFd, iface: u8) -> Result<()> {
    if get_driver(fd, iface)?.as_deref() == Some(USBFS_DRIVER_NAME) {
        return Err(Error::NotFound);
    }
    driver_ioctl(fd, iface, USBFS_DISCONNECT)
}

pub(crate) fn connect_driver(fd: RawFd, iface: u8) -> Result<()> {
    driver_ioctl(fd, iface, USBFS_CONNECT)
}

pub(crate) fn submit_urb(fd: RawFd, urb: *mut UsbFsUrb) -> Result<()> {
    match unsafe { usbfs_submit_urb(fd, urb) } {
        Ok(_) => Ok(()),
        Err(Errno::ENODEV) => Err(Error::NoDevice),
        Err(Errno::ENOMEM) => Err(Error::NoMem),
        Err(e) => {
            log::error!("submiturb failed: {}", e);
            Err(Error::Io)
        }
    }
}

/// `NotFound` when the URB already completed.
pub(crate) fn discard_urb(fd: RawFd, urb: *const UsbFsUrb) -> Result<()> {
    match unsafe { usbfs_discard_urb(fd, urb) } {
        Ok(_) => Ok(()),
        Err(Errno::EINVAL) => Err(Error::NotFound),
        Err(Errno::ENODEV) => Err(Error::NoDevice),
        Err(e) => {
            log::warn!("unrecognised discard errno {}", e);
            Err(Error::Other)
        }
    }
}

/// Next finished URB, `None` when the queue is empty.
pub(crate) fn reap_urb_ndelay(fd: RawFd) -> Result<Option<*mut UsbFsUrb>> {
    let mut urb: *mut UsbFsUrb = ptr::null_mut();
    match unsafe { usbfs_reap_urb_ndelay(fd, &mut urb) } {
        Ok(_) if urb.is_null() => Ok(None),
        Ok(_) => Ok(Some(urb)),
        Err(Errno::EAGAIN) => Ok(None),
        Err(Errno::ENODEV) => Err(Error::NoDevice),
        Err(e) => {
            log::error!("reap failed: {}", e);
            Err(Error::Io)
        }
    }
}
