pub(crate) const USBFS_CAP_ZERO_PACKET: u32 = 0x01;
pub(crate) const USBFS_CAP_REAP_AFTER_DISCONNECT: u32 = 0x10;

pub(crate) const USBFS_URB_TYPE_INTERRUPT: u8 = 1;
pub(crate) const USBFS_URB_TYPE_CONTROL: u8 = 2;
pub(crate) const USBFS_URB_TYPE_BULK: u8 = 3;

pub(crate) const USBFS_URB_FLAGS_SHORT_NOT_OK: u32 = 0x01;
pub(crate) const USBFS_URB_FLAGS_ZERO_PACKET: u32 = 0x40;

/// Length of the name buffer in `struct usbdevfs_getdriver`.
pub(crate) const USBFS_MAXDRIVERNAME: usize = 255;

pub(crate) const SYSFS_DEVICES: &str = "/sys/bus/usb/devices";
pub(crate) const DEVFS_ROOT: &str = "/dev/bus/usb";

/// Name the kernel reports for interfaces claimed through usbfs.
pub(crate) const USBFS_DRIVER_NAME: &str = "usbfs";
