use super::constants::*;
use crate::endpoint::Endpoint;
use crate::transfer::{TransferFlags, TransferStatus, TransferType};
use crate::error::{Error, Result};
use std::fmt;
use std::ptr;

/// `struct usbdevfs_urb` without the trailing iso packet array.
#[derive(Debug)]
#[repr(C)]
pub(crate) struct UsbFsUrb {
    pub(crate) typ: u8,
    pub(crate) endpoint: u8,
    pub(crate) status: i32,
    pub(crate) flags: u32,
    pub(crate) buffer: *mut u8,
    pub(crate) buffer_length: i32,
    pub(crate) actual_length: i32,
    pub(crate) start_frame: i32,
    /// `number_of_packets` for iso, `stream_id` for bulk streams.
    pub(crate) stream_id: u32,
    pub(crate) error_count: i32,
    pub(crate) signr: u32,
    pub(crate) usercontext: *mut libc::c_void,
}

impl UsbFsUrb {
    pub(crate) fn new(typ: u8, ep: Endpoint, buffer: &mut [u8]) -> Result<Self> {
        if buffer.len() > i32::MAX as usize {
            return Err(Error::InvalidParam);
        }
        Ok(UsbFsUrb {
            typ,
            endpoint: ep.into(),
            status: 0,
            flags: 0,
            buffer: buffer.as_mut_ptr(),
            buffer_length: buffer.len() as i32,
            actual_length: 0,
            start_frame: 0,
            stream_id: 0,
            error_count: 0,
            signr: 0,
            usercontext: ptr::null_mut(),
        })
    }

    pub(crate) fn urb_type(kind: TransferType) -> Result<u8> {
        match kind {
            TransferType::Control => Ok(USBFS_URB_TYPE_CONTROL),
            TransferType::Bulk | TransferType::BulkStream => Ok(USBFS_URB_TYPE_BULK),
            TransferType::Interrupt => Ok(USBFS_URB_TYPE_INTERRUPT),
            TransferType::Isochronous => Err(Error::NotSupported),
        }
    }

    /// Translates transfer flags, `NotSupported` when the kernel lacks a
    /// required capability.
    pub(crate) fn set_flags(&mut self, flags: TransferFlags, caps: u32) -> Result<()> {
        let ep = Endpoint::new(self.endpoint);
        if flags.contains(TransferFlags::SHORT_NOT_OK) && ep.is_in() {
            self.flags |= USBFS_URB_FLAGS_SHORT_NOT_OK;
        }
        if flags.contains(TransferFlags::ADD_ZERO_PACKET) && ep.is_out() {
            if caps & USBFS_CAP_ZERO_PACKET == 0 {
                return Err(Error::NotSupported);
            }
            self.flags |= USBFS_URB_FLAGS_ZERO_PACKET;
        }
        Ok(())
    }

    /// Status of a reaped URB. `None` means the URB was unlinked by a
    /// discard.
    pub(crate) fn transfer_status(&self) -> Option<TransferStatus> {
        match -self.status {
            0 => Some(TransferStatus::Completed),
            // short packet with SHORT_NOT_OK, the core judges the length
            libc::EREMOTEIO => Some(TransferStatus::Completed),
            libc::ENOENT | libc::ECONNRESET => None,
            libc::EPIPE => Some(TransferStatus::Stall),
            libc::EOVERFLOW => Some(TransferStatus::Overflow),
            libc::ENODEV | libc::ESHUTDOWN => Some(TransferStatus::NoDevice),
            libc::EPROTO | libc::EILSEQ | libc::ETIME | libc::ECOMM | libc::ENOSR => {
                log::debug!("low level error {} on ep 0x{:02x}", self.status, self.endpoint);
                Some(TransferStatus::Error)
            }
            _ => {
                log::warn!("unrecognised urb status {} on ep 0x{:02x}", self.status, self.endpoint);
                Some(TransferStatus::Error)
            }
        }
    }
}

impl fmt::Display for UsbFsUrb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "type: 0x{:02X}", self.typ)?;
        writeln!(f, "endpoint: 0x{:02X}", self.endpoint)?;
        writeln!(f, "status: {}", self.status)?;
        writeln!(f, "flags: 0x{:08X}", self.flags)?;
        writeln!(f, "buffer_length: {}", self.buffer_length)?;
        write!(f, "actual_length: {}", self.actual_length)
    }
}

/// A URB owned by the backend while the kernel works on it. The data area is
/// separate from the transfer's buffer so the application can never resize
/// memory the kernel writes into.
pub(crate) struct UrbSlot {
    urb: Box<UsbFsUrb>,
    data: Vec<u8>,
}

// The raw pointers point into `data`, which moves with the slot.
unsafe impl Send for UrbSlot {}

impl UrbSlot {
    pub(crate) fn new(typ: u8, ep: Endpoint, mut data: Vec<u8>) -> Result<Self> {
        let urb = Box::new(UsbFsUrb::new(typ, ep, &mut data)?);
        Ok(UrbSlot { urb, data })
    }

    pub(crate) fn urb(&self) -> &UsbFsUrb {
        &self.urb
    }

    pub(crate) fn urb_mut(&mut self) -> &mut UsbFsUrb {
        &mut self.urb
    }

    /// Address the kernel hands back on reap.
    pub(crate) fn key(&self) -> usize {
        &*self.urb as *const UsbFsUrb as usize
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut UsbFsUrb {
        &mut *self.urb
    }

    /// Bytes the kernel reported, starting `offset` bytes into the data.
    pub(crate) fn received(&self, offset: usize) -> &[u8] {
        let actual = self.urb.actual_length.max(0) as usize;
        let end = (offset + actual).min(self.data.len());
        self.data.get(offset..end).unwrap_or(&[])
    }
}
