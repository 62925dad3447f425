//! Blocking transfers built on the asynchronous engine.
use crate::control_transfer::{ControlSetup, CONTROL_SETUP_SIZE, REQUEST_GET_DESCRIPTOR};
use crate::descriptors::{self, DT_STRING};
use crate::device::DeviceHandle;
use crate::endpoint::{Endpoint, ENDPOINT_IN};
use crate::error::{Error, Result};
use crate::transfer::{Transfer, TransferStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn status_to_result(status: TransferStatus) -> Result<()> {
    match status {
        TransferStatus::Completed => Ok(()),
        TransferStatus::TimedOut => Err(Error::Timeout),
        TransferStatus::Stall => Err(Error::Pipe),
        TransferStatus::NoDevice => Err(Error::NoDevice),
        TransferStatus::Overflow => Err(Error::Overflow),
        TransferStatus::Error | TransferStatus::Cancelled => Err(Error::Io),
    }
}

impl DeviceHandle {
    /// Submits `transfer` and handles events until it completed. Returns
    /// the final status.
    fn submit_and_wait(&self, transfer: &Transfer, completed: Arc<AtomicBool>) -> Result<TransferStatus> {
        transfer.submit()?;
        let ctx = self.context();
        while !completed.load(Ordering::SeqCst) {
            if let Err(e) = ctx.handle_events_completed(Some(&completed)) {
                if e == Error::Interrupted {
                    continue;
                }
                log::error!("handle_events failed: {}, cancelling transfer and retrying", e);
                let _ = transfer.cancel();
                continue;
            }
            if transfer.handle().is_none() {
                // completion after close
                return Ok(TransferStatus::NoDevice);
            }
        }
        Ok(transfer.status())
    }

    /// Control transfer on endpoint 0. For IN requests (`request_type` bit
    /// 7 set) `data` receives the response; returns the bytes moved.
    pub fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        if self.context().is_handling_thread() {
            return Err(Error::Busy);
        }
        if data.len() > u16::MAX as usize {
            return Err(Error::InvalidParam);
        }
        let setup = ControlSetup::new(request_type, request, value, index, data.len() as u16);
        let buffer = setup.fill_buffer(data);

        let completed = Arc::new(AtomicBool::new(false));
        let done = completed.clone();
        let transfer = Transfer::control(self, buffer, timeout, move |_| {
            done.store(true, Ordering::SeqCst);
        });
        let status = self.submit_and_wait(&transfer, completed)?;
        status_to_result(status)?;

        let actual = transfer.actual_length();
        if setup.is_in() {
            let received = transfer.control_data();
            let n = received.len().min(data.len());
            data[..n].copy_from_slice(&received[..n]);
        }
        Ok(actual)
    }

    fn sync_in(&self, transfer: Transfer, completed: Arc<AtomicBool>, data: &mut [u8]) -> Result<usize> {
        let status = self.submit_and_wait(&transfer, completed)?;
        status_to_result(status)?;
        let actual = transfer.actual_length().min(data.len());
        transfer.with_buffer(|buf| data[..actual].copy_from_slice(&buf[..actual]));
        Ok(actual)
    }

    fn sync_out(&self, transfer: Transfer, completed: Arc<AtomicBool>) -> Result<usize> {
        let status = self.submit_and_wait(&transfer, completed)?;
        status_to_result(status)?;
        Ok(transfer.actual_length())
    }

    fn sync_transfer(
        &self,
        endpoint: Endpoint,
        buffer: Vec<u8>,
        timeout: Duration,
        interrupt: bool,
    ) -> Result<(Transfer, Arc<AtomicBool>)> {
        if self.context().is_handling_thread() {
            return Err(Error::Busy);
        }
        let completed = Arc::new(AtomicBool::new(false));
        let done = completed.clone();
        let callback = move |_: &Transfer| done.store(true, Ordering::SeqCst);
        let transfer = if interrupt {
            Transfer::interrupt(self, endpoint, buffer, timeout, callback)
        } else {
            Transfer::bulk(self, endpoint, buffer, timeout, callback)
        };
        Ok((transfer, completed))
    }

    pub fn read_bulk(&self, endpoint: Endpoint, data: &mut [u8], timeout: Duration) -> Result<usize> {
        if !endpoint.is_in() {
            return Err(Error::InvalidParam);
        }
        let (t, completed) = self.sync_transfer(endpoint, vec![0; data.len()], timeout, false)?;
        self.sync_in(t, completed, data)
    }

    pub fn write_bulk(&self, endpoint: Endpoint, data: &[u8], timeout: Duration) -> Result<usize> {
        if !endpoint.is_out() {
            return Err(Error::InvalidParam);
        }
        let (t, completed) = self.sync_transfer(endpoint, data.to_vec(), timeout, false)?;
        self.sync_out(t, completed)
    }

    pub fn read_interrupt(&self, endpoint: Endpoint, data: &mut [u8], timeout: Duration) -> Result<usize> {
        if !endpoint.is_in() {
            return Err(Error::InvalidParam);
        }
        let (t, completed) = self.sync_transfer(endpoint, vec![0; data.len()], timeout, true)?;
        self.sync_in(t, completed, data)
    }

    pub fn write_interrupt(&self, endpoint: Endpoint, data: &[u8], timeout: Duration) -> Result<usize> {
        if !endpoint.is_out() {
            return Err(Error::InvalidParam);
        }
        let (t, completed) = self.sync_transfer(endpoint, data.to_vec(), timeout, true)?;
        self.sync_out(t, completed)
    }

    /// GET_DESCRIPTOR into `data`.
    pub fn get_descriptor(&self, desc_type: u8, desc_index: u8, lang_id: u16, data: &mut [u8]) -> Result<usize> {
        let timeout = self.context().options().control_timeout;
        self.control_transfer(
            ENDPOINT_IN,
            REQUEST_GET_DESCRIPTOR,
            (desc_type as u16) << 8 | desc_index as u16,
            lang_id,
            data,
            timeout,
        )
    }

    /// Languages listed in string descriptor zero.
    pub fn read_languages(&self) -> Result<Vec<u16>> {
        let mut buf = [0u8; 255];
        let n = self.get_descriptor(DT_STRING, 0, 0, &mut buf)?;
        if n < 4 {
            return Err(Error::Io);
        }
        Ok(descriptors::parse_language_ids(&buf[..n])?)
    }

    pub fn read_string_descriptor_with_lang(&self, index: u8, lang_id: u16) -> Result<String> {
        if index == 0 {
            return Err(Error::InvalidParam);
        }
        let mut buf = [0u8; 255];
        let n = self.get_descriptor(DT_STRING, index, lang_id, &mut buf)?;
        if n < 2 || buf[1] != DT_STRING || buf[0] as usize > n {
            return Err(Error::Io);
        }
        Ok(descriptors::parse_string(&buf[..n])?)
    }

    /// String descriptor `index` in the device's first language.
    pub fn read_string_descriptor(&self, index: u8) -> Result<String> {
        let langs = self.read_languages()?;
        let lang = langs.first().copied().ok_or(Error::Io)?;
        self.read_string_descriptor_with_lang(index, lang)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_to_errors() {
        assert_eq!(status_to_result(TransferStatus::Completed), Ok(()));
        assert_eq!(status_to_result(TransferStatus::TimedOut), Err(Error::Timeout));
        assert_eq!(status_to_result(TransferStatus::Stall), Err(Error::Pipe));
        assert_eq!(status_to_result(TransferStatus::NoDevice), Err(Error::NoDevice));
        assert_eq!(status_to_result(TransferStatus::Overflow), Err(Error::Overflow));
        assert_eq!(status_to_result(TransferStatus::Cancelled), Err(Error::Io));
        assert_eq!(status_to_result(TransferStatus::Error), Err(Error::Io));
    }

    #[test]
    fn setup_prefix_size() {
        assert_eq!(CONTROL_SETUP_SIZE, 8);
    }
}
