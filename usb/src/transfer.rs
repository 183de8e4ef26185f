use crate::driver::{
    ERROR_IO_INCOMPLETE, ERROR_IO_PENDING, Overlapped, SessionHandle, SetupPacket,
};
use crate::error::{PreconditionError, Result, TransferError};
use crate::session::{DeviceSession, OpenSession, SessionState};
use log::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlTransferResult {
    pub success: bool,
    pub buffer: Vec<u8>,
    pub transferred: u32,
}

/// The outcome of polling an overlapped read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlappedPoll {
    /// The read completed, holding exactly the bytes the device sent.
    Ready(Vec<u8>),

    /// Still in flight (ERROR_IO_PENDING or ERROR_IO_INCOMPLETE), poll again later.
    Pending(u32),

    /// The read failed with the given code, and has been discarded.
    Failed(u32),

    /// Nothing has been submitted since the last read finished.
    Idle,
}

pub(crate) enum OverlappedRead {
    Idle,
    Submitted {
        session: SessionHandle,
        pipe_id: u8,
        buffer: Box<[u8]>,
        record: Box<Overlapped>,
    },
}

impl OverlappedRead {
    /// True while a read is outstanding on `handle`.
    pub(crate) fn is_on(&self, handle: SessionHandle) -> bool {
        matches!(self, OverlappedRead::Submitted { session, .. } if *session == handle)
    }

    /// Drops an outstanding read without waiting for it. WinUSB may still write into the buffer
    /// and record after this point, so both are leaked instead of freed.
    pub(crate) fn abandon(&mut self, name: &str) {
        if let OverlappedRead::Submitted {
            pipe_id,
            buffer,
            record,
            ..
        } = std::mem::replace(self, OverlappedRead::Idle)
        {
            warn!(
                "[{}] Abandoning in-flight read on pipe 0x{:02x} ({} bytes)",
                name,
                pipe_id,
                buffer.len()
            );
            std::mem::forget(buffer);
            std::mem::forget(record);
        }
    }
}

impl DeviceSession {
    /// Performs a control transfer on the default pipe. A payload, if provided, is copied into a
    /// buffer of exactly `setup.length` bytes, otherwise the buffer is zero filled ready to
    /// receive.
    pub fn control_transfer(
        &self,
        setup: SetupPacket,
        payload: Option<&[u8]>,
    ) -> ControlTransferResult {
        let length = setup.length as usize;
        let mut buffer = vec![0; length];
        if let Some(payload) = payload {
            let copy = payload.len().min(length);
            buffer[..copy].copy_from_slice(&payload[..copy]);
        }

        let session = match self.open_session() {
            Ok(session) => session,
            Err(error) => {
                warn!("[{}] Control transfer skipped: {}", self.name(), error);
                return ControlTransferResult {
                    success: false,
                    buffer,
                    transferred: 0,
                };
            }
        };

        match self.driver.control_transfer(session.active(), setup, &mut buffer) {
            Ok(transferred) => ControlTransferResult {
                success: true,
                buffer,
                transferred,
            },
            Err(error) => {
                warn!(
                    "[{}] Control transfer 0x{:02x} failed: {}",
                    self.name(),
                    { setup.request },
                    error
                );
                ControlTransferResult {
                    success: false,
                    buffer,
                    transferred: 0,
                }
            }
        }
    }

    /// Writes all of `data` in a single request, returning how many bytes the device accepted.
    pub fn write(&self, pipe_id: u8, data: &[u8]) -> Result<u32> {
        let handle = self.transfer_handle()?;
        let written = self
            .driver
            .write_pipe(handle, pipe_id, data)
            .map_err(TransferError::from)?;

        if written as usize != data.len() {
            debug!(
                "[{}] Short write on pipe 0x{:02x}: {} of {} bytes",
                self.name(),
                pipe_id,
                written,
                data.len()
            );
        }
        Ok(written)
    }

    /// Reads up to `length` bytes. A short read is normal, only the received bytes are returned.
    pub fn read(&self, pipe_id: u8, length: usize) -> Result<Vec<u8>> {
        let handle = self.transfer_handle()?;

        let mut buffer = vec![0; length];
        let read = self
            .driver
            .read_pipe(handle, pipe_id, &mut buffer)
            .map_err(TransferError::from)?;

        buffer.truncate(read as usize);
        Ok(buffer)
    }

    /// Submits an asynchronous read of `length` bytes. Any read still outstanding is abandoned.
    pub fn overlapped_read_init(&mut self, pipe_id: u8, length: usize) -> bool {
        let name = self.name().to_string();
        let SessionState::Open(session) = &mut self.state else {
            warn!("[{}] Unable to submit read, device is not open", name);
            return false;
        };
        session.overlapped.abandon(&name);

        let handle = session.active();
        let mut buffer = vec![0u8; length].into_boxed_slice();
        let mut record = Box::<Overlapped>::default();

        match self
            .driver
            .read_pipe_overlapped(handle, pipe_id, &mut buffer, &mut record)
        {
            Ok(()) => debug!("[{}] Read on pipe 0x{:02x} completed at submission", name, pipe_id),
            Err(error) if error.code() == ERROR_IO_PENDING => {}
            Err(error) => {
                warn!("[{}] Unable to submit read on pipe 0x{:02x}: {}", name, pipe_id, error);
                return false;
            }
        }

        session.overlapped = OverlappedRead::Submitted {
            session: handle,
            pipe_id,
            buffer,
            record,
        };
        true
    }

    /// Checks on the outstanding asynchronous read without blocking. A completed read is not
    /// resubmitted, call `overlapped_read_init` again for the next one.
    pub fn overlapped_read(&mut self) -> Result<OverlappedPoll> {
        let name = self.name().to_string();
        let session = match &mut self.state {
            SessionState::Open(session) => session,
            SessionState::Uninitialized => return Err(PreconditionError::NotOpen.into()),
            SessionState::Closed => return Err(PreconditionError::Closed.into()),
        };

        let OverlappedRead::Submitted {
            session: handle,
            record,
            ..
        } = &mut session.overlapped
        else {
            return Ok(OverlappedPoll::Idle);
        };

        match self.driver.get_overlapped_result(*handle, record, false) {
            Ok(length) => {
                let buffer = Self::finish_overlapped(session);
                let length = (length as usize).min(buffer.len());
                Ok(OverlappedPoll::Ready(buffer[..length].to_vec()))
            }
            Err(error) if [ERROR_IO_PENDING, ERROR_IO_INCOMPLETE].contains(&error.code()) => {
                Ok(OverlappedPoll::Pending(error.code()))
            }
            Err(error) => {
                warn!("[{}] Overlapped read failed: {}", name, error);
                Self::finish_overlapped(session);
                Ok(OverlappedPoll::Failed(error.code()))
            }
        }
    }

    fn finish_overlapped(session: &mut OpenSession) -> Box<[u8]> {
        match std::mem::replace(&mut session.overlapped, OverlappedRead::Idle) {
            OverlappedRead::Submitted { buffer, .. } => buffer,
            OverlappedRead::Idle => Box::default(),
        }
    }

    fn transfer_handle(&self) -> std::result::Result<SessionHandle, PreconditionError> {
        let handle = self.open_session()?.active();
        if handle.is_null() {
            return Err(PreconditionError::NullSessionHandle);
        }
        Ok(handle)
    }
}
