use crate::driver::{
    DEVICE_SPEED, DriverApi, FileHandle, InterfaceDescriptor, OpenOptions, SessionHandle,
};
use crate::enumerator::DeviceDescriptor;
use crate::error::{PreconditionError, ResourceError, Result};
use crate::transfer::OverlappedRead;
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, info, warn};
use std::rc::Rc;
use winusb_types::{DeviceSpeed, PipePolicy, PipeType};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PipeDescriptor {
    pub pipe_type: PipeType,
    pub pipe_id: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Uninitialized,
    Open,
    Closed,
}

pub(crate) enum SessionState {
    Uninitialized,
    Open(OpenSession),
    Closed,
}

pub(crate) struct OpenSession {
    pub(crate) file: FileHandle,

    // The handle returned by WinUsb_Initialize, which always represents the first interface.
    pub(crate) root: SessionHandle,

    // Set by change_interface, this replaces the root for all pipe and transfer operations.
    pub(crate) associated: Option<(u8, SessionHandle)>,

    pub(crate) overlapped: OverlappedRead,
}

impl OpenSession {
    pub(crate) fn active(&self) -> SessionHandle {
        match self.associated {
            Some((_, handle)) => handle,
            None => self.root,
        }
    }
}

/// A single device, and the WinUSB handles needed to talk to it.
pub struct DeviceSession {
    device: DeviceDescriptor,
    options: OpenOptions,
    pub(crate) driver: Rc<dyn DriverApi>,
    pub(crate) state: SessionState,
}

impl DeviceSession {
    pub fn new(driver: Rc<dyn DriverApi>, device: DeviceDescriptor) -> Self {
        debug!("[{}] Session created for {}", device.name(), device.path());
        Self {
            device,
            options: OpenOptions::default(),
            driver,
            state: SessionState::Uninitialized,
        }
    }

    /// Overrides the parameters used to open the device path. Only effective before `init_device`.
    pub fn with_options(mut self, options: OpenOptions) -> Self {
        self.options = options;
        self
    }

    pub fn name(&self) -> &str {
        self.device.name()
    }

    pub fn path(&self) -> &str {
        self.device.path()
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.device
    }

    pub fn status(&self) -> SessionStatus {
        match self.state {
            SessionState::Uninitialized => SessionStatus::Uninitialized,
            SessionState::Open(_) => SessionStatus::Open,
            SessionState::Closed => SessionStatus::Closed,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status() == SessionStatus::Open
    }

    pub fn init_device(&mut self) -> Result<()> {
        match self.state {
            SessionState::Uninitialized => {}
            SessionState::Open(_) => return Err(PreconditionError::AlreadyOpen.into()),
            SessionState::Closed => return Err(PreconditionError::Closed.into()),
        }

        let path = self.device.path().to_string();
        let file = match self.driver.open_file(&path, &self.options) {
            Ok(file) if file.is_valid() => file,
            Ok(_) => {
                error!("[{}] Failed to open device at {}", self.name(), path);
                return Err(ResourceError::Open {
                    path,
                    error: crate::error::OsError(0),
                }
                .into());
            }
            Err(error) => {
                error!("[{}] Failed to open device at {}: {}", self.name(), path, error);
                return Err(ResourceError::Open { path, error }.into());
            }
        };
        debug!("[{}] Device opened at {}", self.name(), path);

        let root = match self.driver.session_initialize(file) {
            Ok(root) if !root.is_null() => root,
            result => {
                let error = result.err().unwrap_or(crate::error::OsError(0));
                error!("[{}] WinUSB initialisation failed: {}", self.name(), error);

                // Don't leave the file handle dangling, the session can be retried from scratch.
                if let Err(close_error) = self.driver.close_handle(file) {
                    warn!("[{}] Unable to close file handle: {}", self.name(), close_error);
                }
                return Err(ResourceError::SessionInit(error).into());
            }
        };

        info!("[{}] WinUSB session initialised", self.name());
        self.state = SessionState::Open(OpenSession {
            file,
            root,
            associated: None,
            overlapped: OverlappedRead::Idle,
        });
        Ok(())
    }

    /// Releases every handle held by the session, attempting each release even when an earlier
    /// one fails. Returns true only if all of them succeeded. The session can't be reopened.
    pub fn close_device(&mut self) -> bool {
        let state = std::mem::replace(&mut self.state, SessionState::Closed);
        let SessionState::Open(mut session) = state else {
            debug!("[{}] Nothing to close", self.name());
            return true;
        };

        session.overlapped.abandon(self.name());

        let mut success = true;
        if let Some((index, handle)) = session.associated.take() {
            if let Err(error) = self.driver.session_free(handle) {
                warn!("[{}] Unable to free interface {}: {}", self.name(), index, error);
                success = false;
            }
        }
        if let Err(error) = self.driver.close_handle(session.file) {
            warn!("[{}] Unable to close file handle: {}", self.name(), error);
            success = false;
        }
        if let Err(error) = self.driver.session_free(session.root) {
            warn!("[{}] Unable to free WinUSB session: {}", self.name(), error);
            success = false;
        }

        if success {
            info!("[{}] Device closed", self.name());
        }
        success
    }

    /// Switches pipe and transfer operations to the associated interface at `index`.
    pub fn change_interface(&mut self, index: u8) -> bool {
        let name = self.device.name().to_string();
        let SessionState::Open(session) = &mut self.state else {
            warn!("[{}] Unable to change interface, device is not open", name);
            return false;
        };

        let handle = match self.driver.get_associated_interface(session.root, index) {
            Ok(handle) if !handle.is_null() => handle,
            Ok(_) => {
                warn!("[{}] Interface {} returned a null handle", name, index);
                return false;
            }
            Err(error) => {
                warn!("[{}] Unable to change to interface {}: {}", name, index, error);
                return false;
            }
        };

        if let Some((previous, previous_handle)) = session.associated.replace((index, handle)) {
            if session.overlapped.is_on(previous_handle) {
                session.overlapped.abandon(&name);
            }
            if let Err(error) = self.driver.session_free(previous_handle) {
                warn!("[{}] Unable to free interface {}: {}", name, previous, error);
            }
        }

        debug!("[{}] Changed to interface {}", name, index);
        true
    }

    /// The associated interface in use, or None while still on the default interface.
    pub fn current_interface(&self) -> Option<u8> {
        match &self.state {
            SessionState::Open(session) => session.associated.map(|(index, _)| index),
            _ => None,
        }
    }

    pub fn query_interface_settings(&self, index: u8) -> Result<Option<InterfaceDescriptor>> {
        let session = self.open_session()?;
        let Some((current, active)) = session.associated else {
            return Err(PreconditionError::InterfaceNotSelected.into());
        };

        if current == 0 {
            return Ok(self.query_settings_with(active));
        }

        let sibling = match self.driver.get_associated_interface(session.root, index) {
            Ok(sibling) if !sibling.is_null() => sibling,
            Ok(_) => return Ok(None),
            Err(error) => {
                debug!("[{}] Unable to resolve interface {}: {}", self.name(), index, error);
                return Ok(None);
            }
        };

        let descriptor = self.query_settings_with(sibling);
        if let Err(error) = self.driver.session_free(sibling) {
            warn!("[{}] Unable to free interface {}: {}", self.name(), index, error);
        }
        Ok(descriptor)
    }

    fn query_settings_with(&self, handle: SessionHandle) -> Option<InterfaceDescriptor> {
        match self.driver.query_interface_settings(handle, 0) {
            Ok(descriptor) => Some(descriptor),
            Err(error) => {
                debug!("[{}] Interface settings query failed: {}", self.name(), error);
                None
            }
        }
    }

    pub fn query_pipe(&self, pipe_index: u8) -> Result<Option<PipeDescriptor>> {
        let session = self.open_session()?;

        let raw = match self.driver.query_pipe(session.active(), 0, pipe_index) {
            Ok(raw) => raw,
            Err(error) => {
                debug!("[{}] Pipe {} query failed: {}", self.name(), pipe_index, error);
                return Ok(None);
            }
        };

        let Some(pipe_type) = PipeType::from_raw(raw.pipe_type) else {
            warn!("[{}] Unknown pipe type {}", self.name(), raw.pipe_type);
            return Ok(None);
        };

        Ok(Some(PipeDescriptor {
            pipe_type,
            pipe_id: raw.pipe_id,
            max_packet_size: raw.maximum_packet_size,
            interval: raw.interval,
        }))
    }

    /// Every pipe on the current interface, in index order.
    pub fn pipes(&self) -> Result<Vec<PipeDescriptor>> {
        let mut pipes = Vec::new();
        for index in 0..=u8::MAX {
            match self.query_pipe(index)? {
                Some(pipe) => pipes.push(pipe),
                None => break,
            }
        }
        Ok(pipes)
    }

    pub fn query_device_info(&self, info_type: u32) -> Option<u32> {
        let session = self.open_session().ok()?;
        match self.driver.query_device_information(session.active(), info_type) {
            Ok(value) => Some(value),
            Err(error) => {
                debug!("[{}] Device information {} unavailable: {}", self.name(), info_type, error);
                None
            }
        }
    }

    pub fn device_speed(&self) -> Option<DeviceSpeed> {
        self.query_device_info(DEVICE_SPEED)
            .and_then(DeviceSpeed::from_raw)
    }

    pub fn set_pipe_policy(&self, pipe_id: u8, policy: PipePolicy, value: &[u8]) -> bool {
        let Ok(session) = self.open_session() else {
            warn!("[{}] Unable to set {} policy, device is not open", self.name(), policy);
            return false;
        };

        match self.driver.set_pipe_policy(session.active(), pipe_id, policy.id(), value) {
            Ok(()) => true,
            Err(error) => {
                warn!(
                    "[{}] Unable to set {} on pipe 0x{:02x}: {}",
                    self.name(),
                    policy,
                    pipe_id,
                    error
                );
                false
            }
        }
    }

    pub fn set_timeout(&self, pipe_id: u8, timeout_ms: u32) -> bool {
        let mut value = [0; 4];
        LittleEndian::write_u32(&mut value, timeout_ms);
        self.set_pipe_policy(pipe_id, PipePolicy::PipeTransferTimeout, &value)
    }

    pub fn flush(&self, pipe_id: u8) -> bool {
        let Ok(session) = self.open_session() else {
            return false;
        };

        match self.driver.flush_pipe(session.active(), pipe_id) {
            Ok(()) => true,
            Err(error) => {
                warn!("[{}] Unable to flush pipe 0x{:02x}: {}", self.name(), pipe_id, error);
                false
            }
        }
    }

    pub(crate) fn open_session(&self) -> std::result::Result<&OpenSession, PreconditionError> {
        match &self.state {
            SessionState::Open(session) => Ok(session),
            SessionState::Uninitialized => Err(PreconditionError::NotOpen),
            SessionState::Closed => Err(PreconditionError::Closed),
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if self.is_open() && !self.close_device() {
            warn!("[{}] Handles were not cleanly released on drop", self.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::{Call, FakeDriver};
    use crate::error::Error;
    use crate::transfer::OverlappedPoll;

    const PATH: &str = r"\\?\usb#vid_1234&pid_5678#0001#{dee824ef-729b-4a0e-9c14-b7117d33a817}";

    fn session() -> (Rc<FakeDriver>, DeviceSession) {
        let fake = Rc::new(FakeDriver::new());
        let session = DeviceSession::new(fake.clone(), DeviceDescriptor::new("Test Device", PATH));
        (fake, session)
    }

    fn open_session() -> (Rc<FakeDriver>, DeviceSession) {
        let (fake, mut session) = session();
        session.init_device().unwrap();
        fake.clear_calls();
        (fake, session)
    }

    #[test]
    fn init_opens_both_handles() {
        let (fake, mut session) = session();
        assert_eq!(session.status(), SessionStatus::Uninitialized);

        session.init_device().unwrap();
        assert_eq!(session.status(), SessionStatus::Open);
        assert_eq!(session.current_interface(), None);
        assert_eq!(fake.live_sessions(), 1);

        match &fake.calls()[0] {
            Call::OpenFile { path, options } => {
                assert_eq!(path, PATH);
                assert_eq!(*options, OpenOptions::default());
            }
            other => panic!("Expected the file to be opened first, got {:?}", other),
        }
    }

    #[test]
    fn open_failure_skips_session_initialisation() {
        let (fake, mut session) = session();
        fake.fail_open.set(Some(2));

        let result = session.init_device();
        assert!(matches!(
            result,
            Err(Error::Resource(ResourceError::Open { error, .. })) if error.code() == 2
        ));
        assert_eq!(
            fake.count(|call| matches!(call, Call::SessionInitialize(_))),
            0
        );
        assert_eq!(session.status(), SessionStatus::Uninitialized);
    }

    #[test]
    fn invalid_file_handle_skips_session_initialisation() {
        let (fake, mut session) = session();
        fake.open_returns_invalid.set(true);

        let result = session.init_device();
        assert!(matches!(
            result,
            Err(Error::Resource(ResourceError::Open { error, .. })) if error.code() == 0
        ));
        assert_eq!(
            fake.count(|call| matches!(call, Call::SessionInitialize(_))),
            0
        );
        assert_eq!(session.status(), SessionStatus::Uninitialized);
    }

    #[test]
    fn null_session_handle_is_an_initialisation_failure() {
        let (fake, mut session) = session();
        fake.session_returns_null.set(true);

        let result = session.init_device();
        assert!(matches!(
            result,
            Err(Error::Resource(ResourceError::SessionInit(error))) if error.code() == 0
        ));
        assert_eq!(fake.count(|call| matches!(call, Call::CloseHandle(_))), 1);
        assert_eq!(fake.live_sessions(), 0);
        assert_eq!(session.status(), SessionStatus::Uninitialized);

        fake.session_returns_null.set(false);
        session.init_device().unwrap();
        assert!(session.is_open());
    }

    #[test]
    fn session_failure_closes_the_file_and_allows_retry() {
        let (fake, mut session) = session();
        fake.fail_session_init.set(Some(31));

        let result = session.init_device();
        assert!(matches!(
            result,
            Err(Error::Resource(ResourceError::SessionInit(error))) if error.code() == 31
        ));
        assert_eq!(fake.count(|call| matches!(call, Call::CloseHandle(_))), 1);
        assert_eq!(session.status(), SessionStatus::Uninitialized);

        fake.fail_session_init.set(None);
        session.init_device().unwrap();
        assert!(session.is_open());
    }

    #[test]
    fn init_twice_is_a_precondition_error() {
        let (_fake, mut session) = open_session();
        assert!(matches!(
            session.init_device(),
            Err(Error::Precondition(PreconditionError::AlreadyOpen))
        ));
    }

    #[test]
    fn close_attempts_every_release() {
        let (fake, mut session) = open_session();
        fake.fail_close_handle.set(Some(6));

        assert!(!session.close_device());
        assert_eq!(session.status(), SessionStatus::Closed);
        assert_eq!(fake.count(|call| matches!(call, Call::CloseHandle(_))), 1);
        assert_eq!(fake.count(|call| matches!(call, Call::SessionFree(_))), 1);
        assert_eq!(fake.live_sessions(), 0);

        assert!(matches!(
            session.init_device(),
            Err(Error::Precondition(PreconditionError::Closed))
        ));
    }

    #[test]
    fn close_reports_session_free_failure() {
        let (fake, mut session) = open_session();
        fake.fail_session_free.set(Some(6));

        assert!(!session.close_device());
        assert_eq!(fake.count(|call| matches!(call, Call::CloseHandle(_))), 1);
    }

    #[test]
    fn clean_close_succeeds() {
        let (fake, mut session) = open_session();
        assert!(session.change_interface(0));

        assert!(session.close_device());
        assert_eq!(fake.live_sessions(), 0);

        let calls = fake.calls();
        let releases: Vec<&Call> = calls
            .iter()
            .filter(|call| matches!(call, Call::SessionFree(_) | Call::CloseHandle(_)))
            .collect();
        assert_eq!(releases.len(), 3);
        assert!(matches!(releases[1], Call::CloseHandle(_)));
    }

    #[test]
    fn change_interface_keeps_the_root() {
        let (fake, mut session) = open_session();
        fake.associated_interfaces.set(2);

        assert!(session.change_interface(0));
        assert!(session.change_interface(1));
        assert_eq!(session.current_interface(), Some(1));

        // Both requests come from the root handle, and the first associated handle is released.
        let roots: Vec<SessionHandle> = fake
            .calls()
            .iter()
            .filter_map(|call| match call {
                Call::GetAssociatedInterface { session, .. } => Some(*session),
                _ => None,
            })
            .collect();
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0], roots[1]);
        assert_eq!(fake.count(|call| matches!(call, Call::SessionFree(_))), 1);
        assert_eq!(fake.live_sessions(), 2);
    }

    #[test]
    fn change_abandons_a_read_on_the_replaced_interface() {
        let (fake, mut session) = open_session();
        fake.associated_interfaces.set(2);
        assert!(session.change_interface(0));
        assert!(session.overlapped_read_init(0x81, 8));

        assert!(session.change_interface(1));
        let freed: Vec<SessionHandle> = fake
            .calls()
            .iter()
            .filter_map(|call| match call {
                Call::SessionFree(handle) => Some(*handle),
                _ => None,
            })
            .collect();
        assert_eq!(freed.len(), 1);

        // The read belonged to the freed handle, so nothing is left to poll.
        fake.clear_calls();
        assert_eq!(session.overlapped_read().unwrap(), OverlappedPoll::Idle);
        assert_eq!(
            fake.count(|call| matches!(call, Call::GetOverlappedResult { .. })),
            0
        );
    }

    #[test]
    fn change_keeps_a_read_on_the_root() {
        let (fake, mut session) = open_session();
        assert!(session.overlapped_read_init(0x81, 8));

        assert!(session.change_interface(0));
        fake.clear_calls();
        assert_eq!(
            session.overlapped_read().unwrap(),
            OverlappedPoll::Pending(crate::driver::ERROR_IO_INCOMPLETE)
        );
        assert_eq!(
            fake.count(|call| matches!(call, Call::GetOverlappedResult { .. })),
            1
        );
    }

    #[test]
    fn failed_change_leaves_state_alone() {
        let (_fake, mut session) = open_session();
        assert!(session.change_interface(0));
        assert!(!session.change_interface(5));
        assert_eq!(session.current_interface(), Some(0));
    }

    #[test]
    fn change_requires_an_open_session() {
        let (fake, mut session) = session();
        assert!(!session.change_interface(0));
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn interface_settings_need_a_selected_interface() {
        let (_fake, session) = open_session();
        assert!(matches!(
            session.query_interface_settings(0),
            Err(Error::Precondition(PreconditionError::InterfaceNotSelected))
        ));
    }

    #[test]
    fn interface_settings_on_the_first_associated_interface() {
        let (fake, mut session) = open_session();
        assert!(session.change_interface(0));
        fake.clear_calls();

        let descriptor = session.query_interface_settings(0).unwrap().unwrap();
        assert_eq!(descriptor.interface_number, 1);
        assert_eq!(descriptor.alternate_setting, 0);
        assert_eq!(
            fake.count(|call| matches!(call, Call::GetAssociatedInterface { .. })),
            0
        );
    }

    #[test]
    fn interface_settings_resolve_and_free_a_sibling() {
        let (fake, mut session) = open_session();
        fake.associated_interfaces.set(3);
        assert!(session.change_interface(1));
        let live = fake.live_sessions();

        let descriptor = session.query_interface_settings(2).unwrap().unwrap();
        assert_eq!(descriptor.interface_number, 3);
        assert_eq!(fake.live_sessions(), live);
        assert_eq!(session.current_interface(), Some(1));

        assert_eq!(session.query_interface_settings(9).unwrap(), None);
    }

    #[test]
    fn pipes_are_described() {
        let (fake, session) = open_session();
        fake.add_pipe(2, 0x81, 64, 0);
        fake.add_pipe(3, 0x02, 8, 10);

        let pipe = session.query_pipe(1).unwrap().unwrap();
        assert_eq!(
            pipe,
            PipeDescriptor {
                pipe_type: PipeType::Interrupt,
                pipe_id: 0x02,
                max_packet_size: 8,
                interval: 10,
            }
        );
        assert_eq!(session.query_pipe(2).unwrap(), None);
        assert_eq!(session.pipes().unwrap().len(), 2);
    }

    #[test]
    fn pipe_query_requires_an_open_session() {
        let (fake, session) = session();
        assert!(matches!(
            session.query_pipe(0),
            Err(Error::Precondition(PreconditionError::NotOpen))
        ));
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn device_speed_is_decoded() {
        let (fake, session) = open_session();
        assert_eq!(session.device_speed(), Some(DeviceSpeed::High));

        fake.device_speed.set(None);
        assert_eq!(session.device_speed(), None);
    }

    #[test]
    fn timeout_is_a_little_endian_policy() {
        let (fake, session) = open_session();
        assert!(session.set_timeout(0x81, 1000));

        assert_eq!(
            fake.calls(),
            vec![Call::SetPipePolicy {
                pipe_id: 0x81,
                policy: 3,
                value: vec![0xE8, 0x03, 0x00, 0x00],
            }]
        );

        fake.fail_policy.set(Some(87));
        assert!(!session.set_pipe_policy(0x81, PipePolicy::RawIo, &[1]));
    }

    #[test]
    fn flush_reports_the_driver_result() {
        let (fake, session) = open_session();
        assert!(session.flush(0x81));

        fake.fail_flush.set(Some(6));
        assert!(!session.flush(0x81));
    }

    #[test]
    fn drop_closes_an_open_session() {
        let (fake, session) = open_session();
        drop(session);
        assert_eq!(fake.live_sessions(), 0);
        assert_eq!(fake.count(|call| matches!(call, Call::CloseHandle(_))), 1);
    }
}
