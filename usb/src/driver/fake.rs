//! A scripted, in-memory Driver API.
//!
//! Every call is recorded in order, and each failure mode can be injected through the public
//! `Cell` / `RefCell` fields, so tests can assert both on what the core returned, and on exactly
//! which platform operations it performed to get there.
use crate::driver::{
    DeviceInfoRecord, DriverApi, DriverResult, ERROR_INSUFFICIENT_BUFFER, ERROR_INVALID_HANDLE,
    ERROR_INVALID_USER_BUFFER, ERROR_IO_INCOMPLETE, ERROR_IO_PENDING, ERROR_NO_MORE_ITEMS,
    FileHandle, InfoSetHandle, InterfaceDescriptor, InterfaceRecord, OpenOptions, Overlapped,
    RawPipeInformation, SPDRP_FRIENDLYNAME, SessionHandle, SetupPacket,
};
use crate::error::OsError;
use byteorder::{ByteOrder, LittleEndian};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use winusb_types::Guid;

pub const ERROR_SEM_TIMEOUT: u32 = 121;
pub const ERROR_GEN_FAILURE: u32 = 31;

#[derive(Debug, Clone)]
pub struct FakeDevice {
    pub path: String,
    pub friendly_name: Option<String>,
    pub header_size: u32,
}

impl FakeDevice {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            friendly_name: None,
            header_size: 8,
        }
    }

    pub fn with_friendly_name(mut self, name: &str) -> Self {
        self.friendly_name = Some(name.to_string());
        self
    }

    pub fn with_header_size(mut self, header_size: u32) -> Self {
        self.header_size = header_size;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    EnumerateClassDevices { guid: Guid, flags: u32 },
    DestroyDeviceInfoSet(InfoSetHandle),
    EnumerateDeviceInterface { index: u32 },
    InterfaceDetail { header_size: u32 },
    GetDeviceProperty,
    OpenFile { path: String, options: OpenOptions },
    CloseHandle(FileHandle),
    SessionInitialize(FileHandle),
    SessionFree(SessionHandle),
    GetAssociatedInterface { session: SessionHandle, index: u8 },
    QueryDeviceInformation { info_type: u32 },
    QueryInterfaceSettings(SessionHandle),
    QueryPipe { session: SessionHandle, pipe_index: u8 },
    ControlTransfer { setup: SetupPacket, data: Vec<u8> },
    WritePipe { session: SessionHandle, pipe_id: u8, data: Vec<u8> },
    ReadPipe { session: SessionHandle, pipe_id: u8, length: usize },
    ReadPipeOverlapped { pipe_id: u8, length: usize },
    GetOverlappedResult { wait: bool },
    SetPipePolicy { pipe_id: u8, policy: u32, value: Vec<u8> },
    FlushPipe { pipe_id: u8 },
}

/// How the next overlapped poll should resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Pending,
    Incomplete,
    Complete,
    Fail(u32),
}

pub struct FakeDriver {
    calls: RefCell<Vec<Call>>,
    devices: RefCell<Vec<FakeDevice>>,
    open_sets: RefCell<Vec<InfoSetHandle>>,
    sessions: RefCell<HashMap<SessionHandle, u8>>,
    next_handle: Cell<isize>,
    in_flight: Cell<Option<u32>>,

    /// Injected failures, each holding the error code to report.
    pub fail_info_set: Cell<Option<u32>>,
    pub fail_enumeration_at: Cell<Option<(u32, u32)>>,
    pub fail_property: Cell<bool>,
    pub fail_open: Cell<Option<u32>>,
    pub fail_session_init: Cell<Option<u32>>,
    pub fail_close_handle: Cell<Option<u32>>,
    pub fail_session_free: Cell<Option<u32>>,
    pub fail_query_pipe: Cell<Option<u32>>,
    pub fail_policy: Cell<Option<u32>>,
    pub fail_flush: Cell<Option<u32>>,
    pub fail_control: Cell<Option<u32>>,

    /// Succeed without a usable handle, as CreateFileW and WinUsb_Initialize occasionally do.
    pub open_returns_invalid: Cell<bool>,
    pub session_returns_null: Cell<bool>,

    /// Number of associated interfaces reachable from a root handle.
    pub associated_interfaces: Cell<u8>,
    pub pipes: RefCell<Vec<RawPipeInformation>>,
    pub device_speed: Cell<Option<u32>>,

    /// Scripted responses, consumed front to back.
    pub read_responses: RefCell<VecDeque<Result<Vec<u8>, u32>>>,
    pub write_results: RefCell<VecDeque<Result<u32, u32>>>,
    pub control_responses: RefCell<VecDeque<Vec<u8>>>,
    pub overlapped_payloads: RefCell<VecDeque<Vec<u8>>>,
    pub overlapped_submit_codes: RefCell<VecDeque<u32>>,
    pub poll_outcomes: RefCell<VecDeque<PollOutcome>>,
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDriver {
    pub fn new() -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            devices: RefCell::new(Vec::new()),
            open_sets: RefCell::new(Vec::new()),
            sessions: RefCell::new(HashMap::new()),
            next_handle: Cell::new(0x100),
            in_flight: Cell::new(None),

            fail_info_set: Cell::new(None),
            fail_enumeration_at: Cell::new(None),
            fail_property: Cell::new(false),
            fail_open: Cell::new(None),
            fail_session_init: Cell::new(None),
            fail_close_handle: Cell::new(None),
            fail_session_free: Cell::new(None),
            fail_query_pipe: Cell::new(None),
            fail_policy: Cell::new(None),
            fail_flush: Cell::new(None),
            fail_control: Cell::new(None),

            open_returns_invalid: Cell::new(false),
            session_returns_null: Cell::new(false),

            associated_interfaces: Cell::new(1),
            pipes: RefCell::new(Vec::new()),
            device_speed: Cell::new(Some(3)),

            read_responses: RefCell::new(VecDeque::new()),
            write_results: RefCell::new(VecDeque::new()),
            control_responses: RefCell::new(VecDeque::new()),
            overlapped_payloads: RefCell::new(VecDeque::new()),
            overlapped_submit_codes: RefCell::new(VecDeque::new()),
            poll_outcomes: RefCell::new(VecDeque::new()),
        }
    }

    pub fn add_device(&self, device: FakeDevice) {
        self.devices.borrow_mut().push(device);
    }

    pub fn add_pipe(&self, pipe_type: u32, pipe_id: u8, maximum_packet_size: u16, interval: u8) {
        self.pipes.borrow_mut().push(RawPipeInformation {
            pipe_type,
            pipe_id,
            maximum_packet_size,
            interval,
        });
    }

    pub fn push_read(&self, response: Result<Vec<u8>, u32>) {
        self.read_responses.borrow_mut().push_back(response);
    }

    pub fn push_poll(&self, outcome: PollOutcome) {
        self.poll_outcomes.borrow_mut().push_back(outcome);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.borrow_mut().clear();
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls.borrow().iter().filter(|call| predicate(call)).count()
    }

    pub fn detail_header_attempts(&self) -> Vec<u32> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                Call::InterfaceDetail { header_size } => Some(*header_size),
                _ => None,
            })
            .collect()
    }

    pub fn open_info_sets(&self) -> usize {
        self.open_sets.borrow().len()
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.borrow().len()
    }

    fn record(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }

    fn allocate_handle(&self) -> isize {
        let handle = self.next_handle.get();
        self.next_handle.set(handle + 1);
        handle
    }

    fn fail(cell: &Cell<Option<u32>>) -> DriverResult<()> {
        match cell.get() {
            Some(code) => Err(OsError(code)),
            None => Ok(()),
        }
    }

    fn device_at(&self, record: &InterfaceRecord) -> Option<FakeDevice> {
        let index = record.reserved.checked_sub(1)?;
        self.devices.borrow().get(index).cloned()
    }
}

impl DriverApi for FakeDriver {
    fn enumerate_class_devices(&self, guid: &Guid, flags: u32) -> DriverResult<InfoSetHandle> {
        self.record(Call::EnumerateClassDevices { guid: *guid, flags });
        Self::fail(&self.fail_info_set)?;

        let set = InfoSetHandle(self.allocate_handle());
        self.open_sets.borrow_mut().push(set);
        Ok(set)
    }

    fn destroy_device_info_set(&self, set: InfoSetHandle) -> DriverResult<()> {
        self.record(Call::DestroyDeviceInfoSet(set));
        let mut sets = self.open_sets.borrow_mut();
        match sets.iter().position(|open| *open == set) {
            Some(position) => {
                sets.remove(position);
                Ok(())
            }
            None => Err(OsError(ERROR_INVALID_HANDLE)),
        }
    }

    fn enumerate_device_interface(
        &self,
        set: InfoSetHandle,
        guid: &Guid,
        index: u32,
    ) -> DriverResult<Option<InterfaceRecord>> {
        self.record(Call::EnumerateDeviceInterface { index });
        if !self.open_sets.borrow().contains(&set) {
            return Err(OsError(ERROR_INVALID_HANDLE));
        }
        if let Some((fail_index, code)) = self.fail_enumeration_at.get() {
            if fail_index == index {
                return Err(OsError(code));
            }
        }
        if index as usize >= self.devices.borrow().len() {
            return Ok(None);
        }

        // The reserved field carries index + 1, so a zeroed record never resolves.
        Ok(Some(InterfaceRecord {
            class_guid: *guid,
            flags: 1,
            reserved: index as usize + 1,
        }))
    }

    fn get_interface_detail(
        &self,
        set: InfoSetHandle,
        record: &InterfaceRecord,
        buffer: &mut [u8],
        required_size: &mut u32,
        device_info: Option<&mut DeviceInfoRecord>,
    ) -> DriverResult<()> {
        if !self.open_sets.borrow().contains(&set) {
            return Err(OsError(ERROR_INVALID_HANDLE));
        }
        let device = self
            .device_at(record)
            .ok_or(OsError(ERROR_INVALID_USER_BUFFER))?;

        let wide: Vec<u16> = device.path.encode_utf16().chain(std::iter::once(0)).collect();
        let needed = (size_of::<u32>() + wide.len() * 2) as u32;
        *required_size = needed;

        if buffer.is_empty() {
            return Err(OsError(ERROR_INSUFFICIENT_BUFFER));
        }

        let header_size = LittleEndian::read_u32(&buffer[..4]);
        self.record(Call::InterfaceDetail { header_size });

        if header_size != device.header_size {
            return Err(OsError(ERROR_INVALID_USER_BUFFER));
        }
        if buffer.len() < needed as usize {
            return Err(OsError(ERROR_INSUFFICIENT_BUFFER));
        }

        LittleEndian::write_u16_into(&wide, &mut buffer[4..needed as usize]);
        if let Some(device_info) = device_info {
            device_info.class_guid = record.class_guid;
            device_info.dev_inst = record.reserved as u32;
            device_info.reserved = record.reserved;
        }
        Ok(())
    }

    fn get_device_property(
        &self,
        set: InfoSetHandle,
        device_info: &DeviceInfoRecord,
        property: u32,
        buffer: &mut [u8],
    ) -> DriverResult<u32> {
        self.record(Call::GetDeviceProperty);
        if !self.open_sets.borrow().contains(&set) {
            return Err(OsError(ERROR_INVALID_HANDLE));
        }
        if self.fail_property.get() || property != SPDRP_FRIENDLYNAME {
            return Err(OsError(ERROR_GEN_FAILURE));
        }

        let name = self
            .devices
            .borrow()
            .get((device_info.dev_inst as usize).wrapping_sub(1))
            .and_then(|device| device.friendly_name.clone())
            .ok_or(OsError(ERROR_INVALID_USER_BUFFER))?;

        let wide: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();
        let length = wide.len() * 2;
        if buffer.len() < length {
            return Err(OsError(ERROR_INSUFFICIENT_BUFFER));
        }
        LittleEndian::write_u16_into(&wide, &mut buffer[..length]);
        Ok(length as u32)
    }

    fn open_file(&self, path: &str, options: &OpenOptions) -> DriverResult<FileHandle> {
        self.record(Call::OpenFile {
            path: path.to_string(),
            options: *options,
        });
        Self::fail(&self.fail_open)?;
        if self.open_returns_invalid.get() {
            return Ok(FileHandle::INVALID);
        }
        Ok(FileHandle(self.allocate_handle()))
    }

    fn close_handle(&self, file: FileHandle) -> DriverResult<()> {
        self.record(Call::CloseHandle(file));
        Self::fail(&self.fail_close_handle)
    }

    fn session_initialize(&self, file: FileHandle) -> DriverResult<SessionHandle> {
        self.record(Call::SessionInitialize(file));
        Self::fail(&self.fail_session_init)?;
        if self.session_returns_null.get() {
            return Ok(SessionHandle::NULL);
        }

        let session = SessionHandle(self.allocate_handle());
        self.sessions.borrow_mut().insert(session, 0);
        Ok(session)
    }

    fn session_free(&self, session: SessionHandle) -> DriverResult<()> {
        self.record(Call::SessionFree(session));
        Self::fail(&self.fail_session_free)?;
        match self.sessions.borrow_mut().remove(&session) {
            Some(_) => Ok(()),
            None => Err(OsError(ERROR_INVALID_HANDLE)),
        }
    }

    fn get_associated_interface(
        &self,
        session: SessionHandle,
        index: u8,
    ) -> DriverResult<SessionHandle> {
        self.record(Call::GetAssociatedInterface { session, index });
        if !self.sessions.borrow().contains_key(&session) {
            return Err(OsError(ERROR_INVALID_HANDLE));
        }
        if index >= self.associated_interfaces.get() {
            return Err(OsError(ERROR_NO_MORE_ITEMS));
        }

        let associated = SessionHandle(self.allocate_handle());
        self.sessions.borrow_mut().insert(associated, index + 1);
        Ok(associated)
    }

    fn query_device_information(
        &self,
        session: SessionHandle,
        info_type: u32,
    ) -> DriverResult<u32> {
        self.record(Call::QueryDeviceInformation { info_type });
        if !self.sessions.borrow().contains_key(&session) {
            return Err(OsError(ERROR_INVALID_HANDLE));
        }
        self.device_speed.get().ok_or(OsError(ERROR_GEN_FAILURE))
    }

    fn query_interface_settings(
        &self,
        session: SessionHandle,
        alternate_setting: u8,
    ) -> DriverResult<InterfaceDescriptor> {
        self.record(Call::QueryInterfaceSettings(session));
        let interface_number = *self
            .sessions
            .borrow()
            .get(&session)
            .ok_or(OsError(ERROR_INVALID_HANDLE))?;

        Ok(InterfaceDescriptor {
            length: 9,
            descriptor_type: 0x04,
            interface_number,
            alternate_setting,
            num_endpoints: self.pipes.borrow().len() as u8,
            interface_class: 0xFF,
            interface_sub_class: 0x00,
            interface_protocol: 0x00,
            interface_string: 0,
        })
    }

    fn query_pipe(
        &self,
        session: SessionHandle,
        _alternate_setting: u8,
        pipe_index: u8,
    ) -> DriverResult<RawPipeInformation> {
        self.record(Call::QueryPipe {
            session,
            pipe_index,
        });
        Self::fail(&self.fail_query_pipe)?;
        self.pipes
            .borrow()
            .get(pipe_index as usize)
            .copied()
            .ok_or(OsError(ERROR_NO_MORE_ITEMS))
    }

    fn control_transfer(
        &self,
        _session: SessionHandle,
        setup: SetupPacket,
        buffer: &mut [u8],
    ) -> DriverResult<u32> {
        self.record(Call::ControlTransfer {
            setup,
            data: buffer.to_vec(),
        });
        Self::fail(&self.fail_control)?;

        if setup.is_device_to_host() {
            let response = self.control_responses.borrow_mut().pop_front().unwrap_or_default();
            let length = response.len().min(buffer.len());
            buffer[..length].copy_from_slice(&response[..length]);
            return Ok(length as u32);
        }
        Ok(buffer.len() as u32)
    }

    fn write_pipe(&self, session: SessionHandle, pipe_id: u8, data: &[u8]) -> DriverResult<u32> {
        self.record(Call::WritePipe {
            session,
            pipe_id,
            data: data.to_vec(),
        });
        match self.write_results.borrow_mut().pop_front() {
            Some(Ok(written)) => Ok(written),
            Some(Err(code)) => Err(OsError(code)),
            None => Ok(data.len() as u32),
        }
    }

    fn read_pipe(
        &self,
        session: SessionHandle,
        pipe_id: u8,
        buffer: &mut [u8],
    ) -> DriverResult<u32> {
        self.record(Call::ReadPipe {
            session,
            pipe_id,
            length: buffer.len(),
        });
        match self.read_responses.borrow_mut().pop_front() {
            Some(Ok(data)) => {
                let length = data.len().min(buffer.len());
                buffer[..length].copy_from_slice(&data[..length]);
                Ok(length as u32)
            }
            Some(Err(code)) => Err(OsError(code)),
            None => Err(OsError(ERROR_SEM_TIMEOUT)),
        }
    }

    fn read_pipe_overlapped(
        &self,
        _session: SessionHandle,
        pipe_id: u8,
        buffer: &mut [u8],
        overlapped: &mut Overlapped,
    ) -> DriverResult<()> {
        self.record(Call::ReadPipeOverlapped {
            pipe_id,
            length: buffer.len(),
        });

        let code = self
            .overlapped_submit_codes
            .borrow_mut()
            .pop_front()
            .unwrap_or(ERROR_IO_PENDING);
        if code != ERROR_IO_PENDING && code != 0 {
            return Err(OsError(code));
        }

        // The data lands in the caller's buffer straight away, but only becomes visible once a
        // poll reports completion.
        let payload = self.overlapped_payloads.borrow_mut().pop_front().unwrap_or_default();
        let length = payload.len().min(buffer.len());
        buffer[..length].copy_from_slice(&payload[..length]);
        overlapped.internal_high = length;
        self.in_flight.set(Some(length as u32));

        if code == ERROR_IO_PENDING {
            return Err(OsError(ERROR_IO_PENDING));
        }
        Ok(())
    }

    fn get_overlapped_result(
        &self,
        session: SessionHandle,
        overlapped: &mut Overlapped,
        wait: bool,
    ) -> DriverResult<u32> {
        self.record(Call::GetOverlappedResult { wait });
        if !self.sessions.borrow().contains_key(&session) {
            return Err(OsError(ERROR_INVALID_HANDLE));
        }
        let outcome = self
            .poll_outcomes
            .borrow_mut()
            .pop_front()
            .unwrap_or(PollOutcome::Incomplete);

        match outcome {
            PollOutcome::Pending => Err(OsError(ERROR_IO_PENDING)),
            PollOutcome::Incomplete => Err(OsError(ERROR_IO_INCOMPLETE)),
            PollOutcome::Complete => {
                let length = self.in_flight.take().unwrap_or(0);
                overlapped.internal_high = length as usize;
                Ok(length)
            }
            PollOutcome::Fail(code) => {
                self.in_flight.set(None);
                Err(OsError(code))
            }
        }
    }

    fn set_pipe_policy(
        &self,
        _session: SessionHandle,
        pipe_id: u8,
        policy: u32,
        value: &[u8],
    ) -> DriverResult<()> {
        self.record(Call::SetPipePolicy {
            pipe_id,
            policy,
            value: value.to_vec(),
        });
        Self::fail(&self.fail_policy)
    }

    fn flush_pipe(&self, _session: SessionHandle, pipe_id: u8) -> DriverResult<()> {
        self.record(Call::FlushPipe { pipe_id });
        Self::fail(&self.fail_flush)
    }
}
