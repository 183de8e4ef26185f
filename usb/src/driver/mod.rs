// The Driver API is the only place that talks to the platform. Everything above it (the record
// decoder, enumerator, sessions and transfers) works purely in terms of this trait, so the same
// logic runs against the real WinUSB stack on Windows, and the scripted fake during tests.
use crate::error::OsError;
use winusb_types::Guid;

cfg_if::cfg_if! {
    if #[cfg(target_os = "windows")] {
        mod win32;
        pub use self::win32::WinUsbDriver;

        pub fn open_driver() -> anyhow::Result<std::rc::Rc<dyn DriverApi>> {
            Ok(std::rc::Rc::new(WinUsbDriver::load()?))
        }
    } else {
        pub fn open_driver() -> anyhow::Result<std::rc::Rc<dyn DriverApi>> {
            anyhow::bail!("The WinUSB driver is only available under Windows")
        }
    }
}

#[cfg(any(test, feature = "fake"))]
pub mod fake;

pub type DriverResult<T> = Result<T, OsError>;

pub const ERROR_INVALID_HANDLE: u32 = 6;
pub const ERROR_INSUFFICIENT_BUFFER: u32 = 122;
pub const ERROR_NO_MORE_ITEMS: u32 = 259;
pub const ERROR_IO_INCOMPLETE: u32 = 996;
pub const ERROR_IO_PENDING: u32 = 997;
pub const ERROR_INVALID_USER_BUFFER: u32 = 1784;

pub const SPDRP_FRIENDLYNAME: u32 = 0x0C;
pub const DEVICE_SPEED: u32 = 0x01;

/// A device information set, as returned by SetupDiGetClassDevs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct InfoSetHandle(pub isize);

/// A kernel file handle opened against a device interface path.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FileHandle(pub isize);

impl FileHandle {
    pub const INVALID: FileHandle = FileHandle(-1);

    pub fn is_valid(&self) -> bool {
        *self != FileHandle::INVALID
    }
}

/// A WinUSB interface handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub isize);

impl SessionHandle {
    pub const NULL: SessionHandle = SessionHandle(0);

    pub fn is_null(&self) -> bool {
        *self == SessionHandle::NULL
    }
}

/// Mirrors SP_DEVICE_INTERFACE_DATA (minus cbSize, which the platform layer fills in).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct InterfaceRecord {
    pub class_guid: Guid,
    pub flags: u32,
    pub reserved: usize,
}

/// Mirrors SP_DEVINFO_DATA (minus cbSize).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceInfoRecord {
    pub class_guid: Guid,
    pub dev_inst: u32,
    pub reserved: usize,
}

/// Parameters for opening a device path, defaulting to shared read / write overlapped access.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OpenOptions {
    pub access: u32,
    pub share_mode: u32,
    pub creation_disposition: u32,
    pub flags_and_attributes: u32,
}

pub const GENERIC_READ: u32 = 0x8000_0000;
pub const GENERIC_WRITE: u32 = 0x4000_0000;
pub const FILE_SHARE_READ: u32 = 0x01;
pub const FILE_SHARE_WRITE: u32 = 0x02;
pub const OPEN_EXISTING: u32 = 3;
pub const FILE_ATTRIBUTE_NORMAL: u32 = 0x80;
pub const FILE_FLAG_OVERLAPPED: u32 = 0x4000_0000;

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            access: GENERIC_READ | GENERIC_WRITE,
            share_mode: FILE_SHARE_READ | FILE_SHARE_WRITE,
            creation_disposition: OPEN_EXISTING,
            flags_and_attributes: FILE_ATTRIBUTE_NORMAL | FILE_FLAG_OVERLAPPED,
        }
    }
}

/// WINUSB_SETUP_PACKET, which is declared with 1 byte packing.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    pub fn is_device_to_host(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

/// USB_INTERFACE_DESCRIPTOR.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_sub_class: u8,
    pub interface_protocol: u8,
    pub interface_string: u8,
}

/// WINUSB_PIPE_INFORMATION, exactly as the driver fills it in.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RawPipeInformation {
    pub pipe_type: u32,
    pub pipe_id: u8,
    pub maximum_packet_size: u16,
    pub interval: u8,
}

/// OVERLAPPED. The offset / pointer union is flattened into its two 32bit halves.
#[repr(C)]
#[derive(Debug, Default)]
pub struct Overlapped {
    pub internal: usize,
    pub internal_high: usize,
    pub offset: u32,
    pub offset_high: u32,
    pub event: isize,
}

/// Every privileged operation the core needs from the platform. Failures carry the platform's
/// last error code at the time of the failure (0 when the platform didn't set one).
pub trait DriverApi {
    fn enumerate_class_devices(&self, guid: &Guid, flags: u32) -> DriverResult<InfoSetHandle>;
    fn destroy_device_info_set(&self, set: InfoSetHandle) -> DriverResult<()>;

    /// Returns `Ok(None)` once `index` walks past the last member.
    fn enumerate_device_interface(
        &self,
        set: InfoSetHandle,
        guid: &Guid,
        index: u32,
    ) -> DriverResult<Option<InterfaceRecord>>;

    /// Fills `buffer` with a SP_DEVICE_INTERFACE_DETAIL_DATA_W record. The first four bytes of
    /// `buffer` must already hold the header size the caller believes is correct. The size the
    /// record actually needs is always written to `required_size`, including on failure.
    fn get_interface_detail(
        &self,
        set: InfoSetHandle,
        record: &InterfaceRecord,
        buffer: &mut [u8],
        required_size: &mut u32,
        device_info: Option<&mut DeviceInfoRecord>,
    ) -> DriverResult<()>;

    /// Returns the number of bytes written into `buffer`.
    fn get_device_property(
        &self,
        set: InfoSetHandle,
        device_info: &DeviceInfoRecord,
        property: u32,
        buffer: &mut [u8],
    ) -> DriverResult<u32>;

    fn open_file(&self, path: &str, options: &OpenOptions) -> DriverResult<FileHandle>;
    fn close_handle(&self, file: FileHandle) -> DriverResult<()>;

    fn session_initialize(&self, file: FileHandle) -> DriverResult<SessionHandle>;
    fn session_free(&self, session: SessionHandle) -> DriverResult<()>;
    fn get_associated_interface(
        &self,
        session: SessionHandle,
        index: u8,
    ) -> DriverResult<SessionHandle>;

    fn query_device_information(&self, session: SessionHandle, info_type: u32)
    -> DriverResult<u32>;
    fn query_interface_settings(
        &self,
        session: SessionHandle,
        alternate_setting: u8,
    ) -> DriverResult<InterfaceDescriptor>;
    fn query_pipe(
        &self,
        session: SessionHandle,
        alternate_setting: u8,
        pipe_index: u8,
    ) -> DriverResult<RawPipeInformation>;

    /// Returns the number of bytes transferred in either direction.
    fn control_transfer(
        &self,
        session: SessionHandle,
        setup: SetupPacket,
        buffer: &mut [u8],
    ) -> DriverResult<u32>;
    fn write_pipe(&self, session: SessionHandle, pipe_id: u8, data: &[u8]) -> DriverResult<u32>;
    fn read_pipe(&self, session: SessionHandle, pipe_id: u8, buffer: &mut [u8])
    -> DriverResult<u32>;

    /// Submits an asynchronous read. Both `buffer` and `overlapped` must stay at the same address
    /// until a poll reports something other than pending. A request that was queued rather than
    /// completed reports `ERROR_IO_PENDING`.
    fn read_pipe_overlapped(
        &self,
        session: SessionHandle,
        pipe_id: u8,
        buffer: &mut [u8],
        overlapped: &mut Overlapped,
    ) -> DriverResult<()>;

    /// Returns the number of bytes transferred by a completed overlapped request.
    fn get_overlapped_result(
        &self,
        session: SessionHandle,
        overlapped: &mut Overlapped,
        wait: bool,
    ) -> DriverResult<u32>;

    fn set_pipe_policy(
        &self,
        session: SessionHandle,
        pipe_id: u8,
        policy: u32,
        value: &[u8],
    ) -> DriverResult<()>;
    fn flush_pipe(&self, session: SessionHandle, pipe_id: u8) -> DriverResult<()>;
}
