// The Windows Driver API. SetupAPI and kernel32 come through the windows crate, winusb.dll isn't
// covered by it, so it's loaded at runtime and its exports bound by hand.
use crate::driver::{
    DeviceInfoRecord, DriverApi, DriverResult, FileHandle, InfoSetHandle, InterfaceDescriptor,
    InterfaceRecord, OpenOptions, Overlapped, RawPipeInformation, SessionHandle, SetupPacket,
};
use crate::error::OsError;
use anyhow::Result;
use libloading::Library;
use log::{debug, info};
use std::ffi::c_void;
use std::ptr;
use windows::Win32::Devices::DeviceAndDriverInstallation::{
    HDEVINFO, SETUP_DI_GET_CLASS_DEVS_FLAGS, SETUP_DI_REGISTRY_PROPERTY, SP_DEVICE_INTERFACE_DATA,
    SP_DEVICE_INTERFACE_DETAIL_DATA_W, SP_DEVINFO_DATA, SetupDiDestroyDeviceInfoList,
    SetupDiEnumDeviceInterfaces, SetupDiGetClassDevsW, SetupDiGetDeviceInterfaceDetailW,
    SetupDiGetDeviceRegistryPropertyW,
};
use windows::Win32::Foundation::{CloseHandle, GetLastError, HANDLE};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FILE_CREATION_DISPOSITION, FILE_FLAGS_AND_ATTRIBUTES, FILE_SHARE_MODE,
};
use windows::Win32::System::IO::OVERLAPPED;
use windows::core::{GUID, PCWSTR};
use winusb_types::Guid;

const _: () = assert!(size_of::<Overlapped>() == size_of::<OVERLAPPED>());

// Define the Types of the various methods..
type Initialize = unsafe extern "system" fn(isize, *mut isize) -> i32;
type Free = unsafe extern "system" fn(isize) -> i32;
type GetAssociatedInterface = unsafe extern "system" fn(isize, u8, *mut isize) -> i32;
type QueryDeviceInformation = unsafe extern "system" fn(isize, u32, *mut u32, *mut c_void) -> i32;
type QueryInterfaceSettings = unsafe extern "system" fn(isize, u8, *mut InterfaceDescriptor) -> i32;
type QueryPipe = unsafe extern "system" fn(isize, u8, u8, *mut RawPipeInformation) -> i32;
type ControlTransfer =
    unsafe extern "system" fn(isize, SetupPacket, *mut u8, u32, *mut u32, *mut Overlapped) -> i32;
type WritePipe =
    unsafe extern "system" fn(isize, u8, *const u8, u32, *mut u32, *mut Overlapped) -> i32;
type ReadPipe =
    unsafe extern "system" fn(isize, u8, *mut u8, u32, *mut u32, *mut Overlapped) -> i32;
type GetOverlappedResult = unsafe extern "system" fn(isize, *mut Overlapped, *mut u32, i32) -> i32;
type SetPipePolicy = unsafe extern "system" fn(isize, u8, u32, u32, *const c_void) -> i32;
type FlushPipe = unsafe extern "system" fn(isize, u8) -> i32;

pub struct WinUsbDriver {
    // The function pointers below are only valid while this is loaded.
    _library: Library,

    initialize: Initialize,
    free: Free,
    get_associated_interface: GetAssociatedInterface,

    query_device_information: QueryDeviceInformation,
    query_interface_settings: QueryInterfaceSettings,
    query_pipe: QueryPipe,

    control_transfer: ControlTransfer,
    write_pipe: WritePipe,
    read_pipe: ReadPipe,
    get_overlapped_result: GetOverlappedResult,

    set_pipe_policy: SetPipePolicy,
    flush_pipe: FlushPipe,
}

impl WinUsbDriver {
    pub fn load() -> Result<Self> {
        let library = unsafe { Library::new("winusb.dll")? };

        let initialize = unsafe { *library.get::<Initialize>(b"WinUsb_Initialize\0")? };
        let free = unsafe { *library.get::<Free>(b"WinUsb_Free\0")? };
        let get_associated_interface =
            unsafe { *library.get::<GetAssociatedInterface>(b"WinUsb_GetAssociatedInterface\0")? };

        let query_device_information =
            unsafe { *library.get::<QueryDeviceInformation>(b"WinUsb_QueryDeviceInformation\0")? };
        let query_interface_settings =
            unsafe { *library.get::<QueryInterfaceSettings>(b"WinUsb_QueryInterfaceSettings\0")? };
        let query_pipe = unsafe { *library.get::<QueryPipe>(b"WinUsb_QueryPipe\0")? };

        let control_transfer =
            unsafe { *library.get::<ControlTransfer>(b"WinUsb_ControlTransfer\0")? };
        let write_pipe = unsafe { *library.get::<WritePipe>(b"WinUsb_WritePipe\0")? };
        let read_pipe = unsafe { *library.get::<ReadPipe>(b"WinUsb_ReadPipe\0")? };
        let get_overlapped_result =
            unsafe { *library.get::<GetOverlappedResult>(b"WinUsb_GetOverlappedResult\0")? };

        let set_pipe_policy = unsafe { *library.get::<SetPipePolicy>(b"WinUsb_SetPipePolicy\0")? };
        let flush_pipe = unsafe { *library.get::<FlushPipe>(b"WinUsb_FlushPipe\0")? };

        info!("Loaded winusb.dll");
        Ok(Self {
            _library: library,
            initialize,
            free,
            get_associated_interface,
            query_device_information,
            query_interface_settings,
            query_pipe,
            control_transfer,
            write_pipe,
            read_pipe,
            get_overlapped_result,
            set_pipe_policy,
            flush_pipe,
        })
    }

    // WinUSB calls return a BOOL, with the detail left in the thread's last error.
    fn check(result: i32) -> DriverResult<()> {
        if result != 0 {
            return Ok(());
        }
        Err(last_error())
    }
}

fn last_error() -> OsError {
    OsError(unsafe { GetLastError() }.0)
}

// windows::core::Error carries the last error wrapped as an HRESULT (0x8007xxxx).
fn os_error(error: windows::core::Error) -> OsError {
    let code = error.code().0 as u32;
    if code & 0xFFFF_0000 == 0x8007_0000 {
        return OsError(code & 0xFFFF);
    }
    OsError(code)
}

fn to_guid(guid: &Guid) -> GUID {
    GUID::from_values(guid.data1, guid.data2, guid.data3, guid.data4)
}

fn from_guid(guid: &GUID) -> Guid {
    Guid::new(guid.data1, guid.data2, guid.data3, guid.data4)
}

fn info_set(set: InfoSetHandle) -> HDEVINFO {
    HDEVINFO(set.0 as _)
}

fn device_info_data(record: &DeviceInfoRecord) -> SP_DEVINFO_DATA {
    SP_DEVINFO_DATA {
        cbSize: size_of::<SP_DEVINFO_DATA>() as u32,
        ClassGuid: to_guid(&record.class_guid),
        DevInst: record.dev_inst,
        Reserved: record.reserved,
    }
}

impl DriverApi for WinUsbDriver {
    fn enumerate_class_devices(&self, guid: &Guid, flags: u32) -> DriverResult<InfoSetHandle> {
        let guid = to_guid(guid);
        let set = unsafe {
            SetupDiGetClassDevsW(
                Some(&guid),
                PCWSTR::null(),
                None,
                SETUP_DI_GET_CLASS_DEVS_FLAGS(flags),
            )
        }
        .map_err(os_error)?;
        Ok(InfoSetHandle(set.0 as isize))
    }

    fn destroy_device_info_set(&self, set: InfoSetHandle) -> DriverResult<()> {
        unsafe { SetupDiDestroyDeviceInfoList(info_set(set)) }.map_err(os_error)
    }

    fn enumerate_device_interface(
        &self,
        set: InfoSetHandle,
        guid: &Guid,
        index: u32,
    ) -> DriverResult<Option<InterfaceRecord>> {
        let guid = to_guid(guid);
        let mut data = SP_DEVICE_INTERFACE_DATA {
            cbSize: size_of::<SP_DEVICE_INTERFACE_DATA>() as u32,
            ..Default::default()
        };

        match unsafe { SetupDiEnumDeviceInterfaces(info_set(set), None, &guid, index, &mut data) } {
            Ok(()) => Ok(Some(InterfaceRecord {
                class_guid: from_guid(&data.InterfaceClassGuid),
                flags: data.Flags,
                reserved: data.Reserved,
            })),
            Err(error) => {
                let error = os_error(error);
                if error.code() == crate::driver::ERROR_NO_MORE_ITEMS {
                    return Ok(None);
                }
                Err(error)
            }
        }
    }

    fn get_interface_detail(
        &self,
        set: InfoSetHandle,
        record: &InterfaceRecord,
        buffer: &mut [u8],
        required_size: &mut u32,
        device_info: Option<&mut DeviceInfoRecord>,
    ) -> DriverResult<()> {
        let data = SP_DEVICE_INTERFACE_DATA {
            cbSize: size_of::<SP_DEVICE_INTERFACE_DATA>() as u32,
            InterfaceClassGuid: to_guid(&record.class_guid),
            Flags: record.flags,
            Reserved: record.reserved,
        };

        // The caller has already written the header size into the first four bytes.
        let detail = match buffer.is_empty() {
            true => None,
            false => Some(buffer.as_mut_ptr() as *mut SP_DEVICE_INTERFACE_DETAIL_DATA_W),
        };

        let mut info_data = SP_DEVINFO_DATA {
            cbSize: size_of::<SP_DEVINFO_DATA>() as u32,
            ..Default::default()
        };
        let want_info = device_info.is_some();

        let result = unsafe {
            SetupDiGetDeviceInterfaceDetailW(
                info_set(set),
                &data,
                detail,
                buffer.len() as u32,
                Some(required_size as *mut u32),
                want_info.then_some(&mut info_data as *mut SP_DEVINFO_DATA),
            )
        };
        result.map_err(os_error)?;

        if let Some(device_info) = device_info {
            device_info.class_guid = from_guid(&info_data.ClassGuid);
            device_info.dev_inst = info_data.DevInst;
            device_info.reserved = info_data.Reserved;
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
        let info_data = device_info_data(device_info);
        let mut required_size = 0;

        unsafe {
            SetupDiGetDeviceRegistryPropertyW(
                info_set(set),
                &info_data,
                SETUP_DI_REGISTRY_PROPERTY(property),
                None,
                Some(buffer),
                Some(&mut required_size),
            )
        }
        .map_err(os_error)?;
        Ok(required_size)
    }

    fn open_file(&self, path: &str, options: &OpenOptions) -> DriverResult<FileHandle> {
        let wide: Vec<u16> = path.encode_utf16().chain(std::iter::once(0)).collect();
        let handle = unsafe {
            CreateFileW(
                PCWSTR(wide.as_ptr()),
                options.access,
                FILE_SHARE_MODE(options.share_mode),
                None,
                FILE_CREATION_DISPOSITION(options.creation_disposition),
                FILE_FLAGS_AND_ATTRIBUTES(options.flags_and_attributes),
                None,
            )
        }
        .map_err(os_error)?;

        debug!("Opened {}", path);
        Ok(FileHandle(handle.0 as isize))
    }

    fn close_handle(&self, file: FileHandle) -> DriverResult<()> {
        unsafe { CloseHandle(HANDLE(file.0 as _)) }.map_err(os_error)
    }

    fn session_initialize(&self, file: FileHandle) -> DriverResult<SessionHandle> {
        let mut session = 0;
        Self::check(unsafe { (self.initialize)(file.0, &mut session) })?;
        Ok(SessionHandle(session))
    }

    fn session_free(&self, session: SessionHandle) -> DriverResult<()> {
        Self::check(unsafe { (self.free)(session.0) })
    }

    fn get_associated_interface(
        &self,
        session: SessionHandle,
        index: u8,
    ) -> DriverResult<SessionHandle> {
        let mut associated = 0;
        Self::check(unsafe { (self.get_associated_interface)(session.0, index, &mut associated) })?;
        Ok(SessionHandle(associated))
    }

    fn query_device_information(
        &self,
        session: SessionHandle,
        info_type: u32,
    ) -> DriverResult<u32> {
        let mut value: u32 = 0;
        let mut length = size_of::<u32>() as u32;
        Self::check(unsafe {
            (self.query_device_information)(
                session.0,
                info_type,
                &mut length,
                &mut value as *mut u32 as *mut c_void,
            )
        })?;
        Ok(value)
    }

    fn query_interface_settings(
        &self,
        session: SessionHandle,
        alternate_setting: u8,
    ) -> DriverResult<InterfaceDescriptor> {
        let mut descriptor = InterfaceDescriptor::default();
        Self::check(unsafe {
            (self.query_interface_settings)(session.0, alternate_setting, &mut descriptor)
        })?;
        Ok(descriptor)
    }

    fn query_pipe(
        &self,
        session: SessionHandle,
        alternate_setting: u8,
        pipe_index: u8,
    ) -> DriverResult<RawPipeInformation> {
        let mut information = RawPipeInformation::default();
        Self::check(unsafe {
            (self.query_pipe)(session.0, alternate_setting, pipe_index, &mut information)
        })?;
        Ok(information)
    }

    fn control_transfer(
        &self,
        session: SessionHandle,
        setup: SetupPacket,
        buffer: &mut [u8],
    ) -> DriverResult<u32> {
        let mut transferred = 0;
        let data = match buffer.is_empty() {
            true => ptr::null_mut(),
            false => buffer.as_mut_ptr(),
        };

        Self::check(unsafe {
            (self.control_transfer)(
                session.0,
                setup,
                data,
                buffer.len() as u32,
                &mut transferred,
                ptr::null_mut(),
            )
        })?;
        Ok(transferred)
    }

    fn write_pipe(&self, session: SessionHandle, pipe_id: u8, data: &[u8]) -> DriverResult<u32> {
        let mut written = 0;
        Self::check(unsafe {
            (self.write_pipe)(
                session.0,
                pipe_id,
                data.as_ptr(),
                data.len() as u32,
                &mut written,
                ptr::null_mut(),
            )
        })?;
        Ok(written)
    }

    fn read_pipe(
        &self,
        session: SessionHandle,
        pipe_id: u8,
        buffer: &mut [u8],
    ) -> DriverResult<u32> {
        let mut read = 0;
        Self::check(unsafe {
            (self.read_pipe)(
                session.0,
                pipe_id,
                buffer.as_mut_ptr(),
                buffer.len() as u32,
                &mut read,
                ptr::null_mut(),
            )
        })?;
        Ok(read)
    }

    fn read_pipe_overlapped(
        &self,
        session: SessionHandle,
        pipe_id: u8,
        buffer: &mut [u8],
        overlapped: &mut Overlapped,
    ) -> DriverResult<()> {
        // The transferred length is left null, it's collected from the overlapped result.
        Self::check(unsafe {
            (self.read_pipe)(
                session.0,
                pipe_id,
                buffer.as_mut_ptr(),
                buffer.len() as u32,
                ptr::null_mut(),
                overlapped,
            )
        })
    }

    fn get_overlapped_result(
        &self,
        session: SessionHandle,
        overlapped: &mut Overlapped,
        wait: bool,
    ) -> DriverResult<u32> {
        let mut transferred = 0;
        Self::check(unsafe {
            (self.get_overlapped_result)(session.0, overlapped, &mut transferred, wait as i32)
        })?;
        Ok(transferred)
    }

    fn set_pipe_policy(
        &self,
        session: SessionHandle,
        pipe_id: u8,
        policy: u32,
        value: &[u8],
    ) -> DriverResult<()> {
        Self::check(unsafe {
            (self.set_pipe_policy)(
                session.0,
                pipe_id,
                policy,
                value.len() as u32,
                value.as_ptr() as *const c_void,
            )
        })
    }

    fn flush_pipe(&self, session: SessionHandle, pipe_id: u8) -> DriverResult<()> {
        Self::check(unsafe { (self.flush_pipe)(session.0, pipe_id) })
    }
}
