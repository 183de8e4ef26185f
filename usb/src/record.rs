// SP_DEVICE_INTERFACE_DETAIL_DATA_W is a DWORD cbSize followed by an open ended UTF-16 path. The
// value SetupAPI expects in cbSize is the size of the declared struct, which depends on packing
// and pointer width (8 on 64bit, 6 on 32bit, 5 on some older toolchains), so we can't know it
// up front. Instead, we offer each candidate in turn until the API accepts one.
use crate::driver::{
    DeviceInfoRecord, DriverApi, ERROR_INVALID_HANDLE, InfoSetHandle, InterfaceRecord,
};
use crate::error::{DecodeError, OsError};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};
use widestring::U16CStr;

/// Largest / most specific first.
pub const HEADER_SIZE_CANDIDATES: [u32; 3] = [8, 6, 5];

// The path always starts straight after the cbSize field, regardless of the declared size.
const PATH_OFFSET: usize = size_of::<u32>();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    pub path: String,
    pub device_info: DeviceInfoRecord,
}

/// Decodes interface detail records for a single enumeration pass, remembering which header
/// size the platform accepted so later records try it first.
#[derive(Debug, Clone)]
pub struct RecordDecoder {
    candidates: Vec<u32>,
    accepted: Option<u32>,
}

impl Default for RecordDecoder {
    fn default() -> Self {
        Self::new(&HEADER_SIZE_CANDIDATES)
    }
}

impl RecordDecoder {
    pub fn new(candidates: &[u32]) -> Self {
        Self {
            candidates: candidates.to_vec(),
            accepted: None,
        }
    }

    pub fn accepted_header_size(&self) -> Option<u32> {
        self.accepted
    }

    /// Asks the driver how large the detail record for `record` is, by offering it no buffer.
    pub fn probe_required_size(
        driver: &dyn DriverApi,
        set: InfoSetHandle,
        record: &InterfaceRecord,
    ) -> Result<u32, DecodeError> {
        let mut required_size = 0;
        let result = driver.get_interface_detail(set, record, &mut [], &mut required_size, None);

        if required_size > 0 {
            return Ok(required_size);
        }

        match result {
            Err(error) if error.code() == ERROR_INVALID_HANDLE => Err(DecodeError::InvalidHandle),
            Err(error) => Err(DecodeError::SizeUnavailable(error)),
            Ok(()) => Err(DecodeError::SizeUnavailable(OsError(0))),
        }
    }

    pub fn decode(
        &mut self,
        driver: &dyn DriverApi,
        set: InfoSetHandle,
        record: &InterfaceRecord,
    ) -> Result<DecodedRecord, DecodeError> {
        let required_size = Self::probe_required_size(driver, set, record)?;
        if (required_size as usize) < PATH_OFFSET + size_of::<u16>() {
            return Err(DecodeError::Truncated(required_size));
        }

        let mut tried = Vec::with_capacity(self.candidates.len());
        let mut last_error = OsError(0);

        for header_size in self.attempt_order() {
            tried.push(header_size);

            let mut buffer = vec![0; required_size as usize];
            LittleEndian::write_u32(&mut buffer[..PATH_OFFSET], header_size);

            let mut device_info = DeviceInfoRecord::default();
            let mut reported_size = required_size;
            let result = driver.get_interface_detail(
                set,
                record,
                &mut buffer,
                &mut reported_size,
                Some(&mut device_info),
            );

            match result {
                Ok(()) => {
                    if self.accepted != Some(header_size) {
                        debug!("Interface detail header size {} accepted", header_size);
                    }
                    self.accepted = Some(header_size);

                    return Ok(DecodedRecord {
                        path: read_path(&buffer[PATH_OFFSET..]),
                        device_info,
                    });
                }
                Err(error) => {
                    if self.accepted == Some(header_size) {
                        warn!(
                            "Previously accepted header size {} rejected: {}",
                            header_size, error
                        );
                    }
                    last_error = error;
                }
            }
        }

        Err(DecodeError::NoMatchingLayout {
            tried,
            error: last_error,
        })
    }

    fn attempt_order(&self) -> Vec<u32> {
        match self.accepted {
            None => self.candidates.clone(),
            Some(accepted) => std::iter::once(accepted)
                .chain(self.candidates.iter().copied().filter(|size| *size != accepted))
                .collect(),
        }
    }
}

// Reads a NUL terminated UTF-16LE string, tolerating a missing terminator or an odd trailing byte.
pub(crate) fn read_path(bytes: &[u8]) -> String {
    let mut wide = vec![0; bytes.len() / 2];
    LittleEndian::read_u16_into(&bytes[..wide.len() * 2], &mut wide);

    match U16CStr::from_slice_truncate(&wide) {
        Ok(path) => path.to_string_lossy(),
        Err(_) => String::from_utf16_lossy(&wide),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::{Call, FakeDevice, FakeDriver};
    use winusb_types::EnumerationClass;

    const PATH: &str = r"\\?\usb#vid_1234&pid_5678#0001#{dee824ef-729b-4a0e-9c14-b7117d33a817}";

    fn driver_with(header_size: u32) -> FakeDriver {
        let driver = FakeDriver::new();
        driver.add_device(FakeDevice::new(PATH).with_header_size(header_size));
        driver
    }

    fn first_record(driver: &FakeDriver) -> (InfoSetHandle, InterfaceRecord) {
        let guid = EnumerationClass::WinUsb.guid();
        let set = driver.enumerate_class_devices(&guid, 0x10).unwrap();
        let record = driver
            .enumerate_device_interface(set, &guid, 0)
            .unwrap()
            .unwrap();
        (set, record)
    }

    #[test]
    fn probe_reports_header_plus_wide_path() {
        let driver = driver_with(8);
        let (set, record) = first_record(&driver);

        let size = RecordDecoder::probe_required_size(&driver, set, &record).unwrap();
        assert_eq!(size as usize, 4 + (PATH.encode_utf16().count() + 1) * 2);
    }

    #[test]
    fn probe_fails_on_invalid_handle() {
        let driver = driver_with(8);
        let (_, record) = first_record(&driver);

        let result = RecordDecoder::probe_required_size(&driver, InfoSetHandle(-1), &record);
        assert!(matches!(result, Err(DecodeError::InvalidHandle)));
    }

    #[test]
    fn largest_header_size_is_tried_first() {
        let driver = driver_with(8);
        let (set, record) = first_record(&driver);

        let mut decoder = RecordDecoder::default();
        let decoded = decoder.decode(&driver, set, &record).unwrap();
        assert_eq!(decoded.path, PATH);
        assert_eq!(decoder.accepted_header_size(), Some(8));

        let attempts = driver.detail_header_attempts();
        assert_eq!(attempts, vec![8]);
    }

    #[test]
    fn falls_through_to_smaller_header_sizes() {
        let driver = driver_with(6);
        let (set, record) = first_record(&driver);

        let mut decoder = RecordDecoder::default();
        let decoded = decoder.decode(&driver, set, &record).unwrap();
        assert_eq!(decoded.path, PATH);
        assert_eq!(driver.detail_header_attempts(), vec![8, 6]);
    }

    #[test]
    fn accepted_size_is_reused_but_reverified() {
        let driver = FakeDriver::new();
        driver.add_device(FakeDevice::new("first").with_header_size(5));
        driver.add_device(FakeDevice::new("second").with_header_size(5));
        driver.add_device(FakeDevice::new("third").with_header_size(8));

        let guid = EnumerationClass::WinUsb.guid();
        let set = driver.enumerate_class_devices(&guid, 0x10).unwrap();
        let mut decoder = RecordDecoder::default();

        let mut paths = Vec::new();
        for index in 0..3 {
            let record = driver
                .enumerate_device_interface(set, &guid, index)
                .unwrap()
                .unwrap();
            paths.push(decoder.decode(&driver, set, &record).unwrap().path);
        }

        assert_eq!(paths, vec!["first", "second", "third"]);
        assert_eq!(decoder.accepted_header_size(), Some(8));
        assert_eq!(driver.detail_header_attempts(), vec![8, 6, 5, 5, 5, 8]);
    }

    #[test]
    fn no_candidate_accepted() {
        let driver = driver_with(12);
        let (set, record) = first_record(&driver);

        let mut decoder = RecordDecoder::default();
        match decoder.decode(&driver, set, &record) {
            Err(DecodeError::NoMatchingLayout { tried, error }) => {
                assert_eq!(tried, vec![8, 6, 5]);
                assert_eq!(error.code(), crate::driver::ERROR_INVALID_USER_BUFFER);
            }
            other => panic!("Unexpected decode result: {:?}", other),
        }
        assert_eq!(decoder.accepted_header_size(), None);
        assert!(
            !driver
                .calls()
                .iter()
                .any(|call| matches!(call, Call::GetDeviceProperty))
        );
    }

    #[test]
    fn path_reader_stops_at_terminator() {
        let mut bytes = Vec::new();
        for unit in "abc".encode_utf16().chain([0, 0x41]) {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        bytes.push(0xFF);
        assert_eq!(read_path(&bytes), "abc");
    }
}
