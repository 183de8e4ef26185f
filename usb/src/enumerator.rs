// Discovery of device interfaces. A pass opens a device information set for one interface class,
// walks its members by index until SetupAPI runs out, and decodes each member's path. The pass is
// lazy, and one-shot, a new pass needs a new call.
use crate::driver::{DriverApi, InfoSetHandle, SPDRP_FRIENDLYNAME};
use crate::error::{Error, ResourceError, Result};
use crate::record::{read_path, RecordDecoder};
use crate::session::DeviceSession;
use enumset::EnumSet;
use fancy_regex::Regex;
use lazy_static::lazy_static;
use log::{debug, warn};
use std::rc::Rc;
use winusb_types::{EnumerationFlag, Guid};

// 250 wide characters, matching what Windows' own device manager allows for.
const FRIENDLY_NAME_LENGTH: usize = 250 * 2;

lazy_static! {
    static ref DEVICE_IDS: Regex =
        Regex::new(r"(?i)vid_([0-9a-f]{4})&pid_([0-9a-f]{4})").expect("Invalid VID / PID pattern");
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    name: String,
    path: String,
}

impl DeviceDescriptor {
    pub fn new(name: &str, path: &str) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Vendor and Product IDs, pulled from the `vid_xxxx&pid_xxxx` part of the path.
    pub fn ids(&self) -> Option<(u16, u16)> {
        let captures = DEVICE_IDS.captures(&self.path).ok()??;
        let vendor_id = u16::from_str_radix(captures.get(1)?.as_str(), 16).ok()?;
        let product_id = u16::from_str_radix(captures.get(2)?.as_str(), 16).ok()?;
        Some((vendor_id, product_id))
    }

    pub fn vendor_id(&self) -> Option<u16> {
        self.ids().map(|(vendor_id, _)| vendor_id)
    }

    pub fn product_id(&self) -> Option<u16> {
        self.ids().map(|(_, product_id)| product_id)
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.ids() == Some((vendor_id, product_id))
    }
}

pub fn filter_by_ids(
    devices: impl IntoIterator<Item = DeviceDescriptor>,
    vendor_id: u16,
    product_id: u16,
) -> Vec<DeviceDescriptor> {
    devices
        .into_iter()
        .filter(|device| device.matches(vendor_id, product_id))
        .collect()
}

pub struct DeviceEnumerator {
    driver: Rc<dyn DriverApi>,
}

impl DeviceEnumerator {
    pub fn new(driver: Rc<dyn DriverApi>) -> Self {
        Self { driver }
    }

    /// Starts a lazy enumeration pass. The pass ends at the first error it yields.
    pub fn iter(
        &self,
        guid: impl Into<Guid>,
        flags: EnumSet<EnumerationFlag>,
    ) -> Result<DeviceIter> {
        let guid = guid.into();
        let bits = EnumerationFlag::to_bits(flags);
        debug!("Enumerating {} with flags 0x{:02x}", guid, bits);

        let set = self
            .driver
            .enumerate_class_devices(&guid, bits)
            .map_err(ResourceError::InfoSet)?;

        Ok(DeviceIter {
            driver: self.driver.clone(),
            set,
            guid,
            index: 0,
            decoder: RecordDecoder::default(),
            finished: false,
        })
    }

    /// Collects a full pass. If any member fails to decode, the whole pass fails and anything
    /// gathered before the failure is discarded.
    pub fn enumerate(
        &self,
        guid: impl Into<Guid>,
        flags: EnumSet<EnumerationFlag>,
    ) -> Result<Vec<DeviceDescriptor>> {
        self.iter(guid, flags)?.collect()
    }

    pub fn enumerate_filtered(
        &self,
        guid: impl Into<Guid>,
        vendor_id: u16,
        product_id: u16,
        flags: EnumSet<EnumerationFlag>,
    ) -> Result<Vec<DeviceDescriptor>> {
        let devices = self.enumerate(guid, flags)?;
        Ok(filter_by_ids(devices, vendor_id, product_id))
    }

    /// Creates an uninitialised session for a discovered device.
    pub fn open(&self, device: &DeviceDescriptor) -> DeviceSession {
        DeviceSession::new(self.driver.clone(), device.clone())
    }
}

pub struct DeviceIter {
    driver: Rc<dyn DriverApi>,
    set: InfoSetHandle,
    guid: Guid,
    index: u32,
    decoder: RecordDecoder,
    finished: bool,
}

impl DeviceIter {
    fn next_device(&mut self) -> Result<Option<DeviceDescriptor>> {
        let record = self
            .driver
            .enumerate_device_interface(self.set, &self.guid, self.index)
            .map_err(|error| ResourceError::Enumeration {
                index: self.index,
                error,
            })?;

        let Some(record) = record else {
            debug!("Enumeration complete, {} device(s) found", self.index);
            return Ok(None);
        };

        let decoded = self
            .decoder
            .decode(self.driver.as_ref(), self.set, &record)
            .map_err(Error::from)?;

        let name = self
            .friendly_name(&decoded.device_info)
            .unwrap_or_else(|| decoded.path.clone());

        debug!("Found Device {}: {} ({})", self.index, name, decoded.path);
        self.index += 1;

        Ok(Some(DeviceDescriptor {
            name,
            path: decoded.path,
        }))
    }

    fn friendly_name(&self, device_info: &crate::driver::DeviceInfoRecord) -> Option<String> {
        let mut buffer = vec![0; FRIENDLY_NAME_LENGTH];
        let length = self
            .driver
            .get_device_property(self.set, device_info, SPDRP_FRIENDLYNAME, &mut buffer)
            .ok()?;

        Some(read_path(&buffer[..(length as usize).min(buffer.len())]))
    }
}

impl Iterator for DeviceIter {
    type Item = Result<DeviceDescriptor>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let result = self.next_device();
        if !matches!(result, Ok(Some(_))) {
            self.finished = true;
        }
        result.transpose()
    }
}

impl Drop for DeviceIter {
    fn drop(&mut self) {
        if let Err(error) = self.driver.destroy_device_info_set(self.set) {
            warn!("Unable to release device information set: {}", error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::{Call, FakeDevice, FakeDriver};
    use crate::error::DecodeError;
    use winusb_types::EnumerationClass;

    const DEVICE_A: &str = r"\\?\usb#vid_1234&pid_5678#a#{dee824ef-729b-4a0e-9c14-b7117d33a817}";
    const DEVICE_B: &str = r"\\?\USB#VID_1234&PID_9ABC#b#{dee824ef-729b-4a0e-9c14-b7117d33a817}";
    const DEVICE_C: &str = r"\\?\usb#vid_abcd&pid_5678#c#{dee824ef-729b-4a0e-9c14-b7117d33a817}";

    fn setup() -> (Rc<FakeDriver>, DeviceEnumerator) {
        let fake = Rc::new(FakeDriver::new());
        fake.add_device(FakeDevice::new(DEVICE_A).with_friendly_name("Device A"));
        fake.add_device(FakeDevice::new(DEVICE_B));
        fake.add_device(FakeDevice::new(DEVICE_C).with_friendly_name("Device C"));

        let enumerator = DeviceEnumerator::new(fake.clone());
        (fake, enumerator)
    }

    #[test]
    fn enumerates_every_member_in_order() {
        let (fake, enumerator) = setup();
        let devices = enumerator
            .enumerate(EnumerationClass::WinUsb, EnumSet::empty())
            .unwrap();

        let names: Vec<&str> = devices.iter().map(|device| device.name()).collect();
        assert_eq!(names, vec!["Device A", DEVICE_B, "Device C"]);
        assert_eq!(devices[1].path(), DEVICE_B);

        // Three members, plus the probe that found the end of the sequence.
        assert_eq!(
            fake.count(|call| matches!(call, Call::EnumerateDeviceInterface { .. })),
            4
        );
        assert_eq!(fake.open_info_sets(), 0);
    }

    #[test]
    fn empty_class_is_not_an_error() {
        let fake = Rc::new(FakeDriver::new());
        let enumerator = DeviceEnumerator::new(fake.clone());

        let devices = enumerator
            .enumerate(EnumerationClass::UsbDevice, EnumSet::empty())
            .unwrap();
        assert!(devices.is_empty());
        assert_eq!(fake.open_info_sets(), 0);
    }

    #[test]
    fn flags_are_passed_through() {
        let (fake, enumerator) = setup();

        enumerator
            .enumerate(EnumerationClass::UsbDevice, EnumSet::empty())
            .unwrap();
        enumerator
            .enumerate(
                EnumerationClass::UsbDevice,
                EnumerationFlag::Present | EnumerationFlag::DeviceInterface,
            )
            .unwrap();

        let flags: Vec<u32> = fake
            .calls()
            .iter()
            .filter_map(|call| match call {
                Call::EnumerateClassDevices { guid, flags } => {
                    assert_eq!(*guid, EnumerationClass::UsbDevice.guid());
                    Some(*flags)
                }
                _ => None,
            })
            .collect();
        assert_eq!(flags, vec![0x10, 0x12]);
    }

    #[test]
    fn property_failure_falls_back_to_path() {
        let (fake, enumerator) = setup();
        fake.fail_property.set(true);

        let devices = enumerator
            .enumerate(EnumerationClass::WinUsb, EnumSet::empty())
            .unwrap();
        let names: Vec<&str> = devices.iter().map(|device| device.name()).collect();
        assert_eq!(names, vec![DEVICE_A, DEVICE_B, DEVICE_C]);
    }

    #[test]
    fn empty_friendly_name_is_kept() {
        let fake = Rc::new(FakeDriver::new());
        fake.add_device(FakeDevice::new(DEVICE_A).with_friendly_name(""));
        let enumerator = DeviceEnumerator::new(fake.clone());

        let devices = enumerator
            .enumerate(EnumerationClass::WinUsb, EnumSet::empty())
            .unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name(), "");
        assert_eq!(devices[0].path(), DEVICE_A);
    }

    #[test]
    fn info_set_failure_is_a_resource_error() {
        let (fake, enumerator) = setup();
        fake.fail_info_set.set(Some(5));

        let result = enumerator.enumerate(EnumerationClass::WinUsb, EnumSet::empty());
        assert!(matches!(
            result,
            Err(Error::Resource(ResourceError::InfoSet(error))) if error.code() == 5
        ));
    }

    #[test]
    fn decode_failure_aborts_the_collected_pass() {
        let (fake, enumerator) = setup();
        fake.add_device(FakeDevice::new("broken").with_header_size(3));
        fake.add_device(FakeDevice::new("never reached"));

        let result = enumerator.enumerate(EnumerationClass::WinUsb, EnumSet::empty());
        assert!(matches!(
            result,
            Err(Error::Decode(DecodeError::NoMatchingLayout { .. }))
        ));
        assert_eq!(
            fake.count(|call| matches!(call, Call::EnumerateDeviceInterface { index: 4 })),
            0
        );
        assert_eq!(fake.open_info_sets(), 0);
    }

    #[test]
    fn lazy_pass_keeps_results_before_a_failure() {
        let (fake, enumerator) = setup();
        fake.add_device(FakeDevice::new("broken").with_header_size(3));

        let results: Vec<Result<DeviceDescriptor>> = enumerator
            .iter(EnumerationClass::WinUsb, EnumSet::empty())
            .unwrap()
            .collect();

        assert_eq!(results.len(), 4);
        assert!(results[..3].iter().all(|result| result.is_ok()));
        assert!(results[3].is_err());
    }

    #[test]
    fn mid_pass_enumeration_error_is_reported() {
        let (fake, enumerator) = setup();
        fake.fail_enumeration_at.set(Some((1, 1784)));

        let result = enumerator.enumerate(EnumerationClass::WinUsb, EnumSet::empty());
        assert!(matches!(
            result,
            Err(Error::Resource(ResourceError::Enumeration { index: 1, .. }))
        ));
    }

    #[test]
    fn filtered_is_a_stable_subset() {
        let (_fake, enumerator) = setup();
        let all = enumerator
            .enumerate(EnumerationClass::WinUsb, EnumSet::empty())
            .unwrap();

        let first = enumerator
            .enumerate_filtered(EnumerationClass::WinUsb, 0x1234, 0x9abc, EnumSet::empty())
            .unwrap();
        let second = enumerator
            .enumerate_filtered(EnumerationClass::WinUsb, 0x1234, 0x9abc, EnumSet::empty())
            .unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].path(), DEVICE_B);
        assert_eq!(first, second);
        assert!(first.iter().all(|device| all.contains(device)));
    }

    #[test]
    fn ids_are_parsed_case_insensitively() {
        let device = DeviceDescriptor::new("A", DEVICE_B);
        assert_eq!(device.ids(), Some((0x1234, 0x9abc)));
        assert_eq!(device.vendor_id(), Some(0x1234));
        assert_eq!(device.product_id(), Some(0x9abc));
        assert!(device.matches(0x1234, 0x9ABC));

        let device = DeviceDescriptor::new("B", r"\\?\hid#something_else");
        assert_eq!(device.ids(), None);
        assert!(!device.matches(0x1234, 0x9abc));
    }

    #[test]
    fn filter_is_pure() {
        let devices = vec![
            DeviceDescriptor::new("A", DEVICE_A),
            DeviceDescriptor::new("C", DEVICE_C),
        ];
        let matched = filter_by_ids(devices.clone(), 0xabcd, 0x5678);
        assert_eq!(matched, vec![devices[1].clone()]);
        assert!(filter_by_ids(devices, 0x0000, 0x0000).is_empty());
    }
}
