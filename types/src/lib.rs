#[cfg(feature = "clap")]
use clap::ValueEnum;
use enumset::{EnumSet, EnumSetType};
use std::fmt::Formatter;
use strum::{Display, EnumCount, EnumIter};

/// A 128bit identifier, laid out the way SetupAPI expects it.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Guid {
    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self {
            data1,
            data2,
            data3,
            data4,
        }
    }

    pub fn is_null(&self) -> bool {
        *self == Guid::default()
    }
}

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{{:08X}-{:04X}-{:04X}-{:02X}{:02X}-",
            self.data1, self.data2, self.data3, self.data4[0], self.data4[1]
        )?;
        for byte in &self.data4[2..] {
            write!(f, "{:02X}", byte)?;
        }
        write!(f, "}}")
    }
}

impl std::fmt::Debug for Guid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Guid(\"{}\")", self)
    }
}

/// The well known device interface classes a discovery pass can be scoped to.
#[derive(Copy, Clone, Debug, Display, EnumIter, EnumCount, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "clap", derive(ValueEnum))]
pub enum EnumerationClass {
    UsbDevice,
    WinUsb,
    UsbComposite,
}

impl EnumerationClass {
    pub fn guid(&self) -> Guid {
        match self {
            EnumerationClass::UsbDevice => Guid::new(
                0xA5DCBF10,
                0x6530,
                0x11D2,
                [0x90, 0x1F, 0x00, 0xC0, 0x4F, 0xB9, 0x51, 0xED],
            ),
            EnumerationClass::WinUsb => Guid::new(
                0xDEE824EF,
                0x729B,
                0x4A0E,
                [0x9C, 0x14, 0xB7, 0x11, 0x7D, 0x33, 0xA8, 0x17],
            ),
            EnumerationClass::UsbComposite => Guid::new(
                0x36FC9E60,
                0xC465,
                0x11CF,
                [0x80, 0x56, 0x44, 0x45, 0x53, 0x54, 0x00, 0x00],
            ),
        }
    }
}

impl From<EnumerationClass> for Guid {
    fn from(value: EnumerationClass) -> Self {
        value.guid()
    }
}

// Flags controlling what is included in the device information set.
#[derive(Debug, Display, EnumIter, EnumCount, EnumSetType, Hash)]
#[cfg_attr(feature = "clap", derive(ValueEnum))]
pub enum EnumerationFlag {
    Default,
    Present,
    AllClasses,
    Profile,
    DeviceInterface,
}

impl EnumerationFlag {
    pub fn bits(&self) -> u32 {
        match self {
            EnumerationFlag::Default => 0x01,
            EnumerationFlag::Present => 0x02,
            EnumerationFlag::AllClasses => 0x04,
            EnumerationFlag::Profile => 0x08,
            EnumerationFlag::DeviceInterface => 0x10,
        }
    }

    /// Folds a flag set into the raw value handed to SetupAPI. An empty set still requests
    /// device interfaces, otherwise no path would come back to open.
    pub fn to_bits(flags: EnumSet<EnumerationFlag>) -> u32 {
        if flags.is_empty() {
            return EnumerationFlag::DeviceInterface.bits();
        }
        flags.iter().fold(0, |bits, flag| bits | flag.bits())
    }
}

#[derive(Copy, Clone, Debug, Display, EnumIter, EnumCount, PartialEq, Eq)]
pub enum PipeType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl PipeType {
    pub fn from_raw(value: u32) -> Option<Self> {
        match value {
            0 => Some(PipeType::Control),
            1 => Some(PipeType::Isochronous),
            2 => Some(PipeType::Bulk),
            3 => Some(PipeType::Interrupt),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Display, EnumIter, EnumCount, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(ValueEnum))]
pub enum PipePolicy {
    ShortPacketTerminate = 0x01,
    AutoClearStall = 0x02,
    PipeTransferTimeout = 0x03,
    IgnoreShortPackets = 0x04,
    AllowPartialReads = 0x05,
    AutoFlush = 0x06,
    RawIo = 0x07,
}

impl PipePolicy {
    pub fn id(&self) -> u32 {
        *self as u32
    }
}

#[derive(Copy, Clone, Debug, Display, EnumIter, EnumCount, PartialEq, Eq)]
pub enum DeviceSpeed {
    Low = 0x01,
    Full = 0x02,
    High = 0x03,
}

impl DeviceSpeed {
    pub fn from_raw(value: u32) -> Option<Self> {
        match value {
            1 => Some(DeviceSpeed::Low),
            2 => Some(DeviceSpeed::Full),
            3 => Some(DeviceSpeed::High),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_flags_fall_back_to_device_interface() {
        assert_eq!(EnumerationFlag::to_bits(EnumSet::empty()), 0x10);
    }

    #[test]
    fn flags_are_combined() {
        let flags = EnumerationFlag::Present | EnumerationFlag::DeviceInterface;
        assert_eq!(EnumerationFlag::to_bits(flags), 0x12);

        let flags =
            EnumerationFlag::Default | EnumerationFlag::AllClasses | EnumerationFlag::Profile;
        assert_eq!(EnumerationFlag::to_bits(flags), 0x0D);
    }

    #[test]
    fn guids_compare_by_value() {
        let a = EnumerationClass::WinUsb.guid();
        let b = Guid::new(
            0xDEE824EF,
            0x729B,
            0x4A0E,
            [0x9C, 0x14, 0xB7, 0x11, 0x7D, 0x33, 0xA8, 0x17],
        );
        assert_eq!(a, b);
        assert_ne!(a, EnumerationClass::UsbDevice.guid());
        assert!(Guid::default().is_null());
        assert!(!a.is_null());
    }

    #[test]
    fn guid_display() {
        assert_eq!(
            EnumerationClass::UsbDevice.guid().to_string(),
            "{A5DCBF10-6530-11D2-901F-00C04FB951ED}"
        );
    }

    #[test]
    fn raw_pipe_types() {
        assert_eq!(PipeType::from_raw(2), Some(PipeType::Bulk));
        assert_eq!(PipeType::from_raw(3), Some(PipeType::Interrupt));
        assert_eq!(PipeType::from_raw(9), None);
    }
}
