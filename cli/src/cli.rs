use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use winusb_types::{EnumerationClass, EnumerationFlag};

#[derive(Parser, Debug)]
#[clap(about, version, author)]
pub struct Cli {
    /// Minimum log level to print out
    #[clap(long, value_enum, default_value = "info")]
    pub log_level: LevelFilter,

    /// Also write the log to this file
    #[clap(long)]
    pub log_file: Option<PathBuf>,

    /// The device interface class to enumerate
    #[clap(long, value_enum, default_value = "win-usb")]
    pub class: EnumerationClass,

    /// Enumeration flags, may be repeated (defaults to device-interface)
    #[clap(long = "flag", value_enum)]
    pub flags: Vec<EnumerationFlag>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List every device in the class
    List,

    /// List devices matching a Vendor and Product ID
    Filter {
        /// Vendor ID, in hex
        #[clap(value_parser = parse_hex_u16)]
        vendor_id: u16,

        /// Product ID, in hex
        #[clap(value_parser = parse_hex_u16)]
        product_id: u16,
    },

    /// Show the speed, interface and pipes of a device
    Info {
        #[clap(flatten)]
        device: DeviceArgs,
    },

    /// Read from a pipe
    Read {
        #[clap(flatten)]
        device: DeviceArgs,

        /// The pipe to read from, in hex (eg. 81)
        #[clap(value_parser = parse_hex_u8)]
        pipe: u8,

        /// Maximum number of bytes to read
        #[clap(long, default_value = "64")]
        length: usize,

        /// Pipe timeout in milliseconds
        #[clap(long, default_value = "1000")]
        timeout: u32,

        /// Submit the read asynchronously, and poll until it completes
        #[clap(long)]
        overlapped: bool,
    },

    /// Write hex encoded bytes to a pipe
    Write {
        #[clap(flatten)]
        device: DeviceArgs,

        /// The pipe to write to, in hex (eg. 01)
        #[clap(value_parser = parse_hex_u8)]
        pipe: u8,

        /// The data to send, as hex (eg. 0102ff)
        #[clap(value_parser = parse_hex_bytes)]
        data: HexBytes,
    },
}

#[derive(Args, Debug)]
pub struct DeviceArgs {
    /// The index of the device, as shown by 'list'
    #[clap(long, default_value = "0")]
    pub device: usize,

    /// Switch to this associated interface after opening
    #[clap(long)]
    pub interface: Option<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HexBytes(pub Vec<u8>);

#[repr(usize)]
#[derive(ValueEnum, Copy, Clone, Eq, PartialEq, Debug)]
pub enum LevelFilter {
    /// A level lower than all log levels.
    Off,
    /// Corresponds to the `Error` log level.
    Error,
    /// Corresponds to the `Warn` log level.
    Warn,
    /// Corresponds to the `Info` log level.
    Info,
    /// Corresponds to the `Debug` log level.
    Debug,
    /// Corresponds to the `Trace` log level.
    Trace,
}

impl From<LevelFilter> for log::LevelFilter {
    fn from(value: LevelFilter) -> Self {
        match value {
            LevelFilter::Off => log::LevelFilter::Off,
            LevelFilter::Error => log::LevelFilter::Error,
            LevelFilter::Warn => log::LevelFilter::Warn,
            LevelFilter::Info => log::LevelFilter::Info,
            LevelFilter::Debug => log::LevelFilter::Debug,
            LevelFilter::Trace => log::LevelFilter::Trace,
        }
    }
}

fn parse_hex_u16(value: &str) -> Result<u16, String> {
    u16::from_str_radix(value.trim_start_matches("0x"), 16).map_err(|e| e.to_string())
}

fn parse_hex_u8(value: &str) -> Result<u8, String> {
    u8::from_str_radix(value.trim_start_matches("0x"), 16).map_err(|e| e.to_string())
}

fn parse_hex_bytes(value: &str) -> Result<HexBytes, String> {
    let value = value.trim_start_matches("0x");
    if value.len() % 2 != 0 {
        return Err(String::from("Hex data must have an even number of digits"));
    }

    (0..value.len())
        .step_by(2)
        .map(|index| {
            value
                .get(index..index + 2)
                .ok_or_else(|| String::from("Hex data must be ASCII"))
                .and_then(|byte| u8::from_str_radix(byte, 16).map_err(|e| e.to_string()))
        })
        .collect::<Result<Vec<u8>, String>>()
        .map(HexBytes)
}
