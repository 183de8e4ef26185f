pub use winusb_types as types;

pub mod driver;
pub mod enumerator;
pub mod error;
pub mod record;
pub mod session;
pub mod transfer;

pub use driver::{DriverApi, InterfaceDescriptor, OpenOptions, SetupPacket, open_driver};
pub use enumerator::{DeviceDescriptor, DeviceEnumerator, DeviceIter, filter_by_ids};
pub use error::{Error, Result};
pub use session::{DeviceSession, PipeDescriptor, SessionStatus};
pub use transfer::{ControlTransferResult, OverlappedPoll};
