use anyhow::{Context, Result, bail};
use clap::Parser;
use enumset::EnumSet;
use log::{debug, info};
use simplelog::{
    ColorChoice, CombinedLogger, Config, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};
use std::fs::File;
use std::thread;
use std::time::{Duration, Instant};
use winusb::{DeviceDescriptor, DeviceEnumerator, DeviceSession, OverlappedPoll, open_driver};
use winusb_types::{EnumerationFlag, Guid};

use crate::cli::{Cli, Commands, DeviceArgs};

mod cli;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

fn main() -> Result<()> {
    let args: Cli = Cli::parse();

    let level: log::LevelFilter = args.log_level.into();
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if let Some(path) = &args.log_file {
        let file = File::create(path)
            .with_context(|| format!("Unable to create log file {}", path.display()))?;
        loggers.push(WriteLogger::new(level, Config::default(), file));
    }
    CombinedLogger::init(loggers).context("Could not configure the logger")?;

    let enumerator = DeviceEnumerator::new(open_driver()?);
    let guid = args.class.guid();
    let flags: EnumSet<EnumerationFlag> = args.flags.iter().copied().collect();

    match &args.command {
        Commands::List => {
            let devices = enumerator.enumerate(guid, flags)?;
            print_devices(&devices);
        }
        Commands::Filter {
            vendor_id,
            product_id,
        } => {
            let devices = enumerator.enumerate_filtered(guid, *vendor_id, *product_id, flags)?;
            print_devices(&devices);
        }
        Commands::Info { device } => {
            let session = open_device(&enumerator, guid, flags, device)?;
            println!("{} ({})", session.name(), session.path());

            match session.device_speed() {
                Some(speed) => println!("Speed: {}", speed),
                None => println!("Speed: Unknown"),
            }
            if let Some(interface) = device.interface {
                if let Some(descriptor) = session.query_interface_settings(interface)? {
                    println!(
                        "Interface {}: Class 0x{:02x}, Subclass 0x{:02x}, Protocol 0x{:02x}, \
                         {} Endpoint(s)",
                        descriptor.interface_number,
                        descriptor.interface_class,
                        descriptor.interface_sub_class,
                        descriptor.interface_protocol,
                        descriptor.num_endpoints
                    );
                }
            }
            for pipe in session.pipes()? {
                println!(
                    "Pipe 0x{:02x}: {}, Max Packet {}, Interval {}",
                    pipe.pipe_id, pipe.pipe_type, pipe.max_packet_size, pipe.interval
                );
            }
        }
        Commands::Read {
            device,
            pipe,
            length,
            timeout,
            overlapped,
        } => {
            let mut session = open_device(&enumerator, guid, flags, device)?;
            if !session.set_timeout(*pipe, *timeout) {
                bail!("Unable to set the timeout on pipe 0x{:02x}", pipe);
            }

            let data = match overlapped {
                true => overlapped_read(&mut session, *pipe, *length, *timeout)?,
                false => session.read(*pipe, *length)?,
            };
            println!("{}", to_hex(&data));
        }
        Commands::Write { device, pipe, data } => {
            let session = open_device(&enumerator, guid, flags, device)?;
            let written = session.write(*pipe, &data.0)?;
            println!("Wrote {} of {} bytes", written, data.0.len());
        }
    }

    Ok(())
}

fn print_devices(devices: &[DeviceDescriptor]) {
    if devices.is_empty() {
        println!("No devices found");
        return;
    }

    for (index, device) in devices.iter().enumerate() {
        match device.ids() {
            Some((vendor_id, product_id)) => println!(
                "{}: [{:04x}:{:04x}] {}",
                index,
                vendor_id,
                product_id,
                device.name()
            ),
            None => println!("{}: {}", index, device.name()),
        }
        println!("   {}", device.path());
    }
}

fn open_device(
    enumerator: &DeviceEnumerator,
    guid: Guid,
    flags: EnumSet<EnumerationFlag>,
    args: &DeviceArgs,
) -> Result<DeviceSession> {
    let devices = enumerator.enumerate(guid, flags)?;
    let Some(device) = devices.get(args.device) else {
        bail!(
            "Device {} not found, {} device(s) available",
            args.device,
            devices.len()
        );
    };

    let mut session = enumerator.open(device);
    session.init_device()?;
    info!("Opened {}", session.name());

    if let Some(interface) = args.interface {
        if !session.change_interface(interface) {
            bail!("Unable to change to interface {}", interface);
        }
    }
    Ok(session)
}

fn overlapped_read(
    session: &mut DeviceSession,
    pipe: u8,
    length: usize,
    timeout: u32,
) -> Result<Vec<u8>> {
    if !session.overlapped_read_init(pipe, length) {
        bail!("Unable to submit a read on pipe 0x{:02x}", pipe);
    }

    let deadline = Instant::now() + Duration::from_millis(timeout as u64);
    loop {
        match session.overlapped_read()? {
            OverlappedPoll::Ready(data) => return Ok(data),
            OverlappedPoll::Failed(code) => bail!("Read failed with error {}", code),
            OverlappedPoll::Idle => bail!("No read was outstanding"),
            OverlappedPoll::Pending(code) => {
                if Instant::now() > deadline {
                    bail!("Read timed out waiting for the device");
                }
                debug!("Read pending ({}), polling again", code);
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

fn to_hex(data: &[u8]) -> String {
    data.iter().map(|byte| format!("{:02x}", byte)).collect()
}
