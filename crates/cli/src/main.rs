//! hidusb command line tool
//!
//! Lists HID interfaces and exchanges reports with them through the
//! `hidusb` library, bypassing the operating system's HID driver.

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use common::{Config, level_from_env, setup_logging};
use hidusb::{HidApi, HidDevice, ReadOutcome};
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "hidusb")]
#[command(author, version, about = "Talk to USB HID devices through libusb")]
#[command(long_about = "
Enumerate USB HID interfaces and read or write their reports without the
operating system's HID driver. The interface is claimed through libusb, so a
bound kernel driver is detached first (see device.detach_kernel_driver).

Devices are addressed by path: BUS:ADDRESS:INTERFACE in hex, for example
0001:001a:00. /dev/bus/usb/BBB/DDD nodes and /dev/hidapi/ links are accepted
as well.

EXAMPLES:
    # List all HID interfaces
    hidusb list

    # List interfaces of one vendor
    hidusb list --vid 046d

    # Print five input reports, waiting up to one second for each
    hidusb read 0001:001a:00 --count 5 --timeout 1000

    # Send output report 0 (no report IDs) with two data bytes
    hidusb write 0001:001a:00 00ff01

    # Read feature report 3
    hidusb get-feature 0001:001a:00 3 --size 16

CONFIGURATION:
    The tool looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/hid-usb/config.toml
    3. /etc/hid-usb/config.toml
    4. Built-in defaults

    ENABLE_DEBUG=1 turns on debug logging when --log-level is not given.
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List HID interfaces
    List {
        /// Vendor ID in hex (0 or absent matches any)
        #[arg(long, value_name = "HEX", value_parser = parse_hex_u16)]
        vid: Option<u16>,

        /// Product ID in hex (0 or absent matches any)
        #[arg(long, value_name = "HEX", value_parser = parse_hex_u16)]
        pid: Option<u16>,
    },

    /// Show the identity of one interface
    Info {
        /// Device path
        path: String,
    },

    /// Print input reports as hex
    Read {
        /// Device path
        path: String,

        /// Milliseconds to wait for each report (-1 waits forever)
        #[arg(short, long, default_value_t = 1000, allow_negative_numbers = true)]
        timeout: i32,

        /// Number of reports to print (0 reads until the device stops)
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },

    /// Write an output report; the first byte is the report ID (0 if unused)
    Write {
        /// Device path
        path: String,

        /// Report bytes in hex
        #[arg(value_parser = parse_hex_bytes)]
        data: HexBytes,
    },

    /// Read a feature report
    GetFeature {
        /// Device path
        path: String,

        /// Report ID in hex
        #[arg(value_parser = parse_hex_u8)]
        report_id: u8,

        /// Buffer size (defaults to the interface's max packet size)
        #[arg(short, long)]
        size: Option<usize>,
    },

    /// Send a feature report; the first byte is the report ID (0 if unused)
    SendFeature {
        /// Device path
        path: String,

        /// Report bytes in hex
        #[arg(value_parser = parse_hex_bytes)]
        data: HexBytes,
    },

    /// Save default configuration to default location and exit
    SaveConfig,
}

/// Raw bytes given on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
struct HexBytes(Vec<u8>);

fn main() -> Result<()> {
    let args = Args::parse();

    if let Command::SaveConfig = args.command {
        let config = Config::default();
        let path = Config::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        Config::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        Config::load_or_default()
    };

    let log_level = match args.log_level {
        Some(level) => level,
        None => level_from_env(&config.logging.level),
    };
    setup_logging(&log_level).context("Failed to setup logging")?;

    debug!("hidusb v{}", env!("CARGO_PKG_VERSION"));

    let api = HidApi::with_settings(config.device).context("Failed to initialize libusb")?;

    match args.command {
        Command::List { vid, pid } => list(&api, vid.unwrap_or(0), pid.unwrap_or(0)),
        Command::Info { path } => show_info(&api, &path),
        Command::Read {
            path,
            timeout,
            count,
        } => read_reports(&api, &path, timeout, count),
        Command::Write { path, data } => {
            let device = open(&api, &path)?;
            let written = device.write(&data.0).context("Failed to write report")?;
            println!("Wrote {} byte(s)", written);
            Ok(())
        }
        Command::GetFeature {
            path,
            report_id,
            size,
        } => {
            let device = open(&api, &path)?;
            let report = device
                .get_feature_report(report_id, size)
                .with_context(|| format!("Failed to get feature report {:#04x}", report_id))?;
            println!("{}", format_hex(&report));
            Ok(())
        }
        Command::SendFeature { path, data } => {
            let device = open(&api, &path)?;
            let sent = device
                .send_feature_report(&data.0)
                .context("Failed to send feature report")?;
            println!("Sent {} byte(s)", sent);
            Ok(())
        }
        Command::SaveConfig => Ok(()),
    }
}

fn list(api: &HidApi, vendor_id: u16, product_id: u16) -> Result<()> {
    let devices = api
        .device_list(vendor_id, product_id)
        .context("Failed to enumerate HID devices")?;

    if devices.is_empty() {
        println!("No HID devices found.");
        return Ok(());
    }

    println!("Found {} HID interface(s):\n", devices.len());
    for info in devices {
        println!(
            "  [{}] {:04x}:{:04x} - {} {}",
            info.path, info.vendor_id, info.product_id, info.manufacturer, info.product
        );
        println!("      Interface: {}  Serial: {}", info.interface, info.serial_number);
    }

    Ok(())
}

fn show_info(api: &HidApi, path: &str) -> Result<()> {
    let device = api
        .get_device_by_path(path, None)
        .with_context(|| format!("Failed to look up {}", path))?
        .ok_or_else(|| anyhow!("No HID interface at {}", path))?;

    let info = device.info();
    println!("Path:          {}", info.path);
    println!("Vendor ID:     {:04x}", info.vendor_id);
    println!("Product ID:    {:04x}", info.product_id);
    println!("Interface:     {}", info.interface);
    println!("Manufacturer:  {}", info.manufacturer);
    println!("Product:       {}", info.product);
    println!("Serial number: {}", info.serial_number);

    Ok(())
}

fn read_reports(api: &HidApi, path: &str, timeout: i32, count: usize) -> Result<()> {
    let device = open(api, path)?;
    let mut printed = 0;

    while count == 0 || printed < count {
        match device.read_timeout(timeout).context("Failed to read report")? {
            ReadOutcome::Report(report) => {
                println!("{}", format_hex(&report));
                printed += 1;
            }
            ReadOutcome::Empty => {
                info!("No report within {} ms", timeout);
                if count != 0 {
                    bail!("Timed out after {} of {} report(s)", printed, count);
                }
            }
            ReadOutcome::LoopStopped => bail!("Device stopped reading after {} report(s)", printed),
        }
    }

    Ok(())
}

fn open(api: &HidApi, path: &str) -> Result<HidDevice> {
    api.open_path(path, None)
        .with_context(|| format!("Failed to open {}", path))?
        .ok_or_else(|| anyhow!("No HID interface at {}", path))
}

fn parse_hex_u16(value: &str) -> Result<u16, String> {
    u16::from_str_radix(strip_hex_prefix(value.trim()), 16)
        .map_err(|e| format!("invalid hex id '{}': {}", value, e))
}

fn parse_hex_u8(value: &str) -> Result<u8, String> {
    u8::from_str_radix(strip_hex_prefix(value.trim()), 16)
        .map_err(|e| format!("invalid hex byte '{}': {}", value, e))
}

/// Accepts `00ff01`, `0x00ff01`, `00 ff 01` and `00:ff:01`
fn parse_hex_bytes(value: &str) -> Result<HexBytes, String> {
    let digits: String = strip_hex_prefix(value.trim())
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != ',')
        .collect();

    hex::decode(&digits)
        .map(HexBytes)
        .map_err(|e| format!("invalid hex data '{}': {}", value, e))
}

fn strip_hex_prefix(value: &str) -> &str {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
}

fn format_hex(data: &[u8]) -> String {
    data.chunks(1).map(hex::encode).collect::<Vec<_>>().join(" ")
}
