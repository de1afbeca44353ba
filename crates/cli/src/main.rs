//! osrfx2-ctl
//!
//! Attaches the driver core to every OSR USB-FX2 board found on the bus and
//! exercises one of them: switches, bargraph, 7-segment display, bulk
//! loopback and power management.

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use cli::Osrfx2Config;
use common::setup_logging;
use driver::bus::native::{RusbBus, device_info, find_devices};
use driver::{AccessMode, Attribute, Driver, SignalFlag, UsbBus};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "osrfx2-ctl")]
#[command(
    author,
    version,
    about = "OSR USB-FX2 control - drive the learning kit from userspace"
)]
#[command(long_about = "
Binds the OSR USB-FX2 driver core to the boards on the bus and runs one
operation against them.

EXAMPLES:
    # List matching boards
    osrfx2-ctl list

    # Show the DIP switches of the first board
    osrfx2-ctl switches

    # Light the whole bargraph
    osrfx2-ctl bargraph 255

    # Send ten packets through the bulk loopback
    osrfx2-ctl loopback --count 10

    # Print switch changes until Ctrl+C
    osrfx2-ctl watch

CONFIGURATION:
    The tool looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/osrfx2/config.toml
    3. /etc/osrfx2/config.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Device to operate on
    #[arg(short, long, value_name = "NAME", default_value = "osrfx2_0")]
    device: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List matching boards without binding to them
    List,
    /// Show the DIP switch bank
    Switches,
    /// Show the bargraph, or set it to VALUE (0-255)
    Bargraph { value: Option<String> },
    /// Show the 7-segment display, or set it to VALUE (0-255)
    Segment { value: Option<String> },
    /// Write numbered packets to the bulk pipe and read them back
    Loopback {
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
        #[arg(long, value_name = "MS", default_value_t = 0)]
        interval_ms: u64,
    },
    /// Print switch changes until interrupted
    Watch,
    /// Suspend the board, then resume it
    Cycle {
        /// Time to stay suspended
        #[arg(long, value_name = "MS", default_value_t = 1000)]
        hold_ms: u64,
    },
    /// Show a status snapshot
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Save the default configuration to the default location and exit
    SaveConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Command::SaveConfig = args.command {
        let config = Osrfx2Config::default();
        let path = Osrfx2Config::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        Osrfx2Config::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        Osrfx2Config::load_or_default()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("osrfx2-ctl v{}", env!("CARGO_PKG_VERSION"));

    if let Command::List = args.command {
        return list_boards(&config);
    }

    let driver = Arc::new(Driver::register(config.driver_config()?));
    attach_boards(&driver, &config)?;

    let minor = driver::minor_for_name(&args.device)
        .ok_or_else(|| anyhow!("Not a device name: {}", args.device))?;
    let result = run(Arc::clone(&driver), minor, args.command).await;

    if let Err(e) = &result {
        error!("{:#}", e);
    }

    match Arc::try_unwrap(driver) {
        Ok(driver) => driver.deregister(),
        Err(_) => warn!("Driver still in use at exit"),
    }
    result
}

fn list_boards(config: &Osrfx2Config) -> Result<()> {
    let ids = config.device_match()?;
    let context = rusb::Context::new().context("Failed to initialize libusb")?;
    let devices = find_devices(&context, ids.vendor_id, ids.product_id)?;

    if devices.is_empty() {
        println!("No boards found ({:04x}:{:04x})", ids.vendor_id, ids.product_id);
        return Ok(());
    }

    println!("Found {} board(s):", devices.len());
    for device in &devices {
        let info = device_info(device, None)?;
        println!(
            "  bus {:03} device {:03}  {:04x}:{:04x}  {:?}",
            info.bus_number, info.device_address, info.vendor_id, info.product_id, info.speed
        );
    }
    Ok(())
}

fn attach_boards(driver: &Driver, config: &Osrfx2Config) -> Result<()> {
    let ids = config.device_match()?;
    let context = rusb::Context::new().context("Failed to initialize libusb")?;
    let devices = find_devices(&context, ids.vendor_id, ids.product_id)?;

    for device in &devices {
        let bus = match RusbBus::open(device, config.device.interface) {
            Ok(bus) => bus,
            Err(e) => {
                warn!(
                    "Skipping device on bus {:03} address {:03}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                continue;
            }
        };
        let bus: Arc<dyn UsbBus> = Arc::new(bus);
        if let Err(e) = driver.attach(bus) {
            warn!("Attach failed: {}", e);
        }
    }

    if driver.minors().is_empty() {
        return Err(anyhow!(
            "No {:04x}:{:04x} board could be attached",
            ids.vendor_id,
            ids.product_id
        ));
    }
    Ok(())
}

/// Run a blocking driver call off the async runtime
async fn blocking<T, F>(driver: &Arc<Driver>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Driver) -> Result<T> + Send + 'static,
{
    let driver = Arc::clone(driver);
    tokio::task::spawn_blocking(move || f(&driver))
        .await
        .context("Driver task panicked")?
}

async fn run(driver: Arc<Driver>, minor: u32, command: Command) -> Result<()> {
    match command {
        Command::Switches => {
            let text = blocking(&driver, move |d| {
                Ok(d.attributes(minor)?.show(Attribute::Switches)?)
            })
            .await?;
            println!("{}", text);
        }
        Command::Bargraph { value } => {
            show_or_store(&driver, minor, Attribute::Bargraph, value).await?
        }
        Command::Segment { value } => {
            show_or_store(&driver, minor, Attribute::SevenSegment, value).await?
        }
        Command::Loopback { count, interval_ms } => {
            blocking(&driver, move |d| loopback(d, minor, count, interval_ms)).await?
        }
        Command::Watch => watch(&driver, minor).await?,
        Command::Cycle { hold_ms } => {
            blocking(&driver, move |d| {
                let signal = SignalFlag::new();
                d.suspend(minor, &signal)?;
                println!("suspended");
                std::thread::sleep(Duration::from_millis(hold_ms));
                d.resume(minor, &signal)?;
                println!("resumed");
                Ok(())
            })
            .await?
        }
        Command::Status { json } => {
            let status = blocking(&driver, move |d| Ok(d.status(minor)?)).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("{}:", status.name);
                println!("  minor:     {}", status.minor);
                println!("  switches:  {}", status.switches);
                println!("  bargraph:  {}", status.bargraph);
                println!("  7segment:  {}", status.segments);
                println!("  suspended: {}", status.suspended);
                match status.high_speed {
                    Some(high) => println!("  high speed: {}", high),
                    None => println!("  high speed: unknown"),
                }
                println!("  pending:   {} byte(s)", status.pending_bytes);
            }
        }
        Command::List | Command::SaveConfig => {}
    }
    Ok(())
}

async fn show_or_store(
    driver: &Arc<Driver>,
    minor: u32,
    attr: Attribute,
    value: Option<String>,
) -> Result<()> {
    let text = blocking(driver, move |d| {
        let attrs = d.attributes(minor)?;
        if let Some(value) = value {
            attrs.store(attr, &value)?;
        }
        Ok(attrs.show(attr)?)
    })
    .await?;
    println!("{}", text);
    Ok(())
}

fn loopback(driver: &Driver, minor: u32, count: u32, interval_ms: u64) -> Result<()> {
    let file = driver.open(minor, AccessMode::ReadWrite)?;
    let mut buf = [0u8; 512];

    for n in 0..count {
        let packet = format!("Test packet {}", n);
        let written = file.write(packet.as_bytes())?;
        let read = file.read(&mut buf)?;
        let echoed = String::from_utf8_lossy(&buf[..read]);
        println!("wrote {} byte(s), read {} byte(s): {}", written, read, echoed);

        if interval_ms > 0 && n + 1 < count {
            std::thread::sleep(Duration::from_millis(interval_ms));
        }
    }

    file.close();
    Ok(())
}

async fn watch(driver: &Arc<Driver>, minor: u32) -> Result<()> {
    let ctx = driver.context(minor)?;
    let events = ctx.subscribe_switches();
    println!("{}: {}", ctx.name(), ctx.vendor().read_switches());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let outputs = blocking(driver, move |d| {
                        let attrs = d.attributes(minor)?;
                        Ok((
                            attrs.show(Attribute::SevenSegment)?,
                            attrs.show(Attribute::Bargraph)?,
                        ))
                    })
                    .await;
                    match outputs {
                        Ok((segments, bargraph)) => println!(
                            "{}: switches {:08b}  7segment {}  bargraph {}",
                            ctx.name(),
                            event.state,
                            segments,
                            bargraph
                        ),
                        Err(e) => println!("{}: switches {:08b} ({:#})", ctx.name(), event.state, e),
                    }
                }
                Err(_) => {
                    info!("{} went away", ctx.name());
                    break;
                }
            },
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, stopping"),
                    Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
                }
                break;
            }
        }
    }
    Ok(())
}
