//! rmuxd
//!
//! Daemon multiplexing logical connections to Apple mobile devices attached
//! over USB. This binary hosts the USB device-management core on a dedicated
//! worker thread and reports device lifecycle on the async side.

mod config;
mod device;
mod usb;

use anyhow::{Context, Result};
use clap::Parser;
use common::{UsbBridge, UsbCommand, UsbEvent, create_usb_bridge, setup_logging};
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "rmuxd")]
#[command(
    author,
    version,
    about = "Multiplexes logical connections to Apple mobile devices over USB"
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save the default configuration to its default location and exit
    #[arg(long)]
    save_config: bool,

    /// Enumerate attached devices, print them, and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = config::DaemonConfig::default();
        let path = config::DaemonConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if args.config.is_some() {
        config::DaemonConfig::load(args.config.clone()).context("Failed to load configuration")?
    } else {
        config::DaemonConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("rmuxd v{}", env!("CARGO_PKG_VERSION"));

    let (bridge, worker) = create_usb_bridge();
    let usb_handle = usb::spawn_usb_worker(worker, config.usb.desired_mode);

    if !config.usb.auto_discover {
        bridge
            .send_command(UsbCommand::Autodiscover { enable: false })
            .await
            .context("Failed to disable autodiscovery")?;
    }

    let result = if args.list_devices {
        list_devices_mode(bridge.clone()).await
    } else {
        run_daemon(bridge.clone()).await
    };

    info!("Shutting down USB subsystem...");
    if let Err(e) = bridge.send_command(UsbCommand::Shutdown).await {
        error!("Error requesting USB shutdown: {:#}", e);
    }
    match usb_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("USB worker exited with error: {}", e),
        Err(e) => error!("USB worker thread panicked: {:?}", e),
    }

    result
}

/// Force an enumeration pass, give the asynchronous device setup a moment to
/// finish, then print whatever initialized.
async fn list_devices_mode(bridge: UsbBridge) -> Result<()> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    bridge
        .send_command(UsbCommand::Discover { response: tx })
        .await
        .context("Failed to send Discover command")?;
    match rx.await.context("Failed to receive discovery result")? {
        Ok(count) => info!("Discovery pass saw {} candidate device(s)", count),
        Err(e) => error!("Discovery failed: {}", e),
    }

    // mode negotiation and string descriptor reads happen asynchronously
    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;

    let (tx, rx) = tokio::sync::oneshot::channel();
    bridge
        .send_command(UsbCommand::ListDevices { response: tx })
        .await
        .context("Failed to send ListDevices command")?;
    let devices = rx.await.context("Failed to receive device list")?;

    if devices.is_empty() {
        println!("No devices found.");
    } else {
        println!("Found {} device(s):\n", devices.len());
        for device in devices {
            println!(
                "  {} (bus {}, address {}, pid {:04x}, {} Mbit/s)",
                device.serial,
                device.bus(),
                device.address(),
                device.product_id,
                device.speed_bps / 1_000_000
            );
        }
    }

    Ok(())
}

/// Run until ctrl-c, logging device lifecycle as it happens.
async fn run_daemon(bridge: UsbBridge) -> Result<()> {
    let events = bridge.clone();
    tokio::spawn(async move {
        while let Ok(event) = events.recv_event().await {
            match event {
                UsbEvent::DeviceArrived { device } => {
                    info!(
                        "device attached: {} at bus {} address {} ({} Mbit/s)",
                        device.serial,
                        device.bus(),
                        device.address(),
                        device.speed_bps / 1_000_000
                    );
                }
                UsbEvent::DeviceRemoved { location } => {
                    info!("device detached: {:#010x}", location);
                }
            }
        }
    });

    info!("Press Ctrl+C to shutdown");
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
        Err(e) => error!("Error waiting for Ctrl+C: {}", e),
    }

    Ok(())
}
