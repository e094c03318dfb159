//! Common utilities for rmuxd
//!
//! Shared pieces between the daemon front end and the USB worker thread:
//! error handling, logging setup, device summaries, and the async channel
//! bridge the two sides talk over.

pub mod channel;
pub mod error;
pub mod logging;
pub mod types;

pub use channel::{UsbBridge, UsbCommand, UsbEvent, UsbWorker, create_usb_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use types::DeviceEntry;
