//! USB device management core
//!
//! Discovers Apple devices attached over USB, negotiates their operating
//! mode, selects the configuration exposing the multiplex bulk endpoints,
//! and drives the continuous read/write pipeline until the device goes away.
//!
//! Everything here runs single-threaded inside the USB worker: the registry,
//! the device records, and every libusb completion callback share one thread,
//! so no locking exists between them. Callbacks only flip device state; actual
//! teardown happens in the reap pass of the event pump.

pub mod device;
pub mod manager;
pub mod setup;
pub mod transfers;
pub mod worker;

pub use device::UsbDevice;
pub use manager::UsbManager;
pub use worker::{UsbWorkerThread, spawn_usb_worker};

use std::cell::RefCell;
use std::rc::Rc;

/// Apple vendor ID
pub const VID_APPLE: u16 = 0x05ac;
/// iPhone/iPad/iPod product ID range
pub const PID_RANGE_LOW: u16 = 0x1290;
pub const PID_RANGE_MAX: u16 = 0x12af;
/// T2 coprocessor
pub const PID_APPLE_T2_COPROCESSOR: u16 = 0x8600;
/// Apple Silicon devices in restore mode
pub const PID_APPLE_SILICON_RESTORE_LOW: u16 = 0x1901;
pub const PID_APPLE_SILICON_RESTORE_MAX: u16 = 0x1905;

/// Class/subclass/protocol triple of the multiplex interface
pub const INTERFACE_CLASS: u8 = 0xff;
pub const INTERFACE_SUBCLASS: u8 = 0xfe;
pub const INTERFACE_PROTOCOL: u8 = 2;

/// Vendor-specific requests querying and switching the device mode
pub const APPLE_VEND_SPECIFIC_GET_MODE: u8 = 0x45;
pub const APPLE_VEND_SPECIFIC_SET_MODE: u8 = 0x52;

/// Receive buffer size for each bulk-in transfer
pub const USB_MRU: usize = 65536;

/// Parallel bulk-in transfers per device. A single loop leaves the port
/// mostly dormant; three gives noticeably better read throughput.
pub const NUM_RX_LOOPS: usize = 3;

/// Interval between enumeration passes when polling, in milliseconds
pub const DEVICE_POLL_TIME_MS: u64 = 1000;

/// Timeout for negotiation and initialization control transfers
pub const CONTROL_TIMEOUT_MS: u32 = 1000;

/// Environment variable selecting the desired device mode (decimal, 1..=5)
pub const ENV_DEVICE_MODE: &str = "USBMUXD_DEFAULT_DEVICE_MODE";

/// Shared handle to one device record. Records live on the USB thread only;
/// transfer contexts hold a clone, so a record cannot be freed while any of
/// its transfers is still in flight.
pub type DeviceRef = Rc<RefCell<UsbDevice>>;

/// The layer above the bulk stream. The core treats it as an opaque sink for
/// inbound bytes and a notifier of device arrival and removal.
pub trait DeviceLayer {
    /// Inbound bytes from a completed bulk-in transfer, in completion order.
    fn device_data_input(&self, dev: &DeviceRef, data: &[u8]);

    /// A device finished initialization and its read loops are about to
    /// start. An error refuses the device, which is disconnected on the spot.
    fn device_added(&self, dev: &DeviceRef) -> common::Result<()>;

    /// A device is gone, either reaped or reported by hotplug.
    fn device_removed(&self, dev: &DeviceRef);
}

pub type SharedDeviceLayer = Rc<dyn DeviceLayer>;
