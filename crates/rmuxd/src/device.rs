//! Upper device layer
//!
//! The muxer-facing side of the USB core: republishes device lifecycle over
//! the bridge and accounts the inbound byte stream per device. Multiplex
//! framing would consume `device_data_input`; the daemon keeps that boundary
//! but only tracks volume.

use std::cell::RefCell;
use std::collections::HashMap;

use async_channel::Sender;
use common::{DeviceEntry, UsbEvent};
use tracing::{debug, trace, warn};

use crate::usb::{DeviceLayer, DeviceRef};

pub struct MuxDeviceLayer {
    event_tx: Sender<UsbEvent>,
    rx_bytes: RefCell<HashMap<u32, u64>>,
}

impl MuxDeviceLayer {
    pub fn new(event_tx: Sender<UsbEvent>) -> Self {
        Self {
            event_tx,
            rx_bytes: RefCell::new(HashMap::new()),
        }
    }

    fn entry_for(dev: &DeviceRef) -> DeviceEntry {
        let d = dev.borrow();
        DeviceEntry {
            serial: d.serial().unwrap_or_default().to_string(),
            location: d.location(),
            product_id: d.product_id(),
            speed_bps: d.speed(),
        }
    }
}

impl DeviceLayer for MuxDeviceLayer {
    fn device_data_input(&self, dev: &DeviceRef, data: &[u8]) {
        let location = dev.borrow().location();
        let mut counters = self.rx_bytes.borrow_mut();
        let total = counters.entry(location).or_insert(0);
        *total += data.len() as u64;
        trace!(
            "received {} bytes from device {:#010x} ({} total)",
            data.len(),
            location,
            total
        );
    }

    fn device_added(&self, dev: &DeviceRef) -> common::Result<()> {
        let entry = Self::entry_for(dev);
        debug!(
            "device {} at {:#010x} is ready",
            entry.serial, entry.location
        );
        self.rx_bytes.borrow_mut().insert(entry.location, 0);
        // a dead bridge means nobody is listening; refuse the device
        self.event_tx
            .send_blocking(UsbEvent::DeviceArrived { device: entry })
            .map_err(|e| common::Error::Channel(e.to_string()))
    }

    fn device_removed(&self, dev: &DeviceRef) {
        let location = dev.borrow().location();
        // removal can be reported twice (hotplug, then the reap) and also
        // for devices that never finished initialization
        let Some(total) = self.rx_bytes.borrow_mut().remove(&location) else {
            return;
        };
        debug!(
            "device {:#010x} removed after {} bytes received",
            location, total
        );
        if let Err(e) = self
            .event_tx
            .send_blocking(UsbEvent::DeviceRemoved { location })
        {
            warn!("failed to publish device removal: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::device::{DescriptorSnapshot, UsbDevice};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn record() -> DeviceRef {
        Rc::new(RefCell::new(UsbDevice::new(
            1,
            9,
            DescriptorSnapshot::default(),
            None,
        )))
    }

    #[test]
    fn test_data_input_accounts_bytes() {
        let (tx, _rx) = async_channel::bounded(4);
        let layer = MuxDeviceLayer::new(tx);
        let dev = record();

        layer.device_data_input(&dev, &[0u8; 100]);
        layer.device_data_input(&dev, &[0u8; 28]);

        let location = dev.borrow().location();
        assert_eq!(layer.rx_bytes.borrow().get(&location), Some(&128));
    }

    #[test]
    fn test_added_rejects_when_bridge_is_gone() {
        let (tx, rx) = async_channel::bounded(4);
        drop(rx);
        let layer = MuxDeviceLayer::new(tx);
        assert!(layer.device_added(&record()).is_err());
    }

    #[test]
    fn test_removed_publishes_event_once() {
        let (tx, rx) = async_channel::bounded(4);
        let layer = MuxDeviceLayer::new(tx);
        let dev = record();

        layer.device_added(&dev).unwrap();
        match rx.try_recv().unwrap() {
            UsbEvent::DeviceArrived { device } => {
                assert_eq!(device.location, dev.borrow().location());
            }
            other => panic!("unexpected event: {:?}", other),
        }

        layer.device_removed(&dev);
        match rx.try_recv().unwrap() {
            UsbEvent::DeviceRemoved { location } => {
                assert_eq!(location, dev.borrow().location());
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // a second report of the same device publishes nothing
        layer.device_removed(&dev);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_removed_without_added_is_silent() {
        let (tx, rx) = async_channel::bounded(4);
        let layer = MuxDeviceLayer::new(tx);
        layer.device_removed(&record());
        assert!(rx.try_recv().is_err());
    }
}
