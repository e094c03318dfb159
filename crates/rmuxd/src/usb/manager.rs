//! Device registry, discovery, hotplug, and the event pump
//!
//! A single `UsbManager` owns the libusb context and the registry of device
//! records. All of its methods, and every libusb callback they trigger, run
//! on the USB worker thread; the only cross-thread structure is the pending
//! hotplug queue, which the libusb callback fills and the pump drains.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rusb::ffi;
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use tracing::{debug, error, info, trace, warn};

use crate::usb::device::{DescriptorSnapshot, UsbDevice, split_location};
use crate::usb::{
    DEVICE_POLL_TIME_MS, DeviceRef, PID_APPLE_SILICON_RESTORE_LOW, PID_APPLE_SILICON_RESTORE_MAX,
    PID_APPLE_T2_COPROCESSOR, PID_RANGE_LOW, PID_RANGE_MAX, SharedDeviceLayer, VID_APPLE, setup,
    transfers,
};

/// Consecutive enumeration failures tolerated before the poll loop gives up
const MAX_DEVLIST_FAILURES: u32 = 5;

/// How long a disconnect waits for cancellations, in 1 ms event slices
const DISCONNECT_TIMEOUT_MS: u32 = 100;

/// Effective "never" returned by the timeout query while polling is disabled
const POLL_DISABLED_MS: u64 = 100_000;

/// Ordered set of device records keyed by (bus, address).
#[derive(Default)]
pub struct Registry {
    devices: Vec<DeviceRef>,
}

impl Registry {
    pub fn find(&self, bus: u8, address: u8) -> Option<DeviceRef> {
        self.devices
            .iter()
            .find(|dev| {
                let d = dev.borrow();
                d.bus == bus && d.address == address
            })
            .cloned()
    }

    /// Insert at the tail unless a record with the same key exists.
    pub fn insert(&mut self, dev: DeviceRef) -> bool {
        let (bus, address) = {
            let d = dev.borrow();
            (d.bus, d.address)
        };
        if self.find(bus, address).is_some() {
            return false;
        }
        self.devices.push(dev);
        true
    }

    pub fn remove(&mut self, bus: u8, address: u8) {
        self.devices.retain(|dev| {
            let d = dev.borrow();
            d.bus != bus || d.address != address
        });
    }

    pub fn mark_all_dead(&self) {
        for dev in &self.devices {
            dev.borrow_mut().alive = false;
        }
    }

    pub fn snapshot(&self) -> Vec<DeviceRef> {
        self.devices.clone()
    }

    pub fn dead(&self) -> Vec<DeviceRef> {
        self.devices
            .iter()
            .filter(|dev| !dev.borrow().alive)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

enum HotplugEvent {
    Arrived(Device<Context>),
    Left { bus: u8, address: u8 },
}

type PendingHotplug = Arc<Mutex<Vec<HotplugEvent>>>;

/// libusb may fire hotplug callbacks from inside `handle_events`, where no
/// blocking call is allowed; the callback therefore only queues the event
/// and the pump applies it on the next wake.
struct HotplugQueue {
    pending: PendingHotplug,
}

impl Hotplug<Context> for HotplugQueue {
    fn device_arrived(&mut self, device: Device<Context>) {
        trace!(
            "hotplug: device arrived at {}-{}",
            device.bus_number(),
            device.address()
        );
        self.pending.lock().unwrap().push(HotplugEvent::Arrived(device));
    }

    fn device_left(&mut self, device: Device<Context>) {
        trace!(
            "hotplug: device left at {}-{}",
            device.bus_number(),
            device.address()
        );
        self.pending.lock().unwrap().push(HotplugEvent::Left {
            bus: device.bus_number(),
            address: device.address(),
        });
    }
}

/// Apple product IDs that speak the multiplex protocol.
fn is_mux_product(pid: u16) -> bool {
    pid == PID_APPLE_T2_COPROCESSOR
        || (PID_APPLE_SILICON_RESTORE_LOW..=PID_APPLE_SILICON_RESTORE_MAX).contains(&pid)
        || (PID_RANGE_LOW..=PID_RANGE_MAX).contains(&pid)
}

/// Consecutive-failure accounting for the enumeration path. True means this
/// failure is the one that escalates.
fn record_devlist_failure(failures: &mut u32) -> bool {
    *failures += 1;
    *failures >= MAX_DEVLIST_FAILURES
}

/// Pick the effective pump timeout from the poll deadline and libusb's own
/// next-timeout report.
fn effective_timeout(poll_remain_ms: u64, libusb_ms: Option<u64>) -> u64 {
    match libusb_ms {
        Some(ms) if ms < poll_remain_ms => ms,
        _ => poll_remain_ms,
    }
}

pub struct UsbManager {
    context: Context,
    registry: Rc<RefCell<Registry>>,
    sink: SharedDeviceLayer,
    default_mode: u8,
    /// Fallback enumeration runs only while this is set
    polling: bool,
    /// Gates device-add handling of hotplug arrivals
    hotplug_add: bool,
    next_poll: Instant,
    devlist_failures: u32,
    pending: PendingHotplug,
    _hotplug_registration: Option<Registration<Context>>,
}

impl UsbManager {
    /// Initialize libusb, register for hotplug events when the library
    /// supports them, and run the first enumeration otherwise. A library
    /// init failure is fatal to the caller.
    pub fn new(sink: SharedDeviceLayer, default_mode: u8) -> Result<Self, rusb::Error> {
        let context = Context::new()?;
        let version = rusb::version();
        info!(
            "using libusb {}.{}.{}",
            version.major(),
            version.minor(),
            version.micro()
        );

        let mut manager = Self {
            context,
            registry: Rc::new(RefCell::new(Registry::default())),
            sink,
            default_mode,
            polling: true,
            hotplug_add: true,
            next_poll: Instant::now(),
            devlist_failures: 0,
            pending: Arc::new(Mutex::new(Vec::new())),
            _hotplug_registration: None,
        };

        if rusb::has_hotplug() {
            info!("registering for hotplug events");
            let queue = HotplugQueue {
                pending: Arc::clone(&manager.pending),
            };
            match HotplugBuilder::new()
                .vendor_id(VID_APPLE)
                .enumerate(true)
                .register(&manager.context, Box::new(queue))
            {
                Ok(registration) => {
                    manager._hotplug_registration = Some(registration);
                    manager.polling = false;
                }
                Err(e) => error!("could not register for hotplug events: {}", e),
            }
        } else {
            error!("libusb does not support hotplug events");
        }

        if manager.polling {
            manager.discover()?;
        }

        Ok(manager)
    }

    /// Summaries of every device that completed initialization.
    pub fn list_devices(&self) -> Vec<common::DeviceEntry> {
        self.registry
            .borrow()
            .snapshot()
            .iter()
            .filter_map(|dev| {
                let d = dev.borrow();
                let serial = d.serial()?;
                if serial.is_empty() {
                    return None;
                }
                Some(common::DeviceEntry {
                    serial: serial.to_string(),
                    location: d.location(),
                    product_id: d.product_id(),
                    speed_bps: d.speed(),
                })
            })
            .collect()
    }

    pub fn find_by_location(&self, location: u32) -> Option<DeviceRef> {
        let (bus, address) = split_location(location);
        self.registry.borrow().find(bus, address)
    }

    /// Queue outbound payload bytes for the device at `location`.
    pub fn send(&self, location: u32, data: Vec<u8>) -> Result<(), rusb::Error> {
        let dev = self
            .find_by_location(location)
            .ok_or(rusb::Error::NoDevice)?;
        transfers::send(&dev, data)
    }

    /// Gate both the polling loop and hotplug add handling.
    pub fn autodiscover(&mut self, enable: bool) {
        debug!("device polling enable: {}", enable);
        self.polling = enable;
        self.hotplug_add = enable;
    }

    fn poll_remaining(&self) -> Duration {
        if !self.polling {
            return Duration::from_millis(POLL_DISABLED_MS);
        }
        self.next_poll.saturating_duration_since(Instant::now())
    }

    fn schedule_next_poll(&mut self) {
        self.next_poll = Instant::now() + Duration::from_millis(DEVICE_POLL_TIME_MS);
    }

    /// Milliseconds until the pump next needs to run: the poll deadline or
    /// libusb's internal timeout, whichever is closer.
    pub fn get_timeout(&self) -> u64 {
        let poll_remain = self.poll_remaining().as_millis() as u64;
        effective_timeout(poll_remain, self.libusb_next_timeout())
    }

    fn libusb_next_timeout(&self) -> Option<u64> {
        let mut tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        let res = unsafe { ffi::libusb_get_next_timeout(self.context.as_raw(), &mut tv) };
        match res {
            1 => Some(tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000),
            0 => None,
            _ => {
                error!("libusb_get_next_timeout failed: {}", res);
                None
            }
        }
    }

    /// File descriptors the owning loop must include in its poll set, with
    /// their event masks.
    pub fn get_fds(&self) -> Vec<(std::os::raw::c_int, i16)> {
        let mut fds = Vec::new();
        unsafe {
            let list = ffi::libusb_get_pollfds(self.context.as_raw());
            if list.is_null() {
                error!("libusb_get_pollfds failed");
                return fds;
            }
            let mut entry = list;
            while !(*entry).is_null() {
                fds.push(((**entry).fd, (**entry).events));
                entry = entry.add(1);
            }
            ffi::libusb_free_pollfds(list);
        }
        fds
    }

    /// One cooperative pump step: dispatch pending events without blocking,
    /// apply queued hotplug events, reap the dead, and run a due enumeration.
    pub fn process(&mut self) -> Result<(), rusb::Error> {
        self.context.handle_events(Some(Duration::ZERO))?;
        self.drain_hotplug();
        self.reap_dead_devices();
        if self.poll_remaining().is_zero() {
            self.discover()?;
        }
        Ok(())
    }

    /// Pump events for up to `ms` milliseconds, reaping after each wake.
    pub fn process_for(&mut self, ms: u64) -> Result<(), rusb::Error> {
        let deadline = Instant::now() + Duration::from_millis(ms);
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            self.context.handle_events(Some(left))?;
            self.drain_hotplug();
            self.reap_dead_devices();
        }
        Ok(())
    }

    fn drain_hotplug(&mut self) {
        let events: Vec<HotplugEvent> = std::mem::take(&mut *self.pending.lock().unwrap());
        for event in events {
            match event {
                HotplugEvent::Arrived(device) => {
                    if self.hotplug_add {
                        self.device_add(&device);
                    }
                }
                HotplugEvent::Left { bus, address } => {
                    let found = self.registry.borrow().find(bus, address);
                    if let Some(dev) = found {
                        dev.borrow_mut().alive = false;
                        self.sink.device_removed(&dev);
                    }
                }
            }
        }
    }

    /// Tear down every record whose liveness was cleared since the last pass.
    fn reap_dead_devices(&mut self) {
        let dead = self.registry.borrow().dead();
        for dev in dead {
            {
                let d = dev.borrow();
                debug!("reaping device {}-{}", d.bus, d.address);
            }
            self.sink.device_removed(&dev);
            disconnect(&self.registry, &dev);
        }
    }

    /// Consider one enumerated device: filter, open, record, and start the
    /// mode query. Returns whether the device is a live muxer candidate.
    fn device_add(&mut self, device: &Device<Context>) -> bool {
        let bus = device.bus_number();
        let address = device.address();

        let existing = self.registry.borrow().find(bus, address);
        if let Some(dev) = existing {
            dev.borrow_mut().alive = true;
            return true;
        }

        let desc = match device.device_descriptor() {
            Ok(d) => d,
            Err(e) => {
                warn!(
                    "could not get device descriptor for device {}-{}: {}",
                    bus, address, e
                );
                return false;
            }
        };
        if desc.vendor_id() != VID_APPLE || !is_mux_product(desc.product_id()) {
            return false;
        }

        let snapshot = DescriptorSnapshot {
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            num_configurations: desc.num_configurations(),
            serial_index: desc.serial_number_string_index().unwrap_or(0),
        };
        info!(
            "found new device with v/p {:04x}:{:04x} at {}-{}",
            snapshot.vendor_id, snapshot.product_id, bus, address
        );

        // must stay non-blocking: this can run right after a hotplug arrival
        let handle = match device.open() {
            Ok(h) => h,
            Err(e) => {
                warn!("could not open device {}-{}: {}", bus, address, e);
                return false;
            }
        };
        let dev: DeviceRef = Rc::new(RefCell::new(UsbDevice::new(
            bus,
            address,
            snapshot,
            Some(handle),
        )));
        if !self.registry.borrow_mut().insert(dev.clone()) {
            return true;
        }

        if let Err(e) = setup::begin_setup(
            &dev,
            device.clone(),
            &self.registry,
            &self.sink,
            self.default_mode,
        ) {
            warn!(
                "could not request current mode from device {}-{}: {}",
                bus, address, e
            );
            dev.borrow_mut().alive = false;
            return false;
        }
        true
    }

    /// One enumeration pass: mark-and-sweep the registry against the bus.
    /// Transient list failures return 0 devices; the fifth consecutive one
    /// surfaces the library error to the caller.
    pub fn discover(&mut self) -> Result<usize, rusb::Error> {
        let devices = match self.context.devices() {
            Ok(list) => list,
            Err(e) => {
                // enumeration right after an unplug fails now and then
                warn!("could not get device list: {}", e);
                if record_devlist_failure(&mut self.devlist_failures) {
                    error!("too many consecutive errors getting the device list");
                    return Err(e);
                }
                self.schedule_next_poll();
                return Ok(0);
            }
        };
        self.devlist_failures = 0;

        trace!("discover: scanning {} devices", devices.len());
        self.registry.borrow().mark_all_dead();
        let mut valid = 0;
        for device in devices.iter() {
            if self.device_add(&device) {
                valid += 1;
            }
        }
        self.reap_dead_devices();
        self.schedule_next_poll();
        Ok(valid)
    }

    /// Deregister hotplug and tear down every device. The registry is empty
    /// afterwards and no transfer is left in flight.
    pub fn shutdown(&mut self) {
        debug!("usb shutdown, {} device(s) attached", self.registry.borrow().len());
        self._hotplug_registration = None;
        let all = self.registry.borrow().snapshot();
        for dev in all {
            self.sink.device_removed(&dev);
            disconnect(&self.registry, &dev);
        }
    }
}

/// Tear one device down: cancel its transfers, give the cancellations a
/// bounded window to complete, force-free whatever is left, release the
/// interface, close the handle, and drop the record from the registry.
///
/// Never called from a transfer callback; those clear the liveness flag and
/// let the reap pass get here, because the library still references the
/// transfer while the callback runs.
pub(crate) fn disconnect(registry: &Rc<RefCell<Registry>>, dev: &DeviceRef) {
    let context = {
        let d = dev.borrow();
        let Some(handle) = d.handle.as_ref() else {
            return;
        };
        handle.context().clone()
    };

    {
        let d = dev.borrow();
        debug!(
            "disconnecting device {}-{}: cancelling {} RX and {} TX transfers",
            d.bus,
            d.address,
            d.rx_xfers.len(),
            d.tx_xfers.len()
        );
        d.rx_xfers.cancel_all();
        d.tx_xfers.cancel_all();
    }

    // drive completions in 1 ms slices; libusb occasionally loses a
    // cancellation completion and an unbounded wait would hang the daemon
    let mut iterations = 0;
    while iterations < DISCONNECT_TIMEOUT_MS {
        let pending = {
            let d = dev.borrow();
            d.rx_xfers.len() + d.tx_xfers.len()
        };
        if pending == 0 {
            break;
        }
        if let Err(e) = context.handle_events(Some(Duration::from_millis(1))) {
            error!("event handling during disconnect failed: {}", e);
            break;
        }
        iterations += 1;
    }

    let (bus, address) = {
        let mut d = dev.borrow_mut();
        if !d.rx_xfers.is_empty() || !d.tx_xfers.is_empty() {
            warn!(
                "device {}-{} still has transfers pending after {} ms, forcing cleanup",
                d.bus, d.address, DISCONNECT_TIMEOUT_MS
            );
            d.rx_xfers.force_clear();
            d.tx_xfers.force_clear();
        }
        let interface = d.interface;
        if let Some(handle) = d.handle.take() {
            if let Err(e) = handle.release_interface(interface) {
                debug!("could not release interface {}: {}", interface, e);
            }
        }
        (d.bus, d.address)
    };
    registry.borrow_mut().remove(bus, address);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::device::{DescriptorSnapshot, UsbDevice, location};

    fn record(bus: u8, address: u8) -> DeviceRef {
        Rc::new(RefCell::new(UsbDevice::new(
            bus,
            address,
            DescriptorSnapshot::default(),
            None,
        )))
    }

    #[test]
    fn test_registry_insert_and_find() {
        let mut registry = Registry::default();
        assert!(registry.is_empty());
        assert!(registry.insert(record(1, 4)));
        assert!(registry.insert(record(1, 5)));
        assert_eq!(registry.len(), 2);

        assert!(registry.find(1, 4).is_some());
        assert!(registry.find(1, 5).is_some());
        assert!(registry.find(2, 4).is_none());
    }

    #[test]
    fn test_registry_rejects_duplicate_key() {
        let mut registry = Registry::default();
        assert!(registry.insert(record(3, 9)));
        assert!(!registry.insert(record(3, 9)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_remove() {
        let mut registry = Registry::default();
        registry.insert(record(1, 4));
        registry.insert(record(2, 6));
        registry.remove(1, 4);
        assert!(registry.find(1, 4).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_mark_and_sweep_bookkeeping() {
        let mut registry = Registry::default();
        registry.insert(record(1, 4));
        registry.insert(record(1, 5));
        assert!(registry.dead().is_empty());

        registry.mark_all_dead();
        assert_eq!(registry.dead().len(), 2);

        // re-asserting liveness rescues a record from the sweep
        if let Some(dev) = registry.find(1, 4) {
            dev.borrow_mut().alive = true;
        }
        assert_eq!(registry.dead().len(), 1);
    }

    #[test]
    fn test_mux_product_filter() {
        assert!(is_mux_product(PID_APPLE_T2_COPROCESSOR));
        assert!(is_mux_product(PID_RANGE_LOW));
        assert!(is_mux_product(0x12a8));
        assert!(is_mux_product(PID_RANGE_MAX));
        assert!(is_mux_product(PID_APPLE_SILICON_RESTORE_LOW));
        assert!(is_mux_product(PID_APPLE_SILICON_RESTORE_MAX));

        assert!(!is_mux_product(0x128f));
        assert!(!is_mux_product(0x12b0));
        assert!(!is_mux_product(0x1900));
        assert!(!is_mux_product(0x1906));
        assert!(!is_mux_product(0x0000));
    }

    #[test]
    fn test_devlist_failure_escalation() {
        let mut failures = 0;
        for _ in 0..4 {
            assert!(!record_devlist_failure(&mut failures));
        }
        assert!(record_devlist_failure(&mut failures));
    }

    #[test]
    fn test_effective_timeout() {
        assert_eq!(effective_timeout(1000, None), 1000);
        assert_eq!(effective_timeout(1000, Some(20)), 20);
        assert_eq!(effective_timeout(15, Some(700)), 15);
        assert_eq!(effective_timeout(POLL_DISABLED_MS, None), POLL_DISABLED_MS);
    }

    #[test]
    fn test_location_lookup_key() {
        let loc = location(2, 7);
        assert_eq!(split_location(loc), (2, 7));
    }

    // Needs a working libusb; skipped wherever the context cannot be created.
    #[test]
    fn test_manager_smoke() {
        struct NullLayer;
        impl crate::usb::DeviceLayer for NullLayer {
            fn device_data_input(&self, _dev: &DeviceRef, _data: &[u8]) {}
            fn device_added(&self, _dev: &DeviceRef) -> common::Result<()> {
                Ok(())
            }
            fn device_removed(&self, _dev: &DeviceRef) {}
        }

        match UsbManager::new(Rc::new(NullLayer), 1) {
            Ok(mut manager) => {
                assert!(manager.get_timeout() <= POLL_DISABLED_MS);
                let _ = manager.process();
                manager.shutdown();
                assert!(manager.registry.borrow().is_empty());
            }
            Err(e) => {
                eprintln!("skipping manager smoke test, no usable libusb context: {}", e);
            }
        }
    }
}
