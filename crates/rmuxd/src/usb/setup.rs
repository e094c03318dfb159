//! Mode negotiation and device initialization
//!
//! Each new device runs through a chain of asynchronous control transfers
//! before its bulk pipeline starts:
//!
//! GET_MODE -> (SET_MODE) -> GET_LANGID -> GET_SERIAL -> claim + RX loops
//!
//! The chain is a tagged-stage state machine dispatched from a single
//! completion callback. Old devices don't implement the mode requests at
//! all; any failure there simply continues initialization in the current
//! mode. Failures from GET_LANGID onward clear the device's liveness flag,
//! and the device stays gone until it is physically re-plugged.

use std::cell::RefCell;
use std::os::raw::{c_int, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;
use std::rc::Rc;

use rusb::constants::*;
use rusb::{ConfigDescriptor, Context, Device, Direction};
use rusb::ffi;
use tracing::{debug, error, info, trace, warn};

use crate::usb::device::{FALLBACK_MAX_PACKET, decode_string_descriptor, format_serial, speed_bits_per_sec};
use crate::usb::manager::{Registry, disconnect};
use crate::usb::transfers::{from_libusb, start_rx_loop};
use crate::usb::{
    APPLE_VEND_SPECIFIC_GET_MODE, APPLE_VEND_SPECIFIC_SET_MODE, CONTROL_TIMEOUT_MS, DeviceRef,
    ENV_DEVICE_MODE, INTERFACE_CLASS, INTERFACE_PROTOCOL, INTERFACE_SUBCLASS, NUM_RX_LOOPS,
    SharedDeviceLayer,
};

/// Size of the SETUP packet at the head of a control transfer buffer
const CONTROL_SETUP_SIZE: usize = 8;

/// wLength for the string-descriptor requests
const STRING_REQUEST_LEN: u16 = 1024;

/// Stages of the asynchronous setup chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetupStage {
    GetMode,
    SwitchMode,
    GetLangId,
    GetSerial,
}

/// Context carried by each in-flight setup transfer. It owns the transfer
/// buffer and keeps the record alive via its `DeviceRef` clone.
struct SetupContext {
    stage: SetupStage,
    dev: DeviceRef,
    usbdev: Device<Context>,
    registry: Rc<RefCell<Registry>>,
    sink: SharedDeviceLayer,
    default_mode: u8,
    buf: Vec<u8>,
}

impl SetupContext {
    fn ids(&self) -> (u8, u8) {
        let d = self.dev.borrow();
        (d.bus, d.address)
    }

    /// Response bytes of a completed control transfer.
    unsafe fn data(&self, xfer: *mut ffi::libusb_transfer) -> &[u8] {
        let capacity = self.buf.len().saturating_sub(CONTROL_SETUP_SIZE);
        let len = ((*xfer).actual_length as usize).min(capacity);
        &self.buf[CONTROL_SETUP_SIZE..CONTROL_SETUP_SIZE + len]
    }
}

/// Write the 8-byte SETUP packet at the head of a control buffer.
pub fn fill_control_setup(
    buf: &mut [u8],
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
) {
    buf[0] = request_type;
    buf[1] = request;
    buf[2..4].copy_from_slice(&value.to_le_bytes());
    buf[4..6].copy_from_slice(&index.to_le_bytes());
    buf[6..8].copy_from_slice(&length.to_le_bytes());
}

/// Parse a decimal mode in [1,5].
pub fn parse_mode(s: &str) -> Option<u8> {
    s.trim().parse::<u8>().ok().filter(|m| (1..=5).contains(m))
}

/// Desired mode from the environment, falling back to the configured default.
fn desired_mode(default_mode: u8) -> u8 {
    match std::env::var(ENV_DEVICE_MODE) {
        Ok(value) => parse_mode(&value).unwrap_or(default_mode),
        Err(_) => default_mode,
    }
}

/// Switch only when the desired mode is valid, the guess is confident, and
/// the two differ.
pub fn should_switch(desired: u8, guessed: u8) -> bool {
    (1..=5).contains(&desired) && guessed > 0 && guessed != desired
}

/// Interface class/subclass/protocol triple seen during a configuration scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceTriple {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// Guess the current mode from the configuration layout.
///
/// 0 = undetermined, 1 = initial, 2 = Valeria (H.265 capture), 3 = CDC-NCM,
/// 4 = USB Ethernet + CDC-NCM, 5 = CDC-NCM direct. Five configurations need
/// an inspection of configuration 5: the multiplex interface must be there,
/// together with either the Valeria or the CDC-NCM interface.
pub fn guess_mode(num_configurations: u8, config5: Option<&[InterfaceTriple]>) -> u8 {
    if num_configurations == 1 {
        return 5;
    }
    if num_configurations <= 4 {
        return 1;
    }
    if num_configurations == 6 {
        return 4;
    }
    if num_configurations != 5 {
        return 0;
    }
    let Some(triples) = config5 else {
        return 0;
    };
    let mut has_valeria = false;
    let mut has_cdc_ncm = false;
    let mut has_mux = false;
    for t in triples {
        if t.class == INTERFACE_CLASS && t.subclass == 42 && t.protocol == 255 {
            has_valeria = true;
        }
        if t.class == 2 && t.subclass == 0x0d {
            has_cdc_ncm = true;
        }
        if t.class == INTERFACE_CLASS
            && t.subclass == INTERFACE_SUBCLASS
            && t.protocol == INTERFACE_PROTOCOL
        {
            has_mux = true;
        }
    }
    if has_valeria && has_mux {
        return 2;
    }
    if has_cdc_ncm && has_mux {
        return 3;
    }
    0
}

/// Altsetting-0 interface triples of configuration 5, when the device has one.
fn config5_triples(usbdev: &Device<Context>, num_configurations: u8) -> Option<Vec<InterfaceTriple>> {
    for idx in 0..num_configurations {
        let Ok(config) = usbdev.config_descriptor(idx) else {
            continue;
        };
        if config.number() != 5 {
            continue;
        }
        let mut triples = Vec::new();
        for intf in config.interfaces() {
            if let Some(desc) = intf.descriptors().next() {
                triples.push(InterfaceTriple {
                    class: desc.class_code(),
                    subclass: desc.sub_class_code(),
                    protocol: desc.protocol_code(),
                });
            }
        }
        return Some(triples);
    }
    None
}

/// Kick off the asynchronous setup chain for a freshly opened device.
pub(crate) fn begin_setup(
    dev: &DeviceRef,
    usbdev: Device<Context>,
    registry: &Rc<RefCell<Registry>>,
    sink: &SharedDeviceLayer,
    default_mode: u8,
) -> Result<(), rusb::Error> {
    let (handle, bus, address) = {
        let d = dev.borrow();
        match d.raw_handle() {
            Some(h) => (h, d.bus, d.address),
            None => return Err(rusb::Error::NoDevice),
        }
    };
    info!("requesting current mode from device {}-{}", bus, address);
    let ctx = Box::new(SetupContext {
        stage: SetupStage::GetMode,
        dev: dev.clone(),
        usbdev,
        registry: registry.clone(),
        sink: sink.clone(),
        default_mode,
        buf: Vec::new(),
    });
    submit_vendor_specific(handle, ctx, APPLE_VEND_SPECIFIC_GET_MODE, 0, 0, 4)
}

/// Submit a vendor-specific IN control transfer to the device recipient. The
/// transfer carries the free-on-completion flag, so only the context needs
/// reclaiming in the callback.
fn submit_vendor_specific(
    handle: *mut ffi::libusb_device_handle,
    mut ctx: Box<SetupContext>,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
) -> Result<(), rusb::Error> {
    ctx.buf = vec![0u8; CONTROL_SETUP_SIZE + usize::from(length)];
    let request_type = LIBUSB_REQUEST_TYPE_VENDOR | LIBUSB_ENDPOINT_IN | LIBUSB_RECIPIENT_DEVICE;
    fill_control_setup(&mut ctx.buf, request_type, request, value, index, length);
    let buf_ptr = ctx.buf.as_mut_ptr();
    let buf_len = ctx.buf.len();
    unsafe {
        let xfer = ffi::libusb_alloc_transfer(0);
        if xfer.is_null() {
            return Err(rusb::Error::NoMem);
        }
        (*xfer).dev_handle = handle;
        (*xfer).endpoint = 0;
        (*xfer).transfer_type = LIBUSB_TRANSFER_TYPE_CONTROL;
        (*xfer).timeout = CONTROL_TIMEOUT_MS;
        (*xfer).flags = LIBUSB_TRANSFER_FREE_TRANSFER;
        (*xfer).buffer = buf_ptr;
        (*xfer).length = buf_len as c_int;
        (*xfer).actual_length = 0;
        (*xfer).callback = setup_callback;
        (*xfer).user_data = Box::into_raw(ctx) as *mut c_void;
        let res = ffi::libusb_submit_transfer(xfer);
        if res != 0 {
            drop(Box::from_raw((*xfer).user_data as *mut SetupContext));
            (*xfer).user_data = ptr::null_mut();
            ffi::libusb_free_transfer(xfer);
            return Err(from_libusb(res));
        }
    }
    Ok(())
}

/// Single dispatcher for every stage of the setup chain. The context box is
/// taken out of `user_data` on entry; stages that continue the chain put it
/// back by resubmitting.
extern "system" fn setup_callback(xfer: *mut ffi::libusb_transfer) {
    let result = catch_unwind(AssertUnwindSafe(|| unsafe {
        let ctx = Box::from_raw((*xfer).user_data as *mut SetupContext);
        (*xfer).user_data = ptr::null_mut();
        match ctx.stage {
            SetupStage::GetMode => on_get_mode(xfer, ctx),
            SetupStage::SwitchMode => on_switch_mode(xfer, ctx),
            SetupStage::GetLangId => on_langid(xfer, ctx),
            SetupStage::GetSerial => on_serial(xfer, ctx),
        }
    }));
    if result.is_err() {
        error!("panic in setup transfer callback");
    }
}

unsafe fn on_get_mode(xfer: *mut ffi::libusb_transfer, mut ctx: Box<SetupContext>) {
    let (bus, address) = ctx.ids();
    let status = (*xfer).status;
    if status != LIBUSB_TRANSFER_COMPLETED {
        // old devices never implemented this request
        error!(
            "failed to request mode for device {}-{} ({}), completing initialization in current mode",
            bus, address, status
        );
        complete_initialization(ctx);
        return;
    }

    let data = ctx.data(xfer);
    // the response is 3:3:3:0 in the initial mode, 5:3:3:0 otherwise
    info!(
        "got mode response {:?} for device {}-{}",
        &data[..data.len().min(4)],
        bus,
        address
    );

    let desired = desired_mode(ctx.default_mode);
    let num_configurations = ctx.dev.borrow().desc.num_configurations;
    let config5 = if num_configurations == 5 {
        config5_triples(&ctx.usbdev, num_configurations)
    } else {
        None
    };
    let guessed = guess_mode(num_configurations, config5.as_deref());

    if should_switch(desired, guessed) {
        warn!(
            "switching device {}-{} from mode {} to {}",
            bus, address, guessed, desired
        );
        let dev = ctx.dev.clone();
        let Some(handle) = dev.borrow().raw_handle() else {
            return;
        };
        ctx.stage = SetupStage::SwitchMode;
        if let Err(e) = submit_vendor_specific(
            handle,
            ctx,
            APPLE_VEND_SPECIFIC_SET_MODE,
            0,
            u16::from(desired),
            1,
        ) {
            warn!(
                "could not request mode switch to {} for device {}-{}: {}",
                desired, bus, address, e
            );
            dev.borrow_mut().alive = false;
        }
    } else {
        debug!(
            "keeping device {}-{} in mode {} (desired {})",
            bus, address, guessed, desired
        );
        complete_initialization(ctx);
    }
}

unsafe fn on_switch_mode(xfer: *mut ffi::libusb_transfer, ctx: Box<SetupContext>) {
    let (bus, address) = ctx.ids();
    let status = (*xfer).status;
    if status != LIBUSB_TRANSFER_COMPLETED {
        error!(
            "failed to request mode switch for device {}-{} ({}), completing initialization in current mode",
            bus, address, status
        );
    } else {
        let response = ctx.data(xfer).first().copied().unwrap_or(0);
        if response != 0 {
            info!(
                "unexpected response {} to mode switch for device {}-{}, completing initialization in current mode",
                response, bus, address
            );
        }
    }
    complete_initialization(ctx);
}

/// Select the multiplex configuration, claim the interface, and start the
/// string-descriptor chain. Runs synchronously from a negotiation callback.
fn complete_initialization(mut ctx: Box<SetupContext>) {
    let dev = ctx.dev.clone();
    let (bus, address) = ctx.ids();
    {
        let d = dev.borrow();
        if !d.alive || d.handle.is_none() {
            debug!("skipping initialization of dead device {}-{}", bus, address);
            return;
        }
    }

    if select_configuration(&ctx.usbdev, &dev).is_err() {
        dev.borrow_mut().alive = false;
        return;
    }

    let claim_result = {
        let d = dev.borrow();
        let iface = d.interface;
        d.handle.as_ref().map(|h| h.claim_interface(iface))
    };
    match claim_result {
        Some(Ok(())) => {}
        Some(Err(e)) => {
            let iface = dev.borrow().interface;
            warn!(
                "could not claim interface {} for device {}-{}: {}",
                iface, bus, address, e
            );
            dev.borrow_mut().alive = false;
            return;
        }
        None => {
            dev.borrow_mut().alive = false;
            return;
        }
    }

    let speed_bps = speed_bits_per_sec(ctx.usbdev.speed());
    {
        let mut d = dev.borrow_mut();
        d.speed_bps = speed_bps;
        info!(
            "using wMaxPacketSize={} for device {}-{}",
            d.max_packet_out, bus, address
        );
    }
    info!(
        "USB speed is {} MBit/s for device {}-{}",
        speed_bps / 1_000_000,
        bus,
        address
    );

    // string descriptor index 0 lists the language IDs the device supports
    ctx.stage = SetupStage::GetLangId;
    ctx.buf = vec![0u8; CONTROL_SETUP_SIZE + usize::from(STRING_REQUEST_LEN) + 8];
    fill_control_setup(
        &mut ctx.buf,
        LIBUSB_ENDPOINT_IN,
        LIBUSB_REQUEST_GET_DESCRIPTOR,
        u16::from(LIBUSB_DT_STRING) << 8,
        0,
        STRING_REQUEST_LEN,
    );
    let raw = dev.borrow().raw_handle();
    let Some(handle) = raw else {
        dev.borrow_mut().alive = false;
        return;
    };
    let buf_ptr = ctx.buf.as_mut_ptr();
    unsafe {
        let xfer = ffi::libusb_alloc_transfer(0);
        if xfer.is_null() {
            dev.borrow_mut().alive = false;
            return;
        }
        (*xfer).dev_handle = handle;
        (*xfer).endpoint = 0;
        (*xfer).transfer_type = LIBUSB_TRANSFER_TYPE_CONTROL;
        (*xfer).timeout = CONTROL_TIMEOUT_MS;
        (*xfer).flags = 0;
        (*xfer).buffer = buf_ptr;
        (*xfer).length = (CONTROL_SETUP_SIZE + usize::from(STRING_REQUEST_LEN)) as c_int;
        (*xfer).actual_length = 0;
        (*xfer).callback = setup_callback;
        (*xfer).user_data = Box::into_raw(ctx) as *mut c_void;
        let res = ffi::libusb_submit_transfer(xfer);
        if res != 0 {
            error!(
                "could not request language IDs from device {}-{}: {}",
                bus, address, res
            );
            drop(Box::from_raw((*xfer).user_data as *mut SetupContext));
            (*xfer).user_data = ptr::null_mut();
            ffi::libusb_free_transfer(xfer);
            dev.borrow_mut().alive = false;
        }
    }
}

unsafe fn on_langid(xfer: *mut ffi::libusb_transfer, mut ctx: Box<SetupContext>) {
    let (bus, address) = ctx.ids();
    let dev = ctx.dev.clone();
    let status = (*xfer).status;
    if status != LIBUSB_TRANSFER_COMPLETED || !dev.borrow().alive {
        error!(
            "failed to request language IDs for device {}-{} ({})",
            bus, address, status
        );
        ffi::libusb_free_transfer(xfer);
        dev.borrow_mut().alive = false;
        return;
    }
    let data = ctx.data(xfer);
    if data.len() < 4 {
        error!(
            "short language ID response ({} bytes) from device {}-{}",
            data.len(),
            bus,
            address
        );
        ffi::libusb_free_transfer(xfer);
        dev.borrow_mut().alive = false;
        return;
    }
    // the first supported language ID sits at bytes [2..4], little-endian
    let langid = u16::from_le_bytes([data[2], data[3]]);
    info!("got language ID {:#06x} for device {}-{}", langid, bus, address);

    // reuse the same transfer and buffer for the serial string
    let serial_index = dev.borrow().desc.serial_index;
    ctx.stage = SetupStage::GetSerial;
    fill_control_setup(
        &mut ctx.buf,
        LIBUSB_ENDPOINT_IN,
        LIBUSB_REQUEST_GET_DESCRIPTOR,
        (u16::from(LIBUSB_DT_STRING) << 8) | u16::from(serial_index),
        langid,
        STRING_REQUEST_LEN,
    );
    (*xfer).user_data = Box::into_raw(ctx) as *mut c_void;
    let res = ffi::libusb_submit_transfer(xfer);
    if res != 0 {
        error!(
            "could not request serial from device {}-{}: {}",
            bus, address, res
        );
        drop(Box::from_raw((*xfer).user_data as *mut SetupContext));
        (*xfer).user_data = ptr::null_mut();
        ffi::libusb_free_transfer(xfer);
        dev.borrow_mut().alive = false;
    }
}

unsafe fn on_serial(xfer: *mut ffi::libusb_transfer, ctx: Box<SetupContext>) {
    let (bus, address) = ctx.ids();
    let dev = ctx.dev.clone();
    let status = (*xfer).status;
    if status != LIBUSB_TRANSFER_COMPLETED || !dev.borrow().alive {
        error!(
            "failed to request serial for device {}-{} ({})",
            bus, address, status
        );
        ffi::libusb_free_transfer(xfer);
        dev.borrow_mut().alive = false;
        return;
    }

    let serial = format_serial(decode_string_descriptor(&ctx.buf[CONTROL_SETUP_SIZE..]));
    ffi::libusb_free_transfer(xfer);
    info!("got serial '{}' for device {}-{}", serial, bus, address);
    dev.borrow_mut().serial = serial;

    // publish upward; a refused device is torn down on the spot (its pools
    // are still empty, so this is not the deferred-teardown case)
    if ctx.sink.device_added(&dev).is_err() {
        info!("device {}-{} refused by the device layer", bus, address);
        disconnect(&ctx.registry, &dev);
        return;
    }

    // spin up the parallel read loops; one running loop is the floor
    let mut started = 0;
    for n in 0..NUM_RX_LOOPS {
        if let Err(e) = start_rx_loop(&dev, &ctx.sink) {
            warn!("failed to start RX loop {}: {}", n, e);
            break;
        }
        started += 1;
    }
    if started == 0 {
        error!("failed to start any RX loop for device {}-{}", bus, address);
        ctx.sink.device_removed(&dev);
        disconnect(&ctx.registry, &dev);
    } else if started < NUM_RX_LOOPS {
        warn!(
            "only {}/{} RX loops running for device {}-{}, read throughput may suffer",
            started, NUM_RX_LOOPS, bus, address
        );
    } else {
        trace!("all {} RX loops started for device {}-{}", NUM_RX_LOOPS, bus, address);
    }
}

struct EndpointSelection {
    interface: u8,
    ep_out: u8,
    ep_in: u8,
    max_packet_out: u16,
}

/// Look for the multiplex interface in one configuration. Matching class OR
/// subclass OR protocol is deliberately loose; firmware variants drift on
/// individual fields, and the two-bulk-endpoint requirement weeds out false
/// positives.
fn find_mux_interface(config: &ConfigDescriptor, bus: u8, address: u8) -> Option<EndpointSelection> {
    for intf in config.interfaces() {
        let Some(desc) = intf.descriptors().next() else {
            continue;
        };
        if desc.class_code() != INTERFACE_CLASS
            && desc.sub_class_code() != INTERFACE_SUBCLASS
            && desc.protocol_code() != INTERFACE_PROTOCOL
        {
            continue;
        }
        debug!(
            "found multiplex interface {} for device {}-{}",
            desc.interface_number(),
            bus,
            address
        );
        if desc.num_endpoints() != 2 {
            warn!(
                "endpoint count mismatch for interface {} of device {}-{}",
                desc.interface_number(),
                bus,
                address
            );
            continue;
        }
        let endpoints: Vec<_> = desc.endpoint_descriptors().collect();
        if endpoints.len() != 2 {
            continue;
        }
        let (out_ep, in_ep) = match (endpoints[0].direction(), endpoints[1].direction()) {
            (Direction::Out, Direction::In) => (&endpoints[0], &endpoints[1]),
            (Direction::In, Direction::Out) => (&endpoints[1], &endpoints[0]),
            _ => {
                warn!(
                    "endpoint direction mismatch for interface {} of device {}-{}",
                    desc.interface_number(),
                    bus,
                    address
                );
                continue;
            }
        };
        let max_packet = out_ep.max_packet_size();
        return Some(EndpointSelection {
            interface: desc.interface_number(),
            ep_out: out_ep.address(),
            ep_in: in_ep.address(),
            max_packet_out: if max_packet == 0 {
                FALLBACK_MAX_PACKET
            } else {
                max_packet
            },
        });
    }
    None
}

/// Find and activate the configuration exposing the multiplex endpoints,
/// recording the interface and endpoint addresses on the device.
fn select_configuration(usbdev: &Device<Context>, dev: &DeviceRef) -> Result<(), rusb::Error> {
    let (bus, address, num_configurations) = {
        let d = dev.borrow();
        (d.bus, d.address, d.desc.num_configurations)
    };

    let current = {
        let d = dev.borrow();
        let handle = d.handle.as_ref().ok_or(rusb::Error::NoDevice)?;
        match handle.active_configuration() {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "could not get current configuration for device {}-{}: {}",
                    bus, address, e
                );
                return Err(e);
            }
        }
    };

    let mut descriptors = Vec::new();
    for idx in 0..num_configurations {
        match usbdev.config_descriptor(idx) {
            Ok(config) => descriptors.push(config),
            Err(e) => debug!(
                "could not get configuration descriptor {} for device {}-{}: {}",
                idx, bus, address, e
            ),
        }
    }

    // bConfigurationValue is 1-based; prefer the highest configuration
    for value in (1..=num_configurations).rev() {
        let Some(config) = descriptors.iter().find(|c| c.number() == value) else {
            continue;
        };
        let Some(selection) = find_mux_interface(config, bus, address) else {
            continue;
        };
        info!(
            "found interface {} with endpoints {:02x}/{:02x} for device {}-{}",
            selection.interface, selection.ep_out, selection.ep_in, bus, address
        );

        if current == 0 {
            debug!("device {}-{} is unconfigured", bus, address);
        }
        if current == 0 || config.number() != current {
            info!(
                "changing configuration of device {}-{}: {} -> {}",
                bus, address, current, config.number()
            );
            let set_result = {
                let d = dev.borrow();
                let handle = d.handle.as_ref().ok_or(rusb::Error::NoDevice)?;
                // the kernel must let go of every interface first
                for intf in config.interfaces() {
                    let Some(intf_desc) = intf.descriptors().next() else {
                        continue;
                    };
                    let number = intf_desc.interface_number();
                    match handle.kernel_driver_active(number) {
                        Ok(true) => {
                            info!(
                                "detaching kernel driver from device {}-{} interface {}",
                                bus, address, number
                            );
                            if let Err(e) = handle.detach_kernel_driver(number) {
                                warn!(
                                    "could not detach kernel driver from interface {}, configuration change will probably fail: {}",
                                    number, e
                                );
                            }
                        }
                        Ok(false) => {}
                        Err(e) => debug!(
                            "could not check kernel ownership of interface {} for device {}-{}: {}",
                            number, bus, address, e
                        ),
                    }
                }
                handle.set_active_configuration(config.number())
            };
            if let Err(e) = set_result {
                warn!(
                    "could not set configuration {} for device {}-{}: {}",
                    config.number(),
                    bus,
                    address,
                    e
                );
                continue;
            }
        }

        let mut d = dev.borrow_mut();
        d.interface = selection.interface;
        d.ep_out = selection.ep_out;
        d.ep_in = selection.ep_in;
        d.max_packet_out = selection.max_packet_out;
        return Ok(());
    }

    warn!(
        "could not find a suitable USB interface for device {}-{}",
        bus, address
    );
    Err(rusb::Error::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MUX: InterfaceTriple = InterfaceTriple {
        class: INTERFACE_CLASS,
        subclass: INTERFACE_SUBCLASS,
        protocol: INTERFACE_PROTOCOL,
    };
    const VALERIA: InterfaceTriple = InterfaceTriple {
        class: INTERFACE_CLASS,
        subclass: 42,
        protocol: 255,
    };
    const CDC_NCM: InterfaceTriple = InterfaceTriple {
        class: 2,
        subclass: 0x0d,
        protocol: 0,
    };

    #[test]
    fn test_guess_by_configuration_count() {
        assert_eq!(guess_mode(1, None), 5);
        assert_eq!(guess_mode(2, None), 1);
        assert_eq!(guess_mode(3, None), 1);
        assert_eq!(guess_mode(4, None), 1);
        assert_eq!(guess_mode(6, None), 4);
        assert_eq!(guess_mode(7, None), 0);
    }

    #[test]
    fn test_guess_config5_valeria() {
        assert_eq!(guess_mode(5, Some(&[MUX, VALERIA])), 2);
    }

    #[test]
    fn test_guess_config5_cdc_ncm() {
        assert_eq!(guess_mode(5, Some(&[CDC_NCM, MUX])), 3);
    }

    #[test]
    fn test_guess_config5_valeria_wins_over_cdc_ncm() {
        assert_eq!(guess_mode(5, Some(&[MUX, VALERIA, CDC_NCM])), 2);
    }

    #[test]
    fn test_guess_config5_requires_mux_interface() {
        assert_eq!(guess_mode(5, Some(&[VALERIA, CDC_NCM])), 0);
        assert_eq!(guess_mode(5, Some(&[MUX])), 0);
        assert_eq!(guess_mode(5, Some(&[])), 0);
        assert_eq!(guess_mode(5, None), 0);
    }

    #[test]
    fn test_should_switch() {
        assert!(should_switch(1, 2));
        assert!(should_switch(3, 1));
        // guess failed
        assert!(!should_switch(1, 0));
        // already there
        assert!(!should_switch(2, 2));
        // desired out of range
        assert!(!should_switch(0, 2));
        assert!(!should_switch(6, 2));
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("1"), Some(1));
        assert_eq!(parse_mode("5"), Some(5));
        assert_eq!(parse_mode(" 3 "), Some(3));
        assert_eq!(parse_mode("0"), None);
        assert_eq!(parse_mode("6"), None);
        assert_eq!(parse_mode(""), None);
        assert_eq!(parse_mode("banana"), None);
        assert_eq!(parse_mode("-1"), None);
    }

    #[test]
    fn test_fill_control_setup_layout() {
        let mut buf = [0u8; 8];
        fill_control_setup(&mut buf, 0xc0, 0x45, 0x1234, 0xabcd, 4);
        assert_eq!(buf, [0xc0, 0x45, 0x34, 0x12, 0xcd, 0xab, 0x04, 0x00]);
    }

    #[test]
    fn test_get_mode_request_shape() {
        let mut buf = [0u8; 8];
        let request_type =
            LIBUSB_REQUEST_TYPE_VENDOR | LIBUSB_ENDPOINT_IN | LIBUSB_RECIPIENT_DEVICE;
        fill_control_setup(&mut buf, request_type, APPLE_VEND_SPECIFIC_GET_MODE, 0, 0, 4);
        assert_eq!(buf[0], 0xc0);
        assert_eq!(buf[1], 0x45);
        assert_eq!(u16::from_le_bytes([buf[6], buf[7]]), 4);
    }
}
