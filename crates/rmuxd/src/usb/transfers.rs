//! Asynchronous bulk-transfer pipeline
//!
//! rusb's safe API only offers synchronous transfers, so the continuous
//! read/write pipeline goes through libusb's async API via `rusb::ffi`:
//! transfers are allocated raw, carry a boxed context in `user_data`, and
//! complete in `extern "system"` callbacks dispatched from `handle_events`.
//!
//! Every transfer belongs to exactly one pool from submission until its
//! terminal callback removes and frees it. Callbacks run on the USB thread;
//! on failure they clear the device's liveness flag and leave teardown to
//! the reap pass.

use std::os::raw::{c_int, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;

use rusb::constants::*;
use rusb::ffi;
use tracing::{debug, error, info, trace, warn};

use crate::usb::{DeviceRef, SharedDeviceLayer, USB_MRU};

/// Unordered set of in-flight transfers owned by one device.
#[derive(Default)]
pub struct TransferPool {
    xfers: Vec<*mut ffi::libusb_transfer>,
}

impl TransferPool {
    pub(crate) fn add(&mut self, xfer: *mut ffi::libusb_transfer) {
        self.xfers.push(xfer);
    }

    pub(crate) fn remove(&mut self, xfer: *mut ffi::libusb_transfer) {
        self.xfers.retain(|p| *p != xfer);
    }

    pub(crate) fn len(&self) -> usize {
        self.xfers.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.xfers.is_empty()
    }

    /// Ask libusb to cancel everything in flight. Completions arrive later
    /// through the normal callbacks with a cancelled status.
    pub(crate) fn cancel_all(&self) {
        for &xfer in &self.xfers {
            unsafe {
                ffi::libusb_cancel_transfer(xfer);
            }
        }
    }

    /// Free transfers whose cancellation never completed, reclaiming their
    /// context buffers, and leave the pool empty. Only valid once the device
    /// is being torn down and no more completions are expected.
    pub(crate) fn force_clear(&mut self) {
        for &xfer in &self.xfers {
            unsafe {
                drop_context(xfer);
                ffi::libusb_free_transfer(xfer);
            }
        }
        self.xfers.clear();
    }
}

/// Context attached to each bulk transfer. The `DeviceRef` clone keeps the
/// record alive for as long as the transfer exists.
struct BulkContext {
    dev: DeviceRef,
    /// Present on read transfers only
    sink: Option<SharedDeviceLayer>,
    buf: Vec<u8>,
}

/// Reclaim the boxed context of a transfer, if any.
unsafe fn drop_context(xfer: *mut ffi::libusb_transfer) {
    let user_data = (*xfer).user_data;
    if !user_data.is_null() {
        drop(Box::from_raw(user_data as *mut BulkContext));
        (*xfer).user_data = ptr::null_mut();
    }
}

unsafe fn fill_bulk(
    xfer: *mut ffi::libusb_transfer,
    handle: *mut ffi::libusb_device_handle,
    endpoint: u8,
    buf: *mut u8,
    length: c_int,
    callback: ffi::libusb_transfer_cb_fn,
    user_data: *mut c_void,
) {
    (*xfer).dev_handle = handle;
    (*xfer).endpoint = endpoint;
    (*xfer).transfer_type = LIBUSB_TRANSFER_TYPE_BULK;
    // bulk transfers never time out; the host stack is the only flow control
    (*xfer).timeout = 0;
    (*xfer).flags = 0;
    (*xfer).buffer = buf;
    (*xfer).length = length;
    (*xfer).actual_length = 0;
    (*xfer).callback = callback;
    (*xfer).user_data = user_data;
}

fn log_transfer_status(direction: &str, bus: u8, address: u8, status: c_int) {
    match status {
        LIBUSB_TRANSFER_ERROR => {
            // also what a disconnect mid-transfer sometimes looks like
            info!(
                "device {}-{} {} aborted due to error or disconnect",
                bus, address, direction
            );
        }
        LIBUSB_TRANSFER_TIMED_OUT => {
            error!("{} transfer timed out for device {}-{}", direction, bus, address);
        }
        LIBUSB_TRANSFER_CANCELLED => {
            debug!("device {}-{} {} transfer cancelled", bus, address, direction);
        }
        LIBUSB_TRANSFER_STALL => {
            error!("{} transfer stalled for device {}-{}", direction, bus, address);
        }
        LIBUSB_TRANSFER_NO_DEVICE => {
            info!("device {}-{} {} aborted due to disconnect", bus, address, direction);
        }
        LIBUSB_TRANSFER_OVERFLOW => {
            error!("{} transfer overflow for device {}-{}", direction, bus, address);
        }
        _ => {
            error!(
                "unexpected {} transfer status {} for device {}-{}",
                direction, status, bus, address
            );
        }
    }
}

/// Terminal path shared by both callbacks: drop the pool entry, reclaim the
/// context and the transfer, and optionally schedule the device for reaping.
unsafe fn finish_bulk(xfer: *mut ffi::libusb_transfer, dev: &DeviceRef, rx: bool, mark_dead: bool) {
    {
        let mut d = dev.borrow_mut();
        if rx {
            d.rx_xfers.remove(xfer);
        } else {
            d.tx_xfers.remove(xfer);
        }
        if mark_dead {
            d.alive = false;
        }
    }
    drop_context(xfer);
    ffi::libusb_free_transfer(xfer);
}

/// Completion of a write. Tearing the device down here would free state the
/// library is still walking, so failures only clear the liveness flag.
extern "system" fn tx_callback(xfer: *mut ffi::libusb_transfer) {
    let result = catch_unwind(AssertUnwindSafe(|| unsafe {
        let ctx = (*xfer).user_data as *mut BulkContext;
        let dev = (*ctx).dev.clone();
        let status = (*xfer).status;
        let (bus, address) = {
            let d = dev.borrow();
            (d.bus, d.address)
        };
        trace!(
            "TX callback dev {}-{} len {} -> {} status {}",
            bus,
            address,
            (*xfer).length,
            (*xfer).actual_length,
            status
        );
        let failed = status != LIBUSB_TRANSFER_COMPLETED;
        if failed {
            log_transfer_status("TX", bus, address, status);
        }
        finish_bulk(xfer, &dev, false, failed);
    }));
    if result.is_err() {
        error!("panic in TX transfer callback");
    }
}

/// Completion of a read. Success hands the bytes to the device layer and
/// resubmits the same transfer, reusing its buffer; anything else ends this
/// read loop and schedules the device for reaping.
extern "system" fn rx_callback(xfer: *mut ffi::libusb_transfer) {
    let result = catch_unwind(AssertUnwindSafe(|| unsafe {
        let ctx = (*xfer).user_data as *mut BulkContext;
        let dev = (*ctx).dev.clone();
        let sink = (*ctx).sink.clone();
        let buf_len = (*ctx).buf.len();
        let status = (*xfer).status;
        let (bus, address) = {
            let d = dev.borrow();
            (d.bus, d.address)
        };
        trace!(
            "RX callback dev {}-{} len {} status {}",
            bus,
            address,
            (*xfer).actual_length,
            status
        );
        if status == LIBUSB_TRANSFER_COMPLETED {
            let len = ((*xfer).actual_length as usize).min(buf_len);
            if let Some(sink) = sink {
                let data = std::slice::from_raw_parts((*xfer).buffer as *const u8, len);
                sink.device_data_input(&dev, data);
            }
            if ffi::libusb_submit_transfer(xfer) != 0 {
                warn!("failed to resubmit RX transfer for device {}-{}", bus, address);
                finish_bulk(xfer, &dev, true, true);
            }
        } else {
            log_transfer_status("RX", bus, address, status);
            finish_bulk(xfer, &dev, true, true);
        }
    }));
    if result.is_err() {
        error!("panic in RX transfer callback");
    }
}

/// Bulk-out writes that fill every packet need a zero-length terminator.
pub fn needs_zlp(len: usize, max_packet: usize) -> bool {
    max_packet != 0 && len % max_packet == 0
}

fn submit_tx(dev: &DeviceRef, mut buf: Vec<u8>, length: usize) -> Result<(), rusb::Error> {
    let (handle, ep_out, bus, address) = {
        let d = dev.borrow();
        match d.raw_handle() {
            Some(h) => (h, d.ep_out, d.bus, d.address),
            None => return Err(rusb::Error::NoDevice),
        }
    };
    let buf_ptr = buf.as_mut_ptr();
    let ctx = Box::new(BulkContext {
        dev: dev.clone(),
        sink: None,
        buf,
    });
    unsafe {
        let xfer = ffi::libusb_alloc_transfer(0);
        if xfer.is_null() {
            return Err(rusb::Error::NoMem);
        }
        fill_bulk(
            xfer,
            handle,
            ep_out,
            buf_ptr,
            length as c_int,
            tx_callback,
            Box::into_raw(ctx) as *mut c_void,
        );
        let res = ffi::libusb_submit_transfer(xfer);
        if res != 0 {
            error!(
                "failed to submit TX transfer of {} bytes to device {}-{}: {}",
                length, bus, address, res
            );
            drop_context(xfer);
            ffi::libusb_free_transfer(xfer);
            return Err(from_libusb(res));
        }
        dev.borrow_mut().tx_xfers.add(xfer);
    }
    Ok(())
}

/// Queue payload bytes on the device's bulk-out endpoint.
///
/// A payload that is an exact multiple of the endpoint's max packet size is
/// followed by a zero-length packet so the device sees the boundary. The ZLP
/// rides its own transfer; if only the ZLP fails, the primary submission
/// stands and the error is reported to the caller.
pub fn send(dev: &DeviceRef, data: Vec<u8>) -> Result<(), rusb::Error> {
    let length = data.len();
    let max_packet = usize::from(dev.borrow().max_packet_out);
    submit_tx(dev, data, length)?;
    if needs_zlp(length, max_packet) {
        debug!("sending ZLP");
        submit_tx(dev, vec![0u8; 1], 0)?;
    }
    Ok(())
}

/// Post one persistent read on the bulk-in endpoint. The transfer resubmits
/// itself from its completion callback until an error or cancellation ends
/// the loop.
pub fn start_rx_loop(dev: &DeviceRef, sink: &SharedDeviceLayer) -> Result<(), rusb::Error> {
    let (handle, ep_in, bus, address) = {
        let d = dev.borrow();
        match d.raw_handle() {
            Some(h) => (h, d.ep_in, d.bus, d.address),
            None => return Err(rusb::Error::NoDevice),
        }
    };
    let mut buf = vec![0u8; USB_MRU];
    let buf_ptr = buf.as_mut_ptr();
    let ctx = Box::new(BulkContext {
        dev: dev.clone(),
        sink: Some(sink.clone()),
        buf,
    });
    unsafe {
        let xfer = ffi::libusb_alloc_transfer(0);
        if xfer.is_null() {
            return Err(rusb::Error::NoMem);
        }
        fill_bulk(
            xfer,
            handle,
            ep_in,
            buf_ptr,
            USB_MRU as c_int,
            rx_callback,
            Box::into_raw(ctx) as *mut c_void,
        );
        let res = ffi::libusb_submit_transfer(xfer);
        if res != 0 {
            warn!(
                "failed to submit RX transfer to device {}-{}: {}",
                bus, address, res
            );
            drop_context(xfer);
            ffi::libusb_free_transfer(xfer);
            return Err(from_libusb(res));
        }
        dev.borrow_mut().rx_xfers.add(xfer);
    }
    Ok(())
}

/// Map a raw libusb return code to `rusb::Error`.
pub(crate) fn from_libusb(code: c_int) -> rusb::Error {
    match code {
        LIBUSB_ERROR_IO => rusb::Error::Io,
        LIBUSB_ERROR_INVALID_PARAM => rusb::Error::InvalidParam,
        LIBUSB_ERROR_ACCESS => rusb::Error::Access,
        LIBUSB_ERROR_NO_DEVICE => rusb::Error::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => rusb::Error::NotFound,
        LIBUSB_ERROR_BUSY => rusb::Error::Busy,
        LIBUSB_ERROR_TIMEOUT => rusb::Error::Timeout,
        LIBUSB_ERROR_OVERFLOW => rusb::Error::Overflow,
        LIBUSB_ERROR_PIPE => rusb::Error::Pipe,
        LIBUSB_ERROR_INTERRUPTED => rusb::Error::Interrupted,
        LIBUSB_ERROR_NO_MEM => rusb::Error::NoMem,
        LIBUSB_ERROR_NOT_SUPPORTED => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_zlp() {
        assert!(!needs_zlp(4, 64));
        assert!(!needs_zlp(63, 64));
        assert!(needs_zlp(64, 64));
        assert!(needs_zlp(128, 64));
        assert!(needs_zlp(1024, 512));
        assert!(!needs_zlp(1025, 512));
        // empty payloads still terminate with a ZLP
        assert!(needs_zlp(0, 512));
        // a record that never read its endpoint descriptor must not divide by zero
        assert!(!needs_zlp(64, 0));
    }

    #[test]
    fn test_pool_membership() {
        let a = 0x1000 as *mut ffi::libusb_transfer;
        let b = 0x2000 as *mut ffi::libusb_transfer;
        let mut pool = TransferPool::default();
        assert!(pool.is_empty());

        pool.add(a);
        pool.add(b);
        assert_eq!(pool.len(), 2);

        pool.remove(a);
        assert_eq!(pool.len(), 1);
        // removing twice is harmless
        pool.remove(a);
        assert_eq!(pool.len(), 1);

        pool.remove(b);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_from_libusb() {
        assert_eq!(from_libusb(LIBUSB_ERROR_NO_DEVICE), rusb::Error::NoDevice);
        assert_eq!(from_libusb(LIBUSB_ERROR_TIMEOUT), rusb::Error::Timeout);
        assert_eq!(from_libusb(LIBUSB_ERROR_PIPE), rusb::Error::Pipe);
        assert_eq!(from_libusb(-999), rusb::Error::Other);
    }
}
