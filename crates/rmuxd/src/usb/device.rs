//! Per-device record and descriptor-derived helpers

use rusb::{Context, DeviceHandle};

use crate::usb::transfers::TransferPool;

/// wMaxPacketSize used when the endpoint descriptor is unreadable
pub const FALLBACK_MAX_PACKET: u16 = 64;

/// The device-descriptor fields the core needs, kept as plain data so the
/// record logic works without a live device.
#[derive(Debug, Clone, Copy, Default)]
pub struct DescriptorSnapshot {
    pub vendor_id: u16,
    pub product_id: u16,
    pub num_configurations: u8,
    /// iSerialNumber string index, 0 when the device reports none
    pub serial_index: u8,
}

/// In-memory state for one attached candidate device.
///
/// A record is in the registry exactly while its handle is open. Clearing
/// `alive` schedules it for the next reap pass; nothing else may tear a
/// record down.
pub struct UsbDevice {
    pub(crate) bus: u8,
    pub(crate) address: u8,
    pub(crate) desc: DescriptorSnapshot,
    pub(crate) handle: Option<DeviceHandle<Context>>,
    pub(crate) serial: String,
    pub(crate) alive: bool,
    pub(crate) interface: u8,
    pub(crate) ep_in: u8,
    pub(crate) ep_out: u8,
    pub(crate) max_packet_out: u16,
    pub(crate) speed_bps: u64,
    pub(crate) rx_xfers: TransferPool,
    pub(crate) tx_xfers: TransferPool,
}

impl UsbDevice {
    pub(crate) fn new(
        bus: u8,
        address: u8,
        desc: DescriptorSnapshot,
        handle: Option<DeviceHandle<Context>>,
    ) -> Self {
        Self {
            bus,
            address,
            desc,
            handle,
            serial: String::new(),
            alive: true,
            interface: 0,
            ep_in: 0,
            ep_out: 0,
            max_packet_out: FALLBACK_MAX_PACKET,
            speed_bps: 0,
            rx_xfers: TransferPool::default(),
            tx_xfers: TransferPool::default(),
        }
    }

    /// UDID string, once initialization has read it
    pub fn serial(&self) -> Option<&str> {
        if self.handle.is_none() {
            return None;
        }
        Some(self.serial.as_str())
    }

    /// `(bus << 16) | address`, 0 for a closed record
    pub fn location(&self) -> u32 {
        if self.handle.is_none() {
            return 0;
        }
        location(self.bus, self.address)
    }

    pub fn product_id(&self) -> u16 {
        if self.handle.is_none() {
            return 0;
        }
        self.desc.product_id
    }

    /// Negotiated link speed in bits per second
    pub fn speed(&self) -> u64 {
        if self.handle.is_none() {
            return 0;
        }
        self.speed_bps
    }

    pub(crate) fn raw_handle(&self) -> Option<*mut rusb::ffi::libusb_device_handle> {
        self.handle.as_ref().map(|h| h.as_raw())
    }
}

/// Pack a bus/address pair into the location the muxer reports upward.
pub fn location(bus: u8, address: u8) -> u32 {
    (u32::from(bus) << 16) | u32::from(address)
}

/// Split a location back into (bus, address).
pub fn split_location(location: u32) -> (u8, u8) {
    ((location >> 16) as u8, location as u8)
}

/// Bits per second for an enumerated speed class. High and unknown share the
/// 480M default.
pub fn speed_bits_per_sec(speed: rusb::Speed) -> u64 {
    match speed {
        rusb::Speed::Low => 1_500_000,
        rusb::Speed::Full => 12_000_000,
        rusb::Speed::Super => 5_000_000_000,
        rusb::Speed::SuperPlus => 10_000_000_000,
        _ => 480_000_000,
    }
}

/// Decode a UTF-16LE string descriptor to ASCII, substituting `?` for
/// non-ASCII code units and stopping at NUL or the descriptor's own length.
pub fn decode_string_descriptor(data: &[u8]) -> String {
    let mut out = String::new();
    if data.len() < 2 {
        return out;
    }
    let blen = usize::from(data[0]).min(data.len());
    let mut si = 2;
    while si + 1 < blen && out.len() < 255 {
        let (lo, hi) = (data[si], data[si + 1]);
        if lo & 0x80 != 0 || hi != 0 {
            out.push('?');
        } else if lo == 0 {
            break;
        } else {
            out.push(lo as char);
        }
        si += 2;
    }
    out
}

/// New-style UDIDs are 24 digits and gain a hyphen between the first 8 and
/// the remaining 16. Everything else passes through untouched.
pub fn format_serial(raw: String) -> String {
    if raw.len() == 24 {
        format!("{}-{}", &raw[..8], &raw[8..])
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> UsbDevice {
        UsbDevice::new(
            2,
            7,
            DescriptorSnapshot {
                vendor_id: 0x05ac,
                product_id: 0x12a8,
                num_configurations: 4,
                serial_index: 3,
            },
            None,
        )
    }

    #[test]
    fn test_location_packing() {
        assert_eq!(location(0, 0), 0);
        assert_eq!(location(2, 7), 0x0002_0007);
        assert_eq!(location(0xff, 0xff), 0x00ff_00ff);
        assert_eq!(split_location(location(3, 19)), (3, 19));
    }

    #[test]
    fn test_getters_require_open_handle() {
        let dev = record();
        assert_eq!(dev.serial(), None);
        assert_eq!(dev.location(), 0);
        assert_eq!(dev.product_id(), 0);
        assert_eq!(dev.speed(), 0);
    }

    #[test]
    fn test_speed_mapping() {
        assert_eq!(speed_bits_per_sec(rusb::Speed::Low), 1_500_000);
        assert_eq!(speed_bits_per_sec(rusb::Speed::Full), 12_000_000);
        assert_eq!(speed_bits_per_sec(rusb::Speed::High), 480_000_000);
        assert_eq!(speed_bits_per_sec(rusb::Speed::Unknown), 480_000_000);
        assert_eq!(speed_bits_per_sec(rusb::Speed::Super), 5_000_000_000);
        assert_eq!(speed_bits_per_sec(rusb::Speed::SuperPlus), 10_000_000_000);
    }

    fn descriptor(chars: &[u16]) -> Vec<u8> {
        let mut data = vec![(2 + chars.len() * 2) as u8, 0x03];
        for c in chars {
            data.extend_from_slice(&c.to_le_bytes());
        }
        data
    }

    #[test]
    fn test_decode_ascii_serial() {
        let data = descriptor(&"001122334455667788990011".chars().map(|c| c as u16).collect::<Vec<_>>());
        assert_eq!(decode_string_descriptor(&data), "001122334455667788990011");
    }

    #[test]
    fn test_decode_substitutes_non_ascii() {
        // 'a', U+00E9, U+0416, 'b'
        let data = descriptor(&[0x0061, 0x00e9, 0x0416, 0x0062]);
        assert_eq!(decode_string_descriptor(&data), "a??b");
    }

    #[test]
    fn test_decode_stops_at_nul() {
        let data = descriptor(&[0x0061, 0x0000, 0x0062]);
        assert_eq!(decode_string_descriptor(&data), "a");
    }

    #[test]
    fn test_decode_respects_blength() {
        // bLength claims 6 bytes, so only the first two code units count
        let mut data = descriptor(&[0x0061, 0x0062, 0x0063]);
        data[0] = 6;
        assert_eq!(decode_string_descriptor(&data), "ab");
    }

    #[test]
    fn test_decode_short_buffers() {
        assert_eq!(decode_string_descriptor(&[]), "");
        assert_eq!(decode_string_descriptor(&[2]), "");
        assert_eq!(decode_string_descriptor(&[2, 0x03]), "");
    }

    #[test]
    fn test_serial_hyphenation() {
        assert_eq!(
            format_serial("001122334455667788990011".to_string()),
            "00112233-4455667788990011"
        );
        assert_eq!(format_serial("a1b2c3d4e5f6a7b8c9d0e1f2".to_string()).len(), 25);
    }

    #[test]
    fn test_serial_other_lengths_unchanged() {
        for s in ["", "abc", "0123456789abcdef01234567x", "0008110000A1D0E3C08801E"] {
            assert_eq!(format_serial(s.to_string()), s);
        }
    }
}
