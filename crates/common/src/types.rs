//! Device summaries published by the USB core

/// Snapshot of an initialized device as seen above the USB layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    /// UDID read from the serial string descriptor (hyphenated when 24 digits)
    pub serial: String,
    /// `(bus << 16) | address`
    pub location: u32,
    /// USB product ID
    pub product_id: u16,
    /// Negotiated link speed in bits per second
    pub speed_bps: u64,
}

impl DeviceEntry {
    pub fn bus(&self) -> u8 {
        (self.location >> 16) as u8
    }

    pub fn address(&self) -> u8 {
        self.location as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_split() {
        let entry = DeviceEntry {
            serial: "00008110-000A1D0E3C08801E".to_string(),
            location: (3 << 16) | 19,
            product_id: 0x12a8,
            speed_bps: 480_000_000,
        };
        assert_eq!(entry.bus(), 3);
        assert_eq!(entry.address(), 19);
    }
}
