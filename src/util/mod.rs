//! Utility functions for the GATT client
//!
//! UUID parsing for the short Bluetooth SIG forms and payload formatting

/// Common utility functions
pub mod common {
    use uuid::Uuid;

    use crate::ble::BleError;

    /// Bluetooth base UUID; 16- and 32-bit identifiers occupy the first 32 bits
    pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(0x00000000_0000_1000_8000_00805f9b34fb);

    const BASE_MASK: u128 = 0xffffffff_0000_0000_0000_000000000000;

    /// Expand a 16- or 32-bit assigned number into a full UUID
    pub fn uuid_from_u32(short: u32) -> Uuid {
        Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | (u128::from(short) << 96))
    }

    /// Parse `"180f"`, `"0000180f"`, `"0x180F"` or a full 128-bit UUID
    pub fn parse_uuid(text: &str) -> Result<Uuid, BleError> {
        let trimmed = text.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        match digits.len() {
            4 | 8 => u32::from_str_radix(digits, 16)
                .map(uuid_from_u32)
                .map_err(|_| BleError::InvalidUuid(text.to_string())),
            _ => Uuid::parse_str(digits).map_err(|_| BleError::InvalidUuid(text.to_string())),
        }
    }

    /// Short form of a UUID built on the Bluetooth base, if it is one
    pub fn short_uuid(uuid: &Uuid) -> Option<u32> {
        let value = uuid.as_u128();
        if value & !BASE_MASK == BLUETOOTH_BASE_UUID.as_u128() {
            Some((value >> 96) as u32)
        } else {
            None
        }
    }

    /// Compact display form: `0x180f` for assigned numbers, the full UUID otherwise
    pub fn display_uuid(uuid: &Uuid) -> String {
        match short_uuid(uuid) {
            Some(short) if short <= 0xffff => format!("0x{:04x}", short),
            Some(short) => format!("0x{:08x}", short),
            None => uuid.to_string(),
        }
    }

    /// Hex dump of a characteristic value
    pub fn format_value(data: &[u8]) -> String {
        if data.is_empty() {
            "<empty>".to_string()
        } else {
            hex::encode(data)
        }
    }

    /// Parse a hex payload, ignoring whitespace and an optional `0x` prefix
    pub fn parse_value(text: &str) -> Result<Vec<u8>, hex::FromHexError> {
        let compact: String = text.split_whitespace().collect();
        let digits = compact.strip_prefix("0x").unwrap_or(&compact);
        hex::decode(digits)
    }

}
