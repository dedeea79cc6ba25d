//! Byte order and bit helpers for gateway frames
//!
//! Gateway frames are big-endian unless a wire variant overrides the order
//! for a given value class (see `channel::BYTE_ORDER_OVERRIDES`).

/// Byte order for 32-bit values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ByteOrder {
    #[default]
    BigEndian,
    LittleEndian,
}

impl ByteOrder {
    /// Reassemble a u32 from four wire bytes
    #[inline]
    pub fn read_u32(&self, b: [u8; 4]) -> u32 {
        match self {
            Self::BigEndian => u32::from_be_bytes(b),
            Self::LittleEndian => u32::from_le_bytes(b),
        }
    }
}

/// Extract single bit from u8 value
#[inline]
pub fn extract_bit_u8(value: u8, bit_index: u8) -> bool {
    debug_assert!(bit_index < 8, "Bit index out of range: {}", bit_index);
    (value & (1 << bit_index)) != 0
}

/// Encode bytes to uppercase hex for log lines
/// Example: [0x7E, 0xF4, 0x00] -> "7EF400"
pub fn encode_upper(data: &[u8]) -> String {
    hex::encode_upper(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_u32_orders() {
        let value = 0x1234_5678u32;
        assert_eq!(ByteOrder::BigEndian.read_u32([0x12, 0x34, 0x56, 0x78]), value);
        assert_eq!(ByteOrder::LittleEndian.read_u32([0x78, 0x56, 0x34, 0x12]), value);
        assert_eq!(ByteOrder::default(), ByteOrder::BigEndian);
    }

    #[test]
    fn test_extract_bit_u8() {
        let value = 0b0000_0101u8;
        assert!(extract_bit_u8(value, 0));
        assert!(!extract_bit_u8(value, 1));
        assert!(extract_bit_u8(value, 2));
    }

    #[test]
    fn test_encode_upper() {
        assert_eq!(encode_upper(&[0x7E, 0xF4, 0x0A]), "7EF40A");
        assert_eq!(encode_upper(&[]), "");
    }
}
