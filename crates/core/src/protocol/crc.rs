//! Table-driven CRC-8 (polynomial 0x07, zero init) used as the framed
//! protocol's trailing checksum

pub const CRC8_POLY: u8 = 0x07;

pub static CRC8_TABLE: [u8; 256] = build_table(CRC8_POLY);

const fn build_table(poly: u8) -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ poly
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Checksum over every byte of `data`
pub fn crc8(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |acc, &byte| CRC8_TABLE[(acc ^ byte) as usize])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_entries() {
        assert_eq!(CRC8_TABLE[0], 0x00);
        assert_eq!(CRC8_TABLE[1], 0x07);
        assert_eq!(CRC8_TABLE[2], 0x0E);
        assert_eq!(CRC8_TABLE[255], 0xF3);
    }

    #[test]
    fn test_reference_check_value() {
        assert_eq!(crc8(b"123456789"), 0xF4);
        assert_eq!(crc8(&[]), 0x00);
    }
}
