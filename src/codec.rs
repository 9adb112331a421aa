//! Byte-level helpers shared by the FRAM and BLE decoders.

/// Returned by [`serial_number`] when the uid is not exactly 8 bytes long.
pub const INVALID_SERIAL: &str = "";

pub const SERIAL_ALPHABET: [char; 32] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'C', 'D', 'E', 'F', 'G', 'H', 'J', 'K',
    'L', 'M', 'N', 'P', 'Q', 'R', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z',
];

const CRC16_TABLE: [u16; 256] = [
    0x0000, 0x1189, 0x2312, 0x329b, 0x4624, 0x57ad, 0x6536, 0x74bf, 0x8c48, 0x9dc1, 0xaf5a, 0xbed3,
    0xca6c, 0xdbe5, 0xe97e, 0xf8f7, 0x1081, 0x0108, 0x3393, 0x221a, 0x56a5, 0x472c, 0x75b7, 0x643e,
    0x9cc9, 0x8d40, 0xbfdb, 0xae52, 0xdaed, 0xcb64, 0xf9ff, 0xe876, 0x2102, 0x308b, 0x0210, 0x1399,
    0x6726, 0x76af, 0x4434, 0x55bd, 0xad4a, 0xbcc3, 0x8e58, 0x9fd1, 0xeb6e, 0xfae7, 0xc87c, 0xd9f5,
    0x3183, 0x200a, 0x1291, 0x0318, 0x77a7, 0x662e, 0x54b5, 0x453c, 0xbdcb, 0xac42, 0x9ed9, 0x8f50,
    0xfbef, 0xea66, 0xd8fd, 0xc974, 0x4204, 0x538d, 0x6116, 0x709f, 0x0420, 0x15a9, 0x2732, 0x36bb,
    0xce4c, 0xdfc5, 0xed5e, 0xfcd7, 0x8868, 0x99e1, 0xab7a, 0xbaf3, 0x5285, 0x430c, 0x7197, 0x601e,
    0x14a1, 0x0528, 0x37b3, 0x263a, 0xdecd, 0xcf44, 0xfddf, 0xec56, 0x98e9, 0x8960, 0xbbfb, 0xaa72,
    0x6306, 0x728f, 0x4014, 0x519d, 0x2522, 0x34ab, 0x0630, 0x17b9, 0xef4e, 0xfec7, 0xcc5c, 0xddd5,
    0xa96a, 0xb8e3, 0x8a78, 0x9bf1, 0x7387, 0x620e, 0x5095, 0x411c, 0x35a3, 0x242a, 0x16b1, 0x0738,
    0xffcf, 0xee46, 0xdcdd, 0xcd54, 0xb9eb, 0xa862, 0x9af9, 0x8b70, 0x8408, 0x9581, 0xa71a, 0xb693,
    0xc22c, 0xd3a5, 0xe13e, 0xf0b7, 0x0840, 0x19c9, 0x2b52, 0x3adb, 0x4e64, 0x5fed, 0x6d76, 0x7cff,
    0x9489, 0x8500, 0xb79b, 0xa612, 0xd2ad, 0xc324, 0xf1bf, 0xe036, 0x18c1, 0x0948, 0x3bd3, 0x2a5a,
    0x5ee5, 0x4f6c, 0x7df7, 0x6c7e, 0xa50a, 0xb483, 0x8618, 0x9791, 0xe32e, 0xf2a7, 0xc03c, 0xd1b5,
    0x2942, 0x38cb, 0x0a50, 0x1bd9, 0x6f66, 0x7eef, 0x4c74, 0x5dfd, 0xb58b, 0xa402, 0x9699, 0x8710,
    0xf3af, 0xe226, 0xd0bd, 0xc134, 0x39c3, 0x284a, 0x1ad1, 0x0b58, 0x7fe7, 0x6e6e, 0x5cf5, 0x4d7c,
    0xc60c, 0xd785, 0xe51e, 0xf497, 0x8028, 0x91a1, 0xa33a, 0xb2b3, 0x4a44, 0x5bcd, 0x6956, 0x78df,
    0x0c60, 0x1de9, 0x2f72, 0x3efb, 0xd68d, 0xc704, 0xf59f, 0xe416, 0x90a9, 0x8120, 0xb3bb, 0xa232,
    0x5ac5, 0x4b4c, 0x79d7, 0x685e, 0x1ce1, 0x0d68, 0x3ff3, 0x2e7a, 0xe70e, 0xf687, 0xc41c, 0xd595,
    0xa12a, 0xb0a3, 0x8238, 0x93b1, 0x6b46, 0x7acf, 0x4854, 0x59dd, 0x2d62, 0x3ceb, 0x0e70, 0x1ff9,
    0xf78f, 0xe606, 0xd49d, 0xc514, 0xb1ab, 0xa022, 0x92b9, 0x8330, 0x7bc7, 0x6a4e, 0x58d5, 0x495c,
    0x3de3, 0x2c6a, 0x1ef1, 0x0f78,
];

/// CRC-16 as stored in the sensor memory regions: table-driven with seed
/// `0xFFFF`, result bit-reversed.
pub fn crc16(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &b in bytes {
        crc = (crc >> 8) ^ CRC16_TABLE[usize::from((crc ^ u16::from(b)) & 0xFF)];
    }
    crc.reverse_bits()
}

/// Reads a little-endian `u16` at `offset`. Callers guarantee bounds.
pub fn read_u16_le(buffer: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buffer[offset], buffer[offset + 1]])
}

/// Reads a big-endian `u16` at `offset`. Callers guarantee bounds.
pub fn read_u16_be(buffer: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buffer[offset], buffer[offset + 1]])
}

/// Combines two bytes as `(high << 8) | low`.
pub const fn word(high: u8, low: u8) -> u16 {
    ((high as u16) << 8) | low as u16
}

/// Extracts `bit_count` bits starting at bit `byte_offset * 8 + bit_offset`.
///
/// Bits are scanned LSB-first inside each byte and assembled LSB-first in
/// the result, so a field may straddle any number of byte boundaries.
/// Bits that fall outside `buffer` read as zero.
pub fn read_bits(buffer: &[u8], byte_offset: usize, bit_offset: usize, bit_count: usize) -> u32 {
    let mut result = 0u32;
    for i in 0..bit_count.min(32) {
        let total = byte_offset * 8 + bit_offset + i;
        let Some(byte) = buffer.get(total / 8) else {
            break;
        };
        if (byte >> (total % 8)) & 1 == 1 {
            result |= 1 << i;
        }
    }
    result
}

/// Inverse of [`read_bits`], used to build memory images.
pub fn write_bits(
    buffer: &mut [u8],
    byte_offset: usize,
    bit_offset: usize,
    bit_count: usize,
    value: u32,
) {
    for i in 0..bit_count.min(32) {
        let total = byte_offset * 8 + bit_offset + i;
        let Some(byte) = buffer.get_mut(total / 8) else {
            break;
        };
        let mask = 1u8 << (total % 8);
        if (value >> i) & 1 == 1 {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }
}

/// Printed serial number of a sensor, derived from its 8-byte uid.
///
/// The first six uid bytes are taken in reverse order and repacked into ten
/// 5-bit groups. Returns [`INVALID_SERIAL`] when `uid` is not 8 bytes.
pub fn serial_number(uid: &[u8]) -> String {
    serial_number_with_prefix(uid, '0')
}

pub fn serial_number_with_prefix(uid: &[u8], prefix: char) -> String {
    if uid.len() != 8 {
        return INVALID_SERIAL.to_string();
    }

    let b: Vec<u8> = uid[..6].iter().rev().copied().collect();
    let groups = [
        b[0] >> 3,
        (b[0] << 2) | (b[1] >> 6),
        b[1] >> 1,
        (b[1] << 4) | (b[2] >> 4),
        (b[2] << 1) | (b[3] >> 7),
        b[3] >> 2,
        (b[3] << 3) | (b[4] >> 5),
        b[4],
        b[5] >> 3,
        b[5] << 2,
    ];

    let mut out = String::with_capacity(11);
    out.push(prefix);
    for g in groups {
        out.push(SERIAL_ALPHABET[usize::from(g & 0x1F)]);
    }
    out
}

pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Parses a hex string, ignoring ASCII whitespace. Returns `None` on odd
/// length or non-hex characters.
pub fn from_hex(text: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = text
        .bytes()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    if digits.len() % 2 != 0 {
        return None;
    }

    digits
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some(((hi << 4) | lo) as u8)
        })
        .collect()
}
