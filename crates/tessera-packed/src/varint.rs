//! LEB128 variable-length integers.

use tessera_common::{Result, TesseraError};

/// Longest encoding of a u64.
pub const MAX_VARINT_LEN: usize = 10;

/// Number of bytes `value` occupies once encoded.
pub fn varint_len(value: u64) -> usize {
    let bits = (u64::BITS - value.leading_zeros()).max(1) as usize;
    bits.div_ceil(7)
}

/// Appends the encoding of `value` to `out`.
pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Decodes one value from the start of `bytes`, returning it and its length.
pub fn read_varint(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut value = 0u64;
    for (i, &byte) in bytes.iter().take(MAX_VARINT_LEN).enumerate() {
        let chunk = (byte & 0x7F) as u64;
        if i == MAX_VARINT_LEN - 1 && chunk > 1 {
            break;
        }
        value |= chunk << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(TesseraError::PackedCorrupted(
        "truncated or overlong varint".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_lengths() {
        assert_eq!(varint_len(0), 1);
        assert_eq!(varint_len(127), 1);
        assert_eq!(varint_len(128), 2);
        assert_eq!(varint_len(u64::MAX), 10);
    }

    #[test]
    fn test_varint_encoding() {
        let mut out = Vec::new();
        write_varint(&mut out, 300);
        assert_eq!(out, vec![0xAC, 0x02]);
        assert_eq!(read_varint(&out).unwrap(), (300, 2));

        out.clear();
        write_varint(&mut out, u64::MAX);
        assert_eq!(out.len(), varint_len(u64::MAX));
        assert_eq!(read_varint(&out).unwrap(), (u64::MAX, 10));
    }

    #[test]
    fn test_varint_truncated() {
        assert!(read_varint(&[0x80, 0x80]).is_err());
        assert!(read_varint(&[]).is_err());
    }
}
