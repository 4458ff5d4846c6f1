// src/payload.rs
//
// File payload pattern
//
// Byte i of a payload is (i+1) mod 256, except the header: the first 8 bytes
// hold the item number (little endian), or the first byte holds its low byte
// when the payload is shorter than 8 bytes.

const HEADER_LEN: usize = 8;

/// Length of the header for a payload of `len` bytes
pub fn header_len(len: usize) -> usize {
    if len >= HEADER_LEN {
        HEADER_LEN
    } else {
        len.min(1)
    }
}

/// A buffer holding the fill pattern, header not yet stamped
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i + 1) as u8).collect()
}

/// Write the item number into the header
pub fn stamp(buf: &mut [u8], item: u64) {
    if buf.len() >= HEADER_LEN {
        buf[..HEADER_LEN].copy_from_slice(&item.to_le_bytes());
    } else if let Some(first) = buf.first_mut() {
        *first = item as u8;
    }
}

/// Whether the header carries `item`
pub fn header_matches(buf: &[u8], item: u64) -> bool {
    if buf.len() >= HEADER_LEN {
        buf[..HEADER_LEN] == item.to_le_bytes()
    } else {
        buf.first().map_or(true, |b| *b == item as u8)
    }
}

/// Count verification errors in a payload read back for `item`: one for a
/// wrong header, one for the body if any byte deviates from the pattern.
pub fn verify(buf: &[u8], item: u64) -> u64 {
    let mut errors = 0;
    if !header_matches(buf, item) {
        errors += 1;
    }
    let body_mismatch = buf
        .iter()
        .enumerate()
        .skip(header_len(buf.len()))
        .any(|(i, b)| *b != (i + 1) as u8);
    if body_mismatch {
        errors += 1;
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern() {
        let buf = pattern(300);
        assert_eq!(buf[0], 1);
        assert_eq!(buf[254], 255);
        assert_eq!(buf[255], 0);
        assert_eq!(buf[299], 44);
    }

    #[test]
    fn test_stamped_payload_verifies() {
        for len in [0usize, 1, 5, 8, 9, 4096] {
            let mut buf = pattern(len);
            stamp(&mut buf, 1234);
            assert_eq!(verify(&buf, 1234), 0, "len={}", len);
        }
    }

    #[test]
    fn test_wrong_item_is_one_error() {
        let mut buf = pattern(64);
        stamp(&mut buf, 7);
        assert!(!header_matches(&buf, 8));
        assert_eq!(verify(&buf, 8), 1);

        let mut short = pattern(3);
        stamp(&mut short, 7);
        assert_eq!(verify(&short, 8), 1);
    }

    #[test]
    fn test_corrupted_body_is_one_error() {
        let mut buf = pattern(128);
        stamp(&mut buf, 42);
        buf[20] ^= 0xff;
        buf[100] ^= 0xff;
        assert_eq!(verify(&buf, 42), 1);
        buf[0] ^= 0xff;
        assert_eq!(verify(&buf, 42), 2);
    }

    #[test]
    fn test_short_payload_body() {
        let mut buf = pattern(4);
        stamp(&mut buf, 3);
        assert_eq!(buf, vec![3, 2, 3, 4]);
        buf[3] = 0;
        assert_eq!(verify(&buf, 3), 1);
    }
}
