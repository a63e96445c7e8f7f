//! Byte-buffer helpers used by the framing code.

use bytes::{BufMut, Bytes, BytesMut};

/// A copy did not fit in its source or destination.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "cannot copy {len} bytes from offset {start} of a {from_len}-byte buffer \
     to offset {offset} of a {to_len}-byte buffer"
)]
pub struct RangeError {
    pub start: usize,
    pub len: usize,
    pub from_len: usize,
    pub offset: usize,
    pub to_len: usize,
}

/// Copies `from[start..start + len]` into `to` at `offset`.
///
/// Zero-length copies are allowed at any in-bounds position, including the
/// end of an empty buffer.
pub fn copy_range(
    from: &[u8],
    start: usize,
    len: usize,
    to: &mut [u8],
    offset: usize,
) -> Result<(), RangeError> {
    let err = || RangeError {
        start,
        len,
        from_len: from.len(),
        offset,
        to_len: to.len(),
    };
    let src_end = start.checked_add(len).filter(|&e| e <= from.len());
    let dst_end = offset.checked_add(len).filter(|&e| e <= to.len());
    match (src_end, dst_end) {
        (Some(src_end), Some(dst_end)) => {
            to[offset..dst_end].copy_from_slice(&from[start..src_end]);
            Ok(())
        }
        _ => Err(err()),
    }
}

/// Concatenates `parts` into one contiguous buffer.
pub fn concat<B: AsRef<[u8]>>(parts: &[B]) -> Bytes {
    let total = parts.iter().map(|p| p.as_ref().len()).sum();
    let mut out = BytesMut::with_capacity(total);
    for part in parts {
        out.put_slice(part.as_ref());
    }
    out.freeze()
}

/// Packs `words` as consecutive big-endian `u16`s.
pub fn compose(words: &[u16]) -> Bytes {
    let mut out = BytesMut::with_capacity(words.len() * 2);
    for &word in words {
        out.put_u16(word);
    }
    out.freeze()
}

/// Reads a big-endian `u16` at `offset`.
pub fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_range_whole_buffer() {
        let from = [1u8, 2, 3, 4];
        let mut to = [0u8; 4];
        copy_range(&from, 0, 4, &mut to, 0).expect("fits");
        assert_eq!(to, from);
    }

    #[test]
    fn test_copy_range_with_offsets() {
        let from = [1u8, 2, 3, 4, 5];
        let mut to = [0u8; 6];
        copy_range(&from, 1, 3, &mut to, 2).expect("fits");
        assert_eq!(to, [0, 0, 2, 3, 4, 0]);
    }

    #[test]
    fn test_copy_range_zero_length() {
        let mut to: [u8; 0] = [];
        copy_range(&[], 0, 0, &mut to, 0).expect("empty copy");

        let mut to = [9u8; 2];
        copy_range(&[1, 2, 3], 3, 0, &mut to, 2).expect("empty copy at end");
        assert_eq!(to, [9, 9]);
    }

    #[test]
    fn test_copy_range_out_of_bounds() {
        let mut to = [0u8; 2];
        let err = copy_range(&[1, 2, 3], 1, 3, &mut to, 0).unwrap_err();
        assert_eq!(err.from_len, 3);
        assert!(copy_range(&[1, 2], 0, 2, &mut to, 1).is_err());
        assert!(copy_range(&[1], usize::MAX, 1, &mut to, 0).is_err());
    }

    #[test]
    fn test_concat_joins_parts() {
        let parts: [&[u8]; 3] = [b"ab", b"", b"cde"];
        let joined = concat(&parts);
        assert_eq!(&joined[..], b"abcde");
    }

    #[test]
    fn test_compose_is_big_endian() {
        assert_eq!(&compose(&[0xBEEF, 0x0001])[..], &[0xBE, 0xEF, 0x00, 0x01]);
        assert_eq!(read_u16(&[0xBE, 0xEF], 0), Some(0xBEEF));
        assert_eq!(read_u16(&[0xBE], 0), None);
    }
}
