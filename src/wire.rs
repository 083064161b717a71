//! Primitive encodings shared by recon messages and stored tree nodes.
//!
//! Integers are 4-byte big-endian.  Lengths are integers bounded by
//! [`MAX_READ_LEN`].  Strings, bit strings and element arrays are length
//! prefixed; elements are written at the fixed width of the field modulus.

use std::io::{Read, Write};
use std::sync::Arc;

use num_bigint::BigUint;

use crate::bitstring::Bitstring;
use crate::error::WireError;
use crate::field::{byte_len, Zp};
use crate::zset::ZSet;

/// Largest length prefix accepted from a peer or a stored record.
pub const MAX_READ_LEN: usize = 1 << 24;

/// Reads a 4-byte big-endian integer.
pub fn read_int<R: Read + ?Sized>(r: &mut R) -> Result<u32, WireError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

/// Writes a 4-byte big-endian integer.
pub fn write_int<W: Write + ?Sized>(w: &mut W, n: u32) -> Result<(), WireError> {
    w.write_all(&n.to_be_bytes())?;
    Ok(())
}

/// Reads an integer used as a length, rejecting values over [`MAX_READ_LEN`].
pub fn read_len<R: Read + ?Sized>(r: &mut R) -> Result<usize, WireError> {
    let n = read_int(r)? as usize;
    if n > MAX_READ_LEN {
        return Err(WireError::TooLarge(n));
    }
    Ok(n)
}

/// Writes a `usize` length.
pub fn write_len<W: Write + ?Sized>(w: &mut W, n: usize) -> Result<(), WireError> {
    let n = u32::try_from(n).map_err(|_| WireError::TooLarge(n))?;
    write_int(w, n)
}

/// Reads exactly `n` bytes.
pub fn read_bytes<R: Read + ?Sized>(r: &mut R, n: usize) -> Result<Vec<u8>, WireError> {
    let mut buf = vec![0u8; n];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Reads a length-prefixed UTF-8 string.
pub fn read_string<R: Read + ?Sized>(r: &mut R) -> Result<String, WireError> {
    let n = read_len(r)?;
    String::from_utf8(read_bytes(r, n)?).map_err(|_| WireError::Utf8)
}

/// Writes a length-prefixed string.
pub fn write_string<W: Write + ?Sized>(w: &mut W, s: &str) -> Result<(), WireError> {
    write_len(w, s.len())?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

/// Reads a bit string as bit length, byte length, then bytes.
pub fn read_bitstring<R: Read + ?Sized>(r: &mut R) -> Result<Bitstring, WireError> {
    let bits = read_len(r)?;
    let nbytes = read_len(r)?;
    if nbytes != bits.div_ceil(8) {
        return Err(WireError::Malformed(format!(
            "bit string of {bits} bits carries {nbytes} bytes"
        )));
    }
    let buf = read_bytes(r, nbytes)?;
    Ok(Bitstring::from_bytes(bits, &buf))
}

/// Writes a bit string as bit length, byte length, then bytes.
pub fn write_bitstring<W: Write + ?Sized>(w: &mut W, bs: &Bitstring) -> Result<(), WireError> {
    write_len(w, bs.len())?;
    write_len(w, bs.bytes().len())?;
    w.write_all(bs.bytes())?;
    Ok(())
}

/// Reads one fixed-width element of the field `p`.
pub fn read_zp<R: Read + ?Sized>(r: &mut R, p: &Arc<BigUint>) -> Result<Zp, WireError> {
    let buf = read_bytes(r, byte_len(p))?;
    Ok(Zp::from_bytes(p, &buf))
}

/// Writes one fixed-width element.
pub fn write_zp<W: Write + ?Sized>(w: &mut W, z: &Zp) -> Result<(), WireError> {
    w.write_all(&z.to_bytes())?;
    Ok(())
}

/// Reads a count followed by that many elements.
pub fn read_zz_array<R: Read + ?Sized>(r: &mut R, p: &Arc<BigUint>) -> Result<Vec<Zp>, WireError> {
    let n = read_len(r)?;
    (0..n).map(|_| read_zp(r, p)).collect()
}

/// Writes a count followed by each element.
pub fn write_zz_array<'a, W, I>(w: &mut W, items: I) -> Result<(), WireError>
where
    W: Write + ?Sized,
    I: IntoIterator<Item = &'a Zp>,
    I::IntoIter: ExactSizeIterator,
{
    let items = items.into_iter();
    write_len(w, items.len())?;
    for z in items {
        write_zp(w, z)?;
    }
    Ok(())
}

/// Reads an element array into a set.
pub fn read_zset<R: Read + ?Sized>(r: &mut R, p: &Arc<BigUint>) -> Result<ZSet, WireError> {
    Ok(read_zz_array(r, p)?.into_iter().collect())
}

/// Writes a set as an element array in ascending order.
pub fn write_zset<W: Write + ?Sized>(w: &mut W, set: &ZSet) -> Result<(), WireError> {
    write_len(w, set.len())?;
    for z in set.iter() {
        write_zp(w, z)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::p_sks;
    use std::io::Cursor;

    #[test]
    fn test_int_is_big_endian() {
        let mut buf = Vec::new();
        write_int(&mut buf, 0x0102_0304).unwrap();
        assert_eq!(buf, vec![1, 2, 3, 4]);
        assert_eq!(read_int(&mut Cursor::new(buf)).unwrap(), 0x0102_0304);
    }

    #[test]
    fn test_len_limit() {
        let mut buf = Vec::new();
        write_int(&mut buf, (MAX_READ_LEN + 1) as u32).unwrap();
        assert!(matches!(
            read_len(&mut Cursor::new(buf)),
            Err(WireError::TooLarge(_))
        ));
    }

    #[test]
    fn test_bitstring_layout() {
        let mut bs = Bitstring::new(10);
        bs.set(1);
        let mut buf = Vec::new();
        write_bitstring(&mut buf, &bs).unwrap();
        assert_eq!(buf, vec![0, 0, 0, 10, 0, 0, 0, 2, 0x40, 0x00]);
        assert_eq!(read_bitstring(&mut Cursor::new(buf)).unwrap(), bs);

        let mut empty = Vec::new();
        write_bitstring(&mut empty, &Bitstring::new(0)).unwrap();
        assert_eq!(empty, vec![0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_bitstring_byte_count_must_match_bits() {
        // 2^24 bits announced with a single byte of payload.
        let buf = vec![1, 0, 0, 0, 0, 0, 0, 1, 0xff];
        assert!(matches!(
            read_bitstring(&mut Cursor::new(buf)),
            Err(WireError::Malformed(_))
        ));
        let buf = vec![0, 0, 0, 10, 0, 0, 0, 3, 0x40, 0x00, 0x00];
        assert!(matches!(
            read_bitstring(&mut Cursor::new(buf)),
            Err(WireError::Malformed(_))
        ));
    }

    #[test]
    fn test_zz_array_fixed_width() {
        let p = p_sks();
        let items = vec![Zp::from_i64(&p, 1), Zp::from_i64(&p, 65537)];
        let mut buf = Vec::new();
        write_zz_array(&mut buf, &items).unwrap();
        assert_eq!(buf.len(), 4 + 2 * 17);
        assert_eq!(&buf[4..7], &[1, 0, 0]);
        assert_eq!(read_zz_array(&mut Cursor::new(buf), &p).unwrap(), items);
    }

    #[test]
    fn test_truncated_input_is_io_error() {
        let p = p_sks();
        let buf = vec![0, 0, 0, 1, 9, 9];
        assert!(matches!(
            read_zz_array(&mut Cursor::new(buf), &p),
            Err(WireError::Io(_))
        ));
    }
}
