use super::cursor::{ByteCursor, CursorError};

/// Result of decoding a BER length octet sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Length {
    Definite(usize),
    /// Length byte `0x80`: the value runs until a terminating EOC
    /// (`0x00 0x00`). Only legal for `ext`, `sequence`, `choice` and
    /// `untagged-choice` fields (spec.md §4.2).
    Indefinite,
}

/// Decodes a BER length: short form if the high bit of the first byte is
/// clear; long form reads 1-4 subsequent length bytes; `0x80` alone means
/// indefinite length. Any other encoding (reserved `0xFF`, or a long-form
/// byte count above 4) is malformed (spec.md §4.1).
pub fn decode_length(cursor: &mut ByteCursor) -> Result<Length, CursorError> {
    let first = cursor.read_byte()?;
    if first & 0x80 == 0 {
        return Ok(Length::Definite(first as usize));
    }
    let n = first & 0x7f;
    if n == 0 {
        return Ok(Length::Indefinite);
    }
    if n == 0x7f || n as usize > 4 {
        return Err(CursorError::Malformed);
    }
    let mut value: usize = 0;
    for _ in 0..n {
        value = (value << 8) | cursor.read_byte()? as usize;
    }
    Ok(Length::Definite(value))
}

/// Decodes a two's-complement big-endian integer from exactly
/// `content_len` bytes, sign-extending from the first byte. This single
/// routine serves both signed and unsigned callers: an unsigned field
/// whose encoder emitted a disambiguating leading zero byte decodes to
/// the same non-negative `i64` a signed decode would produce, so callers
/// simply reinterpret the bit pattern at their declared width
/// (spec.md §4.1, open question: leading-zero disambiguation applied
/// uniformly across all unsigned widths).
pub fn decode_int(cursor: &mut ByteCursor, content_len: usize) -> Result<i64, CursorError> {
    if content_len == 0 || content_len > 9 {
        return Err(CursorError::Malformed);
    }
    let bytes = cursor.read_slice(content_len)?;
    let mut value: i64 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
    for &b in bytes {
        value = (value << 8) | b as i64;
    }
    Ok(value)
}

/// Skips a single BER tag+length+value, recursing through nested
/// indefinite-length constructed values and accounting for their
/// terminating EOC markers. Returns the consumed `tag..end` subrange.
pub fn skip_field<'a>(cursor: &mut ByteCursor<'a>) -> Result<&'a [u8], CursorError> {
    let start = cursor.position();
    let _tag = cursor.read_byte()?;
    match decode_length(cursor)? {
        Length::Definite(n) => {
            cursor.read_slice(n)?;
        }
        Length::Indefinite => loop {
            if cursor.peek_byte()? == 0x00 {
                let mut lookahead = *cursor;
                lookahead.read_byte()?;
                if lookahead.read_byte()? == 0x00 {
                    cursor.read_byte()?;
                    cursor.read_byte()?;
                    break;
                }
                return Err(CursorError::Malformed);
            }
            skip_field(cursor)?;
        },
    }
    Ok(cursor.slice_from(start))
}

fn minimal_bytes_signed(value: i64, width_bytes: usize) -> Vec<u8> {
    let full = value.to_be_bytes();
    let mut buf = full[8 - width_bytes..].to_vec();
    while buf.len() > 1 {
        let drop_leading_zero = buf[0] == 0x00 && (buf[1] & 0x80) == 0;
        let drop_leading_ff = buf[0] == 0xff && (buf[1] & 0x80) != 0;
        if drop_leading_zero || drop_leading_ff {
            buf.remove(0);
        } else {
            break;
        }
    }
    buf
}

fn minimal_bytes_unsigned(value: u64, width_bytes: usize) -> Vec<u8> {
    let full = value.to_be_bytes();
    let mut buf = full[8 - width_bytes..].to_vec();
    while buf.len() > 1 && buf[0] == 0x00 {
        buf.remove(0);
    }
    if buf[0] & 0x80 != 0 {
        buf.insert(0, 0x00);
    }
    buf
}

pub fn pack_int32(value: i32) -> Vec<u8> {
    minimal_bytes_signed(value as i64, 4)
}

pub fn pack_int64(value: i64) -> Vec<u8> {
    minimal_bytes_signed(value, 8)
}

pub fn pack_uint32(value: u32) -> Vec<u8> {
    minimal_bytes_unsigned(value as u64, 4)
}

pub fn pack_uint64(value: u64) -> Vec<u8> {
    minimal_bytes_unsigned(value, 8)
}

/// Emits a BER length: short form (`len < 128`) as a single byte; long
/// form otherwise, with the first byte's low 7 bits counting the
/// subsequent minimal-width length bytes.
pub fn pack_len(len: usize) -> Vec<u8> {
    if len < 128 {
        return vec![len as u8];
    }
    let mut body = (len as u64).to_be_bytes().to_vec();
    while body.len() > 1 && body[0] == 0 {
        body.remove(0);
    }
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(0x80 | body.len() as u8);
    out.extend(body);
    out
}

/// Single-byte BER tag (this implementation, like the spec's choice
/// tables, only supports single-byte tags; see spec.md §9 open
/// questions).
pub fn pack_tag(tag: u8) -> [u8; 1] {
    [tag]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_int32_examples() {
        assert_eq!(pack_int32(255), vec![0x00, 0xff]);
        assert_eq!(pack_int32(-255), vec![0xff, 0x01]);
    }

    #[test]
    fn pack_uint32_example() {
        assert_eq!(pack_uint32(0xffff_ffff), vec![0x00, 0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn pack_int64_example() {
        assert_eq!(pack_int64(-1), vec![0xff]);
    }

    #[test]
    fn pack_len_examples() {
        assert_eq!(pack_len(127), vec![0x7f]);
        assert_eq!(pack_len(128), vec![0x81, 0x80]);
    }

    #[test]
    fn decode_length_short_and_long_form() {
        let mut c = ByteCursor::new(&[0x05]);
        assert_eq!(decode_length(&mut c).unwrap(), Length::Definite(5));

        let mut c = ByteCursor::new(&[0x81, 0x80]);
        assert_eq!(decode_length(&mut c).unwrap(), Length::Definite(128));

        let mut c = ByteCursor::new(&[0x80]);
        assert_eq!(decode_length(&mut c).unwrap(), Length::Indefinite);
    }

    #[test]
    fn decode_length_rejects_oversized_long_form() {
        let mut c = ByteCursor::new(&[0x85, 0, 0, 0, 0, 1]);
        assert_eq!(decode_length(&mut c), Err(CursorError::Malformed));
    }

    #[test]
    fn decode_int_roundtrips_pack_int32() {
        for v in [0i32, 1, -1, 255, -255, i32::MAX, i32::MIN] {
            let bytes = pack_int32(v);
            let mut c = ByteCursor::new(&bytes);
            let decoded = decode_int(&mut c, bytes.len()).unwrap();
            assert_eq!(decoded as i32, v);
        }
    }

    #[test]
    fn decode_int_roundtrips_pack_uint32_with_disambiguation() {
        let bytes = pack_uint32(0xffff_ffff);
        let mut c = ByteCursor::new(&bytes);
        let decoded = decode_int(&mut c, bytes.len()).unwrap();
        assert_eq!(decoded as u32, 0xffff_ffff);
    }

    #[test]
    fn skip_field_definite_length() {
        // tag 0x04 (OCTET STRING), length 3, 3 payload bytes.
        let data = [0x04, 0x03, 1, 2, 3, 0xAA];
        let mut c = ByteCursor::new(&data);
        let consumed = skip_field(&mut c).unwrap();
        assert_eq!(consumed, &data[0..5]);
        assert_eq!(c.read_byte().unwrap(), 0xAA);
    }

    #[test]
    fn skip_field_indefinite_nested() {
        // Outer indefinite SEQUENCE containing one definite-length field,
        // terminated by EOC.
        let data = [0x30, 0x80, 0x04, 0x01, 0xBB, 0x00, 0x00, 0xCC];
        let mut c = ByteCursor::new(&data);
        let consumed = skip_field(&mut c).unwrap();
        assert_eq!(consumed, &data[0..7]);
        assert_eq!(c.read_byte().unwrap(), 0xCC);
    }
}
