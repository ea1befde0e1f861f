//! BER (Basic Encoding Rules) primitives: length/integer/tag encode-decode
//! over a byte-stream cursor (spec.md §4.1).
//!
//! Everything here is leaf-level and allocation-free on the decode path;
//! the ASN.1 engine (`crate::asn1`) is the only caller.

mod cursor;
mod primitives;

pub use cursor::{ByteCursor, CursorError};
pub use primitives::{
    decode_int, decode_length, pack_int32, pack_int64, pack_len, pack_tag, pack_uint32,
    pack_uint64, skip_field, Length,
};
