//! HTTP status and `Accept-Encoding` negotiation for the gateway reply
//! path (spec.md §4.7).

use crate::error::IcStatus;

/// Maps a dispatch status to the HTTP status code the gateway replies
/// with: `Ok` → 200, `Exn` → 500 (distinguishing an application
/// exception from a transport error), `Unimplemented` → 404, and every
/// other status (`Retry`/`Abort`/`ProxyError`/`Invalid`/`ServerError`/
/// `TimedOut`/`Canceled`) → 400.
pub fn status_to_http_code(status: IcStatus) -> u16 {
    match status {
        IcStatus::Ok => 200,
        IcStatus::Exn => 500,
        IcStatus::Unimplemented => 404,
        IcStatus::Retry
        | IcStatus::Abort
        | IcStatus::ProxyError
        | IcStatus::Invalid
        | IcStatus::ServerError
        | IcStatus::TimedOut
        | IcStatus::Canceled => 400,
    }
}

/// The response-body encoding negotiated from `Accept-Encoding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Deflate,
}

/// Picks the response encoding, preferring `gzip` over `deflate` when
/// both are offered (spec.md §4.7 "Compression is chosen by
/// Accept-Encoding: gzip, deflate, or none.").
pub fn negotiate_encoding(accept_encoding: Option<&str>) -> ContentEncoding {
    let Some(header) = accept_encoding else {
        return ContentEncoding::Identity;
    };
    let offers: Vec<&str> = header
        .split(',')
        .map(|s| s.split(';').next().unwrap_or("").trim())
        .collect();
    if offers.iter().any(|o| *o == "gzip" || *o == "*") {
        ContentEncoding::Gzip
    } else if offers.iter().any(|o| *o == "deflate") {
        ContentEncoding::Deflate
    } else {
        ContentEncoding::Identity
    }
}

pub fn encoding_header_value(encoding: ContentEncoding) -> Option<&'static str> {
    match encoding {
        ContentEncoding::Identity => None,
        ContentEncoding::Gzip => Some("gzip"),
        ContentEncoding::Deflate => Some("deflate"),
    }
}

/// Parses a request's literal `Content-Encoding` value (unlike
/// [`negotiate_encoding`], there's no preference list to pick from —
/// the body was encoded exactly one way).
pub fn parse_content_encoding(content_encoding: Option<&str>) -> Option<ContentEncoding> {
    match content_encoding?.trim() {
        "gzip" => Some(ContentEncoding::Gzip),
        "deflate" => Some(ContentEncoding::Deflate),
        "identity" => Some(ContentEncoding::Identity),
        _ => None,
    }
}

/// Decompresses `body` per `encoding`, or returns it unchanged for
/// `Identity`. The inverse of [`encode_body`], used on request bodies
/// rather than replies.
pub fn decode_body(body: &[u8], encoding: ContentEncoding) -> std::io::Result<Vec<u8>> {
    use std::io::Read;
    match encoding {
        ContentEncoding::Identity => Ok(body.to_vec()),
        ContentEncoding::Gzip => {
            let mut dec = flate2::read::GzDecoder::new(body);
            let mut out = Vec::new();
            dec.read_to_end(&mut out)?;
            Ok(out)
        }
        ContentEncoding::Deflate => {
            let mut dec = flate2::read::DeflateDecoder::new(body);
            let mut out = Vec::new();
            dec.read_to_end(&mut out)?;
            Ok(out)
        }
    }
}

/// Compresses `body` per `encoding`, or returns it unchanged for
/// `Identity`.
pub fn encode_body(body: &[u8], encoding: ContentEncoding) -> std::io::Result<Vec<u8>> {
    use std::io::Write;
    match encoding {
        ContentEncoding::Identity => Ok(body.to_vec()),
        ContentEncoding::Gzip => {
            let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(body)?;
            enc.finish()
        }
        ContentEncoding::Deflate => {
            let mut enc = flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(body)?;
            enc.finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_the_reply_encoding_table() {
        assert_eq!(status_to_http_code(IcStatus::Ok), 200);
        assert_eq!(status_to_http_code(IcStatus::Exn), 500);
        assert_eq!(status_to_http_code(IcStatus::Unimplemented), 404);
        for s in [
            IcStatus::Retry,
            IcStatus::Abort,
            IcStatus::ProxyError,
            IcStatus::Invalid,
            IcStatus::ServerError,
        ] {
            assert_eq!(status_to_http_code(s), 400);
        }
    }

    #[test]
    fn gzip_is_preferred_over_deflate() {
        assert_eq!(negotiate_encoding(Some("deflate, gzip")), ContentEncoding::Gzip);
        assert_eq!(negotiate_encoding(Some("deflate")), ContentEncoding::Deflate);
        assert_eq!(negotiate_encoding(None), ContentEncoding::Identity);
        assert_eq!(negotiate_encoding(Some("br")), ContentEncoding::Identity);
    }

    #[test]
    fn gzip_roundtrips() {
        let body = b"hello gateway";
        let compressed = encode_body(body, ContentEncoding::Gzip).unwrap();
        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut out = Vec::new();
        std::io::Read::read_to_end(&mut decoder, &mut out).unwrap();
        assert_eq!(out, body);
    }

    #[test]
    fn decode_body_inverts_encode_body() {
        let body = b"a compressed request body";
        for encoding in [ContentEncoding::Gzip, ContentEncoding::Deflate, ContentEncoding::Identity] {
            let encoded = encode_body(body, encoding).unwrap();
            let decoded = decode_body(&encoded, encoding).unwrap();
            assert_eq!(decoded, body);
        }
    }

    #[test]
    fn parse_content_encoding_rejects_unknown_values() {
        assert_eq!(parse_content_encoding(Some("gzip")), Some(ContentEncoding::Gzip));
        assert_eq!(parse_content_encoding(Some("br")), None);
        assert_eq!(parse_content_encoding(None), None);
    }
}
