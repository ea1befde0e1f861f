//! The HTTP gateway (spec.md §4.7): a `Trigger` attached to a URL
//! prefix that negotiates JSON vs. SOAP/XML, builds a synthetic IC
//! header from the request, dispatches through [`crate::dispatch`]
//! under the HTTP slot addressing form, and maps the resulting
//! [`crate::error::IcStatus`] to an HTTP status code.

pub mod soap;
pub mod status;
pub mod trigger;

pub use status::{encode_body, negotiate_encoding, status_to_http_code, ContentEncoding};
pub use trigger::{RpcEntry, Trigger};
