//! Protocol-level error taxonomy shared by the IC channel, the RPC
//! dispatcher and the HTTP gateway.
//!
//! `anyhow` remains the error type at the application boundary (demo
//! binaries, config loading), but every point where the *protocol*
//! itself needs to express a failure — a decode error, a missing
//! registration, a proxy target that vanished — goes through
//! [`IcStatus`]/[`IcError`] so that the dispatcher, the channel and the
//! gateway can agree on one vocabulary (spec.md §7).

use std::cell::RefCell;
use std::fmt;

/// Status carried by an IC reply or surfaced to an HTTP gateway caller.
///
/// Numeric values mirror the original `ic_status_t` ordering
/// (`original_source/src/iop-rpc.h`) so that wire-compatible
/// implementations agree on the integer encoding used in the frame
/// `command` field for replies (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IcStatus {
    /// Normal reply.
    #[error("ok")]
    Ok = 0,
    /// Application-level exception value.
    #[error("application exception")]
    Exn = 1,
    /// Transient, safe to retry.
    #[error("transient error, retry")]
    Retry = 2,
    /// Transient, retry not advised.
    #[error("transient error, abort")]
    Abort = 3,
    /// Payload failed to decode or constraints were violated.
    #[error("invalid payload")]
    Invalid = 4,
    /// No registration for the target cmd.
    #[error("unimplemented")]
    Unimplemented = 5,
    /// Application-level unexpected failure.
    #[error("server error")]
    ServerError = 6,
    /// Proxy target unavailable.
    #[error("proxy error")]
    ProxyError = 7,
    /// Per-message timer fired before a reply arrived.
    #[error("timed out")]
    TimedOut = 8,
    /// Explicit cancel or channel close.
    #[error("canceled")]
    Canceled = 9,
    /// Local-only: a pending query was failed because its channel
    /// dropped and is auto-reconnecting (spec.md §4.5.4). Never appears
    /// on the wire — the original `ic_status_t` ordering this crate
    /// mirrors only spans 0-9, so this has no wire encoding and
    /// [`IcStatus::from_i32`] will never produce it.
    #[error("disconnected, reconnecting")]
    Disconnected = 10,
}

impl IcStatus {
    /// Reconstructs a status from its wire-level integer, as found in a
    /// reply frame's `command` field.
    pub fn from_i32(v: i32) -> Option<Self> {
        use IcStatus::*;
        Some(match v {
            0 => Ok,
            1 => Exn,
            2 => Retry,
            3 => Abort,
            4 => Invalid,
            5 => Unimplemented,
            6 => ServerError,
            7 => ProxyError,
            8 => TimedOut,
            9 => Canceled,
            _ => return None,
        })
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// `true` for statuses that terminate a pending query without ever
    /// having reached the peer's application code.
    pub fn is_transport_terminal(self) -> bool {
        matches!(
            self,
            IcStatus::Abort
                | IcStatus::ProxyError
                | IcStatus::TimedOut
                | IcStatus::Canceled
                | IcStatus::Disconnected
        )
    }
}

impl fmt::Display for IcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

/// An [`IcStatus`] paired with a human-readable message.
///
/// This is the concrete error type threaded through codec and dispatch
/// code; it is intentionally *not* `anyhow::Error` so that callers can
/// match on `.status` without downcasting.
#[derive(Debug, Clone)]
pub struct IcError {
    pub status: IcStatus,
    pub message: String,
}

impl std::error::Error for IcError {}

impl IcError {
    pub fn new(status: IcStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(IcStatus::Invalid, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(IcStatus::Unimplemented, message)
    }

    pub fn proxy_error(message: impl Into<String>) -> Self {
        Self::new(IcStatus::ProxyError, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(IcStatus::ServerError, message)
    }
}

pub type IcResult<T> = Result<T, IcError>;

thread_local! {
    /// Human-readable message for the last codec/dispatch failure on
    /// this thread, consulted by the HTTP gateway when formulating REST
    /// 4xx bodies and SOAP `faultstring` fields (spec.md §7).
    ///
    /// A thread-local is appropriate here (unlike the descriptor
    /// registry, which is re-architected away from thread-locals in
    /// §9) because this is genuinely per-request scratch state, never
    /// shared or mutated concurrently across requests in the
    /// single-threaded-per-channel model (spec.md §5).
    static ERROR_CONTEXT: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Records a human-readable error message for later retrieval by
/// [`take_error_context`].
pub fn set_error_context(message: impl Into<String>) {
    ERROR_CONTEXT.with(|cell| *cell.borrow_mut() = Some(message.into()));
}

/// Takes (clears) the current thread's error context message, if any.
pub fn take_error_context() -> Option<String> {
    ERROR_CONTEXT.with(|cell| cell.borrow_mut().take())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_through_wire_integer() {
        for s in [
            IcStatus::Ok,
            IcStatus::Exn,
            IcStatus::Retry,
            IcStatus::Abort,
            IcStatus::Invalid,
            IcStatus::Unimplemented,
            IcStatus::ServerError,
            IcStatus::ProxyError,
            IcStatus::TimedOut,
            IcStatus::Canceled,
        ] {
            assert_eq!(IcStatus::from_i32(s.as_i32()), Some(s));
        }
        assert_eq!(IcStatus::from_i32(42), None);
    }

    #[test]
    fn disconnected_has_no_wire_encoding() {
        assert_eq!(IcStatus::from_i32(IcStatus::Disconnected.as_i32()), None);
        assert!(IcStatus::Disconnected.is_transport_terminal());
    }

    #[test]
    fn error_context_is_take_once() {
        set_error_context("boom");
        assert_eq!(take_error_context().as_deref(), Some("boom"));
        assert_eq!(take_error_context(), None);
    }
}
