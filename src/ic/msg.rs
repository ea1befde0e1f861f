//! The in-flight message types the send queue and pending-query table
//! operate on (spec.md §4.5.1, §4.5.2).

use crate::error::IcStatus;
use crate::ic::frame::{Flags, Priority};

/// A continuation invoked exactly once with the terminal outcome of a
/// query: either the reply payload (status `Ok`/`Exn` carry a payload;
/// every other status's payload is empty) or a transport-level failure
/// status (spec.md §4.5.5 "invokes the continuation ... exactly once").
pub type Continuation = Box<dyn FnOnce(IcStatus, Vec<u8>) + Send>;

/// A message queued for transmission on a channel.
pub struct OutMsg {
    pub slot: u32,
    pub command: u32,
    pub flags: Flags,
    pub payload: Vec<u8>,
    pub priority: Priority,
    /// Set by [`crate::ic::pending::PendingTable`] cancellation; a
    /// reply that later arrives for a canceled message is discarded
    /// silently (spec.md §4.5.2).
    pub canceled: bool,
}

impl OutMsg {
    pub fn new(slot: u32, command: u32, flags: Flags, payload: Vec<u8>, priority: Priority) -> Self {
        Self {
            slot,
            command,
            flags,
            payload,
            priority,
            canceled: false,
        }
    }
}

impl std::fmt::Debug for OutMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutMsg")
            .field("slot", &self.slot)
            .field("command", &self.command)
            .field("priority", &self.priority)
            .field("payload_len", &self.payload.len())
            .field("canceled", &self.canceled)
            .finish()
    }
}
