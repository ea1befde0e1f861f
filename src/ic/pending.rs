//! Pending-query table (spec.md §4.5.2): "A map `slot → msg` keyed by
//! the 24-bit slot. Insert on send for non-async RPCs. On reply
//! receipt, look up, detach, invoke the continuation. On channel
//! close, drain the table and invoke each continuation with `Aborted`
//! or `ProxyError`."

use std::collections::HashMap;

use crate::error::IcStatus;
use crate::ic::msg::Continuation;

struct Entry {
    continuation: Continuation,
    /// `true` once [`PendingTable::cancel`] has fired the continuation
    /// with `Canceled`; a reply that still arrives afterward is
    /// dropped rather than double-invoking it (spec.md §4.5.5).
    canceled: bool,
}

#[derive(Default)]
pub struct PendingTable {
    entries: HashMap<u32, Entry>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, slot: u32, continuation: Continuation) {
        self.entries.insert(
            slot,
            Entry {
                continuation,
                canceled: false,
            },
        );
    }

    /// A reply arrived for `slot`: detach and invoke its continuation,
    /// unless it was already canceled (spec.md §4.5.2 "A message
    /// flagged `canceled` whose reply later arrives is discarded
    /// silently").
    pub fn complete(&mut self, slot: u32, status: IcStatus, payload: Vec<u8>) {
        if let Some(entry) = self.entries.remove(&slot) {
            if !entry.canceled {
                (entry.continuation)(status, payload);
            }
        }
    }

    /// `cancel(msg)` (spec.md §4.5.5): invokes the continuation with
    /// `Canceled` exactly once and marks the slot so a later reply is
    /// ignored. Double-cancel (slot already gone) is a no-op.
    pub fn cancel(&mut self, slot: u32) {
        if let Some(mut entry) = self.entries.remove(&slot) {
            if !entry.canceled {
                entry.canceled = true;
                (entry.continuation)(IcStatus::Canceled, Vec::new());
            }
        }
    }

    /// Channel teardown: drains every pending entry, invoking each
    /// continuation with `status` (spec.md §4.5.2, §7 "channel I/O
    /// errors ... fail all `pending` continuations with `Abort`").
    pub fn drain_with(&mut self, status: IcStatus) {
        for (_, entry) in self.entries.drain() {
            if !entry.canceled {
                (entry.continuation)(status, Vec::new());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Continuation, Arc<Mutex<Option<(IcStatus, Vec<u8>)>>>) {
        let captured = Arc::new(Mutex::new(None));
        let captured2 = captured.clone();
        let cont: Continuation = Box::new(move |status, payload| {
            *captured2.lock().unwrap() = Some((status, payload));
        });
        (cont, captured)
    }

    #[test]
    fn complete_invokes_continuation_once() {
        let mut table = PendingTable::new();
        let (cont, captured) = recorder();
        table.insert(1, cont);
        table.complete(1, IcStatus::Ok, vec![9]);
        assert_eq!(*captured.lock().unwrap(), Some((IcStatus::Ok, vec![9])));
        assert!(table.is_empty());
    }

    #[test]
    fn cancel_then_late_reply_is_discarded() {
        let mut table = PendingTable::new();
        let (cont, captured) = recorder();
        table.insert(1, cont);
        table.cancel(1);
        assert_eq!(*captured.lock().unwrap(), Some((IcStatus::Canceled, Vec::new())));
        // slot already removed by cancel; a late reply has nothing to complete.
        table.complete(1, IcStatus::Ok, vec![1, 2, 3]);
        assert_eq!(*captured.lock().unwrap(), Some((IcStatus::Canceled, Vec::new())));
    }

    #[test]
    fn double_cancel_is_noop() {
        let mut table = PendingTable::new();
        let (cont, _captured) = recorder();
        table.insert(1, cont);
        table.cancel(1);
        table.cancel(1); // must not panic or double-invoke
    }

    #[test]
    fn drain_with_fires_every_remaining_continuation() {
        let mut table = PendingTable::new();
        let (cont_a, captured_a) = recorder();
        let (cont_b, captured_b) = recorder();
        table.insert(1, cont_a);
        table.insert(2, cont_b);
        table.drain_with(IcStatus::Abort);
        assert_eq!(captured_a.lock().unwrap().as_ref().unwrap().0, IcStatus::Abort);
        assert_eq!(captured_b.lock().unwrap().as_ref().unwrap().0, IcStatus::Abort);
        assert!(table.is_empty());
    }
}
