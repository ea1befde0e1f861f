//! Pre/post dispatch hooks (spec.md §4.6): "every registration may
//! carry `pre_hook(ic, slot, rpc, hdr, userdata)` and
//! `post_hook(ic, status, ctx, userdata, result_struct?, result_value?)`.
//! The pre-hook may short-circuit by replying... A per-call `hook_ctx`
//! stores the slot, a reference to the `cbe`, the post-hook args, and
//! caller-supplied pass-through bytes; it is indexed by slot and
//! fetched at reply time."

use std::collections::HashMap;

use crate::dispatch::cbe::{DispatchOutcome, IcHeader};

/// What a pre-hook decided.
pub enum PreHookOutcome {
    /// Proceed to the registration's own implementation.
    Continue,
    /// Reply immediately; the implementation is never invoked.
    ShortCircuit(DispatchOutcome),
}

pub type PreHook = dyn Fn(u32, u32, &IcHeader) -> PreHookOutcome + Send + Sync;
pub type PostHook = dyn Fn(crate::error::IcStatus, &HookCtx) + Send + Sync;

/// Per-call context threaded from dispatch time to reply time so a
/// post-hook can see what it was originally called for.
#[derive(Debug, Clone)]
pub struct HookCtx {
    pub slot: u32,
    pub cmd: u32,
    pub userdata: Vec<u8>,
}

/// Slot-indexed table of in-flight [`HookCtx`] entries, populated when
/// a registration with a post-hook is dispatched and consumed when its
/// reply is about to be sent.
#[derive(Default)]
pub struct HookCtxTable {
    entries: HashMap<u32, HookCtx>,
}

impl HookCtxTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, ctx: HookCtx) {
        self.entries.insert(ctx.slot, ctx);
    }

    /// Removes and returns the context for `slot`, if a post-hook was
    /// registered for this call.
    pub fn take(&mut self, slot: u32) -> Option<HookCtx> {
        self.entries.remove(&slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_ctx_is_fetched_once_by_slot() {
        let mut table = HookCtxTable::new();
        table.insert(HookCtx {
            slot: 7,
            cmd: 0x0001_0002,
            userdata: vec![1, 2, 3],
        });
        let ctx = table.take(7).unwrap();
        assert_eq!(ctx.cmd, 0x0001_0002);
        assert!(table.take(7).is_none());
    }
}
