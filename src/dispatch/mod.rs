//! RPC dispatch and proxying (spec.md §4.6): the `cmd → cbe`
//! registration table, the five callback-entry kinds, pre/post hooks,
//! and the reply paths.

pub mod cbe;
pub mod hooks;
pub mod router;

pub use cbe::{Cbe, DispatchOutcome, IcHeader, NormalFn, ProxyDynGetter};
pub use hooks::{HookCtx, HookCtxTable, PostHook, PreHook, PreHookOutcome};
pub use router::{dispatch_pending, drain_reply_commands, forwarding_continuation, Registration, ReplyCommand, ReplySender, Router};
