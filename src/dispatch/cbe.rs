//! Callback entries (spec.md §3 "Callback entry (`cbe`)", §4.6): the
//! five ways a registered `cmd` can be fulfilled.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::IcStatus;
use crate::ic::channel::IcChannel;

/// A synthetic header carried alongside a dispatched query: transport
/// credentials and addressing info that isn't part of the RPC payload
/// itself (spec.md §3 "IC message", §4.7 "a synthetic IC header").
#[derive(Debug, Clone, Default)]
pub struct IcHeader {
    pub login: Option<String>,
    pub password: Option<String>,
    pub peer_addr: Option<String>,
    pub workspace_id: Option<i64>,
    pub payload_len: usize,
}

/// What a [`Cbe::Normal`] (or [`Cbe::WsShared`]) implementation function
/// did with a dispatched query.
pub enum DispatchOutcome {
    /// Reply now with this status and payload.
    Reply(IcStatus, Vec<u8>),
    /// The implementation captured the slot and will reply later
    /// through a cloned [`crate::dispatch::router::ReplySender`]
    /// (spec.md §4.6 "capture `slot` and reply later").
    Deferred,
}

/// `(reply_sender, slot, args, hdr) -> outcome` (spec.md §4.6 "Normal").
pub type NormalFn = dyn Fn(crate::dispatch::router::ReplySender, u32, Vec<u8>, IcHeader) -> DispatchOutcome
    + Send
    + Sync;

/// `(hdr) -> Some((target, forced_header))`, `None` meaning the
/// indirection is unset (spec.md §4.6 "Dynamic proxy").
pub type ProxyDynGetter =
    dyn Fn(&IcHeader) -> Option<(Arc<Mutex<IcChannel>>, Option<IcHeader>)> + Send + Sync;

/// The five callback-entry kinds a registration may carry.
pub enum Cbe {
    /// Invoke a function directly; it may reply synchronously or defer.
    Normal(Arc<NormalFn>),
    /// Forward to a fixed, pre-registered target channel.
    ProxyStatic { target: Arc<Mutex<IcChannel>> },
    /// Forward to a target resolved through a mutable indirection, so
    /// operators can retarget without re-registering the `cmd`.
    ProxyPtr {
        target: Arc<tokio::sync::RwLock<Option<Arc<Mutex<IcChannel>>>>>,
    },
    /// Forward to a target resolved per-call from the incoming header.
    ProxyDyn { getter: Arc<ProxyDynGetter> },
    /// Reachable from both the IC transport and the HTTP gateway,
    /// sharing one implementation function (spec.md §4.6 "WS-shared").
    WsShared(Arc<NormalFn>),
}
