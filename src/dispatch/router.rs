//! The `cmd → cbe` registration table and the dispatch entry point
//! (spec.md §4.6).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

use crate::dispatch::cbe::{Cbe, DispatchOutcome, IcHeader};
use crate::dispatch::hooks::{HookCtx, HookCtxTable, PostHook, PreHook, PreHookOutcome};
use crate::error::{IcError, IcStatus};
use crate::ic::channel::IcChannel;
use crate::ic::frame::{decode_command, Command, Priority};
use crate::ic::msg::Continuation;

/// Builds the continuation proxy dispatch hands to the target
/// channel's `send_query`: when invoked, it re-emits the reply back to
/// the original caller under the original slot. This stands in for the
/// original's "magic proxy callback" sentinel function pointer
/// (spec.md §4.6 "a sentinel callback value signals ... the
/// continuation's private data is the 64-bit slot to forward to"): a
/// Rust closure already captures exactly that state, so no sentinel
/// value is needed to recognize the case.
pub fn forwarding_continuation(reply: ReplySender, original_slot: u32) -> Continuation {
    Box::new(move |status, payload| {
        reply.forward_reply_to(original_slot, status, payload);
    })
}

/// A command queued for a channel's event loop to actually send,
/// issued by dispatch callbacks that may run outside that loop's own
/// task (e.g. a proxy's continuation, invoked when the target
/// channel's reply arrives).
pub enum ReplyCommand {
    Reply {
        slot: u32,
        status: IcStatus,
        payload: Vec<u8>,
    },
}

/// Handle a dispatch callback uses to reply, immediately or later
/// (spec.md §4.6 `reply`/`throw`/`reply_err`/`forward_reply_to`).
#[derive(Clone)]
pub struct ReplySender {
    tx: UnboundedSender<ReplyCommand>,
}

impl ReplySender {
    pub fn new(tx: UnboundedSender<ReplyCommand>) -> Self {
        Self { tx }
    }

    pub fn reply(&self, slot: u32, status: IcStatus, payload: Vec<u8>) {
        let _ = self.tx.send(ReplyCommand::Reply { slot, status, payload });
    }

    pub fn throw(&self, slot: u32, payload: Vec<u8>) {
        self.reply(slot, IcStatus::Exn, payload);
    }

    pub fn reply_err(&self, slot: u32, status: IcStatus) {
        self.reply(slot, status, Vec::new());
    }

    /// Re-emits an already-received reply without re-serializing it
    /// (spec.md §4.6: "copies the raw payload from the forwarder's
    /// read buffer").
    pub fn forward_reply_to(&self, slot: u32, status: IcStatus, payload: Vec<u8>) {
        self.reply(slot, status, payload);
    }
}

/// Everything a registration carries alongside its [`Cbe`].
pub struct Registration {
    pub cbe: Cbe,
    pub pre_hook: Option<Arc<PreHook>>,
    pub post_hook: Option<Arc<PostHook>>,
}

impl Registration {
    pub fn new(cbe: Cbe) -> Self {
        Self {
            cbe,
            pre_hook: None,
            post_hook: None,
        }
    }

    pub fn with_pre_hook(mut self, hook: Arc<PreHook>) -> Self {
        self.pre_hook = Some(hook);
        self
    }

    pub fn with_post_hook(mut self, hook: Arc<PostHook>) -> Self {
        self.post_hook = Some(hook);
        self
    }
}

/// The process-wide `cmd → cbe` registration table.
#[derive(Default)]
pub struct Router {
    table: HashMap<u32, Registration>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, interface: u16, rpc: u16, registration: Registration) {
        let cmd = ((interface as u32) << 16) | rpc as u32;
        self.table.insert(cmd, registration);
    }

    pub fn find(&self, cmd: u32) -> Option<&Registration> {
        self.table.get(&cmd)
    }

    /// Dispatches one query. Returns the reply to send immediately, or
    /// `None` if the implementation deferred or the call is proxied
    /// (the eventual reply arrives later as a [`ReplyCommand`]).
    pub async fn dispatch(
        &self,
        reply: ReplySender,
        hook_ctxs: &mut HookCtxTable,
        cmd: u32,
        slot: u32,
        payload: Vec<u8>,
        hdr: IcHeader,
    ) -> Option<(IcStatus, Vec<u8>)> {
        let interface = (cmd >> 16) as u16;
        let rpc = (cmd & 0x7FFF) as u16;

        let Some(registration) = self.table.get(&cmd) else {
            return Some((IcStatus::Unimplemented, Vec::new()));
        };

        if let Some(pre) = &registration.pre_hook {
            match pre(slot, cmd, &hdr) {
                PreHookOutcome::ShortCircuit(outcome) => return Self::finish(outcome),
                PreHookOutcome::Continue => {}
            }
        }

        if registration.post_hook.is_some() {
            hook_ctxs.insert(HookCtx {
                slot,
                cmd,
                userdata: Vec::new(),
            });
        }

        let outcome = match &registration.cbe {
            Cbe::Normal(f) | Cbe::WsShared(f) => f(reply.clone(), slot, payload, hdr),
            Cbe::ProxyStatic { target } => {
                Self::forward(target.clone(), interface, rpc, payload, reply, slot).await
            }
            Cbe::ProxyPtr { target } => {
                let resolved = target.read().await.clone();
                match resolved {
                    Some(chan) => Self::forward(chan, interface, rpc, payload, reply, slot).await,
                    None => DispatchOutcome::Reply(IcStatus::ProxyError, Vec::new()),
                }
            }
            Cbe::ProxyDyn { getter } => match getter(&hdr) {
                Some((chan, _forced_hdr)) => {
                    Self::forward(chan, interface, rpc, payload, reply, slot).await
                }
                None => DispatchOutcome::Reply(IcStatus::ProxyError, Vec::new()),
            },
        };

        Self::finish(outcome)
    }

    async fn forward(
        target: Arc<Mutex<IcChannel>>,
        interface: u16,
        rpc: u16,
        payload: Vec<u8>,
        reply: ReplySender,
        original_slot: u32,
    ) -> DispatchOutcome {
        let continuation = forwarding_continuation(reply, original_slot);
        let sent = target
            .lock()
            .await
            .send_query(interface, rpc, payload, Priority::Normal, None, continuation);
        match sent {
            Ok(_) => DispatchOutcome::Deferred,
            Err(_) => DispatchOutcome::Reply(IcStatus::ProxyError, Vec::new()),
        }
    }

    fn finish(outcome: DispatchOutcome) -> Option<(IcStatus, Vec<u8>)> {
        match outcome {
            DispatchOutcome::Reply(status, payload) => Some((status, payload)),
            DispatchOutcome::Deferred => None,
        }
    }
}

/// Looks up the [`HookCtx`] stashed for `slot` (if the registration
/// that handled it carried a post-hook) and invokes the post-hook with
/// the final status, same as `dispatch`'s pre-hook lookup but on the
/// reply path.
fn invoke_post_hook(router: &Router, hook_ctxs: &mut HookCtxTable, slot: u32, status: IcStatus) {
    let Some(ctx) = hook_ctxs.take(slot) else {
        return;
    };
    if let Some(registration) = router.find(ctx.cmd) {
        if let Some(post) = &registration.post_hook {
            post(status, &ctx);
        }
    }
}

/// Sends `slot`'s reply and fires its post-hook, if any, exactly once.
fn apply_reply(
    channel: &mut IcChannel,
    router: &Router,
    hook_ctxs: &mut HookCtxTable,
    slot: u32,
    status: IcStatus,
    payload: Vec<u8>,
) -> Result<(), IcError> {
    invoke_post_hook(router, hook_ctxs, slot, status);
    channel.send_reply(slot, status, payload)
}

/// Drains every query `channel` has buffered, dispatches each through
/// `router`, and applies any immediate reply. Deferred and proxied
/// replies surface later through `rx` (see [`drain_reply_commands`]).
pub async fn dispatch_pending(
    channel: &mut IcChannel,
    router: &Router,
    reply: &ReplySender,
    hook_ctxs: &mut HookCtxTable,
) -> Result<(), IcError> {
    while let Some((header, payload)) = channel.poll_inbound_query() {
        let command = decode_command(header.command)?;
        let Command::Query { interface, rpc } = command else {
            continue;
        };
        let cmd = ((interface as u32) << 16) | rpc as u32;
        let outcome = router
            .dispatch(reply.clone(), hook_ctxs, cmd, header.slot, payload, IcHeader::default())
            .await;
        if let Some((status, out_payload)) = outcome {
            apply_reply(channel, router, hook_ctxs, header.slot, status, out_payload)?;
        }
    }
    Ok(())
}

/// Applies every [`ReplyCommand`] queued so far onto `channel`,
/// without blocking if none are ready. This is where deferred and
/// proxied replies (including forwarded proxy continuations) finally
/// reach the wire, so post-hooks for those calls fire here too.
pub fn drain_reply_commands(
    channel: &mut IcChannel,
    router: &Router,
    hook_ctxs: &mut HookCtxTable,
    rx: &mut UnboundedReceiver<ReplyCommand>,
) -> Result<(), IcError> {
    while let Ok(cmd) = rx.try_recv() {
        match cmd {
            ReplyCommand::Reply { slot, status, payload } => {
                apply_reply(channel, router, hook_ctxs, slot, status, payload)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn unregistered_cmd_replies_unimplemented() {
        let router = Router::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let reply = ReplySender::new(tx);
        let mut hook_ctxs = HookCtxTable::new();
        let outcome = router
            .dispatch(reply, &mut hook_ctxs, 0x0001_0002, 5, Vec::new(), IcHeader::default())
            .await;
        assert_eq!(outcome, Some((IcStatus::Unimplemented, Vec::new())));
    }

    #[tokio::test]
    async fn normal_cbe_replies_synchronously() {
        let mut router = Router::new();
        let cbe = Cbe::Normal(Arc::new(|_reply, slot, args, _hdr| {
            DispatchOutcome::Reply(IcStatus::Ok, [args, slot.to_le_bytes().to_vec()].concat())
        }));
        router.register(1, 2, Registration::new(cbe));

        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let reply = ReplySender::new(tx);
        let mut hook_ctxs = HookCtxTable::new();
        let outcome = router
            .dispatch(reply, &mut hook_ctxs, (1u32 << 16) | 2, 9, vec![0xAB], IcHeader::default())
            .await;
        let (status, payload) = outcome.unwrap();
        assert_eq!(status, IcStatus::Ok);
        assert_eq!(payload[0], 0xAB);
    }

    #[tokio::test]
    async fn pre_hook_short_circuits_before_the_implementation_runs() {
        let mut router = Router::new();
        let called = Arc::new(AtomicBool::new(false));
        let called2 = called.clone();
        let cbe = Cbe::Normal(Arc::new(move |_reply, _slot, _args, _hdr| {
            called2.store(true, Ordering::SeqCst);
            DispatchOutcome::Reply(IcStatus::Ok, Vec::new())
        }));
        let registration = Registration::new(cbe).with_pre_hook(Arc::new(|_slot, _cmd, _hdr| {
            PreHookOutcome::ShortCircuit(DispatchOutcome::Reply(IcStatus::Invalid, Vec::new()))
        }));
        router.register(1, 2, registration);

        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let reply = ReplySender::new(tx);
        let mut hook_ctxs = HookCtxTable::new();
        let outcome = router
            .dispatch(reply, &mut hook_ctxs, (1u32 << 16) | 2, 1, Vec::new(), IcHeader::default())
            .await;
        assert_eq!(outcome, Some((IcStatus::Invalid, Vec::new())));
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn proxy_with_unresolved_indirection_returns_proxy_error() {
        let mut router = Router::new();
        let cbe = Cbe::ProxyPtr {
            target: Arc::new(tokio::sync::RwLock::new(None)),
        };
        router.register(1, 2, Registration::new(cbe));

        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let reply = ReplySender::new(tx);
        let mut hook_ctxs = HookCtxTable::new();
        let outcome = router
            .dispatch(reply, &mut hook_ctxs, (1u32 << 16) | 2, 1, Vec::new(), IcHeader::default())
            .await;
        assert_eq!(outcome, Some((IcStatus::ProxyError, Vec::new())));
    }
}
