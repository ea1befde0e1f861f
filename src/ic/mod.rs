//! The IC multiplexed RPC channel (spec.md §4.4-§4.5): wire framing,
//! the priority send queue, the pending-query table, timers, and the
//! channel state machine that ties them together.

pub mod channel;
pub mod frame;
pub mod msg;
pub mod pending;
pub mod queue;
pub mod timers;

pub use channel::{ChannelConfig, ChannelState, IcChannel, TlsMode, Transport};
pub use frame::{
    Command, FrameHeader, Flags, Priority, SlotIdGenerator, StreamControl, HEADER_LEN, ID_MAX,
    SLOT_MASK, STREAM_CONTROL_COMMAND,
};
pub use msg::{Continuation, OutMsg};
pub use pending::PendingTable;
pub use queue::SendQueue;
pub use timers::{watchdog_deadlines, TimerHandle, TimerKind, TimerSet};
