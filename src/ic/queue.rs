//! Priority send queue (spec.md §4.5.1).
//!
//! "Messages are inserted by priority: `HIGH` head-first (after
//! existing HIGHs), `NORMAL` inserted just after
//! `last_normal_prio_msg` (tracked by a cursor so NORMALs stay ordered
//! amongst themselves), `LOW` tail. Starvation of LOW under sustained
//! HIGH is accepted and documented."
//!
//! The original keeps two lists (`msg_list` pending build, `iov_list`
//! mid-flush). This runtime's writer flushes one message's header and
//! payload per `writev`-equivalent call rather than batching several
//! into a scatter/gather vector, so a single ordered `VecDeque` plays
//! both roles; nothing here changes the documented ordering guarantees.

use std::collections::VecDeque;

use crate::ic::frame::Priority;
use crate::ic::msg::OutMsg;

#[derive(Default)]
pub struct SendQueue {
    msgs: VecDeque<OutMsg>,
    /// Index just past the last NORMAL-priority message inserted so
    /// far, so successive NORMALs enqueue in FIFO order relative to
    /// each other without rescanning the whole list.
    last_normal_index: Option<usize>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self {
            msgs: VecDeque::new(),
            last_normal_index: None,
        }
    }

    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    pub fn enqueue(&mut self, msg: OutMsg) {
        let insert_at = match msg.priority {
            Priority::High => self.end_of_high_block(),
            Priority::Normal => self.last_normal_index.map(|i| i + 1).unwrap_or_else(|| self.end_of_high_block()),
            Priority::Low => self.msgs.len(),
        };
        self.msgs.insert(insert_at, msg);
        // An insertion at or before the tracked NORMAL cursor pushes it
        // one slot to the right.
        if let Some(idx) = &mut self.last_normal_index {
            if insert_at <= *idx {
                *idx += 1;
            }
        }
        if self.msgs[insert_at].priority == Priority::Normal {
            self.last_normal_index = Some(insert_at);
        }
    }

    fn end_of_high_block(&self) -> usize {
        self.msgs
            .iter()
            .rposition(|m| m.priority == Priority::High)
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    /// Removes and returns the next message to write, in queue order.
    pub fn pop_front(&mut self) -> Option<OutMsg> {
        let msg = self.msgs.pop_front()?;
        if let Some(idx) = &mut self.last_normal_index {
            if *idx == 0 {
                self.last_normal_index = None;
            } else {
                *idx -= 1;
            }
        }
        Some(msg)
    }

    /// Removes the message with the given slot, used by `cancel`
    /// (spec.md §4.5.5) to detach a still-queued message.
    pub fn remove_by_slot(&mut self, slot: u32) -> Option<OutMsg> {
        let pos = self.msgs.iter().position(|m| m.slot == slot)?;
        let was_normal_cursor = self.last_normal_index == Some(pos);
        let msg = self.msgs.remove(pos);
        if let Some(idx) = &mut self.last_normal_index {
            if pos < *idx {
                *idx -= 1;
            } else if was_normal_cursor {
                self.last_normal_index = if pos == 0 { None } else { Some(pos - 1) };
            }
        }
        msg
    }

    pub fn drain(&mut self) -> Vec<OutMsg> {
        self.last_normal_index = None;
        self.msgs.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(slot: u32, p: Priority) -> OutMsg {
        OutMsg::new(slot, 0, crate::ic::frame::Flags::empty(), Vec::new(), p)
    }

    fn order(q: &SendQueue) -> Vec<u32> {
        q.msgs.iter().map(|m| m.slot).collect()
    }

    #[test]
    fn high_goes_after_existing_highs_before_everything_else() {
        let mut q = SendQueue::new();
        q.enqueue(msg(1, Priority::Normal));
        q.enqueue(msg(2, Priority::High));
        q.enqueue(msg(3, Priority::High));
        q.enqueue(msg(4, Priority::Normal));
        assert_eq!(order(&q), vec![2, 3, 1, 4]);
    }

    #[test]
    fn normals_stay_fifo_among_themselves() {
        let mut q = SendQueue::new();
        q.enqueue(msg(1, Priority::Normal));
        q.enqueue(msg(2, Priority::Normal));
        q.enqueue(msg(3, Priority::High));
        q.enqueue(msg(4, Priority::Normal));
        assert_eq!(order(&q), vec![3, 1, 2, 4]);
    }

    #[test]
    fn low_goes_to_tail() {
        let mut q = SendQueue::new();
        q.enqueue(msg(1, Priority::Low));
        q.enqueue(msg(2, Priority::High));
        q.enqueue(msg(3, Priority::Normal));
        assert_eq!(order(&q), vec![2, 3, 1]);
    }

    #[test]
    fn pop_front_drains_in_order() {
        let mut q = SendQueue::new();
        q.enqueue(msg(1, Priority::Normal));
        q.enqueue(msg(2, Priority::High));
        assert_eq!(q.pop_front().unwrap().slot, 2);
        assert_eq!(q.pop_front().unwrap().slot, 1);
        assert!(q.pop_front().is_none());
    }

    #[test]
    fn remove_by_slot_detaches_a_queued_message() {
        let mut q = SendQueue::new();
        q.enqueue(msg(1, Priority::Normal));
        q.enqueue(msg(2, Priority::Normal));
        q.enqueue(msg(3, Priority::Normal));
        let removed = q.remove_by_slot(2).unwrap();
        assert_eq!(removed.slot, 2);
        assert_eq!(order(&q), vec![1, 3]);
        q.enqueue(msg(4, Priority::Normal));
        assert_eq!(order(&q), vec![1, 3, 4]);
    }
}
