//! Wakers that relay wakeups into the loop's mailbox.
//!
//! A pool worker thread completing a task must not touch loop-internal
//! state; it only sends the woken slot through the thread-safe mailbox,
//! which also serves as the loop's idle parking spot.

use super::LoopMsg;
use crossbeam_channel::Sender;
use std::sync::Arc;
use std::task::{Wake, Waker};

pub(crate) struct LoopWaker {
    slot: u64,
    mailbox: Sender<LoopMsg>,
}

impl LoopWaker {
    pub fn waker(slot: u64, mailbox: Sender<LoopMsg>) -> Waker {
        Arc::new(LoopWaker { slot, mailbox }).into()
    }
}

impl Wake for LoopWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        // send failure means the loop is gone; nothing left to wake
        let _ = self.mailbox.send(LoopMsg::Wake(self.slot));
    }
}
