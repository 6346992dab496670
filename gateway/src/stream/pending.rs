//! Pending call bindings.
//!
//! `/register` announces that a call's RTP is about to arrive on a
//! direction; the first packet of a new SSRC on that direction consumes the
//! oldest fresh entry. Entries older than the TTL are invisible: they are
//! discarded on every pop rather than by a background task.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::Direction;

struct Pending {
    uuid: String,
    enqueued: Instant,
}

/// Per-direction FIFO of `{uuid, enqueued-at}` with a TTL.
pub struct PendingBindings {
    ttl: Duration,
    inbound: Mutex<VecDeque<Pending>>,
    outbound: Mutex<VecDeque<Pending>>,
}

impl PendingBindings {
    pub fn new(ttl: Duration) -> Self {
        PendingBindings {
            ttl,
            inbound: Mutex::new(VecDeque::new()),
            outbound: Mutex::new(VecDeque::new()),
        }
    }

    fn queue(&self, direction: Direction) -> &Mutex<VecDeque<Pending>> {
        match direction {
            Direction::In => &self.inbound,
            Direction::Out => &self.outbound,
        }
    }

    /// Announce a call on a direction.
    pub fn push(&self, direction: Direction, uuid: &str) {
        self.queue(direction).lock().push_back(Pending {
            uuid: uuid.to_string(),
            enqueued: Instant::now(),
        });
    }

    /// Pop the oldest entry still within the TTL.
    pub fn pop_fresh(&self, direction: Direction) -> Option<String> {
        let mut queue = self.queue(direction).lock();
        while let Some(head) = queue.pop_front() {
            if head.enqueued.elapsed() <= self.ttl {
                return Some(head.uuid);
            }
        }
        None
    }
}
