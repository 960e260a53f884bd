//! Each worker pulls messages from its own `WorkloadQueue`; the
//! receiver pushes them.
use derivative::Derivative;
use std::collections::VecDeque;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;

use crate::shutdown::Shutdown;
use crate::sync::lock;
use crate::sync::wait;
use crate::ConnectionId;

#[derive(Derivative)]
#[derivative(Debug)]
pub enum MessageKind {
    /// One complete request payload, not decoded yet.
    Request(#[derivative(Debug = "ignore")] Box<[u8]>),
    /// The connection is gone.  The message carries the receiver's
    /// reference to the stream.
    Hangup,
}

/// A unit of work for a worker, tagged with the connection it came
/// from.  The stream is shared with the receiver, so responses can be
/// written even while the receiver keeps reading requests.
#[derive(Debug)]
pub struct Message {
    pub connection: ConnectionId,
    pub reply_to: Arc<UnixStream>,
    pub kind: MessageKind,
}

#[derive(Debug, Default)]
pub struct WorkloadQueue {
    items: Mutex<VecDeque<Message>>,
    cond: Condvar,
}

impl WorkloadQueue {
    pub fn new() -> WorkloadQueue {
        Default::default()
    }

    /// Enqueues `message` and wakes up one consumer.
    pub fn push(&self, message: Message) {
        lock(&self.items).push_back(message);
        self.cond.notify_one();
    }

    /// Blocks until a message is available, and returns it.  Returns
    /// `None` once `shutdown` calls for a hard stop; callers must
    /// then [`WorkloadQueue::wake`] the queue to interrupt the wait.
    pub fn pull(&self, shutdown: &Shutdown) -> Option<Message> {
        let mut items = lock(&self.items);

        loop {
            if shutdown.is_hard() {
                return None;
            }

            if let Some(message) = items.pop_front() {
                return Some(message);
            }

            items = wait(&self.cond, items);
        }
    }

    /// Wakes every consumer blocked in `pull`, so they notice a
    /// shutdown request.
    ///
    /// Taking the queue lock first means a consumer can't check the
    /// shutdown flag and then miss this notification.  That's also why
    /// this isn't safe to call from a signal handler, unlike the
    /// shutdown flags themselves.
    pub fn wake(&self) {
        let _guard = lock(&self.items);
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
