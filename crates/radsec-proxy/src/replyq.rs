//! Bounded reply queues
//!
//! Each queue has one consumer (a reply writer task) and any number of
//! producers (request handlers and upstream readers). Producers never
//! block: when the queue is at capacity the reply is dropped with a
//! warning. Datagram clients share one process-wide queue; each stream
//! client owns its own.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::warn;

/// A finished reply plus, for datagram clients, where to send it.
#[derive(Debug)]
pub struct Reply {
    pub buf: Vec<u8>,
    pub to: Option<SocketAddr>,
}

pub struct ReplyQueue {
    replies: Mutex<VecDeque<Reply>>,
    size: usize,
    available: Notify,
}

impl ReplyQueue {
    pub fn new(size: usize) -> ReplyQueue {
        ReplyQueue {
            replies: Mutex::new(VecDeque::with_capacity(size)),
            size,
            available: Notify::new(),
        }
    }

    /// Enqueue a reply, dropping it if the queue is full. Returns whether
    /// the reply was accepted.
    pub fn push(&self, reply: Reply) -> bool {
        {
            let mut replies = self.replies.lock().unwrap();
            if replies.len() == self.size {
                warn!("no room in reply queue, dropping reply");
                return false;
            }
            replies.push_back(reply);
        }
        self.available.notify_one();
        true
    }

    /// Dequeue the oldest reply if there is one.
    pub fn try_pop(&self) -> Option<Reply> {
        self.replies.lock().unwrap().pop_front()
    }

    /// Dequeue the oldest reply, waiting for one if the queue is empty.
    pub async fn pop(&self) -> Reply {
        loop {
            let notified = self.available.notified();
            if let Some(reply) = self.replies.lock().unwrap().pop_front() {
                return reply;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.replies.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
