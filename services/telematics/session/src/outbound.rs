//! Per-device FIFO of encoded commands awaiting transmission

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use telematics_protocol::DeviceCommand;
use tokio::sync::Notify;

/// A command together with the bytes its protocol encoded it into
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundCommand {
    /// Command as queued
    pub command: DeviceCommand,
    /// Wire bytes for the transport send path
    pub payload: Bytes,
    /// Enqueue time
    pub queued_at: DateTime<Utc>,
}

impl OutboundCommand {
    /// Stamp a freshly encoded command
    pub fn new(command: DeviceCommand, payload: Bytes) -> Self {
        Self {
            command,
            payload,
            queued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<OutboundCommand>,
    closed: bool,
}

/// FIFO consumed by the connection's send path.
///
/// Pushing never blocks. A closed queue refuses new commands and hands back
/// whatever was still pending so the caller can fail it explicitly.
#[derive(Debug, Default)]
pub struct CommandQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl CommandQueue {
    /// Create an open, empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command; `false` if the queue is closed
    pub fn push(&self, command: OutboundCommand) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.items.push_back(command);
        }
        self.notify.notify_one();
        true
    }

    /// Pop the oldest command without waiting
    pub fn try_pop(&self) -> Option<OutboundCommand> {
        self.state.lock().items.pop_front()
    }

    /// Wait for the next command. `None` once closed and drained.
    pub async fn next(&self) -> Option<OutboundCommand> {
        loop {
            let notified = self.notify.notified();
            let mut notified = std::pin::pin!(notified);
            // Register interest before checking so a concurrent push is not missed
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(command) = state.items.pop_front() {
                    return Some(command);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Close the queue and drain what was pending
    pub fn close(&self) -> Vec<OutboundCommand> {
        let drained = {
            let mut state = self.state.lock();
            state.closed = true;
            state.items.drain(..).collect()
        };
        self.notify.notify_waiters();
        drained
    }

    /// Accept commands again after a reconnect
    pub fn reopen(&self) {
        self.state.lock().closed = false;
    }

    /// Whether the queue refuses new commands
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of pending commands
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn outbound(text: &str) -> OutboundCommand {
        let command = DeviceCommand::raw(text).unwrap();
        let payload = Bytes::copy_from_slice(command.as_str().as_bytes());
        OutboundCommand::new(command, payload)
    }

    #[test]
    fn test_fifo_order() {
        let queue = CommandQueue::new();
        assert!(queue.push(outbound("getinfo")));
        assert!(queue.push(outbound("getstatus")));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.try_pop().unwrap().command.as_str(), "getinfo");
        assert_eq!(queue.try_pop().unwrap().command.as_str(), "getstatus");
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_close_drains_and_refuses() {
        let queue = CommandQueue::new();
        queue.push(outbound("getinfo"));
        queue.push(outbound("cpureset"));

        let drained = queue.close();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
        assert!(queue.is_closed());
        assert!(!queue.push(outbound("getinfo")));

        queue.reopen();
        assert!(queue.push(outbound("getinfo")));
    }

    #[tokio::test]
    async fn test_next_wakes_on_push() {
        let queue = Arc::new(CommandQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(outbound("getstatus"));

        let received = consumer.await.unwrap().unwrap();
        assert_eq!(received.command.as_str(), "getstatus");
    }

    #[tokio::test]
    async fn test_next_returns_none_after_close() {
        let queue = Arc::new(CommandQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        assert!(consumer.await.unwrap().is_none());
    }
}
