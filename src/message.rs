//! The message value object: single-response discipline enforced locally,
//! actual finish/requeue/touch delivery routed back to the owning session
//! through a channel handle so a message can outlive the session object
//! without keeping it alive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{NsqError, Result};

/// Commands a `Message` sends back to its owning session's writer task.
pub enum MessageCommand {
    Finish([u8; 16]),
    Requeue { id: [u8; 16], timeout_ms: i64, backoff: bool },
    Touch([u8; 16]),
}

/// A message delivered on a `SUB`'d channel.
///
/// `responded` is shared with nothing else: only this handle observes and
/// mutates it, so a plain `AtomicBool` (rather than a lock) is enough to
/// give `finish`/`requeue`/`touch` a cheap, `Send`-safe single-response
/// check even though the handle may be moved into a spawned handler task.
#[derive(Clone)]
pub struct Message {
    pub timestamp: i64,
    pub attempts: u16,
    pub id: [u8; 16],
    pub body: Bytes,
    responded: Arc<AtomicBool>,
    is_async: Arc<AtomicBool>,
    sender: mpsc::UnboundedSender<MessageCommand>,
}

impl Message {
    pub(crate) fn new(
        timestamp: i64,
        attempts: u16,
        id: [u8; 16],
        body: Bytes,
        sender: mpsc::UnboundedSender<MessageCommand>,
    ) -> Self {
        Message {
            timestamp,
            attempts,
            id,
            body,
            responded: Arc::new(AtomicBool::new(false)),
            is_async: Arc::new(AtomicBool::new(false)),
            sender,
        }
    }

    /// Marks the message as asynchronously handled: the consumer supervisor
    /// will not auto-finish it when the handler returns.
    pub fn enable_async(&self) {
        self.is_async.store(true, Ordering::SeqCst);
    }

    pub fn is_async(&self) -> bool {
        self.is_async.load(Ordering::SeqCst)
    }

    pub fn has_responded(&self) -> bool {
        self.responded.load(Ordering::SeqCst)
    }

    fn take_response_slot(&self) -> Result<()> {
        if self.responded.swap(true, Ordering::SeqCst) {
            return Err(NsqError::AlreadyResponded);
        }
        Ok(())
    }

    pub fn finish(&self) -> Result<()> {
        self.take_response_slot()?;
        self.sender
            .send(MessageCommand::Finish(self.id))
            .map_err(|_| NsqError::SocketError("session gone".into()))
    }

    pub fn requeue(&self, timeout_ms: i64, backoff: bool) -> Result<()> {
        self.take_response_slot()?;
        self.sender
            .send(MessageCommand::Requeue {
                id: self.id,
                timeout_ms,
                backoff,
            })
            .map_err(|_| NsqError::SocketError("session gone".into()))
    }

    /// `touch` is permitted any number of times strictly before the
    /// terminal response; it does not consume the single-response slot.
    pub fn touch(&self) -> Result<()> {
        if self.has_responded() {
            return Err(NsqError::AlreadyResponded);
        }
        self.sender
            .send(MessageCommand::Touch(self.id))
            .map_err(|_| NsqError::SocketError("session gone".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Message, mpsc::UnboundedReceiver<MessageCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let msg = Message::new(0, 0, [0u8; 16], Bytes::from_static(b"body"), tx);
        (msg, rx)
    }

    #[test]
    fn finish_then_finish_fails() {
        let (msg, _rx) = fixture();
        assert!(msg.finish().is_ok());
        assert!(matches!(msg.finish(), Err(NsqError::AlreadyResponded)));
    }

    #[test]
    fn finish_then_requeue_fails() {
        let (msg, _rx) = fixture();
        assert!(msg.finish().is_ok());
        assert!(matches!(
            msg.requeue(0, false),
            Err(NsqError::AlreadyResponded)
        ));
    }

    #[test]
    fn touch_allowed_multiple_times_before_terminal_response() {
        let (msg, _rx) = fixture();
        assert!(msg.touch().is_ok());
        assert!(msg.touch().is_ok());
        assert!(msg.finish().is_ok());
    }

    #[test]
    fn touch_after_terminal_response_fails() {
        let (msg, _rx) = fixture();
        msg.requeue(0, false).unwrap();
        assert!(matches!(msg.touch(), Err(NsqError::AlreadyResponded)));
    }

    #[test]
    fn async_flag_defaults_false() {
        let (msg, _rx) = fixture();
        assert!(!msg.is_async());
        msg.enable_async();
        assert!(msg.is_async());
    }
}
