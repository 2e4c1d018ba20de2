use crate::origin::Origin;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::Child;
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("channel io failed: {0}")]
    Io(String),
    #[error("invalid channel frame: {0}")]
    InvalidFrame(String),
    #[error("channel disconnected")]
    Disconnected,
}

/// A string payload received from a peer, tagged with the peer's identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub sender: Origin,
    pub payload: String,
}

impl InboundMessage {
    pub fn new(sender: Origin, payload: impl Into<String>) -> Self {
        Self {
            sender,
            payload: payload.into(),
        }
    }
}

/// Opaque bidirectional channel between two isolated execution contexts.
pub trait MessageChannel {
    fn post(&mut self, target: &Origin, payload: &str) -> Result<(), TransportError>;
    fn receive(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, TransportError>;
    fn terminate(&mut self) {}
}

impl<C: MessageChannel + ?Sized> MessageChannel for Box<C> {
    fn post(&mut self, target: &Origin, payload: &str) -> Result<(), TransportError> {
        (**self).post(target, payload)
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, TransportError> {
        (**self).receive(timeout)
    }

    fn terminate(&mut self) {
        (**self).terminate()
    }
}

type Inbox = Rc<RefCell<VecDeque<InboundMessage>>>;

/// One end of an in-process channel pair.
///
/// Posting to any target other than the peer's origin is silently
/// discarded, the same way a cross-origin post to the wrong target is.
pub struct MemoryChannel {
    local: Origin,
    peer: Origin,
    inbox: Inbox,
    peer_inbox: Inbox,
}

impl MemoryChannel {
    pub fn local_origin(&self) -> &Origin {
        &self.local
    }

    pub fn peer_origin(&self) -> &Origin {
        &self.peer
    }

    /// Queues a message into this end's inbox as if `sender` had posted it.
    pub fn inject(&self, sender: Origin, payload: impl Into<String>) {
        self.inbox
            .borrow_mut()
            .push_back(InboundMessage::new(sender, payload));
    }

    pub fn pending_inbound(&self) -> usize {
        self.inbox.borrow().len()
    }
}

pub fn memory_pair(a: Origin, b: Origin) -> (MemoryChannel, MemoryChannel) {
    let a_inbox: Inbox = Rc::new(RefCell::new(VecDeque::new()));
    let b_inbox: Inbox = Rc::new(RefCell::new(VecDeque::new()));
    (
        MemoryChannel {
            local: a.clone(),
            peer: b.clone(),
            inbox: Rc::clone(&a_inbox),
            peer_inbox: Rc::clone(&b_inbox),
        },
        MemoryChannel {
            local: b,
            peer: a,
            inbox: b_inbox,
            peer_inbox: a_inbox,
        },
    )
}

impl MessageChannel for MemoryChannel {
    fn post(&mut self, target: &Origin, payload: &str) -> Result<(), TransportError> {
        if target != &self.peer {
            tracing::debug!(target_origin = %target, peer = %self.peer, "dropping post to foreign target");
            return Ok(());
        }
        self.peer_inbox
            .borrow_mut()
            .push_back(InboundMessage::new(self.local.clone(), payload));
        Ok(())
    }

    fn receive(&mut self, _timeout: Duration) -> Result<Option<InboundMessage>, TransportError> {
        Ok(self.inbox.borrow_mut().pop_front())
    }
}

/// One line on a stream channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireFrame {
    pub origin: Origin,
    pub target: Origin,
    pub payload: String,
}

/// Newline-delimited [`WireFrame`] channel over a reader/writer pair.
///
/// Frames addressed to another target are discarded on receipt.
pub struct LineChannel<W: Write> {
    local: Origin,
    writer: W,
    rx: Receiver<Result<WireFrame, TransportError>>,
}

impl<W: Write> LineChannel<W> {
    pub fn new(local: Origin, reader: impl Read + Send + 'static, writer: W) -> Self {
        Self {
            local,
            writer,
            rx: spawn_reader_thread(reader),
        }
    }
}

impl<W: Write> MessageChannel for LineChannel<W> {
    fn post(&mut self, target: &Origin, payload: &str) -> Result<(), TransportError> {
        let frame = WireFrame {
            origin: self.local.clone(),
            target: target.clone(),
            payload: payload.to_string(),
        };
        let line = serde_json::to_string(&frame)
            .map_err(|err| TransportError::InvalidFrame(format!("serialize frame: {err}")))?;

        self.writer
            .write_all(line.as_bytes())
            .map_err(|err| TransportError::Io(format!("write frame failed: {err}")))?;
        self.writer
            .write_all(b"\n")
            .map_err(|err| TransportError::Io(format!("write newline failed: {err}")))?;
        self.writer
            .flush()
            .map_err(|err| TransportError::Io(format!("flush failed: {err}")))
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, TransportError> {
        loop {
            let frame = match self.rx.recv_timeout(timeout) {
                Ok(Ok(frame)) => frame,
                Ok(Err(err)) => return Err(err),
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Disconnected),
            };

            if frame.target != self.local {
                tracing::debug!(target_origin = %frame.target, local = %self.local, "discarding frame for foreign target");
                continue;
            }
            return Ok(Some(InboundMessage::new(frame.origin, frame.payload)));
        }
    }
}

/// Channel to a spawned plugin process over its stdin/stdout.
pub struct StdioProcessChannel {
    child: Child,
    inner: LineChannel<std::process::ChildStdin>,
}

impl StdioProcessChannel {
    pub fn from_child(local: Origin, mut child: Child) -> Result<Self, TransportError> {
        let Some(stdin) = child.stdin.take() else {
            kill_and_wait(&mut child);
            return Err(TransportError::Io("plugin stdin is not piped".to_string()));
        };

        let Some(stdout) = child.stdout.take() else {
            kill_and_wait(&mut child);
            return Err(TransportError::Io("plugin stdout is not piped".to_string()));
        };

        Ok(Self {
            child,
            inner: LineChannel::new(local, stdout, stdin),
        })
    }
}

impl MessageChannel for StdioProcessChannel {
    fn post(&mut self, target: &Origin, payload: &str) -> Result<(), TransportError> {
        self.inner.post(target, payload)
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, TransportError> {
        self.inner.receive(timeout)
    }

    fn terminate(&mut self) {
        kill_and_wait(&mut self.child);
    }
}

impl Drop for StdioProcessChannel {
    fn drop(&mut self) {
        kill_and_wait(&mut self.child);
    }
}

fn spawn_reader_thread(
    reader: impl Read + Send + 'static,
) -> Receiver<Result<WireFrame, TransportError>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let reader = BufReader::new(reader);
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    let _ = tx.send(Err(TransportError::Io(format!("read line failed: {err}"))));
                    return;
                }
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let parsed = serde_json::from_str::<WireFrame>(trimmed)
                .map_err(|err| TransportError::InvalidFrame(err.to_string()));
            if tx.send(parsed).is_err() {
                return;
            }
        }
    });
    rx
}

fn kill_and_wait(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}
