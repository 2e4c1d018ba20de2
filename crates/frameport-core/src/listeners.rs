use crate::protocol::{HostNotification, NotificationKind};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{error, trace, warn};

pub type Listener = Box<dyn FnMut(&HostNotification) -> anyhow::Result<()>>;

/// Append-only subscriber lists, one per notification kind, invoked in
/// registration order.
#[derive(Default)]
pub struct ListenerTable {
    listeners: HashMap<NotificationKind, Vec<Listener>>,
}

impl ListenerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, kind: NotificationKind, listener: Listener) {
        self.listeners.entry(kind).or_default().push(listener);
    }

    pub fn listener_count(&self, kind: NotificationKind) -> usize {
        self.listeners.get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// Runs every listener for the notification's kind. A listener that
    /// fails or panics is logged and the rest still run. Returns how many
    /// listeners completed successfully.
    pub fn dispatch(&mut self, notification: &HostNotification) -> usize {
        let kind = notification.kind();
        let Some(listeners) = self.listeners.get_mut(&kind) else {
            trace!(event = kind.as_tag(), "no listeners for notification");
            return 0;
        };

        let mut completed = 0;
        for (index, listener) in listeners.iter_mut().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| listener(notification))) {
                Ok(Ok(())) => completed += 1,
                Ok(Err(err)) => {
                    warn!(event = kind.as_tag(), listener = index, error = %err, "listener failed");
                }
                Err(panic) => {
                    error!(
                        event = kind.as_tag(),
                        listener = index,
                        panic = panic_message(panic.as_ref()),
                        "listener panicked"
                    );
                }
            }
        }
        completed
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
