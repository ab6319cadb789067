//! Asynchronous notification listeners.
//!
//! Listeners are matched against the channel name and run one at a time,
//! in registration order. A failing listener is logged and skipped.

use regex::Regex;
use tracing::warn;

use super::error::{PgError, PgResult};

/// A NotificationResponse from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}

/// Error type listeners may return.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

type Callback = Box<dyn FnMut(&Notification) -> Result<(), ListenerError> + Send>;

struct Listener {
    name: String,
    channel: Regex,
    callback: Callback,
}

/// Listener registry of one session.
#[derive(Default)]
pub struct NotificationListeners {
    listeners: Vec<Listener>,
}

impl NotificationListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for channels fully matching `channel_pattern`.
    /// A listener with the same name is replaced.
    pub fn add<F>(&mut self, name: &str, channel_pattern: &str, callback: F) -> PgResult<()>
    where
        F: FnMut(&Notification) -> Result<(), ListenerError> + Send + 'static,
    {
        let channel = Regex::new(&format!("^(?:{})$", channel_pattern)).map_err(|e| {
            PgError::Structural(format!("Invalid channel pattern {}: {}", channel_pattern, e))
        })?;
        let listener = Listener {
            name: name.to_string(),
            channel,
            callback: Box::new(callback),
        };
        match self.listeners.iter_mut().find(|l| l.name == name) {
            Some(existing) => *existing = listener,
            None => self.listeners.push(listener),
        }
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| l.name != name);
        self.listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Deliver to every matching listener. Returns how many accepted it.
    pub fn dispatch(&mut self, notification: &Notification) -> usize {
        let mut delivered = 0;
        for listener in self
            .listeners
            .iter_mut()
            .filter(|l| l.channel.is_match(&notification.channel))
        {
            match (listener.callback)(notification) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    listener = %listener.name,
                    channel = %notification.channel,
                    error = %e,
                    "notification listener failed"
                ),
            }
        }
        delivered
    }
}

impl std::fmt::Debug for NotificationListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.listeners.iter().map(|l| (&l.name, l.channel.as_str())))
            .finish()
    }
}
