//! ServeMux for MQTT message routing.
//!
//! Routes incoming messages to every handler whose topic filter matches.
//! Each handler runs isolated: an `Err` or a panic is logged and the next
//! handler still runs.

use crate::error::{Error, Result};
use crate::protocol::Publish;
use crate::trie::{Trie, TrieNode};
use crate::types::QoS;
use bytes::Bytes;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// MQTT message received from a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic the message was published to.
    pub topic: String,
    /// Message payload.
    pub payload: Bytes,
    /// QoS level.
    pub qos: QoS,
    /// Retain flag.
    pub retain: bool,
    /// Set when the broker is redelivering.
    pub dup: bool,
    /// Packet ID (QoS 1 only).
    pub packet_id: Option<u16>,
}

impl Message {
    /// Create a new QoS 0 message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            dup: false,
            packet_id: None,
        }
    }

    /// Get the payload as a string (if valid UTF-8).
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

impl From<Publish> for Message {
    fn from(p: Publish) -> Self {
        let packet_id = (p.qos == QoS::AtLeastOnce).then_some(p.pkid);
        Self {
            topic: p.topic,
            payload: p.payload,
            qos: p.qos,
            retain: p.retain,
            dup: p.dup,
            packet_id,
        }
    }
}

/// Handler trait for processing MQTT messages.
pub trait Handler: Send + Sync {
    /// Handle an incoming MQTT message.
    fn handle_message(&self, msg: &Message) -> Result<()>;
}

/// Handler function type.
pub type HandlerFunc = dyn Fn(&Message) -> Result<()> + Send + Sync;

struct FnHandler {
    f: Box<HandlerFunc>,
}

impl Handler for FnHandler {
    fn handle_message(&self, msg: &Message) -> Result<()> {
        (self.f)(msg)
    }
}

/// Wrap a closure as a shareable [`Handler`].
pub fn handler_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: Fn(&Message) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler { f: Box::new(f) })
}

/// MQTT message multiplexer.
///
/// Supports MQTT wildcards: `+` (single level) and `#` (multi-level).
#[derive(Default)]
pub struct ServeMux {
    trie: Trie,
}

impl ServeMux {
    /// Create a new empty ServeMux.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler function for the given filter.
    ///
    /// # Example
    ///
    /// ```
    /// use mqtt_session::ServeMux;
    ///
    /// let mux = ServeMux::new();
    /// mux.handle_func("device/+/state", |msg| {
    ///     println!("{} {:?}", msg.topic, msg.payload);
    ///     Ok(())
    /// })
    /// .unwrap();
    /// ```
    pub fn handle_func<F>(&self, filter: &str, f: F) -> Result<()>
    where
        F: Fn(&Message) -> Result<()> + Send + Sync + 'static,
    {
        self.handle(filter, handler_fn(f))
    }

    /// Register a handler for the given filter.
    pub fn handle(&self, filter: &str, handler: Arc<dyn Handler>) -> Result<()> {
        self.trie.set(filter, |node: &mut TrieNode| {
            node.add_handler(handler);
        })
    }

    /// Remove every handler registered under `filter`.
    pub fn remove(&self, filter: &str) -> usize {
        self.trie.remove(filter)
    }

    /// Remove one handler previously passed to [`ServeMux::handle`].
    pub fn remove_handler(&self, filter: &str, handler: &Arc<dyn Handler>) -> bool {
        self.trie.remove_handler(filter, handler)
    }

    /// Dispatch `msg` to all matching handlers and return how many ran.
    ///
    /// Handler failures never reach the caller.
    pub fn handle_message(&self, msg: &Message) -> usize {
        let handlers = self.trie.get(&msg.topic);
        if handlers.is_empty() {
            debug!(topic = %msg.topic, "no handler found");
            return 0;
        }

        for handler in &handlers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle_message(msg)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(topic = %msg.topic, error = %e, "handler failed"),
                Err(payload) => {
                    let e = Error::Handler(panic_message(payload.as_ref()));
                    warn!(topic = %msg.topic, error = %e, "handler panicked");
                }
            }
        }
        handlers.len()
    }

    /// Check if any handler matches `topic`.
    pub fn has_handlers(&self, topic: &str) -> bool {
        !self.trie.get(topic).is_empty()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

impl fmt::Debug for ServeMux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServeMux {{ trie: {:?} }}", self.trie)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: &Arc<AtomicUsize>) -> impl Fn(&Message) -> Result<()> + Send + Sync + 'static {
        let counter = counter.clone();
        move |_msg| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_handle_func() {
        let mux = ServeMux::new();
        let counter = Arc::new(AtomicUsize::new(0));
        mux.handle_func("test/topic", counting(&counter)).unwrap();

        assert_eq!(mux.handle_message(&Message::new("test/topic", "hello")), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wildcard_handlers() {
        let mux = ServeMux::new();
        let counter = Arc::new(AtomicUsize::new(0));
        mux.handle_func("device/+/state", counting(&counter)).unwrap();

        mux.handle_message(&Message::new("device/gear-001/state", "data"));
        mux.handle_message(&Message::new("device/gear-002/state", "data"));
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        assert_eq!(mux.handle_message(&Message::new("device/gear-001/stats", "data")), 0);
        assert!(!mux.has_handlers("device/gear-001/stats"));
    }

    #[test]
    fn test_failing_handlers_are_isolated() {
        let mux = ServeMux::new();
        let counter = Arc::new(AtomicUsize::new(0));

        mux.handle_func("a/#", |_| Err(Error::Handler("boom".into()))).unwrap();
        mux.handle_func("a/+", |_| panic!("handler bug")).unwrap();
        mux.handle_func("a/b", counting(&counter)).unwrap();

        assert_eq!(mux.handle_message(&Message::new("a/b", "x")), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove() {
        let mux = ServeMux::new();
        let counter = Arc::new(AtomicUsize::new(0));
        mux.handle_func("a/b", counting(&counter)).unwrap();
        let kept = handler_fn(counting(&counter));
        mux.handle("a/b", kept.clone()).unwrap();
        let dropped = handler_fn(counting(&counter));
        mux.handle("a/b", dropped.clone()).unwrap();

        assert!(mux.remove_handler("a/b", &dropped));
        assert_eq!(mux.handle_message(&Message::new("a/b", "x")), 2);
        assert_eq!(mux.remove("a/b"), 2);
        assert_eq!(mux.handle_message(&Message::new("a/b", "x")), 0);
    }

    #[test]
    fn test_message_from_publish() {
        let msg = Message::from(Publish {
            topic: "t".into(),
            payload: Bytes::from_static(b"p"),
            qos: QoS::AtLeastOnce,
            retain: true,
            dup: true,
            pkid: 9,
        });
        assert_eq!(msg.packet_id, Some(9));
        assert!(msg.retain && msg.dup);
        assert_eq!(msg.payload_str(), Some("p"));

        let msg = Message::from(Publish {
            topic: "t".into(),
            payload: Bytes::new(),
            qos: QoS::AtMostOnce,
            retain: false,
            dup: false,
            pkid: 0,
        });
        assert_eq!(msg.packet_id, None);
    }
}
