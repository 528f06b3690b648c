//! User message dispatch.
//!
//! Peers can send typed JSON messages over the request channel. The host
//! registers handlers by type string; a one-shot handler takes precedence
//! over a persistent one and is removed before it runs.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;

/// Handler for a user message type. The returned value becomes the response
/// `data`; an `Err` string becomes an error-status response.
pub type MessageHandler = Box<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

/// Outcome of dispatching an inbound user message.
pub enum DispatchOutcome {
    /// A handler ran; its result
    Handled(Result<Value, String>),
    /// No handler is registered for this type
    NoHandler,
}

/// Registry of user message handlers.
#[derive(Default)]
pub struct MessageRegistry {
    handlers: Mutex<HashMap<String, MessageHandler>>,
    once: Mutex<HashMap<String, MessageHandler>>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a persistent handler, replacing any previous one.
    pub fn listen(&self, kind: impl Into<String>, handler: MessageHandler) {
        self.handlers.lock().insert(kind.into(), handler);
    }

    /// Register a handler that runs at most once.
    pub fn listen_once(&self, kind: impl Into<String>, handler: MessageHandler) {
        self.once.lock().insert(kind.into(), handler);
    }

    /// Remove both the persistent and the one-shot handler for a type.
    pub fn unlisten(&self, kind: &str) {
        self.handlers.lock().remove(kind);
        self.once.lock().remove(kind);
    }

    /// Dispatch an inbound message. One-shot handlers win and are removed
    /// before invocation, so a handler that panics is still consumed.
    /// Panics are caught at this boundary and become handler errors.
    pub fn dispatch(&self, kind: &str, payload: Value) -> DispatchOutcome {
        if let Some(handler) = self.once.lock().remove(kind) {
            return DispatchOutcome::Handled(run_handler(&handler, payload));
        }
        let handlers = self.handlers.lock();
        match handlers.get(kind) {
            Some(handler) => DispatchOutcome::Handled(run_handler(handler, payload)),
            None => DispatchOutcome::NoHandler,
        }
    }
}

fn run_handler(handler: &MessageHandler, payload: Value) -> Result<Value, String> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(payload)))
        .unwrap_or_else(|_| Err("message handler panicked".to_string()))
}

impl std::fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRegistry")
            .field("handlers", &self.handlers.lock().len())
            .field("once", &self.once.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_listen_and_dispatch() {
        let registry = MessageRegistry::new();
        registry.listen(
            "echo",
            Box::new(|v| Ok(json!({ "ok": true, "echo": v }))),
        );

        match registry.dispatch("echo", json!({ "n": 1 })) {
            DispatchOutcome::Handled(Ok(v)) => {
                assert_eq!(v, json!({ "ok": true, "echo": { "n": 1 } }));
            }
            _ => panic!("expected handled"),
        }

        // Persistent handlers keep working
        assert!(matches!(
            registry.dispatch("echo", json!(2)),
            DispatchOutcome::Handled(Ok(_))
        ));
    }

    #[test]
    fn test_unlisten_removes_handler() {
        let registry = MessageRegistry::new();
        registry.listen("t", Box::new(|_| Ok(Value::Null)));
        registry.unlisten("t");
        assert!(matches!(
            registry.dispatch("t", Value::Null),
            DispatchOutcome::NoHandler
        ));
    }

    #[test]
    fn test_listen_once_fires_exactly_once() {
        let registry = MessageRegistry::new();
        registry.listen_once("t", Box::new(|v| Ok(v)));

        assert!(matches!(
            registry.dispatch("t", json!("x")),
            DispatchOutcome::Handled(Ok(v)) if v == json!("x")
        ));
        assert!(matches!(
            registry.dispatch("t", json!("y")),
            DispatchOutcome::NoHandler
        ));
    }

    #[test]
    fn test_once_takes_precedence_over_listen() {
        let registry = MessageRegistry::new();
        registry.listen("t", Box::new(|_| Ok(json!("persistent"))));
        registry.listen_once("t", Box::new(|_| Ok(json!("once"))));

        match registry.dispatch("t", Value::Null) {
            DispatchOutcome::Handled(Ok(v)) => assert_eq!(v, json!("once")),
            _ => panic!("expected handled"),
        }
        // One-shot consumed, persistent now answers
        match registry.dispatch("t", Value::Null) {
            DispatchOutcome::Handled(Ok(v)) => assert_eq!(v, json!("persistent")),
            _ => panic!("expected handled"),
        }
    }

    #[test]
    fn test_panicking_handler_becomes_error() {
        let registry = MessageRegistry::new();
        registry.listen("t", Box::new(|_| panic!("boom")));
        assert!(matches!(
            registry.dispatch("t", Value::Null),
            DispatchOutcome::Handled(Err(_))
        ));
    }

    #[test]
    fn test_handler_error_propagates() {
        let registry = MessageRegistry::new();
        registry.listen("t", Box::new(|_| Err("nope".to_string())));
        assert!(matches!(
            registry.dispatch("t", Value::Null),
            DispatchOutcome::Handled(Err(msg)) if msg == "nope"
        ));
    }
}
