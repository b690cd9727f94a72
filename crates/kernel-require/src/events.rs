//! Router for frontend-initiated event traffic.
//!
//! The frontend opens its own comm toward the kernel and reports lifecycle
//! events on it (`comms_registered` once its channel targets are wired,
//! `extension_loaded` once the bundle is up). Every inbound event gets an
//! acknowledgement of the form `{resolved: true, value, success}`.
//!
//! A malfunctioning frontend must never crash the kernel-side process:
//! unknown event types and malformed payloads are tolerated, logged, and
//! reported back in the acknowledgement instead of propagated.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::comm::{CommHandle, MessageCallback};

/// A lifecycle event reported by the frontend.
///
/// Known kinds are matched exhaustively; anything else lands in `Unknown`
/// rather than failing a lookup at dispatch time.
#[derive(Debug, Clone, PartialEq)]
pub enum FrontendEvent {
    /// The frontend registered its channel targets.
    CommsRegistered { timestamp: Option<DateTime<Utc>> },
    /// The frontend bundle finished loading.
    ExtensionLoaded { timestamp: Option<DateTime<Utc>> },
    /// Any event kind this kernel does not know.
    Unknown { kind: String },
}

impl FrontendEvent {
    /// Parse an inbound event payload: `type` selects the kind,
    /// `timestamp` (milliseconds since epoch) is optional.
    pub fn parse(event: &Value) -> Self {
        let kind = event.get("type").and_then(Value::as_str).unwrap_or("");
        let timestamp = event
            .get("timestamp")
            .and_then(Value::as_i64)
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

        match kind {
            "comms_registered" => FrontendEvent::CommsRegistered { timestamp },
            "extension_loaded" => FrontendEvent::ExtensionLoaded { timestamp },
            other => FrontendEvent::Unknown {
                kind: other.to_string(),
            },
        }
    }
}

/// Acknowledgement sent back for every inbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventReply {
    /// Always true: the event was received and handled to completion.
    pub resolved: bool,
    /// Handler result, or a description of what went wrong.
    pub value: Value,
    /// Whether the event was recognized and handled without error.
    pub success: bool,
}

impl EventReply {
    fn ok(value: impl Into<Value>) -> Self {
        Self {
            resolved: true,
            value: value.into(),
            success: true,
        }
    }

    fn failed(value: impl Into<Value>) -> Self {
        Self {
            resolved: true,
            value: value.into(),
            success: false,
        }
    }
}

/// Dispatches frontend events and records when they were last seen.
#[derive(Debug, Default)]
pub struct EventRouter {
    comms_registered_at: Mutex<Option<DateTime<Utc>>>,
    extension_loaded_at: Mutex<Option<DateTime<Utc>>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// When the frontend last reported its channel targets registered.
    pub fn comms_registered_at(&self) -> Option<DateTime<Utc>> {
        self.comms_registered_at.lock().ok().and_then(|slot| *slot)
    }

    /// When the frontend bundle last reported itself loaded.
    pub fn extension_loaded_at(&self) -> Option<DateTime<Utc>> {
        self.extension_loaded_at.lock().ok().and_then(|slot| *slot)
    }

    /// Handle one inbound event and produce its acknowledgement.
    ///
    /// Never panics and never returns an error: failures are reported in
    /// the reply's `value` with `success: false`.
    pub fn handle(&self, event: &Value) -> EventReply {
        if !event.is_object() {
            warn!("[events] malformed event payload: {}", event);
            return EventReply::failed(format!("malformed event payload: {}", event));
        }

        let namespace = event.get("namespace").and_then(Value::as_str).unwrap_or("");

        match FrontendEvent::parse(event) {
            FrontendEvent::CommsRegistered { timestamp } => {
                let at = timestamp.unwrap_or_else(Utc::now);
                if let Ok(mut slot) = self.comms_registered_at.lock() {
                    *slot = Some(at);
                }
                debug!("[events] comm targets registered at {} ({})", at, namespace);
                EventReply::ok("comm targets registered")
            }

            FrontendEvent::ExtensionLoaded { timestamp } => {
                let at = timestamp.unwrap_or_else(Utc::now);
                if let Ok(mut slot) = self.extension_loaded_at.lock() {
                    *slot = Some(at);
                }
                debug!("[events] frontend extension loaded at {} ({})", at, namespace);
                EventReply::ok("extension loaded")
            }

            FrontendEvent::Unknown { kind } => {
                debug!("[events] ignoring unknown event type `{}`", kind);
                EventReply::failed(format!("unknown event type: {}", kind))
            }
        }
    }
}

/// Registration entry point for a frontend-opened comm.
///
/// Takes the send half of the pipe the frontend opened plus its open
/// payload, and returns the inbound callback to attach: each message is
/// routed through `router` and acknowledged on the same comm.
pub fn attach_event_comm(
    router: Arc<EventRouter>,
    comm: Arc<dyn CommHandle>,
    open_payload: &Value,
) -> MessageCallback {
    debug!(
        "[events] frontend comm {} attached (open payload: {})",
        comm.comm_id(),
        open_payload
    );

    Arc::new(move |message: Value| {
        let reply = router.handle(&message);
        let payload = json!({
            "resolved": reply.resolved,
            "value": reply.value,
            "success": reply.success,
        });
        if let Err(e) = comm.send(payload) {
            warn!(
                "[events] failed to acknowledge event on {}: {}",
                comm.comm_id(),
                e
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::TransportError;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug)]
    struct RecordingHandle {
        comm_id: String,
        sent: StdMutex<Vec<Value>>,
    }

    impl RecordingHandle {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                comm_id: "events.front#1".to_string(),
                sent: StdMutex::new(Vec::new()),
            })
        }
    }

    impl CommHandle for RecordingHandle {
        fn comm_id(&self) -> &str {
            &self.comm_id
        }

        fn send(&self, payload: Value) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(payload);
            Ok(())
        }
    }

    #[test]
    fn test_comms_registered_records_timestamp() {
        let router = EventRouter::new();
        assert!(router.comms_registered_at().is_none());

        let reply = router.handle(&json!({
            "type": "comms_registered",
            "namespace": "JupyterRequire",
            "timestamp": 1_700_000_000_000i64,
        }));

        assert!(reply.resolved && reply.success);
        let at = router.comms_registered_at().unwrap();
        assert_eq!(at.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_extension_loaded_without_timestamp_uses_now() {
        let router = EventRouter::new();
        let reply = router.handle(&json!({"type": "extension_loaded"}));

        assert!(reply.success);
        assert!(router.extension_loaded_at().is_some());
    }

    #[test]
    fn test_unknown_event_is_tolerated() {
        let router = EventRouter::new();
        let reply = router.handle(&json!({"type": "cell_frozen"}));

        assert!(reply.resolved);
        assert!(!reply.success);
        assert_eq!(reply.value, json!("unknown event type: cell_frozen"));
    }

    #[test]
    fn test_malformed_event_is_tolerated() {
        let router = EventRouter::new();
        let reply = router.handle(&json!("not an object"));

        assert!(reply.resolved);
        assert!(!reply.success);
        assert!(router.comms_registered_at().is_none());
    }

    #[test]
    fn test_attach_acknowledges_on_same_comm() {
        let router = Arc::new(EventRouter::new());
        let handle = RecordingHandle::new();
        let callback = attach_event_comm(router, handle.clone(), &json!({}));

        callback(json!({"type": "comms_registered", "timestamp": 1_700_000_000_000i64}));
        callback(json!({"type": "no_such_event"}));

        let sent = handle.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[0],
            json!({"resolved": true, "value": "comm targets registered", "success": true})
        );
        assert_eq!(
            sent[1],
            json!({"resolved": true, "value": "unknown event type: no_such_event", "success": false})
        );
    }
}
