//! Comm channel abstraction over a host-provided message pipe.
//!
//! The dispatch core never touches a socket directly. It opens channels
//! through the narrow [`CommTransport`] interface and sends through the
//! [`CommHandle`] it gets back, so the same core runs over a framed Unix
//! socket, a named pipe, or the in-process [`LocalTransport`] used by
//! embedding hosts and tests.
//!
//! Sends are fire-and-forget: `send` hands the payload to the transport and
//! returns immediately. Frontend acknowledgements arrive later through the
//! per-channel inbound callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use log::debug;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Inbound-message callback attached to a channel at creation time.
pub type MessageCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Error type for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport disconnected")]
    Disconnected,

    #[error("Comm already registered: {0}")]
    DuplicateComm(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Send side of one open channel.
pub trait CommHandle: Send + Sync + std::fmt::Debug {
    /// Generation-qualified channel identifier.
    fn comm_id(&self) -> &str;

    /// Hand a payload to the transport. Returns immediately; never blocks
    /// on the frontend.
    fn send(&self, payload: Value) -> Result<(), TransportError>;
}

/// A bidirectional message pipe capable of opening named channels.
pub trait CommTransport: Send + Sync {
    /// Open a channel bound to `target`, announcing it to the peer and
    /// wiring `on_message` to its inbound traffic.
    fn create(
        &self,
        target: &str,
        comm_id: &str,
        on_message: MessageCallback,
    ) -> Result<Box<dyn CommHandle>, TransportError>;
}

/// Last generation token handed out by this process.
static LAST_TOKEN: AtomicI64 = AtomicI64::new(0);

/// Next generation token: wall-clock milliseconds, clamped to be strictly
/// greater than every token issued before it. Rapid reloads within one
/// millisecond therefore still get distinct tokens.
pub fn next_generation_token() -> i64 {
    let now = Utc::now().timestamp_millis();
    let mut last = LAST_TOKEN.load(Ordering::Relaxed);
    loop {
        let token = now.max(last + 1);
        match LAST_TOKEN.compare_exchange(last, token, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return token,
            Err(actual) => last = actual,
        }
    }
}

/// Generation-qualified channel id: `<target>.<session-tag>#<token>`.
///
/// The token distinguishes successive channel generations across frontend
/// reloads; the session tag distinguishes kernel processes.
pub fn generation_id(target: &str, session: &str) -> String {
    format!("{}.{}#{}", target, session, next_generation_token())
}

/// Short random tag identifying this kernel session in channel ids.
pub fn session_tag() -> String {
    let mut tag = Uuid::new_v4().simple().to_string();
    tag.truncate(8);
    tag
}

/// One live channel generation, exclusively owned by the dispatch core.
///
/// Only `send` is exposed; the handle is dropped (never closed toward the
/// frontend) when the channel generation is invalidated by a reload.
pub struct Comm {
    target: String,
    handle: Box<dyn CommHandle>,
}

impl Comm {
    /// Open a fresh channel generation for `target`.
    pub fn open(
        transport: &dyn CommTransport,
        target: &str,
        session: &str,
        on_message: MessageCallback,
    ) -> Result<Self, TransportError> {
        let comm_id = generation_id(target, session);
        let handle = transport.create(target, &comm_id, on_message)?;
        debug!("[comm] opened `{}` as {}", target, comm_id);
        Ok(Self {
            target: target.to_string(),
            handle,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn comm_id(&self) -> &str {
        self.handle.comm_id()
    }

    pub fn send(&self, payload: Value) -> Result<(), TransportError> {
        self.handle.send(payload)
    }
}

impl std::fmt::Debug for Comm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Comm")
            .field("target", &self.target)
            .field("comm_id", &self.handle.comm_id())
            .finish()
    }
}

/// Outbound traffic observed by the host embedding a [`LocalTransport`].
#[derive(Debug, Clone)]
pub enum CommEvent {
    /// A channel was opened toward the frontend.
    Open {
        target: String,
        comm_id: String,
        data: Value,
    },
    /// A payload was sent on an open channel.
    Msg { comm_id: String, data: Value },
}

/// In-process transport backed by an unbounded channel.
///
/// The embedding host drains the [`CommEvent`] receiver and forwards traffic
/// over whatever pipe primitive it owns; inbound messages are injected with
/// [`LocalTransport::deliver`].
pub struct LocalTransport {
    outbound: mpsc::UnboundedSender<CommEvent>,
    callbacks: Arc<RwLock<HashMap<String, MessageCallback>>>,
}

impl LocalTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CommEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: tx,
                callbacks: Arc::new(RwLock::new(HashMap::new())),
            },
            rx,
        )
    }

    /// Inject an inbound message for `comm_id`. Returns false if no channel
    /// with that id is registered (stale generation, already reloaded).
    pub fn deliver(&self, comm_id: &str, payload: Value) -> bool {
        let callback = self
            .callbacks
            .read()
            .ok()
            .and_then(|map| map.get(comm_id).cloned());
        match callback {
            Some(callback) => {
                callback(payload);
                true
            }
            None => {
                debug!("[comm] dropping message for unknown comm {}", comm_id);
                false
            }
        }
    }
}

impl CommTransport for LocalTransport {
    fn create(
        &self,
        target: &str,
        comm_id: &str,
        on_message: MessageCallback,
    ) -> Result<Box<dyn CommHandle>, TransportError> {
        {
            let mut callbacks = self
                .callbacks
                .write()
                .map_err(|_| TransportError::Protocol("callback registry poisoned".to_string()))?;
            if callbacks.contains_key(comm_id) {
                return Err(TransportError::DuplicateComm(comm_id.to_string()));
            }
            callbacks.insert(comm_id.to_string(), on_message);
        }

        self.outbound
            .send(CommEvent::Open {
                target: target.to_string(),
                comm_id: comm_id.to_string(),
                data: Value::Object(Default::default()),
            })
            .map_err(|_| TransportError::Disconnected)?;

        Ok(Box::new(LocalCommHandle {
            comm_id: comm_id.to_string(),
            outbound: self.outbound.clone(),
        }))
    }
}

#[derive(Debug)]
struct LocalCommHandle {
    comm_id: String,
    outbound: mpsc::UnboundedSender<CommEvent>,
}

impl CommHandle for LocalCommHandle {
    fn comm_id(&self) -> &str {
        &self.comm_id
    }

    fn send(&self, payload: Value) -> Result<(), TransportError> {
        self.outbound
            .send(CommEvent::Msg {
                comm_id: self.comm_id.clone(),
                data: payload,
            })
            .map_err(|_| TransportError::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_generation_tokens_are_strictly_monotonic() {
        let mut previous = next_generation_token();
        for _ in 0..1000 {
            let token = next_generation_token();
            assert!(token > previous);
            previous = token;
        }
    }

    #[test]
    fn test_generation_id_format() {
        let id = generation_id("config", "ab12cd34");
        let (head, token) = id.split_once('#').unwrap();
        assert_eq!(head, "config.ab12cd34");
        assert!(token.parse::<i64>().unwrap() > 0);
    }

    #[test]
    fn test_local_transport_open_and_send() {
        let (transport, mut outbound) = LocalTransport::new();
        let comm = Comm::open(&transport, "execute", "testtag", Arc::new(|_| {})).unwrap();

        comm.send(json!({"script": "1+1"})).unwrap();

        match outbound.try_recv().unwrap() {
            CommEvent::Open { target, comm_id, .. } => {
                assert_eq!(target, "execute");
                assert_eq!(comm_id, comm.comm_id());
            }
            other => panic!("expected open event, got {:?}", other),
        }
        match outbound.try_recv().unwrap() {
            CommEvent::Msg { comm_id, data } => {
                assert_eq!(comm_id, comm.comm_id());
                assert_eq!(data, json!({"script": "1+1"}));
            }
            other => panic!("expected msg event, got {:?}", other),
        }
    }

    #[test]
    fn test_deliver_routes_to_registered_callback() {
        let (transport, _outbound) = LocalTransport::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = hits.clone();

        let comm = Comm::open(
            &transport,
            "config",
            "testtag",
            Arc::new(move |msg| {
                assert_eq!(msg, json!({"status": "ok"}));
                hits_cb.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        assert!(transport.deliver(comm.comm_id(), json!({"status": "ok"})));
        assert!(!transport.deliver("config.stale#0", json!({"status": "ok"})));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_comm_id_is_rejected() {
        let (transport, _outbound) = LocalTransport::new();
        transport
            .create("config", "config.tag#1", Arc::new(|_| {}))
            .unwrap();
        let err = transport
            .create("config", "config.tag#1", Arc::new(|_| {}))
            .unwrap_err();
        assert!(matches!(err, TransportError::DuplicateComm(_)));
    }

    #[test]
    fn test_send_after_host_disconnect_fails() {
        let (transport, outbound) = LocalTransport::new();
        let comm = Comm::open(&transport, "execute", "testtag", Arc::new(|_| {})).unwrap();

        drop(outbound);

        let err = comm.send(json!({})).unwrap_err();
        assert!(matches!(err, TransportError::Disconnected));
    }
}
