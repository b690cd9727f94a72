//! Framed stream binding for the comm transport.
//!
//! [`SocketTransport`] runs the comm protocol over any bidirectional byte
//! stream the host hands it: a Unix domain socket, a Windows named pipe
//! client, or an in-memory duplex in tests. Two tasks own the stream:
//!
//! - a writer task draining an unbounded outbound queue into
//!   [`WireFrame`]s, so `send` never blocks the caller
//! - a reader task dispatching inbound `comm_msg` frames to the callback
//!   registered for that comm id, and inbound `comm_open` frames
//!   (frontend-initiated channels, e.g. event traffic) to the open handler
//!
//! Frames on one stream are delivered in send order; no ordering holds
//! across distinct streams.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::{debug, warn};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::comm::{CommHandle, CommTransport, MessageCallback, TransportError};
use crate::connection::{recv_json_frame, send_json_frame};
use crate::protocol::WireFrame;

/// Handler for frontend-initiated channel opens.
///
/// Receives the send half of the new channel and the open payload, and
/// returns the callback to wire to its inbound traffic.
pub type OpenCallback = Arc<dyn Fn(Arc<dyn CommHandle>, &Value) -> MessageCallback + Send + Sync>;

type CallbackRegistry = Arc<RwLock<HashMap<String, MessageCallback>>>;

/// Comm transport over a framed byte stream.
pub struct SocketTransport {
    outbound: mpsc::UnboundedSender<WireFrame>,
    callbacks: CallbackRegistry,
    open_handler: Arc<RwLock<Option<OpenCallback>>>,
}

impl SocketTransport {
    /// Take ownership of `stream` and spawn the reader and writer tasks.
    ///
    /// Must be called from within a tokio runtime. When the stream closes,
    /// queued and future sends fail with [`TransportError::Disconnected`].
    pub fn spawn<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<WireFrame>();
        let callbacks: CallbackRegistry = Arc::new(RwLock::new(HashMap::new()));
        let open_handler: Arc<RwLock<Option<OpenCallback>>> = Arc::new(RwLock::new(None));

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = send_json_frame(&mut write_half, &frame).await {
                    warn!("[socket] write failed, closing outbound: {}", e);
                    break;
                }
            }
        });

        let reader_callbacks = callbacks.clone();
        let reader_open_handler = open_handler.clone();
        let reader_outbound = outbound.clone();
        tokio::spawn(async move {
            let mut read_half = read_half;
            loop {
                match recv_json_frame::<_, WireFrame>(&mut read_half).await {
                    Ok(Some(frame)) => dispatch_inbound(
                        frame,
                        &reader_callbacks,
                        &reader_open_handler,
                        &reader_outbound,
                    ),
                    Ok(None) => {
                        debug!("[socket] peer disconnected");
                        break;
                    }
                    Err(e) => {
                        warn!("[socket] read failed, closing inbound: {}", e);
                        break;
                    }
                }
            }
        });

        Self {
            outbound,
            callbacks,
            open_handler,
        }
    }

    /// Install the handler invoked for frontend-initiated channel opens.
    pub fn set_open_handler(&self, handler: OpenCallback) {
        if let Ok(mut slot) = self.open_handler.write() {
            *slot = Some(handler);
        }
    }
}

/// Route one inbound frame. Runs on the reader task; callbacks must not
/// block.
fn dispatch_inbound(
    frame: WireFrame,
    callbacks: &CallbackRegistry,
    open_handler: &Arc<RwLock<Option<OpenCallback>>>,
    outbound: &mpsc::UnboundedSender<WireFrame>,
) {
    match frame {
        WireFrame::CommMsg { comm_id, data } => {
            let callback = callbacks
                .read()
                .ok()
                .and_then(|map| map.get(&comm_id).cloned());
            match callback {
                Some(callback) => callback(data),
                None => debug!("[socket] dropping message for unknown comm {}", comm_id),
            }
        }

        WireFrame::CommOpen {
            comm_id,
            target_name,
            data,
        } => {
            let handler = open_handler.read().ok().and_then(|slot| slot.clone());
            let Some(handler) = handler else {
                debug!(
                    "[socket] no open handler, ignoring frontend comm {} ({})",
                    comm_id, target_name
                );
                return;
            };

            let handle: Arc<dyn CommHandle> = Arc::new(SocketCommHandle {
                comm_id: comm_id.clone(),
                outbound: outbound.clone(),
            });
            let callback = handler(handle, &data);
            if let Ok(mut map) = callbacks.write() {
                map.insert(comm_id, callback);
            }
        }
    }
}

impl CommTransport for SocketTransport {
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
            .send(WireFrame::CommOpen {
                comm_id: comm_id.to_string(),
                target_name: target.to_string(),
                data: Value::Object(Default::default()),
            })
            .map_err(|_| TransportError::Disconnected)?;

        Ok(Box::new(SocketCommHandle {
            comm_id: comm_id.to_string(),
            outbound: self.outbound.clone(),
        }))
    }
}

#[derive(Debug)]
struct SocketCommHandle {
    comm_id: String,
    outbound: mpsc::UnboundedSender<WireFrame>,
}

impl CommHandle for SocketCommHandle {
    fn comm_id(&self) -> &str {
        &self.comm_id
    }

    fn send(&self, payload: Value) -> Result<(), TransportError> {
        self.outbound
            .send(WireFrame::CommMsg {
                comm_id: self.comm_id.clone(),
                data: payload,
            })
            .map_err(|_| TransportError::Disconnected)
    }
}
