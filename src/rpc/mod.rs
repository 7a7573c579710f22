//! Duplex JSON-RPC connection over a pair of byte streams.
//!
//! Reading and writing are independent: a spawned receive loop decodes
//! frames and hands them to the [`Router`], while any number of tasks send
//! through a cloned [`Peer`]. Writes go through one mutex-guarded framed
//! sink so each frame lands on the wire whole.
//!
//! Inbound requests run as separate tasks so a suspended handler never
//! holds up dispatch. Inbound notifications run in arrival order on the
//! receive loop itself, which means an update is observed before any
//! response that was written after it.

pub mod pending;
pub mod router;

pub use pending::{PendingCall, PendingCalls};
pub use router::{Dispatch, Router};

use std::pin::Pin;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AcpError, Result};
use crate::transport::protocol::{Message, Notification, Request};
use crate::transport::{WireCodec, MAX_LINE_BYTES};

type BoxReader = Pin<Box<dyn AsyncRead + Send>>;
type BoxWriter = Pin<Box<dyn AsyncWrite + Send>>;
type Sink = FramedWrite<BoxWriter, WireCodec>;

/// State shared between the receive loop and every [`Peer`] clone.
struct Shared {
    label: &'static str,
    sink: Mutex<Option<Sink>>,
    pending: PendingCalls,
    closed: CancellationToken,
}

impl Shared {
    /// Write one frame. A write still blocked when the connection shuts
    /// down is abandoned and its sink dropped, so the lock is always
    /// released.
    async fn send(&self, message: Message) -> Result<()> {
        let mut sink = tokio::select! {
            sink = self.sink.lock() => sink,
            () = self.closed.cancelled() => return Err(AcpError::ConnectionClosed),
        };
        let Some(framed) = sink.as_mut() else {
            return Err(AcpError::ConnectionClosed);
        };
        let written = tokio::select! {
            written = framed.send(message) => Some(written),
            () = self.closed.cancelled() => None,
        };
        let Some(written) = written else {
            debug!(conn = self.label, "Write abandoned on close");
            *sink = None;
            return Err(AcpError::ConnectionClosed);
        };
        match written {
            Ok(()) => Ok(()),
            Err(AcpError::Io(e)) => {
                warn!(conn = self.label, error = %e, "Write to peer failed, closing connection");
                *sink = None;
                drop(sink);
                self.shutdown("write failed");
                Err(AcpError::ConnectionClosed)
            }
            Err(e) => Err(e),
        }
    }

    /// Stop accepting calls and reject everything still waiting.
    fn shutdown(&self, reason: &str) {
        self.closed.cancel();
        let rejected = self.pending.cancel_all(reason);
        if rejected > 0 {
            info!(conn = self.label, rejected, reason, "Rejected pending calls on close");
        }
    }

    /// Drop the write half so the peer sees end-of-stream.
    async fn close_writer(&self) {
        if let Some(mut framed) = self.sink.lock().await.take() {
            if let Err(e) = framed.close().await {
                debug!(conn = self.label, error = %e, "Error closing write half");
            }
        }
    }
}

/// Cloneable handle for calling the remote peer.
#[derive(Clone)]
pub struct Peer {
    shared: Arc<Shared>,
}

impl Peer {
    /// Send a request and wait for its response.
    ///
    /// Fails with [`AcpError::ConnectionClosed`] if the connection shuts
    /// down first, [`AcpError::MethodNotFound`] or [`AcpError::Remote`] if
    /// the peer answers with an error, and [`AcpError::Protocol`] if the
    /// result does not have the expected shape.
    pub async fn request<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let result = self
            .request_value(method, serde_json::to_value(params)?)
            .await?;
        R::deserialize(&result).map_err(|e| {
            AcpError::protocol(
                format!("unexpected result for {method}: {e}"),
                result.to_string().as_bytes(),
            )
        })
    }

    /// Untyped request.
    ///
    /// If the returned future is dropped before the response arrives, the
    /// call's slot is released and a late response is logged as unmatched.
    pub async fn request_value(&self, method: &str, params: Value) -> Result<Value> {
        let (id, call) = self.shared.pending.register()?;
        let _slot = ForgetOnDrop {
            pending: &self.shared.pending,
            id,
        };
        let message = Message::Request(Request {
            id: id.into(),
            method: method.to_string(),
            params: Some(params),
        });
        self.shared.send(message).await?;
        debug!(conn = self.shared.label, method, id, "Request sent");
        call.await
    }

    /// Send a notification. Returns once the frame is flushed; nothing is
    /// awaited from the peer.
    pub async fn notify<P>(&self, method: &str, params: &P) -> Result<()>
    where
        P: Serialize + ?Sized,
    {
        let message = Message::Notification(Notification {
            method: method.to_string(),
            params: Some(serde_json::to_value(params)?),
        });
        self.shared.send(message).await?;
        debug!(conn = self.shared.label, method, "Notification sent");
        Ok(())
    }

    /// Number of requests awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the connection has shut down.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }
}

/// Releases a pending slot however the request future ends. A slot that
/// was already resolved or cancelled is gone, so this is a no-op then.
struct ForgetOnDrop<'a> {
    pending: &'a PendingCalls,
    id: u64,
}

impl Drop for ForgetOnDrop<'_> {
    fn drop(&mut self) {
        self.pending.forget(self.id);
    }
}

/// Owner of one duplex connection and its receive loop.
///
/// Dropping it shuts the connection down; [`close`](Self::close) does the
/// same and waits for the receive loop to finish.
pub struct RpcConnection {
    peer: Peer,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcConnection {
    /// Wire `router` to the given streams and start receiving.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<R, W>(label: &'static str, router: Router, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        Self::with_max_line_bytes(label, router, reader, writer, MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes<R, W>(
        label: &'static str,
        router: Router,
        reader: R,
        writer: W,
        max_line_bytes: usize,
    ) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        Self::build(label, reader, writer, max_line_bytes, |_| router)
    }

    /// Like [`new`](Self::new), but the router is built from a [`Peer`] for
    /// this same connection, so handlers can call back to the remote side.
    pub fn build<R, W, F>(
        label: &'static str,
        reader: R,
        writer: W,
        max_line_bytes: usize,
        make_router: F,
    ) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
        F: FnOnce(Peer) -> Router,
    {
        let writer: BoxWriter = Box::pin(writer);
        let shared = Arc::new(Shared {
            label,
            sink: Mutex::new(Some(FramedWrite::new(writer, WireCodec::new()))),
            pending: PendingCalls::new(),
            closed: CancellationToken::new(),
        });
        let peer = Peer { shared };
        let router = make_router(peer.clone());

        let frames = FramedRead::new(
            Box::pin(reader) as BoxReader,
            WireCodec::with_max_line_bytes(max_line_bytes),
        );
        let receive_task = tokio::spawn(receive_loop(Arc::clone(&peer.shared), router, frames));

        Self {
            peer,
            receive_task: Mutex::new(Some(receive_task)),
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Shut down: reject pending calls, stop receiving, close the write half.
    pub async fn close(&self) {
        self.peer.shared.shutdown("closed locally");
        let task = self.receive_task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(conn = self.peer.shared.label, error = %e, "Receive loop ended abnormally");
            }
        }
    }

    /// Resolves once the connection has shut down for any reason.
    pub async fn closed(&self) {
        self.peer.closed().await;
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        self.peer.shared.shutdown("connection dropped");
    }
}

async fn receive_loop(
    shared: Arc<Shared>,
    router: Router,
    mut frames: FramedRead<BoxReader, WireCodec>,
) {
    let label = shared.label;
    let mut handlers = JoinSet::new();

    let reason = 'receive: loop {
        tokio::select! {
            biased;

            () = shared.closed.cancelled() => break 'receive "closed locally",

            Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(e) = joined {
                    warn!(conn = label, error = %e, "Request handler task failed");
                }
            }

            frame = frames.next() => match frame {
                None => {
                    debug!(conn = label, "EOF from peer");
                    break 'receive "stream closed";
                }
                Some(Err(AcpError::Protocol { reason, frame })) => {
                    warn!(conn = label, %reason, %frame, "Malformed frame, closing connection");
                    break 'receive "protocol error";
                }
                Some(Err(e)) => {
                    warn!(conn = label, error = %e, "Read from peer failed");
                    break 'receive "read error";
                }
                Some(Ok(message)) => {
                    debug!(conn = label, method = message.method(), "Frame received");
                    match router.route(message, &shared.pending) {
                        Dispatch::Reply(handling) => {
                            let shared = Arc::clone(&shared);
                            handlers.spawn(async move {
                                let response = handling.await;
                                let id = response.id.clone();
                                if let Err(e) = shared.send(Message::Response(response)).await {
                                    debug!(conn = shared.label, %id, error = %e, "Could not deliver response");
                                }
                            });
                        }
                        Dispatch::Deliver(handling) => {
                            tokio::select! {
                                () = handling => {}
                                () = shared.closed.cancelled() => break 'receive "closed locally",
                            }
                        }
                        Dispatch::Done => {}
                    }
                }
            }
        }
    };

    shared.shutdown(reason);
    handlers.shutdown().await;
    shared.close_writer().await;
    info!(conn = label, reason, "Connection closed");
}
