use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex};
use tokio::task::JoinHandle;

use actprobe_core::rpc::{Request, Response};
use actprobe_core::transport::{RpcTransport, TransportError};

use crate::DuplexTransport;

/// One frame seen by a [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Sent(Request),
    Received(Response),
}

/// Wraps a transport and records every request sent and response received.
///
/// The frame log is shared, so keep a [`RecordingTransport::frames`] handle
/// before moving the transport into a client.
pub struct RecordingTransport<T> {
    inner: T,
    frames: Arc<Mutex<Vec<Frame>>>,
}

impl<T> RecordingTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            frames: Arc::default(),
        }
    }

    pub fn frames(&self) -> Arc<Mutex<Vec<Frame>>> {
        Arc::clone(&self.frames)
    }

    fn push(&self, frame: Frame) {
        self.frames.lock().expect("frame log poisoned").push(frame);
    }
}

#[async_trait]
impl<T: RpcTransport> RpcTransport for RecordingTransport<T> {
    async fn send(&mut self, request: &Request) -> Result<(), TransportError> {
        self.inner.send(request).await?;
        self.push(Frame::Sent(request.clone()));
        Ok(())
    }

    async fn receive(&mut self) -> Result<Response, TransportError> {
        let response = self.inner.receive().await?;
        self.push(Frame::Received(response.clone()));
        Ok(response)
    }
}

/// A peer that answers the n-th request line with `replies[n]`, written
/// verbatim. `{id}` in a reply is replaced with the request's id when the
/// request parses. A reply should carry its own line terminator; omit it to
/// test partial output followed by EOF.
///
/// After the replies run out the peer closes its output. The join handle
/// yields every raw line the peer received.
pub fn scripted_peer(replies: Vec<String>) -> (DuplexTransport, JoinHandle<Vec<String>>) {
    let (client_w, peer_r) = duplex(64 * 1024);
    let (mut peer_w, client_r) = duplex(64 * 1024);

    let task = tokio::spawn(async move {
        let mut received = Vec::new();
        let mut lines = BufReader::new(peer_r).lines();
        for reply in replies {
            let Ok(Some(line)) = lines.next_line().await else {
                break;
            };
            let reply = match Request::decode(&line) {
                Ok(req) => reply.replace("{id}", &req.id.to_string()),
                Err(_) => reply,
            };
            received.push(line);
            if peer_w.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
            let _ = peer_w.flush().await;
        }
        drop(peer_w);
        // Keep draining so the harness never blocks on a full pipe.
        while let Ok(Some(line)) = lines.next_line().await {
            received.push(line);
        }
        received
    });

    (DuplexTransport::new(client_w, client_r), task)
}
