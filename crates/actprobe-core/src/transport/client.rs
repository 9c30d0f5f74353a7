//! Sequential request/response client on top of an [`RpcTransport`].

use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::rpc::{Params, Request, Response};

use super::{RpcTransport, TransportError};

/// One completed call: the request as sent and the response as received.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub request: Request,
    pub response: Response,
    pub elapsed: Duration,
}

/// A transport failure together with the request that triggered it.
#[derive(Debug, Error)]
#[error("{} (id {}): {source}", .request.method, .request.id)]
pub struct CallError {
    pub request: Request,
    #[source]
    pub source: TransportError,
}

/// Assigns ids, pairs each request with exactly one response, and checks
/// that the response echoes the request id.
#[derive(Debug)]
pub struct RpcClient<T> {
    transport: T,
    next_id: u64,
    call_timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
}

impl<T: RpcTransport> RpcClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            next_id: 1,
            call_timeout: None,
            cancel: None,
        }
    }

    /// Bound every `receive` by `timeout`. `None` blocks indefinitely.
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Abandon any pending `receive` with [`TransportError::Cancelled`] once
    /// `token` fires.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout
    }

    /// The id the next request will carry.
    pub fn peek_id(&self) -> u64 {
        self.next_id
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Allocate an id and write the request. Does not wait for a response.
    pub async fn send(
        &mut self,
        method: &str,
        params: Option<Params>,
    ) -> Result<Request, CallError> {
        let id = self.next_id;
        self.next_id += 1;
        let request = Request::new(method, id, params);
        match self.transport.send(&request).await {
            Ok(()) => Ok(request),
            Err(source) => Err(CallError { request, source }),
        }
    }

    /// Read the next response line, bounded by `timeout` if given.
    pub async fn receive(&mut self, timeout: Option<Duration>) -> Result<Response, TransportError> {
        let read = receive_within(&mut self.transport, timeout);
        match &self.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(TransportError::Cancelled),
                result = read => result,
            },
            None => read.await,
        }
    }

    /// Send one request and wait for its response.
    pub async fn call(
        &mut self,
        method: &str,
        params: Option<Params>,
    ) -> Result<Exchange, CallError> {
        let started = Instant::now();
        let request = self.send(method, params).await?;

        let response = match self.receive(self.call_timeout).await {
            Ok(response) => response,
            Err(source) => return Err(CallError { request, source }),
        };

        if response.id != request.id {
            let source = TransportError::Mismatch {
                expected: request.id,
                actual: response.id,
            };
            return Err(CallError { request, source });
        }

        let elapsed = started.elapsed();
        debug!(
            method,
            id = request.id,
            ok = response.is_success(),
            elapsed_ms = elapsed.as_millis() as u64,
            "call completed"
        );
        Ok(Exchange {
            request,
            response,
            elapsed,
        })
    }
}

async fn receive_within<T: RpcTransport>(
    transport: &mut T,
    timeout: Option<Duration>,
) -> Result<Response, TransportError> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, transport.receive())
            .await
            .map_err(|_| TransportError::Timeout(limit))?,
        None => transport.receive().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex};

    use crate::transport::LineTransport;

    type DuplexTransport = LineTransport<tokio::io::DuplexStream, tokio::io::DuplexStream>;

    /// Client plus a peer that answers every request with `reply(id)`.
    fn client_with_peer<F>(reply: F) -> RpcClient<DuplexTransport>
    where
        F: Fn(u64) -> String + Send + 'static,
    {
        let (ours_w, theirs_r) = duplex(4096);
        let (mut theirs_w, ours_r) = duplex(4096);
        tokio::spawn(async move {
            let mut lines = BufReader::new(theirs_r).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let req = Request::decode(&line).unwrap();
                let out = reply(req.id);
                if theirs_w.write_all(out.as_bytes()).await.is_err() {
                    break;
                }
            }
        });
        RpcClient::new(LineTransport::new(ours_w, ours_r))
    }

    #[tokio::test]
    async fn call_assigns_sequential_ids() {
        let mut client = client_with_peer(|id| {
            format!("{{\"jsonrpc\":\"2.0\",\"id\":{id},\"result\":{{\"status\":\"healthy\"}}}}\n")
        });

        let first = client.call("health", None).await.unwrap();
        let second = client.call("health", None).await.unwrap();
        assert_eq!(first.request.id, 1);
        assert_eq!(second.request.id, 2);
        assert_eq!(second.response.result().unwrap(), &json!({"status": "healthy"}));
        assert_eq!(client.peek_id(), 3);
    }

    #[tokio::test]
    async fn call_detects_id_mismatch() {
        let mut client = client_with_peer(|id| {
            format!("{{\"jsonrpc\":\"2.0\",\"id\":{},\"result\":{{}}}}\n", id + 100)
        });

        let err = client.call("health", None).await.unwrap_err();
        assert_eq!(err.request.method, "health");
        assert!(matches!(
            err.source,
            TransportError::Mismatch {
                expected: 1,
                actual: 101
            }
        ));
    }

    #[tokio::test]
    async fn call_times_out_when_peer_is_silent() {
        let (ours_w, _theirs_r) = duplex(4096);
        let (_theirs_w, ours_r) = duplex(4096);
        let mut client = RpcClient::new(LineTransport::new(ours_w, ours_r))
            .with_call_timeout(Some(Duration::from_millis(50)));

        let err = client.call("health", None).await.unwrap_err();
        assert!(matches!(err.source, TransportError::Timeout(_)));
    }

    #[tokio::test]
    async fn cancel_abandons_pending_call() {
        let (ours_w, _theirs_r) = duplex(4096);
        let (_theirs_w, ours_r) = duplex(4096);
        let token = CancellationToken::new();
        let mut client = RpcClient::new(LineTransport::new(ours_w, ours_r)).with_cancel(token.clone());

        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = client.call("action.register", None).await.unwrap_err();
        assert!(matches!(err.source, TransportError::Cancelled));
        assert_eq!(err.request.method, "action.register");
        assert_eq!(err.request.id, 1);
    }
}
