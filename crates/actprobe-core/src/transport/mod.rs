//! Line-delimited transport to the target process.
//!
//! ```text
//! RpcClient  --call(method, params)-->  RpcTransport
//!     |                                     |
//!     | assigns id, checks echo             | send(request)  -> one line on stdin
//!     | applies receive timeout             | receive()      <- one line from stdout
//!     v                                     v
//! Exchange { request, response }        LineTransport<ChildStdin, ChildStdout>
//! ```
//!
//! Exactly one call is in flight at a time: every `send` is followed by
//! exactly one `receive` before the next `send`.

pub mod client;
pub mod line;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::rpc::{DecodeError, Request, Response};

pub use client::{Exchange, RpcClient};
pub use line::{ChildTransport, LineTransport};

/// Failures on the pipe. Always fatal to a run.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to write request to target input stream: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to read from target output stream: {0}")]
    Read(#[source] std::io::Error),

    #[error("malformed response line ({source}): {line}")]
    Decode {
        line: String,
        #[source]
        source: DecodeError,
    },

    #[error("target output stream closed before a response line was produced")]
    Eof,

    #[error("response id {actual} does not match request id {expected}")]
    Mismatch { expected: u64, actual: u64 },

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("cancelled while waiting for a response")]
    Cancelled,
}

impl TransportError {
    /// True for failures that usually mean the target process is gone.
    pub fn suggests_exit(&self) -> bool {
        matches!(self, Self::Eof | Self::Write(_))
    }
}

/// A bidirectional request/response pipe.
///
/// Implementors frame exactly one request per `send` and decode exactly one
/// response per `receive`. They do not assign or validate ids; that is the
/// job of [`RpcClient`].
#[async_trait]
pub trait RpcTransport: Send {
    /// Write one request line, followed by one terminator, then flush.
    async fn send(&mut self, request: &Request) -> Result<(), TransportError>;

    /// Block until one response line is available and decode it.
    async fn receive(&mut self) -> Result<Response, TransportError>;
}

#[async_trait]
impl<T: RpcTransport + ?Sized> RpcTransport for Box<T> {
    async fn send(&mut self, request: &Request) -> Result<(), TransportError> {
        (**self).send(request).await
    }

    async fn receive(&mut self) -> Result<Response, TransportError> {
        (**self).receive().await
    }
}
