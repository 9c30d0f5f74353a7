//! [`RpcTransport`] over a byte-stream pair, one JSON object per line.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tracing::{debug, trace};

use crate::rpc::{DecodeError, Request, Response};

use super::{RpcTransport, TransportError};

/// Frames requests onto `writer` and reads responses from `reader`.
///
/// Both halves are raw byte streams. Lines are split on `\n` and only then
/// validated as UTF-8, so a multi-byte character can never be cut in half
/// by the framing.
pub struct LineTransport<W, R> {
    writer: W,
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<W, R> std::fmt::Debug for LineTransport<W, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineTransport").finish_non_exhaustive()
    }
}

impl<W, R> LineTransport<W, R>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    pub fn new(writer: W, reader: R) -> Self {
        Self {
            writer,
            reader: BufReader::new(reader),
            buf: Vec::with_capacity(4096),
        }
    }

    /// Split the transport back into its halves.
    pub fn into_inner(self) -> (W, R) {
        (self.writer, self.reader.into_inner())
    }
}

/// Transport bound to a spawned child's stdin/stdout.
pub type ChildTransport = LineTransport<ChildStdin, ChildStdout>;

#[async_trait]
impl<W, R> RpcTransport for LineTransport<W, R>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    async fn send(&mut self, request: &Request) -> Result<(), TransportError> {
        let line = request.encode().map_err(TransportError::Encode)?;
        debug!(id = request.id, method = %request.method, "-> {line}");

        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(TransportError::Write)?;
        self.writer
            .write_all(b"\n")
            .await
            .map_err(TransportError::Write)?;
        self.writer.flush().await.map_err(TransportError::Write)
    }

    async fn receive(&mut self) -> Result<Response, TransportError> {
        loop {
            // Bytes read before a timeout cancelled the previous call are
            // still in `buf`; this read completes that line.
            let n = self
                .reader
                .read_until(b'\n', &mut self.buf)
                .await
                .map_err(TransportError::Read)?;
            if n == 0 && self.buf.is_empty() {
                return Err(TransportError::Eof);
            }
            let raw = std::mem::take(&mut self.buf);

            let Ok(text) = std::str::from_utf8(&raw) else {
                return Err(TransportError::Decode {
                    line: String::from_utf8_lossy(&raw).trim_end().to_string(),
                    source: DecodeError::InvalidUtf8,
                });
            };
            let line = text.trim_end_matches(['\n', '\r']);
            if line.trim().is_empty() {
                trace!("skipping blank line from target");
                continue;
            }

            debug!("<- {line}");
            return Response::decode(line).map_err(|source| TransportError::Decode {
                line: line.to_string(),
                source,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, duplex};

    use crate::rpc::{ResponseOutcome, params};

    /// Transport whose peer side is returned for the test to drive.
    fn pair() -> (
        LineTransport<tokio::io::DuplexStream, tokio::io::DuplexStream>,
        tokio::io::DuplexStream,
        tokio::io::DuplexStream,
    ) {
        let (ours_w, theirs_r) = duplex(4096);
        let (theirs_w, ours_r) = duplex(4096);
        (LineTransport::new(ours_w, ours_r), theirs_r, theirs_w)
    }

    #[tokio::test]
    async fn send_writes_exactly_one_terminated_line() {
        let (mut transport, mut peer_in, _peer_out) = pair();
        let req = Request::new("health", 1, None);
        transport.send(&req).await.unwrap();
        drop(transport);

        let mut written = String::new();
        peer_in.read_to_string(&mut written).await.unwrap();
        assert_eq!(written, "{\"jsonrpc\":\"2.0\",\"method\":\"health\",\"id\":1}\n");
        assert_eq!(written.matches('\n').count(), 1);
    }

    #[tokio::test]
    async fn send_escapes_newlines_inside_params() {
        let (mut transport, mut peer_in, _peer_out) = pair();
        let req = Request::new("auth.pat", 2, Some(params(json!({"access_token": "a\nb"}))));
        transport.send(&req).await.unwrap();
        drop(transport);

        let mut written = String::new();
        peer_in.read_to_string(&mut written).await.unwrap();
        assert_eq!(written.matches('\n').count(), 1);
        assert!(written.ends_with('\n'));
    }

    #[tokio::test]
    async fn receive_decodes_one_line_at_a_time() {
        let (mut transport, _peer_in, mut peer_out) = pair();
        peer_out
            .write_all(
                b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"a\":1}}\n\
                  {\"jsonrpc\":\"2.0\",\"id\":2,\"error\":{\"code\":-32601,\"message\":\"nope\"}}\n",
            )
            .await
            .unwrap();

        let first = transport.receive().await.unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(first.outcome, ResponseOutcome::Result(json!({"a": 1})));

        let second = transport.receive().await.unwrap();
        assert_eq!(second.id, 2);
        assert_eq!(second.error().unwrap().message, "nope");
    }

    #[tokio::test]
    async fn receive_accepts_crlf_and_skips_blank_lines() {
        let (mut transport, _peer_in, mut peer_out) = pair();
        peer_out
            .write_all(b"\r\n\n{\"jsonrpc\":\"2.0\",\"id\":5,\"result\":true}\r\n")
            .await
            .unwrap();
        let resp = transport.receive().await.unwrap();
        assert_eq!(resp.id, 5);
    }

    #[tokio::test]
    async fn receive_reports_eof_when_stream_closes() {
        let (mut transport, _peer_in, peer_out) = pair();
        drop(peer_out);
        assert!(matches!(
            transport.receive().await.unwrap_err(),
            TransportError::Eof
        ));
    }

    #[tokio::test]
    async fn receive_rejects_invalid_json() {
        let (mut transport, _peer_in, mut peer_out) = pair();
        peer_out.write_all(b"not json at all\n").await.unwrap();
        match transport.receive().await.unwrap_err() {
            TransportError::Decode { line, source } => {
                assert_eq!(line, "not json at all");
                assert!(matches!(source, DecodeError::InvalidJson(_)));
            }
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn receive_rejects_invalid_utf8() {
        let (mut transport, _peer_in, mut peer_out) = pair();
        peer_out.write_all(b"{\"id\":1,\"result\":\"\xff\xfe\"}\n").await.unwrap();
        match transport.receive().await.unwrap_err() {
            TransportError::Decode { source, .. } => {
                assert!(matches!(source, DecodeError::InvalidUtf8));
            }
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn receive_keeps_multibyte_text_intact() {
        let (mut transport, _peer_in, mut peer_out) = pair();
        peer_out
            .write_all("{\"jsonrpc\":\"2.0\",\"id\":3,\"result\":\"授权成功 ✅\"}\n".as_bytes())
            .await
            .unwrap();
        let resp = transport.receive().await.unwrap();
        assert_eq!(resp.result().unwrap(), &json!("授权成功 ✅"));
    }

    #[tokio::test]
    async fn send_fails_when_peer_is_gone() {
        let (mut transport, peer_in, _peer_out) = pair();
        drop(peer_in);
        let err = transport
            .send(&Request::new("health", 1, None))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Write(_)));
        assert!(err.suggests_exit());
    }
}
