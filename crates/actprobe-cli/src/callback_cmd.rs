//! `actprobe callback`: a one-endpoint HTTP listener that captures an OAuth2
//! authorization code from the provider's redirect and hands it off through
//! a [`CodeHandoff`] file.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::handoff::CodeHandoff;

/// Env var overriding the listen port.
pub const ENV_CALLBACK_PORT: &str = "ACTPROBE_CALLBACK_PORT";
pub const DEFAULT_CALLBACK_PORT: u16 = 8080;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CallbackState {
    handoff: CodeHandoff,
    /// Cancelled after the first captured code when running with `--once`.
    captured: Option<CancellationToken>,
}

impl CallbackState {
    pub fn new(handoff: CodeHandoff) -> Self {
        Self {
            handoff,
            captured: None,
        }
    }

    pub fn shutdown_after_capture(mut self, token: CancellationToken) -> Self {
        self.captured = Some(token);
        self
    }
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: CallbackState) -> Router {
    Router::new()
        .route("/oauth/callback", get(callback))
        .route("/oauth/callback/{*rest}", get(callback))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Resolve the listen port: flag > `ACTPROBE_CALLBACK_PORT` > 8080.
pub fn resolve_port<F>(flag: Option<u16>, env: F) -> Result<u16>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(port) = flag {
        return Ok(port);
    }
    match env(ENV_CALLBACK_PORT) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{ENV_CALLBACK_PORT} is not a valid port: {raw:?}")),
        None => Ok(DEFAULT_CALLBACK_PORT),
    }
}

pub async fn run_callback(port: u16, handoff: CodeHandoff, once: bool) -> Result<()> {
    let shutdown = CancellationToken::new();
    let mut state = CallbackState::new(handoff.clone());
    if once {
        state = state.shutdown_after_capture(shutdown.clone());
    }
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind callback listener on {addr}"))?;
    tracing::info!(
        "callback listener on http://localhost:{port}/oauth/callback, codes go to {}",
        handoff.path().display()
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;
    tracing::info!("callback listener shut down");
    Ok(())
}

async fn shutdown_signal(captured: CancellationToken) {
    tokio::select! {
        _ = captured.cancelled() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!("failed to listen for Ctrl+C: {e}");
                captured.cancelled().await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn callback(State(state): State<CallbackState>, Query(q): Query<CallbackQuery>) -> Response {
    if let Some(error) = q.error {
        let description = q.error_description.unwrap_or_default();
        tracing::warn!(%error, %description, "authorization denied by provider");
        return (
            StatusCode::BAD_REQUEST,
            page(
                "Authorization failed",
                &format!("The provider returned <code>{}</code>. {}", escape(&error), escape(&description)),
            ),
        )
            .into_response();
    }

    let Some(code) = q.code.filter(|c| !c.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            page(
                "Missing authorization code",
                "The redirect carried neither a <code>code</code> nor an <code>error</code> parameter.",
            ),
        )
            .into_response();
    };

    if let Err(e) = state.handoff.write(&code) {
        tracing::warn!("failed to store authorization code: {e:#}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            page("Could not store code", &escape(&format!("{e:#}"))),
        )
            .into_response();
    }
    tracing::info!(
        state = q.state.as_deref().unwrap_or(""),
        path = %state.handoff.path().display(),
        "authorization code captured"
    );
    if let Some(token) = &state.captured {
        token.cancel();
    }

    (
        StatusCode::OK,
        page(
            "Authorization successful",
            "The authorization code was captured. You can close this window.",
        ),
    )
        .into_response()
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, page("Not found", "Only /oauth/callback is served here."))
}

fn page(title: &str, body: &str) -> Html<String> {
    Html(format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
         <body><h1>{title}</h1><p>{body}</p></body></html>\n"
    ))
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    // -----------------------------------------------------------------------
    // HTTP helpers
    // -----------------------------------------------------------------------

    async fn send_request(state: CallbackState, uri: &str) -> axum::response::Response {
        let app = build_router(state);
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn scratch() -> (tempfile::TempDir, CodeHandoff) {
        let tmp = tempfile::tempdir().unwrap();
        let handoff = CodeHandoff::new(tmp.path().join("code.txt"));
        (tmp, handoff)
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn code_is_handed_off_and_confirmed() {
        let (_tmp, handoff) = scratch();

        let resp = send_request(
            CallbackState::new(handoff.clone()),
            "/oauth/callback?code=abc123&state=xyz",
        )
        .await;

        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(content_type.starts_with("text/html"));
        assert!(body_text(resp).await.contains("Authorization successful"));
        assert_eq!(handoff.take().unwrap().as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn sub_paths_are_served() {
        let (_tmp, handoff) = scratch();

        let resp = send_request(
            CallbackState::new(handoff.clone()),
            "/oauth/callback/github?code=zzz",
        )
        .await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(handoff.take().unwrap().as_deref(), Some("zzz"));
    }

    #[tokio::test]
    async fn provider_error_is_a_bad_request() {
        let (_tmp, handoff) = scratch();

        let resp = send_request(
            CallbackState::new(handoff.clone()),
            "/oauth/callback?error=access_denied&error_description=%3Cnope%3E",
        )
        .await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_text(resp).await;
        assert!(body.contains("access_denied"));
        assert!(body.contains("&lt;nope&gt;"));
        assert_eq!(handoff.take().unwrap(), None);
    }

    #[tokio::test]
    async fn missing_code_is_a_bad_request() {
        let (_tmp, handoff) = scratch();

        let resp = send_request(CallbackState::new(handoff.clone()), "/oauth/callback").await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(resp).await.contains("Missing authorization code"));
        assert!(!handoff.path().exists());
    }

    #[tokio::test]
    async fn other_paths_are_not_found() {
        let (_tmp, handoff) = scratch();

        let resp = send_request(CallbackState::new(handoff), "/favicon.ico").await;

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn capture_signals_shutdown_in_once_mode() {
        let (_tmp, handoff) = scratch();
        let token = CancellationToken::new();
        let state = CallbackState::new(handoff).shutdown_after_capture(token.clone());

        let denied = send_request(state.clone(), "/oauth/callback?error=access_denied").await;
        assert_eq!(denied.status(), StatusCode::BAD_REQUEST);
        assert!(!token.is_cancelled());

        let resp = send_request(state, "/oauth/callback?code=once").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(token.is_cancelled());
    }

    #[test]
    fn port_resolution_chain() {
        let env = |name: &str| (name == ENV_CALLBACK_PORT).then(|| "9090".to_string());

        assert_eq!(resolve_port(Some(7000), env).unwrap(), 7000);
        assert_eq!(resolve_port(None, env).unwrap(), 9090);
        assert_eq!(resolve_port(None, |_| None).unwrap(), DEFAULT_CALLBACK_PORT);

        let bad = resolve_port(None, |_| Some("http".to_string())).unwrap_err();
        assert!(bad.to_string().contains(ENV_CALLBACK_PORT));
    }
}
