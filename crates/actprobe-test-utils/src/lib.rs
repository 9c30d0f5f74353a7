//! Shared test utilities for actprobe tests.
//!
//! - [`FakeActionService`]: an in-memory action service that speaks the
//!   line protocol over `tokio::io::duplex` pipes, with the same conflict
//!   behavior as the real service so idempotence can be exercised.
//! - [`RecordingTransport`]: wraps any transport and keeps every frame.
//! - [`scripted_peer`]: answers each request with a canned raw line, for
//!   malformed-output tests.
//! - [`write_script`] and friends: executable `/bin/sh` targets for tests
//!   that need a real child process.

mod fake_service;
mod peer;
mod scripts;

pub use fake_service::{DuplexTransport, FakeActionService, connection_trn};
pub use peer::{Frame, RecordingTransport, scripted_peer};
pub use scripts::{smoke_target_script, workflow_target_script, write_script};
