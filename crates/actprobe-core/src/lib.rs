//! Test harness for an action-execution service spoken to over
//! line-delimited JSON-RPC on a child process's stdin/stdout.
//!
//! The [`session`] module ties the pieces together: the [`supervisor`]
//! starts the target, [`readiness`] waits for it to answer, the
//! [`workflow`] orchestrator drives the dependency-chained steps through a
//! [`transport::RpcClient`], [`verify`] checks each response, and a
//! [`report::RunReport`] records every call.

pub mod error;
pub mod readiness;
pub mod report;
pub mod rpc;
pub mod session;
pub mod smoke;
pub mod supervisor;
pub mod transport;
pub mod verify;
pub mod workflow;

pub use error::HarnessError;
