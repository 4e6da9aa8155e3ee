//! Cumulus supervisor library.
//!
//! This library provides the core components of the cumulus multi-agent
//! conversation supervisor: the line-JSON stream decoder, the context
//! assembler, per-thread persistence, the subprocess supervisor, the agent
//! router, and the local HTTP control API.

pub mod api;
pub mod context;
pub mod retrieval;
pub mod router;
pub mod store;
pub mod stream;
pub mod supervisor;
pub mod thread;
