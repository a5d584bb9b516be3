//! Director – an actor-protocol host for sandboxed page instrumenters
//!
//! This crate manages the lifecycle of dynamically injected "instrumenter"
//! scripts attached to a live, navigable page:
//! - A [`DirectorActor`] per attached page acts as registry and factory
//! - Each [`InstrumenterActor`] owns at most one isolated execution context
//! - Activation follows page navigation (document created/destroyed)
//! - Clients call into sandboxed exports and receive events back over an
//!   NDJSON actor protocol ([`service`])
//!
//! The page runtime, the sandbox primitive and the RPC connection are
//! consumed through the capability traits in [`runtime::page`],
//! [`runtime::realm`] and [`runtime::transport`].

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Actor runtime: director, instrumenters, sandboxes and navigation
pub mod runtime;

/// NDJSON actor-protocol service
pub mod service;

/// In-memory page runtime and scripted realms for tests and embedders
pub mod testing;

/// Tracing subscriber setup
pub mod logging;

pub use runtime::director::{Attachment, DirectorActor};
pub use runtime::instrumenter::InstrumenterActor;
pub use runtime::DirectorConfig;

/// Current version of the director crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version for the actor-protocol service
pub const PROTOCOL_VERSION: &str = "1.0.0";
