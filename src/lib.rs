//! swerex: a remote-execution substrate for software-engineering agents.
//!
//! The crate has two halves. The runtime half (`session`, `runtime`, `server`)
//! runs *inside* the target environment: it multiplexes named bash REPL
//! sessions over pseudo-terminals, runs one-shot commands, and reads/writes
//! files, all behind a small authenticated HTTP surface served by the
//! `swerex-remote` binary. The deployment half (`deployment`, `docker`,
//! `cleanup`) runs in the orchestrator: it materializes a container carrying
//! that binary, probes it until healthy, supervises it, and guarantees
//! teardown on normal exit and on signals. `remote` is the typed client that
//! connects the two over HTTP.

pub mod cleanup;
pub mod deployment;
pub mod docker;
pub mod error;
pub mod models;
pub mod remote;
pub mod runtime;
pub mod server;
pub mod session;
pub mod splitter;
