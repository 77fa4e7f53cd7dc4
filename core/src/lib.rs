//! Multi-tenant session manager for interactive terminal programs.
//!
//! Each session is an AI CLI (or any interactive program from the catalog)
//! running inside a shell on its own PTY. The [`SessionRegistry`] supervises
//! spawning, readiness inference, input queueing and pacing, output fan-out,
//! chat transcripts, durable per-owner history, crash recovery, and idle
//! reaping.

mod buffers;
mod config;
mod errors;
mod history;
mod program;
mod readiness;
mod registry;
mod sanitize;
mod session;
mod spawn;
mod transcript;

pub use config::Config;
pub use errors::Result;
pub use errors::SessionError;
pub use program::EnvResolver;
pub use program::HostEnvResolver;
pub use program::ProgramCatalog;
pub use program::ProgramSpec;
pub use program::ProgramVariant;
pub use program::StaticEnvResolver;
pub use registry::SessionRegistry;
pub use session::ExitCallback;
pub use session::OutputCallback;
pub use session::SubscriberId;

pub use ttymux_protocol as protocol;
