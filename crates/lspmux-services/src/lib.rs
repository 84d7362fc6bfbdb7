//! lspmux — Collaborator Implementations
//!
//! Concrete implementations of the capability seams the proxy core
//! consumes: a local-directory workspace filesystem, a client-session
//! directory for notification fan-out, and telemetry sinks.

pub mod fs;
pub mod sessions;
pub mod telemetry;

pub use fs::{LocalFsProvider, LocalWorkspaceFs};
pub use sessions::SessionRegistry;
pub use telemetry::{CollectingTelemetry, TracingTelemetry};
