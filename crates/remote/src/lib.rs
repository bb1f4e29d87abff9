//! Remote session management.
//!
//! One SSH session process-wide, opened with identities from the local key
//! agent only. The [`ConnectionManager`] owns it and stamps each session with
//! a generation so work bound to an old session is never moved onto a new one.

pub mod error;
pub mod info;
pub mod manager;
pub mod session;
pub mod ssh;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use error::ConnectionError;
pub use manager::{ConnectionManager, ConnectionStatus, HealthReport};
pub use session::{CommandOutput, Connector, RemoteEntry, RemoteSession, SshTarget};
pub use ssh::{SshConnector, SshSettings};
