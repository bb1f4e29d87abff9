//! Domain logic for the neuroimaging job orchestrator.
//!
//! Everything in this crate is pure: no database access, no network, no
//! process spawning. The persistence, transport and execution crates build
//! on these types.

pub mod container;
pub mod error;
pub mod hashing;
pub mod hpc;
pub mod job_spec;
pub mod outputs;
pub mod phases;
pub mod provenance;
pub mod registry;
pub mod resolve;
pub mod resources;
pub mod status;
pub mod template;
pub mod types;
