//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async functions that
//! accept `&SqlitePool` as the first argument.

pub mod job_repo;
pub mod output_repo;
pub mod provenance_repo;

pub use job_repo::JobRepo;
pub use output_repo::OutputRepo;
pub use provenance_repo::ProvenanceRepo;
