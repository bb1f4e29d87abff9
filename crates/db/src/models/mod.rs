//! Row types and DTOs, one module per table.

pub mod job;
pub mod output;
pub mod provenance;
