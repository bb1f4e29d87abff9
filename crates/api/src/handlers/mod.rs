pub mod audit;
pub mod hpc;
pub mod jobs;
pub mod registry;
