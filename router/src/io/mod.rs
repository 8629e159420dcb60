//! Side-effecting subsystems: configuration, filesystem snapshots, child
//! process orchestration, and the structured logging pipeline.

pub mod config;
pub mod log_pipeline;
pub mod process;
pub mod snapshot;
