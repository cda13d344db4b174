//! Governor agent — consumes jobs from pluggable work-queue engines while a
//! cluster master arbitrates locks between agents.

pub mod agent;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod status;
