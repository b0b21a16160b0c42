//! Disk-backed HTTP response cache with single-flight population.

pub mod cache;
pub mod config;
pub mod infra;
