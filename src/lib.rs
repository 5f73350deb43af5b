//! # tasktrack-rs
//!
//! Task-tracking service core: a transactional lifecycle pipeline over
//! Postgres and pgmq.
//!
//! Task mutations commit together with their lifecycle events in one
//! database transaction; a bounded worker pool consumes the events with
//! retry/backoff and dead-letters exhausted jobs; an overdue scanner feeds
//! the same queue; a TTL cache keeps the read path cheap and consistent.

pub mod cache;
pub mod config;
pub mod db;
pub mod deadletter;
pub mod error;
pub mod model;
pub mod scanner;
pub mod service;
pub mod shutdown;
pub mod telemetry;
pub mod worker;
