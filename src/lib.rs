//! roundhouse - a round-robin-archive time-series ingestion engine.
//!
//! Accepts a high-volume stream of named numeric samples and statsd-style
//! counter/gauge/timer events, aggregates them in memory against per-series
//! archive definitions, and periodically flushes materialized archive slots
//! to a durable store.

pub mod config;
pub mod health;
pub mod pipeline;
pub mod registry;
pub mod series;
pub mod store;
