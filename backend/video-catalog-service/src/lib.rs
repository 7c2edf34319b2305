//! Video catalog service
//!
//! Owns the authoritative video aggregate. Every committed mutation appends a
//! versioned domain event to the transactional outbox in the same transaction;
//! the outbox processor hands those rows to the projection consumer, which
//! deduplicates by event id and keeps the query-facing read model in step.
//!
//! - [`services`]: create / update / delete plus the processing, media, AI and
//!   visibility stage services
//! - [`events`]: domain event construction and wire encoding
//! - [`db`]: Postgres and in-memory storage behind [`db::CatalogStore`] and
//!   [`db::ProjectionStore`]
//! - [`consumers`]: decoding, projection apply, dedup and redelivery

pub mod clock;
pub mod config;
pub mod consumers;
pub mod db;
pub mod error;
pub mod events;
pub mod http;
pub mod metrics;
pub mod models;
pub mod services;

pub use config::Config;
pub use error::{AppError, ErrorKind, Result};
