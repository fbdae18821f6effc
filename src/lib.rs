//! Key validation and quota metering for a multi-provider LLM relay.
//!
//! The crate sits in front of the relay proper: on every inbound request it
//! authenticates a credential key, reports whether and how far the key is
//! into its spend ceilings, and afterwards records the request's token and
//! cost usage. Two stores cooperate with no global transaction: a durable
//! SQL record owns key configuration while a hot counter cache owns the
//! authentication index, the per-period cost buckets, the sliding rate
//! window, and a bounded usage log.
//!
//! The engine never makes the admission decision itself. [`validate`]
//! returns a discriminated outcome plus a quota snapshot and the relay in
//! front decides whether the request proceeds; [`record`] then folds the
//! completed request into every applicable counter without ever failing the
//! request it meters.
//!
//! [`validate`]: engine::MeteringEngine::validate
//! [`record`]: engine::MeteringEngine::record
//!
//! # Example
//!
//! ```ignore
//! let cache = cache::build_cache(&config.cache)?;
//! let store = Arc::new(db::SqliteKeyStore::new(pool));
//! let engine = engine::MeteringEngine::new(
//!     store,
//!     cache,
//!     pricing,
//!     owner_gate,
//!     registries,
//!     config,
//! )?;
//!
//! match engine.validate(secret).await? {
//!     engine::ValidationOutcome::Valid(snapshot) => { /* relay the request */ }
//!     outcome => { /* reject with the outcome */ }
//! }
//! ```

pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod events;
pub mod models;
pub mod pricing;
