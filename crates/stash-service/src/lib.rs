//! A coalescing cache-aside layer in front of a relational database.
//!
//! - [`kv`] talks to the key-value store holding the cache entries.
//! - [`caching`] contains the [`Cacher`](caching::Cacher), which deduplicates concurrent
//!   lookups and serves them from the store or a loader.
//! - [`repository`] provides cached data-access helpers on top of it.
//! - [`service`] wires all of the above up from a [`Config`](config::Config).

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod kv;
pub mod logging;
pub mod repository;
pub mod service;
pub mod utils;
