//! Herdguard - a caching reverse proxy that collapses concurrent identical
//! requests into a single upstream call

pub mod broadcast;
pub mod cache;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod handlers;
pub mod metrics;
pub mod origin;
pub mod proxy;
pub mod store;
pub mod ttl;
