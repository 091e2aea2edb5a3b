//! pagegate: a full-page response cache gateway for storefronts.
//!
//! The [`cache`] module holds the gateway itself (an axum middleware plus the
//! invalidation trigger), [`infra`] the memcached backend and telemetry, and
//! [`config`] the layered settings loader used by the operator binary.

pub mod cache;
pub mod config;
pub mod infra;
pub mod util;
