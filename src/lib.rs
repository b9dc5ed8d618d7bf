//! hengdang: a personal, identity-authenticated file store.
//!
//! Files and directories live in an ordered key-value store (redb on disk,
//! or in memory) and are served over HTTP with filesystem semantics:
//! chunked content, ETags and conditional requests, per-path write locks,
//! an append-only change log with live Server-Sent Events, and per-identity
//! storage quotas.
//!
//! The [`daemon::engine::Engine`] composes the storage services; the
//! [`daemon::http`] module exposes it as an axum router.

pub mod commands;
pub mod config;
pub mod constants;
pub mod daemon;
pub mod error;
pub mod utils;
