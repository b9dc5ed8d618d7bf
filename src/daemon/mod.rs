//! The file server: storage engine, authentication and HTTP surface.

pub mod auth;
pub mod engine;
pub mod http;
pub mod paths;
pub mod services;
pub mod store;
