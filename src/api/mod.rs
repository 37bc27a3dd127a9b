//! HTTP API Module
//!
//! Provides a small HTTP surface for health checks and writer status.

mod http;

pub use http::HttpServer;
