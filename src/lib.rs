//! Trackgate - Admission Control for the Track Library API
//!
//! This crate implements per-client, per-endpoint-class rate limiting for an
//! HTTP API. Each request is mapped to a named policy by method and path,
//! attributed to a client by proxy headers or peer address, and admitted or
//! rejected by that client's token bucket.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
