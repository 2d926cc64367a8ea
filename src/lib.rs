//! Ratekeeper - fixed-window rate limiting for web request handlers
//!
//! This crate counts requests per identifier (client IP, or session/user id)
//! within fixed time windows stored in Redis, so every instance of a web
//! application shares the same counters. Handlers call the limiter directly
//! through [`ratelimit::RateLimiter`] or over gRPC through the bundled
//! service. When the store is unreachable the limiter fails open.

pub mod config;
pub mod error;
pub mod grpc;
pub mod logging;
pub mod ratelimit;
