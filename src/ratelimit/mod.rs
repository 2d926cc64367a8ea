//! Rate limiting logic and counter stores.

mod decision;
mod identifier;
mod limiter;
mod memory;
mod profile;
mod redis;
mod store;

pub use decision::{CheckOutcome, RateLimitResult};
pub use identifier::{
    client_ip, normalize_ip, IdentityPolicy, Identifier, RequestContext, RequestInfo,
    UNKNOWN_IDENTIFIER,
};
pub use limiter::RateLimiter;
pub use memory::MemoryStore;
pub use profile::{
    ProfileSet, RateLimitConfig, AUTH, BUILTIN_PROFILES, CHECKOUT, PASSWORD_RESET, SEARCH, UPLOAD,
};
pub use redis::RedisStore;
pub use store::{CounterStore, StoreError, WindowCounter};
