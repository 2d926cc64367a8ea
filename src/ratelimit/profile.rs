//! Rate limit profiles: the per-endpoint limit configuration.
//!
//! A profile pairs a request budget with a window length and a key prefix.
//! The key prefix is what keeps profiles apart in the shared store, so two
//! profiles with the same numbers but different prefixes never see each
//! other's counters.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{RatekeeperError, Result};

/// Configuration for a single rate limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum requests allowed per window. Zero blocks every request.
    pub max_requests: u32,
    /// Length of the window in seconds, anchored at the first request
    pub window_seconds: u64,
    /// Namespace isolating this limiter's counters in the store
    pub key_prefix: Cow<'static, str>,
    /// Count per session/user instead of per IP address
    #[serde(default)]
    pub use_user_id: bool,
}

impl RateLimitConfig {
    /// Create a new IP-keyed configuration.
    pub fn new(max_requests: u32, window_seconds: u64, key_prefix: impl Into<String>) -> Self {
        Self {
            max_requests,
            window_seconds,
            key_prefix: Cow::Owned(key_prefix.into()),
            use_user_id: false,
        }
    }

    /// Key the limit on the session or user id when one is present.
    pub fn per_user(mut self) -> Self {
        self.use_user_id = true;
        self
    }

    /// Build the store key for an identifier.
    pub fn key_for(&self, identifier: &str) -> String {
        format!("{}:{}", self.key_prefix, identifier)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.window_seconds == 0 {
            return Err(RatekeeperError::Config(format!(
                "profile '{}': window_seconds must be positive",
                name
            )));
        }
        if self.key_prefix.trim().is_empty() {
            return Err(RatekeeperError::Config(format!(
                "profile '{}': key_prefix must not be empty",
                name
            )));
        }
        Ok(())
    }
}

/// Login and other credential checks, per IP.
pub const AUTH: RateLimitConfig = RateLimitConfig {
    max_requests: 5,
    window_seconds: 60,
    key_prefix: Cow::Borrowed("ratelimit:auth"),
    use_user_id: false,
};

/// Password reset e-mails, per IP.
pub const PASSWORD_RESET: RateLimitConfig = RateLimitConfig {
    max_requests: 3,
    window_seconds: 3600,
    key_prefix: Cow::Borrowed("ratelimit:password-reset"),
    use_user_id: false,
};

/// Checkout and payment actions, per session.
pub const CHECKOUT: RateLimitConfig = RateLimitConfig {
    max_requests: 10,
    window_seconds: 60,
    key_prefix: Cow::Borrowed("ratelimit:checkout"),
    use_user_id: true,
};

/// Catalogue search queries, per IP.
pub const SEARCH: RateLimitConfig = RateLimitConfig {
    max_requests: 60,
    window_seconds: 60,
    key_prefix: Cow::Borrowed("ratelimit:search"),
    use_user_id: false,
};

/// File and media uploads, per session.
pub const UPLOAD: RateLimitConfig = RateLimitConfig {
    max_requests: 10,
    window_seconds: 300,
    key_prefix: Cow::Borrowed("ratelimit:upload"),
    use_user_id: true,
};

/// Names under which the built-in profiles are registered.
pub static BUILTIN_PROFILES: [(&str, RateLimitConfig); 5] = [
    ("auth", AUTH),
    ("password_reset", PASSWORD_RESET),
    ("checkout", CHECKOUT),
    ("search", SEARCH),
    ("upload", UPLOAD),
];

/// The set of profiles a service answers for, indexed by name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfileSet {
    profiles: BTreeMap<String, RateLimitConfig>,
}

impl ProfileSet {
    /// Create an empty profile set.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in profiles.
    pub fn builtin() -> Self {
        let profiles = BUILTIN_PROFILES
            .iter()
            .map(|(name, config)| (name.to_string(), config.clone()))
            .collect();
        Self { profiles }
    }

    /// Replace or add profiles, then check the result is usable.
    ///
    /// Profile names are case-insensitive and stored lowercased, matching
    /// how the configuration loader folds map keys.
    pub fn with_overrides(mut self, overrides: HashMap<String, RateLimitConfig>) -> Result<Self> {
        self.profiles.extend(
            overrides
                .into_iter()
                .map(|(name, config)| (name.to_ascii_lowercase(), config)),
        );
        self.validate()?;
        Ok(self)
    }

    /// Look up a profile by name, ignoring case.
    pub fn get(&self, name: &str) -> Option<&RateLimitConfig> {
        self.profiles.get(&name.to_ascii_lowercase())
    }

    /// Iterate profiles in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RateLimitConfig)> {
        self.profiles.iter().map(|(name, config)| (name.as_str(), config))
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Check every profile and reject key prefixes shared between profiles,
    /// which would silently merge their counters.
    pub fn validate(&self) -> Result<()> {
        let mut prefixes = HashSet::new();
        for (name, config) in &self.profiles {
            config.validate(name)?;
            if !prefixes.insert(config.key_prefix.as_ref()) {
                return Err(RatekeeperError::Config(format!(
                    "profile '{}': key_prefix '{}' is already used by another profile",
                    name, config.key_prefix
                )));
            }
        }
        Ok(())
    }
}
