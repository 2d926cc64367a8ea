//! Identifier derivation: who is this request counted against.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Identifier used when a request carries no usable address at all.
pub const UNKNOWN_IDENTIFIER: &str = "ip:unknown";

/// IPv6 prefix segments kept when normalizing (a /64).
const IPV6_PREFIX_SEGMENTS: usize = 4;

/// Read access to the parts of an inbound request the limiter looks at.
pub trait RequestContext {
    /// Address of the connected peer, if the transport knows it.
    fn client_address(&self) -> Option<&str>;

    /// A request header by name. Names are case-insensitive.
    fn header(&self, name: &str) -> Option<&str>;

    /// A request cookie by name.
    fn cookie(&self, name: &str) -> Option<&str>;

    /// The authenticated user id, when the handler has already resolved one.
    fn user_id(&self) -> Option<&str> {
        None
    }
}

/// How identifiers are derived from requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPolicy {
    /// Cookie holding the session id for per-user limits
    #[serde(default = "default_session_cookie")]
    pub session_cookie: String,

    /// Collapse IPv6 addresses to their /64 so one allocation is one bucket
    #[serde(default)]
    pub normalize_ipv6: bool,
}

impl Default for IdentityPolicy {
    fn default() -> Self {
        Self {
            session_cookie: default_session_cookie(),
            normalize_ipv6: false,
        }
    }
}

fn default_session_cookie() -> String {
    "session_id".to_string()
}

/// The key a requester's counter is partitioned by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier(String);

impl Identifier {
    /// An address-based identifier (`ip:<address>`).
    pub fn ip(address: impl fmt::Display) -> Self {
        Self(format!("ip:{}", address))
    }

    /// A session or user based identifier (`user:<id>`).
    pub fn user(id: impl fmt::Display) -> Self {
        Self(format!("user:{}", id))
    }

    /// The catch-all bucket for requests without an address.
    pub fn unknown() -> Self {
        Self(UNKNOWN_IDENTIFIER.to_string())
    }

    /// Derive the identifier for a request.
    ///
    /// With `use_user_id`, the authenticated user id wins, then the session
    /// cookie; without either the request falls back to its address.
    pub fn resolve<C>(ctx: &C, use_user_id: bool, policy: &IdentityPolicy) -> Self
    where
        C: RequestContext + ?Sized,
    {
        if use_user_id {
            let session = ctx
                .user_id()
                .or_else(|| ctx.cookie(&policy.session_cookie))
                .map(str::trim)
                .filter(|id| !id.is_empty());
            if let Some(id) = session {
                return Self::user(id);
            }
        }

        match client_ip(ctx) {
            Some(ip) => Self::ip(normalize_ip(ip, policy.normalize_ipv6)),
            None => Self::unknown(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Pick the client address: connection address, then the first
/// `X-Forwarded-For` hop, then `X-Real-IP`. Values that do not parse as an
/// address are skipped.
pub fn client_ip<C>(ctx: &C) -> Option<IpAddr>
where
    C: RequestContext + ?Sized,
{
    if let Some(ip) = ctx.client_address().and_then(parse_addr) {
        return Some(ip);
    }

    if let Some(forwarded) = ctx.header("x-forwarded-for") {
        if let Some(ip) = forwarded.split(',').next().and_then(parse_addr) {
            return Some(ip);
        }
    }

    ctx.header("x-real-ip").and_then(parse_addr)
}

/// Parse a bare IP or an `ip:port` socket address.
fn parse_addr(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    raw.parse::<IpAddr>()
        .ok()
        .or_else(|| raw.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
}

/// Render an address for use in an identifier.
///
/// IPv4 addresses are kept as-is. With `collapse_ipv6`, IPv6 addresses are
/// reduced to their /64 prefix so rotating through one allocation does not
/// reset the limit.
pub fn normalize_ip(ip: IpAddr, collapse_ipv6: bool) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return v4.to_string();
            }
            if !collapse_ipv6 {
                return v6.to_string();
            }
            let seg = v6.segments();
            let prefix: Vec<String> = seg[..IPV6_PREFIX_SEGMENTS]
                .iter()
                .map(|s| format!("{:x}", s))
                .collect();
            format!("{}::/64", prefix.join(":"))
        }
    }
}

/// A plain request description, for callers that do not have their own
/// request type to implement [`RequestContext`] on.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    remote_address: Option<String>,
    headers: HashMap<String, String>,
    cookies: HashMap<String, String>,
    user_id: Option<String>,
}

impl RequestInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_remote_address(mut self, address: impl Into<String>) -> Self {
        self.remote_address = Some(address.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn with_user_id(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }
}

impl RequestContext for RequestInfo {
    fn client_address(&self) -> Option<&str> {
        self.remote_address.as_deref().filter(|a| !a.is_empty())
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref().filter(|id| !id.is_empty())
    }
}
