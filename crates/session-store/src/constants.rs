//! Upstream session constants
//!
//! Cookie names issued by the upstream login flow and the fixed client
//! fingerprint the upstream expects on every API call. These identify a
//! browser session shape, not a secret.

/// Cookie that must be present for a session to be usable.
pub const DEFAULT_REQUIRED_COOKIE: &str = "wyzdzjxhdnh";

/// Cookie carrying a JWT whose `exp` claim bounds the session lifetime.
pub const DEFAULT_EXPIRY_COOKIE: &str = "wyandyy";

/// Browser identity sent with every proxied call.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/143.0.0.0 Safari/537.36";

pub const ACCEPT: &str = "application/json, text/plain, */*";

pub const ACCEPT_LANGUAGE: &str = "zh-CN,zh;q=0.9,en;q=0.8";
