use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("API_KEY must be set")]
    MissingApiKey,
    #[error("HMAC_SECRET must be set")]
    MissingHmacSecret,
    #[error("invalid ALLOW_IP entry {0:?}: expected an IP address or CIDR range")]
    InvalidAllowEntry(String),
}

// ── Allow-list ───────────────────────────────────────────────────────────────

/// Set of source addresses permitted to talk to the service.
///
/// An empty list disables the check entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    nets: Vec<IpNet>,
}

impl AllowList {
    /// Parses a comma- or whitespace-separated list of addresses and CIDR
    /// ranges. Bare addresses become single-host networks.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let mut nets = Vec::new();
        for entry in raw
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
        {
            let net = match entry.parse::<IpNet>() {
                Ok(net) => net,
                Err(_) => entry
                    .parse::<IpAddr>()
                    .map(|ip| IpNet::from(ip.to_canonical()))
                    .map_err(|_| ConfigError::InvalidAllowEntry(entry.to_owned()))?,
            };
            nets.push(net);
        }
        Ok(Self { nets })
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    pub fn entries(&self) -> &[IpNet] {
        &self.nets
    }

    /// Exact match or CIDR containment. IPv4-mapped IPv6 addresses are
    /// compared as their IPv4 form.
    pub fn permits(&self, ip: IpAddr) -> bool {
        if self.nets.is_empty() {
            return true;
        }
        let ip = ip.to_canonical();
        self.nets.iter().any(|net| net.contains(&ip))
    }
}

impl fmt::Display for AllowList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nets.is_empty() {
            return f.write_str("*");
        }
        let list: Vec<String> = self.nets.iter().map(ToString::to_string).collect();
        f.write_str(&list.join(","))
    }
}

// ── Credentials ──────────────────────────────────────────────────────────────

/// Shared API key, HMAC secret and allow-list, loaded once at startup.
///
/// Secret material is wiped on drop and never printed by `Debug`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    api_key: String,
    hmac_secret: Option<Vec<u8>>,
    #[zeroize(skip)]
    allow_list: AllowList,
}

impl Credentials {
    /// Builds credentials without validation. A `None` secret disables
    /// signature checking.
    pub fn new(api_key: impl Into<String>, hmac_secret: Option<Vec<u8>>, allow_list: AllowList) -> Self {
        Self {
            api_key: api_key.into(),
            hmac_secret,
            allow_list,
        }
    }

    /// Builds credentials from raw configuration values, requiring both the
    /// API key and the HMAC secret to be non-empty.
    pub fn from_config(api_key: &str, hmac_secret: &str, allow_ip: &str) -> Result<Self, ConfigError> {
        if api_key.is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        if hmac_secret.is_empty() {
            return Err(ConfigError::MissingHmacSecret);
        }
        let allow_list = AllowList::parse(allow_ip)?;
        Ok(Self::new(api_key, Some(hmac_secret.as_bytes().to_vec()), allow_list))
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn hmac_secret(&self) -> Option<&[u8]> {
        self.hmac_secret.as_deref()
    }

    pub fn allow_list(&self) -> &AllowList {
        &self.allow_list
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("hmac_secret", &self.hmac_secret.as_ref().map(|_| "<redacted>"))
            .field("allow_list", &self.allow_list)
            .finish()
    }
}
