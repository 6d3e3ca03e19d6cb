//! Bundled schedule-change policy: trust a fixed set of client addresses.

use std::net::IpAddr;

use anyhow::{Context, Result};

use crate::service::{AccessPolicy, RequestContext};

#[derive(Debug, Clone, Default)]
pub struct AddressAllowList {
    allowed: Vec<IpAddr>,
}

impl AddressAllowList {
    pub fn new(allowed: Vec<IpAddr>) -> Self {
        Self { allowed }
    }

    /// Parse `[server] admin_addresses`. A bad entry is a config error.
    pub fn from_config(entries: &[String]) -> Result<Self> {
        let allowed = entries
            .iter()
            .map(|s| {
                s.trim()
                    .parse::<IpAddr>()
                    .with_context(|| format!("invalid admin address '{}'", s))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(allowed))
    }
}

impl AccessPolicy for AddressAllowList {
    fn authorize(&self, ctx: &RequestContext) -> bool {
        match ctx.client_addr {
            // IPv4 clients on a dual-stack socket show up as ::ffff:a.b.c.d
            Some(addr) => self.allowed.contains(&addr.to_canonical()),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(addr: &str) -> RequestContext {
        RequestContext {
            client_addr: Some(addr.parse().unwrap()),
        }
    }

    #[test]
    fn test_allow_list_matches_exact_addresses() {
        let policy =
            AddressAllowList::from_config(&["127.0.0.1".to_string(), "::1".to_string()]).unwrap();
        assert!(policy.authorize(&ctx("127.0.0.1")));
        assert!(policy.authorize(&ctx("::1")));
        assert!(!policy.authorize(&ctx("192.168.1.20")));
    }

    #[test]
    fn test_mapped_ipv4_is_canonicalized() {
        let policy = AddressAllowList::from_config(&["10.0.0.5".to_string()]).unwrap();
        assert!(policy.authorize(&ctx("::ffff:10.0.0.5")));
    }

    #[test]
    fn test_unknown_peer_is_denied() {
        let policy = AddressAllowList::from_config(&["127.0.0.1".to_string()]).unwrap();
        assert!(!policy.authorize(&RequestContext::default()));
    }

    #[test]
    fn test_bad_entry_rejected() {
        assert!(AddressAllowList::from_config(&["localhost".to_string()]).is_err());
    }
}
