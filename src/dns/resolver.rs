use super::AddressResolver;
use crate::error::{Error, Result};
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Recursive resolution through hickory. Answers are never cached so every
/// propagation check sees what the upstream servers currently return.
pub struct HickoryResolver {
    inner: TokioAsyncResolver,
}

impl HickoryResolver {
    /// Uses `nameservers` when given, public Cloudflare resolvers otherwise.
    pub fn new(nameservers: &[IpAddr]) -> Self {
        let config = if nameservers.is_empty() {
            ResolverConfig::cloudflare()
        } else {
            ResolverConfig::from_parts(
                None,
                Vec::new(),
                NameServerConfigGroup::from_ips_clear(nameservers, 53, true),
            )
        };

        let mut opts = ResolverOpts::default();
        opts.positive_max_ttl = Some(Duration::ZERO);
        opts.negative_max_ttl = Some(Duration::ZERO);
        opts.timeout = Duration::from_secs(5);
        opts.attempts = 1;

        Self {
            inner: TokioAsyncResolver::tokio(config, opts),
        }
    }
}

#[async_trait]
impl AddressResolver for HickoryResolver {
    async fn resolve_ipv4(&self, domain: &str) -> Result<Vec<Ipv4Addr>> {
        match self.inner.lookup_ip(domain).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .filter_map(|ip| match ip {
                    IpAddr::V4(v4) => Some(v4),
                    IpAddr::V6(_) => None,
                })
                .collect()),
            Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => Ok(Vec::new()),
            Err(e) => Err(Error::Resolve {
                domain: domain.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}
