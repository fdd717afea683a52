//! DNS Reconciler
//!
//! Publish and remove the address record for the CI domain and wait until
//! resolvers hand out the expected address.

mod hetzner;
mod resolver;

pub use hetzner::HetznerDns;
pub use resolver::HickoryResolver;

use crate::error::{Error, Result};
use crate::readiness::{CondCheckError, PollPolicy, await_condition};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const RECORD_TYPE_A: &str = "A";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DnsRecord {
    pub id: String,
    pub zone_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub value: String,
    #[serde(default)]
    pub ttl: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewRecord {
    pub zone_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub value: String,
    pub ttl: u32,
}

/// Raw zone/record API of the DNS provider.
#[async_trait]
pub trait DnsApi: Send + Sync {
    async fn zones(&self, name: &str) -> Result<Vec<Zone>>;

    async fn records(&self, zone_id: &str) -> Result<Vec<DnsRecord>>;

    async fn create_record(&self, record: &NewRecord) -> Result<DnsRecord>;

    async fn delete_record(&self, record_id: &str) -> Result<()>;
}

/// Looks up the IPv4 addresses a name currently resolves to. A name with no
/// records yields an empty list, not an error.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve_ipv4(&self, domain: &str) -> Result<Vec<Ipv4Addr>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecordTarget {
    pub domain: String,
    pub desired_ip: Ipv4Addr,
    pub zone_id: String,
}

impl DnsRecordTarget {
    pub fn record_name(&self) -> &str {
        record_name(&self.domain)
    }
}

/// The leftmost label of `domain`.
pub fn record_name(domain: &str) -> &str {
    domain.split('.').next().unwrap_or(domain)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted(usize),
    NotFound,
}

#[derive(Clone)]
pub struct DnsReconciler {
    api: Arc<dyn DnsApi>,
    resolver: Arc<dyn AddressResolver>,
}

impl DnsReconciler {
    pub fn new(api: Arc<dyn DnsApi>, resolver: Arc<dyn AddressResolver>) -> Self {
        Self { api, resolver }
    }

    pub async fn resolve_zone_id(&self, zone_name: &str) -> Result<String> {
        let zones = self.api.zones(zone_name).await?;
        let zone = zones
            .into_iter()
            .find(|z| z.name.trim_end_matches('.') == zone_name.trim_end_matches('.'))
            .ok_or_else(|| Error::ZoneNotFound(zone_name.to_string()))?;
        debug!(zone = zone_name, zone_id = %zone.id, "zone resolved");
        Ok(zone.id)
    }

    /// Always creates a new record; an existing one for the same name stays.
    pub async fn publish(
        &self,
        domain: &str,
        ip: Ipv4Addr,
        zone_id: &str,
        ttl: u32,
    ) -> Result<DnsRecordTarget> {
        let target = DnsRecordTarget {
            domain: domain.to_string(),
            desired_ip: ip,
            zone_id: zone_id.to_string(),
        };
        let record = NewRecord {
            zone_id: zone_id.to_string(),
            name: target.record_name().to_string(),
            record_type: RECORD_TYPE_A.to_string(),
            value: ip.to_string(),
            ttl,
        };

        let created = self.api.create_record(&record).await?;
        info!(domain, %ip, record_id = %created.id, "address record published");
        Ok(target)
    }

    /// Remove every address record for `domain`'s name in the zone.
    pub async fn delete(&self, domain: &str, zone_id: &str) -> Result<DeleteOutcome> {
        let name = record_name(domain);
        let matching: Vec<DnsRecord> = self
            .api
            .records(zone_id)
            .await?
            .into_iter()
            .filter(|r| r.name == name && r.record_type == RECORD_TYPE_A)
            .collect();

        let mut deleted = 0;
        for record in &matching {
            match self.api.delete_record(&record.id).await {
                Ok(()) => deleted += 1,
                Err(e) if e.is_not_found() => {
                    warn!(record_id = %record.id, "record already gone");
                }
                Err(e) => return Err(e),
            }
        }

        if deleted == 0 {
            debug!(domain, "no address record to delete");
            return Ok(DeleteOutcome::NotFound);
        }
        info!(domain, deleted, "address record deleted");
        Ok(DeleteOutcome::Deleted(deleted))
    }

    /// Succeeds as soon as any resolved address equals `expected`.
    pub async fn await_propagation(
        &self,
        domain: &str,
        expected: Ipv4Addr,
        policy: PollPolicy,
    ) -> Result<()> {
        let resolver = &self.resolver;
        await_condition(
            &format!("{} to resolve to {}", domain, expected),
            policy,
            move || async move {
                let addresses = resolver.resolve_ipv4(domain).await?;
                if addresses.contains(&expected) {
                    Ok(())
                } else {
                    debug!(domain, ?addresses, "not propagated yet");
                    Err(CondCheckError::NotYet)
                }
            },
        )
        .await?;
        info!(domain, %expected, "DNS propagated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Zone API and resolver sharing one record table. Records become
    /// visible to the resolver `delay` lookups after they were published.
    #[derive(Default)]
    struct FakeDns {
        records: Mutex<Vec<DnsRecord>>,
        lookups: Mutex<HashMap<String, u32>>,
        delay: u32,
    }

    #[async_trait]
    impl DnsApi for FakeDns {
        async fn zones(&self, name: &str) -> Result<Vec<Zone>> {
            Ok(vec![Zone {
                id: "z1".to_string(),
                name: "example.com".to_string(),
            }]
            .into_iter()
            .filter(|z| z.name == name)
            .collect())
        }

        async fn records(&self, zone_id: &str) -> Result<Vec<DnsRecord>> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.zone_id == zone_id)
                .cloned()
                .collect())
        }

        async fn create_record(&self, record: &NewRecord) -> Result<DnsRecord> {
            let mut records = self.records.lock().unwrap();
            let created = DnsRecord {
                id: format!("r{}", records.len() + 1),
                zone_id: record.zone_id.clone(),
                name: record.name.clone(),
                record_type: record.record_type.clone(),
                value: record.value.clone(),
                ttl: Some(record.ttl),
            };
            records.push(created.clone());
            Ok(created)
        }

        async fn delete_record(&self, record_id: &str) -> Result<()> {
            let mut records = self.records.lock().unwrap();
            let before = records.len();
            records.retain(|r| r.id != record_id);
            if records.len() == before {
                return Err(Error::Dns {
                    code: 404,
                    body: "record not found".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl AddressResolver for FakeDns {
        async fn resolve_ipv4(&self, domain: &str) -> Result<Vec<Ipv4Addr>> {
            let mut lookups = self.lookups.lock().unwrap();
            let seen = lookups.entry(domain.to_string()).or_insert(0);
            *seen += 1;
            if *seen <= self.delay {
                return Ok(Vec::new());
            }
            let name = record_name(domain);
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.name == name)
                .filter_map(|r| r.value.parse().ok())
                .collect())
        }
    }

    fn reconciler(delay: u32) -> (DnsReconciler, Arc<FakeDns>) {
        let fake = Arc::new(FakeDns {
            delay,
            ..Default::default()
        });
        (DnsReconciler::new(fake.clone(), fake.clone()), fake)
    }

    #[test]
    fn test_record_name_is_leftmost_label() {
        assert_eq!(record_name("ci.example.com"), "ci");
        assert_eq!(record_name("localhost"), "localhost");
    }

    #[tokio::test]
    async fn test_unknown_zone() {
        let (dns, _) = reconciler(0);
        assert_eq!(dns.resolve_zone_id("example.com").await.unwrap(), "z1");
        let err = dns.resolve_zone_id("example.org").await.unwrap_err();
        assert!(matches!(err, Error::ZoneNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_then_propagate() {
        let (dns, fake) = reconciler(2);
        let ip = Ipv4Addr::new(203, 0, 113, 5);
        let target = dns.publish("ci.example.com", ip, "z1", 3600).await.unwrap();
        assert_eq!(target.record_name(), "ci");

        dns.await_propagation("ci.example.com", ip, PollPolicy::from_secs(60, 15))
            .await
            .unwrap();
        assert_eq!(fake.lookups.lock().unwrap()["ci.example.com"], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpublished_ip_times_out() {
        let (dns, _) = reconciler(0);
        dns.publish("ci.example.com", Ipv4Addr::new(203, 0, 113, 5), "z1", 3600)
            .await
            .unwrap();

        let start = Instant::now();
        let policy = PollPolicy::from_secs(60, 15);
        let err = dns
            .await_propagation("ci.example.com", Ipv4Addr::new(198, 51, 100, 1), policy)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TimedOut { .. }));
        assert!(start.elapsed() <= policy.timeout + policy.interval);
    }

    #[tokio::test]
    async fn test_publish_twice_creates_two_records() {
        let (dns, fake) = reconciler(0);
        let ip = Ipv4Addr::new(203, 0, 113, 5);
        dns.publish("ci.example.com", ip, "z1", 3600).await.unwrap();
        dns.publish("ci.example.com", ip, "z1", 3600).await.unwrap();
        assert_eq!(fake.records.lock().unwrap().len(), 2);

        assert_eq!(
            dns.delete("ci.example.com", "z1").await.unwrap(),
            DeleteOutcome::Deleted(2)
        );
        assert_eq!(
            dns.delete("ci.example.com", "z1").await.unwrap(),
            DeleteOutcome::NotFound
        );
    }
}
