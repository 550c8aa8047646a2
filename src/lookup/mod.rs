//! Reverse-DNS and AS lookup caching
//!
//! A [`LookupCache`] outlives individual traces and is supplied by the
//! caller; the engines consult it once per observed router address.

mod cymru;

use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Memoized reverse-DNS and origin-AS lookups.
///
/// Both sub-maps are read-mostly: lookups take the read lock, and only a
/// miss upgrades to a write after the network round trip completes. Racing
/// callers may duplicate a lookup for the same address; the last insert
/// wins and the results are identical. Failures are cached too (-1 for AS,
/// the empty string for hostnames) so unresolvable routers cost one query,
/// not one per probe.
pub struct LookupCache {
    asn: RwLock<HashMap<IpAddr, i64>>,
    hosts: RwLock<HashMap<IpAddr, String>>,
    resolver: Arc<TokioResolver>,
}

impl LookupCache {
    /// Create an empty cache with its own resolver.
    pub fn new() -> Self {
        let resolver = TokioResolver::builder_with_config(
            ResolverConfig::cloudflare(),
            TokioConnectionProvider::default(),
        )
        .build();
        Self::with_resolver(Arc::new(resolver))
    }

    /// Create an empty cache that shares an existing resolver.
    pub fn with_resolver(resolver: Arc<TokioResolver>) -> Self {
        Self {
            asn: RwLock::new(HashMap::new()),
            hosts: RwLock::new(HashMap::new()),
            resolver,
        }
    }

    /// AS number announcing `ip`, or -1 if unknown.
    pub async fn lookup_asn(&self, ip: IpAddr) -> i64 {
        if let Some(asn) = self.asn.read().expect("lock poisoned").get(&ip) {
            return *asn;
        }
        let asn = cymru::lookup_origin_as(&self.resolver, ip).await;
        debug!(%ip, asn, "origin AS resolved");
        self.asn.write().expect("lock poisoned").insert(ip, asn);
        asn
    }

    /// Reverse-DNS name of `ip`, or the empty string if unknown.
    pub async fn lookup_host(&self, ip: IpAddr) -> String {
        if let Some(host) = self.hosts.read().expect("lock poisoned").get(&ip) {
            return host.clone();
        }
        let host = match self.resolver.reverse_lookup(ip).await {
            Ok(ptr) => ptr
                .iter()
                .next()
                .map(|name| {
                    let name = name.to_string();
                    name.strip_suffix('.').unwrap_or(&name).to_string()
                })
                .unwrap_or_default(),
            Err(_) => String::new(),
        };
        self.hosts
            .write()
            .expect("lock poisoned")
            .insert(ip, host.clone());
        host
    }

    /// Seed an AS mapping, e.g. from a previous run.
    pub fn insert_asn(&self, ip: IpAddr, asn: i64) {
        self.asn.write().expect("lock poisoned").insert(ip, asn);
    }

    /// Seed a hostname mapping.
    pub fn insert_host(&self, ip: IpAddr, host: String) {
        self.hosts.write().expect("lock poisoned").insert(ip, host);
    }

    /// Number of cached AS entries.
    pub fn asn_len(&self) -> usize {
        self.asn.read().expect("lock poisoned").len()
    }

    /// Number of cached hostname entries.
    pub fn host_len(&self) -> usize {
        self.hosts.read().expect("lock poisoned").len()
    }
}

impl Default for LookupCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LookupCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupCache")
            .field("asn_entries", &self.asn_len())
            .field("host_entries", &self.host_len())
            .finish()
    }
}
