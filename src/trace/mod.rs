//! Probe engines and their result types

pub(crate) mod aggregate;
pub(crate) mod error;
pub(crate) mod parallel;
pub(crate) mod sequential;

use crate::lookup::LookupCache;
use error::{ProbeError, TraceError};
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// IPv4 ICMP protocol number.
pub const PROTOCOL_ICMP: u8 = 1;
/// IPv6 ICMPv6 protocol number.
pub const PROTOCOL_ICMPV6: u8 = 58;
/// Consecutive unanswered TTLs before a sequential trace is abandoned.
pub const MAX_TIMEOUTS: usize = 3;

/// Observer invoked once per completed probe: `(hop, ttl, round)`, both
/// counters 1-based. Called by the sequential and multi-round engines in
/// probe order; the parallel engines never invoke it.
pub type HopCallback = dyn Fn(&Hop, u8, usize) + Send + Sync;

/// A single probe observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    /// Source address of the reply, `None` if no reply was observed
    pub addr: Option<IpAddr>,
    /// Reverse-DNS name of `addr`, empty if unknown
    pub host: String,
    /// AS number announcing `addr`, -1 if unknown
    pub asn: i64,
    /// Time between send and reply receipt; meaningless when `is_timeout`
    pub rtt: Duration,
    /// The reply was an Echo Reply: the destination was reached
    pub is_final: bool,
    /// The read deadline elapsed before any correlated reply arrived
    pub is_timeout: bool,
    /// A Destination Unreachable was received for this probe
    pub is_down: bool,
    /// I/O or encoding failure captured at probe time
    pub error: Option<ProbeError>,
}

impl Default for Hop {
    /// The unfilled result slot: counts as a lost probe until a reply
    /// upgrades it.
    fn default() -> Self {
        Self {
            addr: None,
            host: String::new(),
            asn: -1,
            rtt: Duration::ZERO,
            is_final: false,
            is_timeout: true,
            is_down: false,
            error: None,
        }
    }
}

impl Hop {
    /// A correlated reply from `addr` after `rtt`.
    pub(crate) fn replied(addr: IpAddr, rtt: Duration) -> Self {
        Self {
            addr: Some(addr),
            rtt,
            is_timeout: false,
            ..Self::default()
        }
    }

    /// A probe whose deadline elapsed.
    pub(crate) fn timed_out() -> Self {
        Self::default()
    }

    /// A probe that failed before any reply could be observed.
    pub(crate) fn probe_error(error: ProbeError) -> Self {
        Self {
            is_timeout: false,
            error: Some(error),
            ..Self::default()
        }
    }
}

/// Resolver used for destination lookups when none is supplied.
pub(crate) fn default_resolver() -> TokioResolver {
    TokioResolver::builder_with_config(
        ResolverConfig::cloudflare(),
        TokioConnectionProvider::default(),
    )
    .build()
}

/// Resolve a trace target, preferring IPv4 and falling back to IPv6.
pub(crate) async fn resolve_dest(resolver: &TokioResolver, host: &str) -> Result<IpAddr, TraceError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    if let Ok(lookup) = resolver.ipv4_lookup(host).await {
        if let Some(a) = lookup.iter().next() {
            return Ok(IpAddr::V4(a.0));
        }
    }

    if let Ok(lookup) = resolver.ipv6_lookup(host).await {
        if let Some(aaaa) = lookup.iter().next() {
            return Ok(IpAddr::V6(aaaa.0));
        }
    }

    Err(TraceError::Resolution(host.to_string()))
}

/// Fill `host` and `asn` from the cache for hops that carry an address.
pub(crate) async fn enrich(hop: &mut Hop, cache: Option<&LookupCache>) {
    let (Some(addr), Some(cache)) = (hop.addr, cache) else {
        return;
    };
    hop.host = cache.lookup_host(addr).await;
    hop.asn = cache.lookup_asn(addr).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn default_hop_is_a_lost_slot() {
        let hop = Hop::default();
        assert!(hop.is_timeout);
        assert!(!hop.is_final);
        assert!(!hop.is_down);
        assert_eq!(hop.asn, -1);
        assert!(hop.addr.is_none());
    }

    #[test]
    fn at_most_one_outcome_flag() {
        let replied = Hop::replied(IpAddr::V4(Ipv4Addr::LOCALHOST), Duration::from_millis(5));
        let timed_out = Hop::timed_out();
        let errored = Hop::probe_error(ProbeError::Send("nope".to_string()));
        for hop in [&replied, &timed_out, &errored] {
            let flags = [hop.is_final, hop.is_timeout, hop.is_down];
            assert!(flags.iter().filter(|f| **f).count() <= 1);
        }
        assert!(replied.rtt > Duration::ZERO);
        assert!(errored.error.is_some());
    }

    #[tokio::test]
    async fn literal_addresses_resolve_without_dns() {
        let resolver = default_resolver();
        let v4 = resolve_dest(&resolver, "192.0.2.7").await.unwrap();
        assert_eq!(v4, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)));
        let v6 = resolve_dest(&resolver, "2001:db8::1").await.unwrap();
        assert!(v6.is_ipv6());
    }
}
