//! LookupCache behavior that must hold without touching the network

use hoptrace::LookupCache;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

#[tokio::test]
async fn seeded_asn_answers_from_cache() {
    let cache = LookupCache::new();
    let ip = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));
    cache.insert_asn(ip, 15169);

    assert_eq!(cache.lookup_asn(ip).await, 15169);
    // repeated lookups return the identical result
    assert_eq!(cache.lookup_asn(ip).await, 15169);
    assert_eq!(cache.asn_len(), 1);
}

#[tokio::test]
async fn negative_asn_results_are_cached_too() {
    let cache = LookupCache::new();
    let ip = IpAddr::V6(Ipv6Addr::LOCALHOST);
    cache.insert_asn(ip, -1);

    assert_eq!(cache.lookup_asn(ip).await, -1);
    assert_eq!(cache.asn_len(), 1);
}

#[tokio::test]
async fn seeded_hostname_answers_from_cache() {
    let cache = LookupCache::new();
    let ip = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));
    cache.insert_host(ip, "one.one.one.one".to_string());

    assert_eq!(cache.lookup_host(ip).await, "one.one.one.one");
    assert_eq!(cache.host_len(), 1);

    // empty hostnames are legitimate cached values
    let unnamed = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 99));
    cache.insert_host(unnamed, String::new());
    assert_eq!(cache.lookup_host(unnamed).await, "");
    assert_eq!(cache.host_len(), 2);
}

#[tokio::test]
async fn concurrent_readers_see_consistent_values() {
    let cache = Arc::new(LookupCache::new());
    let ip = IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9));
    cache.insert_asn(ip, 19281);
    cache.insert_host(ip, "dns9.quad9.net".to_string());

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        tasks.push(tokio::spawn(async move {
            (cache.lookup_asn(ip).await, cache.lookup_host(ip).await)
        }));
    }
    for task in tasks {
        let (asn, host) = task.await.unwrap();
        assert_eq!(asn, 19281);
        assert_eq!(host, "dns9.quad9.net");
    }
}

#[tokio::test]
async fn sub_maps_are_independent() {
    let cache = LookupCache::new();
    cache.insert_asn(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 15169);
    assert_eq!(cache.asn_len(), 1);
    assert_eq!(cache.host_len(), 0);
}
