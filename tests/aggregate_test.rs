//! Aggregation behavior through the public API

use hoptrace::{aggregate_multi, Hop, MHop};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

fn answered(addr: [u8; 4], ms: u64) -> Hop {
    Hop {
        addr: Some(IpAddr::V4(Ipv4Addr::from(addr))),
        rtt: Duration::from_millis(ms),
        is_timeout: false,
        ..Hop::default()
    }
}

fn bucket<'a>(row: &'a [MHop], addr: Option<IpAddr>) -> &'a MHop {
    row.iter()
        .find(|m| m.addr == addr)
        .expect("expected a bucket for this address")
}

#[test]
fn mixed_round_splits_into_router_and_silent_buckets() {
    let rows = vec![vec![
        answered([1, 1, 1, 1], 10),
        answered([1, 1, 1, 1], 30),
        Hop::default(),
    ]];

    let agg = aggregate_multi(&rows);
    assert_eq!(agg.len(), 1);
    assert_eq!(agg[0].len(), 2);

    let router = bucket(&agg[0], Some(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))));
    assert_eq!(
        (router.total, router.lost, router.down),
        (2, 0, 0)
    );
    assert_eq!(router.min_rtt, Duration::from_millis(10));
    assert_eq!(router.avg_rtt, Duration::from_millis(20));
    assert_eq!(router.max_rtt, Duration::from_millis(30));

    let silent = bucket(&agg[0], None);
    assert_eq!((silent.total, silent.lost), (1, 1));
}

#[test]
fn all_down_rounds_average_to_zero() {
    let down = Hop {
        is_down: true,
        ..answered([2, 2, 2, 2], 7)
    };
    let rows = vec![vec![down.clone(), down.clone(), down]];

    let agg = aggregate_multi(&rows);
    let b = bucket(&agg[0], Some(IpAddr::V4(Ipv4Addr::new(2, 2, 2, 2))));
    assert_eq!((b.total, b.down, b.lost), (3, 3, 0));
    assert_eq!(b.avg_rtt, Duration::ZERO);
}

#[test]
fn path_change_yields_one_bucket_per_router() {
    let rows = vec![vec![
        answered([10, 0, 0, 1], 5),
        answered([10, 0, 0, 2], 6),
        answered([10, 0, 0, 1], 7),
    ]];
    let agg = aggregate_multi(&rows);
    assert_eq!(agg[0].len(), 2);
    let first = bucket(&agg[0], Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
    assert_eq!(first.total, 2);
    assert_eq!(first.avg_rtt, Duration::from_millis(6));
}

#[test]
fn one_output_row_per_input_row() {
    let rows = vec![
        vec![answered([10, 0, 0, 1], 1)],
        vec![Hop::default()],
        vec![answered([10, 0, 0, 3], 3)],
    ];
    let agg = aggregate_multi(&rows);
    assert_eq!(agg.len(), 3);
    for row in &agg {
        assert_eq!(row.len(), 1);
    }
}

#[test]
fn enrichment_identity_is_carried_into_buckets() {
    let mut hop = answered([8, 8, 8, 8], 12);
    hop.host = "dns.google".to_string();
    hop.asn = 15169;
    let agg = aggregate_multi(&[vec![hop]]);
    let b = bucket(&agg[0], Some(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
    assert_eq!(b.host, "dns.google");
    assert_eq!(b.asn, 15169);
}
