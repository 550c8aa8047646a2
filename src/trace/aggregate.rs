//! Aggregation of multi-round results into per-hop statistics

use super::Hop;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

/// Statistics for one router observed at one TTL across several rounds.
///
/// Rounds where no router replied group under the empty-address bucket
/// (`addr = None`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MHop {
    /// Observed router address, `None` for the no-reply bucket
    pub addr: Option<IpAddr>,
    /// Reverse-DNS name of `addr`, empty if unknown
    pub host: String,
    /// AS number announcing `addr`, -1 if unknown
    pub asn: i64,
    /// Smallest RTT among valid observations
    pub min_rtt: Duration,
    /// Mean RTT over valid observations, zero if there are none
    pub avg_rtt: Duration,
    /// Largest RTT among valid observations
    pub max_rtt: Duration,
    /// Rounds grouped into this bucket
    pub total: usize,
    /// Rounds classified as timeout or probe error
    pub lost: usize,
    /// Rounds answered with Destination Unreachable
    pub down: usize,
    /// Any contributing probe reached the destination
    pub is_final: bool,
}

/// Reduce the rows of a multi-round trace into per-hop statistics.
///
/// Each input row holds the probes for one TTL; the output row holds one
/// [`MHop`] per distinct observed address, in unspecified order.
/// `avg_rtt` is `sum(rtt) / (total - lost - down)` when that denominator
/// is positive; down and lost rounds contribute no RTT.
pub fn aggregate_multi(rows: &[Vec<Hop>]) -> Vec<Vec<MHop>> {
    rows.iter().map(|row| aggregate_row(row)).collect()
}

fn aggregate_row(row: &[Hop]) -> Vec<MHop> {
    let mut buckets: HashMap<String, (MHop, Duration)> = HashMap::new();

    for hop in row {
        let key = hop.addr.map(|a| a.to_string()).unwrap_or_default();
        let (mhop, rtt_sum) = buckets.entry(key).or_insert_with(|| {
            (
                MHop {
                    addr: hop.addr,
                    host: hop.host.clone(),
                    asn: hop.asn,
                    min_rtt: Duration::ZERO,
                    avg_rtt: Duration::ZERO,
                    max_rtt: Duration::ZERO,
                    total: 0,
                    lost: 0,
                    down: 0,
                    is_final: false,
                },
                Duration::ZERO,
            )
        });

        mhop.total += 1;
        if hop.is_down {
            mhop.down += 1;
        } else if hop.is_timeout || hop.error.is_some() {
            mhop.lost += 1;
        } else {
            *rtt_sum += hop.rtt;
            if mhop.max_rtt < hop.rtt {
                mhop.max_rtt = hop.rtt;
            }
            if mhop.min_rtt.is_zero() || mhop.min_rtt > hop.rtt {
                mhop.min_rtt = hop.rtt;
            }
        }
        mhop.is_final |= hop.is_final;
    }

    buckets
        .into_values()
        .map(|(mut mhop, rtt_sum)| {
            let valid = mhop.total - mhop.lost - mhop.down;
            if valid > 0 {
                mhop.avg_rtt = rtt_sum / valid as u32;
            }
            mhop
        })
        .collect()
}
