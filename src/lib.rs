//! hoptrace - raw-ICMP network path discovery
//!
//! This library discovers the sequence of routers between the local host
//! and one or more destinations, measures per-hop round-trip times, and
//! optionally annotates each router with its reverse-DNS name and the
//! autonomous system announcing it.
//!
//! # Trace modes
//!
//! - [`run_trace`]: one probe per TTL, one at a time; stops at the
//!   destination or after three consecutive unanswered TTLs.
//! - [`run_multi_trace`]: several probes per TTL, aggregable into per-hop
//!   statistics with [`aggregate_multi`].
//! - [`run_ptrace`] / [`run_mptrace`]: every probe for every TTL (and
//!   every host) dispatched at once over shared raw sockets, with replies
//!   demultiplexed back to their probe by ICMP identifier and sequence.
//!
//! # Quick start
//!
//! ```no_run
//! use hoptrace::{run_trace, LookupCache, TraceOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cache = LookupCache::new();
//!     let opts = TraceOptions::default();
//!
//!     let hops = run_trace("one.one.one.one", &opts, Some(&cache), None).await?;
//!     for (i, hop) in hops.iter().enumerate() {
//!         match hop.addr {
//!             Some(addr) => println!("{:2}. {} ({}) AS{} {:?}", i + 1, addr, hop.host, hop.asn, hop.rtt),
//!             None => println!("{:2}. *", i + 1),
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Raw ICMP sockets require elevated privilege (root or `CAP_NET_RAW`) on
//! most systems; the OS error is surfaced unmodified when opening fails.

mod options;
mod packet;
mod socket;
mod trace;

pub mod lookup;

pub use lookup::LookupCache;
pub use options::{TraceOptions, TraceOptionsBuilder};
pub use trace::aggregate::{aggregate_multi, MHop};
pub use trace::error::{ProbeError, TraceError};
pub use trace::parallel::{run_mptrace, run_ptrace};
pub use trace::sequential::{run_multi_trace, run_trace};
pub use trace::{Hop, HopCallback, MAX_TIMEOUTS, PROTOCOL_ICMP, PROTOCOL_ICMPV6};
