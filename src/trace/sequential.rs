//! Sequential and multi-round probe engines
//!
//! One probe is in flight at a time. Each TTL step sets the hop limit,
//! writes the prebuilt echo, and reads until a reply correlated by ICMP
//! identifier arrives or the per-probe deadline elapses.

use super::{
    default_resolver, enrich, error::ProbeError, error::TraceError, resolve_dest, Hop,
    HopCallback, MAX_TIMEOUTS,
};
use crate::lookup::LookupCache;
use crate::packet::{build_echo_v4, build_echo_v6, parse_reply_v4, parse_reply_v6, IcmpResponse};
use crate::socket::{open_transport, ProbeTransport, MAX_PACKET};
use crate::TraceOptions;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// State shared by every step of one trace call: the open transport, the
/// destination, the per-trace identifier and the prebuilt echo message.
pub(crate) struct TraceContext {
    pub(crate) transport: Box<dyn ProbeTransport>,
    pub(crate) dest: IpAddr,
    pub(crate) id: u16,
    pub(crate) echo: Vec<u8>,
    pub(crate) max_rtt: Duration,
}

impl TraceContext {
    pub(crate) fn new(
        transport: Box<dyn ProbeTransport>,
        dest: IpAddr,
        max_rtt: Duration,
    ) -> Result<Self, TraceError> {
        // 15-bit identifier, chosen once per trace
        let id = rand::random::<u16>() % 0x8000;
        let echo = if transport.is_ipv6() {
            build_echo_v6(id, 1, &[])?
        } else {
            build_echo_v4(id, 1, &[])?
        };
        Ok(Self {
            transport,
            dest,
            id,
            echo,
            max_rtt,
        })
    }

    /// Send one probe at `ttl` and classify the outcome.
    fn step(&self, ttl: u8) -> Hop {
        let deadline = Instant::now() + self.max_rtt;

        if let Err(err) = self.transport.set_ttl(ttl) {
            return Hop::probe_error(ProbeError::Send(err.to_string()));
        }

        let sent_at = Instant::now();
        if let Err(err) = self.transport.send_to(&self.echo, self.dest) {
            return Hop::probe_error(ProbeError::Send(err.to_string()));
        }

        let mut buf = [0u8; MAX_PACKET];
        loop {
            let (len, from) = match self.transport.recv_deadline(&mut buf, deadline) {
                Ok(Some(read)) => read,
                Ok(None) => return Hop::timed_out(),
                Err(err) => return Hop::probe_error(ProbeError::Read(err.to_string())),
            };

            let parsed = if self.transport.is_ipv6() {
                parse_reply_v6(&buf[..len])
            } else {
                parse_reply_v4(&buf[..len])
            };
            let rtt = sent_at.elapsed();

            match parsed {
                Some(IcmpResponse::EchoReply { id, .. }) if id == self.id => {
                    let mut hop = Hop::replied(from, rtt);
                    hop.is_final = true;
                    return hop;
                }
                Some(IcmpResponse::TimeExceeded { id, .. }) if id == self.id => {
                    return Hop::replied(from, rtt);
                }
                Some(IcmpResponse::Unreachable { id, .. }) if id == self.id => {
                    let mut hop = Hop::replied(from, rtt);
                    hop.is_down = true;
                    return hop;
                }
                // foreign identifier or irrelevant type: keep reading
                Some(_) => continue,
                None => {
                    return Hop::probe_error(ProbeError::Read(
                        "malformed ICMP message".to_string(),
                    ))
                }
            }
        }
    }
}

/// One blocking step on the runtime's blocking pool.
async fn step_blocking(ctx: &Arc<TraceContext>, ttl: u8) -> Hop {
    let ctx = Arc::clone(ctx);
    match tokio::task::spawn_blocking(move || ctx.step(ttl)).await {
        Ok(hop) => hop,
        Err(err) => Hop::probe_error(ProbeError::Read(err.to_string())),
    }
}

/// Trace `host` with one probe per TTL.
///
/// Stops at the first hop that reaches the destination, or after
/// [`MAX_TIMEOUTS`] consecutive unanswered TTLs. Every finished hop is
/// handed to `on_hop` (with round 1) before being appended to the result.
pub async fn run_trace(
    host: &str,
    opts: &TraceOptions,
    cache: Option<&LookupCache>,
    on_hop: Option<&HopCallback>,
) -> Result<Vec<Hop>, TraceError> {
    let resolver = default_resolver();
    let dest = resolve_dest(&resolver, host).await?;
    let transport = open_transport(dest, opts)?;
    let ctx = Arc::new(TraceContext::new(transport, dest, opts.max_rtt)?);
    debug!(%dest, id = ctx.id, max_ttl = opts.max_ttl, "starting sequential trace");
    Ok(sequential_loop(ctx, opts.max_ttl, cache, on_hop).await)
}

async fn sequential_loop(
    ctx: Arc<TraceContext>,
    max_ttl: u8,
    cache: Option<&LookupCache>,
    on_hop: Option<&HopCallback>,
) -> Vec<Hop> {
    let mut hops = Vec::with_capacity(max_ttl as usize);
    let mut timeouts = 0;

    for ttl in 1..=max_ttl {
        let mut hop = step_blocking(&ctx, ttl).await;
        enrich(&mut hop, cache).await;
        if let Some(cb) = on_hop {
            cb(&hop, ttl, 1);
        }

        let reached = hop.is_final;
        let unanswered = hop.is_timeout;
        hops.push(hop);

        if reached {
            break;
        }
        if unanswered {
            timeouts += 1;
        } else {
            timeouts = 0;
        }
        if timeouts == MAX_TIMEOUTS {
            break;
        }
    }

    hops
}

/// Trace `host` with `rounds` probes per TTL, grouped into one row per TTL.
///
/// A row is final if any of its probes reached the destination. The
/// consecutive-timeout counter advances only when every probe in a row
/// timed out.
pub async fn run_multi_trace(
    host: &str,
    opts: &TraceOptions,
    cache: Option<&LookupCache>,
    rounds: usize,
    on_hop: Option<&HopCallback>,
) -> Result<Vec<Vec<Hop>>, TraceError> {
    let resolver = default_resolver();
    let dest = resolve_dest(&resolver, host).await?;
    let transport = open_transport(dest, opts)?;
    let ctx = Arc::new(TraceContext::new(transport, dest, opts.max_rtt)?);
    debug!(%dest, id = ctx.id, rounds, "starting multi-round trace");
    Ok(multi_loop(ctx, opts.max_ttl, rounds, cache, on_hop).await)
}

async fn multi_loop(
    ctx: Arc<TraceContext>,
    max_ttl: u8,
    rounds: usize,
    cache: Option<&LookupCache>,
    on_hop: Option<&HopCallback>,
) -> Vec<Vec<Hop>> {
    let mut rows = Vec::with_capacity(max_ttl as usize);
    let mut timeouts = 0;

    for ttl in 1..=max_ttl {
        let mut row = Vec::with_capacity(rounds);
        let mut reached = false;

        for round in 1..=rounds {
            let mut hop = step_blocking(&ctx, ttl).await;
            enrich(&mut hop, cache).await;
            if let Some(cb) = on_hop {
                cb(&hop, ttl, round);
            }
            reached |= hop.is_final;
            row.push(hop);
        }

        let all_unanswered = !row.is_empty() && row.iter().all(|h| h.is_timeout);
        rows.push(row);

        if reached {
            break;
        }
        if all_unanswered {
            timeouts += 1;
        } else {
            timeouts = 0;
        }
        if timeouts == MAX_TIMEOUTS {
            break;
        }
    }

    rows
}
