//! Parallel burst engines
//!
//! All probes are dispatched without waiting for replies. A sender task
//! walks TTLs outermost, then rounds, then hosts; replies come back on one
//! receiver task per open socket and are demultiplexed into pre-allocated
//! matrices by the `(identifier, sequence)` pair carried in each reply.
//!
//! The sequence field packs the slot index: `seq = hop + max_ttl * round`.
//! In multi-host mode the identifier carries the host index on top of the
//! caller's base identifier.

use super::{
    default_resolver, enrich, error::ProbeError, error::TraceError, resolve_dest, Hop,
};
use crate::lookup::LookupCache;
use crate::packet::{build_echo_v4, build_echo_v6, parse_reply_v4, parse_reply_v6, IcmpResponse};
use crate::socket::{open_transport, ProbeTransport, RawIcmpSocket, MAX_PACKET};
use crate::TraceOptions;
use futures::future::join_all;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// What a correlated reply does to its slot.
#[derive(Debug, Clone, Copy)]
enum ReplyKind {
    /// Time Exceeded: an intermediate router
    Transit,
    /// Echo Reply: the destination
    Final,
    /// Destination Unreachable
    Down,
}

/// Result and send-time matrices for one traced host, shared between the
/// sender and receiver tasks. Indexed `[hop][round]`; the sender writes
/// send times and per-probe errors, receivers upgrade slots their sequence
/// matched, so the tasks never contend on the same field of a slot.
#[derive(Clone)]
pub(crate) struct ProbeMatrix {
    hops: Arc<Mutex<Vec<Vec<Hop>>>>,
    send_on: Arc<Mutex<Vec<Vec<Option<Instant>>>>>,
}

impl ProbeMatrix {
    pub(crate) fn new(max_ttl: usize, rounds: usize) -> Self {
        Self {
            hops: Arc::new(Mutex::new(vec![vec![Hop::default(); rounds]; max_ttl])),
            send_on: Arc::new(Mutex::new(vec![vec![None; rounds]; max_ttl])),
        }
    }

    fn record_send(&self, hop: usize, round: usize) {
        self.send_on.lock().expect("lock poisoned")[hop][round] = Some(Instant::now());
    }

    fn record_error(&self, hop: usize, round: usize, error: ProbeError) {
        self.hops.lock().expect("lock poisoned")[hop][round].error = Some(error);
    }

    fn record_row_error(&self, hop: usize, rounds: usize, error: &ProbeError) {
        let mut rows = self.hops.lock().expect("lock poisoned");
        for round in 0..rounds {
            rows[hop][round].error = Some(error.clone());
        }
    }

    /// Upgrade a slot with a correlated reply. Duplicates overwrite
    /// idempotently.
    fn apply_reply(&self, hop: usize, round: usize, from: IpAddr, kind: ReplyKind) {
        let sent = self.send_on.lock().expect("lock poisoned")[hop][round];
        let rtt = sent.map(|at| at.elapsed()).unwrap_or_default();
        let mut rows = self.hops.lock().expect("lock poisoned");
        let slot = &mut rows[hop][round];
        slot.addr = Some(from);
        slot.rtt = rtt;
        slot.is_timeout = false;
        match kind {
            ReplyKind::Final => slot.is_final = true,
            ReplyKind::Down => slot.is_down = true,
            ReplyKind::Transit => {}
        }
    }

    fn into_rows(self) -> Vec<Vec<Hop>> {
        match Arc::try_unwrap(self.hops) {
            Ok(rows) => rows.into_inner().expect("lock poisoned"),
            Err(shared) => shared.lock().expect("lock poisoned").clone(),
        }
    }
}

/// One traced destination within a burst.
#[derive(Clone)]
pub(crate) struct Target {
    pub(crate) host: String,
    pub(crate) dest: IpAddr,
    /// 16-byte destination address carried as echo payload
    pub(crate) payload: [u8; 16],
    pub(crate) v6: bool,
    pub(crate) matrix: ProbeMatrix,
}

impl Target {
    pub(crate) fn new(host: String, dest: IpAddr, max_ttl: usize, rounds: usize) -> Self {
        let payload = match dest {
            IpAddr::V4(a) => a.to_ipv6_mapped().octets(),
            IpAddr::V6(a) => a.octets(),
        };
        Self {
            host,
            dest,
            payload,
            v6: dest.is_ipv6(),
            matrix: ProbeMatrix::new(max_ttl, rounds),
        }
    }
}

/// Invert `(identifier, sequence)` into `(host, hop, round)`.
///
/// Identifiers outside `[base_id, base_id + host_count)` and sequences
/// past `rounds * max_ttl - 1` belong to other probers and are dropped.
pub(crate) fn slot_for(
    id: u16,
    seq: u16,
    base_id: u16,
    host_count: usize,
    max_ttl: usize,
    rounds: usize,
) -> Option<(usize, usize, usize)> {
    let host = (id as usize).checked_sub(base_id as usize)?;
    if host >= host_count {
        return None;
    }
    let max_seq = (rounds * max_ttl).checked_sub(1)?;
    let seq = seq as usize;
    if seq > max_seq {
        return None;
    }
    Some((host, seq % max_ttl, seq / max_ttl))
}

fn build_echo(v6: bool, id: u16, seq: u16, payload: &[u8]) -> Result<Vec<u8>, ProbeError> {
    if v6 {
        build_echo_v6(id, seq, payload)
    } else {
        build_echo_v4(id, seq, payload)
    }
}

/// Single-host sender: every (ttl, round) probe back to back.
fn burst_sender(
    transport: &dyn ProbeTransport,
    dest: IpAddr,
    id: u16,
    matrix: &ProbeMatrix,
    max_ttl: usize,
    rounds: usize,
    delay: Duration,
) {
    for ttl in 1..=max_ttl {
        let hop = ttl - 1;
        if let Err(err) = transport.set_ttl(ttl as u8) {
            matrix.record_row_error(hop, rounds, &ProbeError::Send(err.to_string()));
            continue;
        }
        for round in 0..rounds {
            let seq = (hop + max_ttl * round) as u16;
            let msg = match build_echo(transport.is_ipv6(), id, seq, &[]) {
                Ok(msg) => msg,
                Err(err) => {
                    matrix.record_error(hop, round, err);
                    continue;
                }
            };
            matrix.record_send(hop, round);
            if let Err(err) = transport.send_to(&msg, dest) {
                matrix.record_error(hop, round, ProbeError::Send(err.to_string()));
            }
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
        }
    }
}

/// Multi-host sender: probes grouped by TTL, then round, then host.
fn multi_sender(
    conn4: Option<Arc<dyn ProbeTransport>>,
    conn6: Option<Arc<dyn ProbeTransport>>,
    targets: &[Target],
    base_id: u16,
    max_ttl: usize,
    rounds: usize,
    delay: Duration,
) {
    for ttl in 1..=max_ttl {
        let hop = ttl - 1;
        if let Some(conn4) = &conn4 {
            if let Err(err) = conn4.set_ttl(ttl as u8) {
                let error = ProbeError::Send(err.to_string());
                for target in targets.iter().filter(|t| !t.v6) {
                    target.matrix.record_row_error(hop, rounds, &error);
                }
                continue;
            }
        }
        if let Some(conn6) = &conn6 {
            if let Err(err) = conn6.set_ttl(ttl as u8) {
                warn!(ttl, %err, "failed to set hop limit");
            }
        }

        for round in 0..rounds {
            for (hostid, target) in targets.iter().enumerate() {
                let id = base_id.wrapping_add(hostid as u16);
                let seq = (hop + max_ttl * round) as u16;
                let msg = match build_echo(target.v6, id, seq, &target.payload) {
                    Ok(msg) => msg,
                    Err(err) => {
                        // a marshal failure lands in every IPv4 host's slot
                        // for this (ttl, round)
                        for t in targets.iter().filter(|t| !t.v6) {
                            t.matrix.record_error(hop, round, err.clone());
                        }
                        continue;
                    }
                };
                target.matrix.record_send(hop, round);
                let conn = if target.v6 { conn6.as_ref() } else { conn4.as_ref() };
                if let Some(conn) = conn {
                    if let Err(err) = conn.send_to(&msg, target.dest) {
                        target
                            .matrix
                            .record_error(hop, round, ProbeError::Send(err.to_string()));
                    }
                }
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
            }
        }
    }
}

/// Drain one socket until the global deadline, demultiplexing correlated
/// replies into the matrices (one per host, indexed by `id - base_id`).
fn receiver_loop(
    transport: &dyn ProbeTransport,
    matrices: &[ProbeMatrix],
    base_id: u16,
    max_ttl: usize,
    rounds: usize,
    deadline: Instant,
) {
    let mut buf = [0u8; MAX_PACKET];
    loop {
        let (len, from) = match transport.recv_deadline(&mut buf, deadline) {
            Ok(Some(read)) => read,
            Ok(None) => break,
            Err(err) => {
                warn!(%err, "receiver read failed");
                break;
            }
        };

        let parsed = if transport.is_ipv6() {
            parse_reply_v6(&buf[..len])
        } else {
            parse_reply_v4(&buf[..len])
        };
        let (kind, id, seq) = match parsed {
            Some(IcmpResponse::EchoReply { id, seq }) => (ReplyKind::Final, id, seq),
            Some(IcmpResponse::TimeExceeded { id, seq }) => (ReplyKind::Transit, id, seq),
            Some(IcmpResponse::Unreachable { id, seq }) => (ReplyKind::Down, id, seq),
            _ => continue,
        };

        let Some((host, hop, round)) = slot_for(id, seq, base_id, matrices.len(), max_ttl, rounds)
        else {
            continue;
        };
        matrices[host].apply_reply(hop, round, from, kind);
    }
}

/// Enrich populated slots and truncate at the destination row.
///
/// The first final slot in row-major order fixes the cut; deeper rows are
/// discarded. Without a final slot the full matrix is returned.
async fn finalize(
    mut rows: Vec<Vec<Hop>>,
    cache: Option<&LookupCache>,
    max_ttl: usize,
) -> Vec<Vec<Hop>> {
    let mut final_hop = max_ttl;
    for hop in 0..rows.len() {
        for round in 0..rows[hop].len() {
            if rows[hop][round].addr.is_none() {
                continue;
            }
            enrich(&mut rows[hop][round], cache).await;
            if final_hop == max_ttl && rows[hop][round].is_final {
                final_hop = hop + 1;
            }
        }
    }
    rows.truncate(final_hop);
    rows
}

/// Trace `host` by dispatching all `max_ttl × rounds` probes at once.
///
/// `icmp_id` is the identifier stamped on every probe; `delay` is an
/// optional pause between sends to rate-limit the burst. The receiver
/// keeps draining until `max_rtt + delay × (rounds × max_ttl − 1)` has
/// elapsed, accounting for later probes leaving later.
pub async fn run_ptrace(
    host: &str,
    opts: &TraceOptions,
    cache: Option<&LookupCache>,
    rounds: usize,
    icmp_id: u16,
    delay: Duration,
) -> Result<Vec<Vec<Hop>>, TraceError> {
    let resolver = default_resolver();
    let dest = resolve_dest(&resolver, host).await?;
    let transport: Arc<dyn ProbeTransport> = Arc::from(open_transport(dest, opts)?);
    debug!(%dest, icmp_id, rounds, "starting parallel trace");
    Ok(ptrace_with_transport(
        transport,
        dest,
        cache,
        opts.max_ttl as usize,
        rounds,
        icmp_id,
        delay,
        opts.max_rtt,
    )
    .await)
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn ptrace_with_transport(
    transport: Arc<dyn ProbeTransport>,
    dest: IpAddr,
    cache: Option<&LookupCache>,
    max_ttl: usize,
    rounds: usize,
    icmp_id: u16,
    delay: Duration,
    max_rtt: Duration,
) -> Vec<Vec<Hop>> {
    if max_ttl == 0 || rounds == 0 {
        return Vec::new();
    }
    let matrix = ProbeMatrix::new(max_ttl, rounds);
    let max_seq = rounds * max_ttl - 1;
    let deadline = Instant::now() + max_rtt + delay * max_seq as u32;

    let sender = {
        let transport = Arc::clone(&transport);
        let matrix = matrix.clone();
        tokio::task::spawn_blocking(move || {
            burst_sender(transport.as_ref(), dest, icmp_id, &matrix, max_ttl, rounds, delay)
        })
    };
    let receiver = {
        let transport = Arc::clone(&transport);
        let matrices = vec![matrix.clone()];
        tokio::task::spawn_blocking(move || {
            receiver_loop(transport.as_ref(), &matrices, icmp_id, max_ttl, rounds, deadline)
        })
    };
    let _ = sender.await;
    let _ = receiver.await;

    finalize(matrix.into_rows(), cache, max_ttl).await
}

/// Trace several hosts over one shared IPv4 and/or IPv6 socket.
///
/// Host `i` probes carry identifier `start_icmp_id + i`; the receivers map
/// identifiers back to hosts. Returns one truncated matrix per host.
pub async fn run_mptrace(
    hosts: &[String],
    opts: &TraceOptions,
    cache: Option<&LookupCache>,
    rounds: usize,
    start_icmp_id: u16,
    delay: Duration,
) -> Result<HashMap<String, Vec<Vec<Hop>>>, TraceError> {
    let max_ttl = opts.max_ttl as usize;
    if hosts.is_empty() || max_ttl == 0 || rounds == 0 {
        return Ok(HashMap::new());
    }

    let resolver = default_resolver();
    let mut targets = Vec::with_capacity(hosts.len());
    let (mut has_v4, mut has_v6) = (false, false);
    for host in hosts {
        let dest = resolve_dest(&resolver, host).await?;
        has_v4 |= dest.is_ipv4();
        has_v6 |= dest.is_ipv6();
        targets.push(Target::new(host.clone(), dest, max_ttl, rounds));
    }

    let conn4: Option<Arc<dyn ProbeTransport>> = if has_v4 {
        Some(Arc::new(RawIcmpSocket::open_v4(opts.source_v4)?))
    } else {
        None
    };
    let conn6: Option<Arc<dyn ProbeTransport>> = if has_v6 {
        Some(Arc::new(RawIcmpSocket::open_v6(opts.source_v6)?))
    } else {
        None
    };
    debug!(hosts = targets.len(), start_icmp_id, rounds, "starting multi-host parallel trace");

    Ok(mptrace_with_transports(
        conn4,
        conn6,
        targets,
        cache,
        max_ttl,
        rounds,
        start_icmp_id,
        delay,
        opts.max_rtt,
    )
    .await)
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn mptrace_with_transports(
    conn4: Option<Arc<dyn ProbeTransport>>,
    conn6: Option<Arc<dyn ProbeTransport>>,
    targets: Vec<Target>,
    cache: Option<&LookupCache>,
    max_ttl: usize,
    rounds: usize,
    base_id: u16,
    delay: Duration,
    max_rtt: Duration,
) -> HashMap<String, Vec<Vec<Hop>>> {
    let max_seq = rounds * max_ttl - 1;
    let deadline = Instant::now() + max_rtt + delay * max_seq as u32;
    let matrices: Vec<ProbeMatrix> = targets.iter().map(|t| t.matrix.clone()).collect();

    let sender = {
        let conn4 = conn4.clone();
        let conn6 = conn6.clone();
        let targets = targets.clone();
        tokio::task::spawn_blocking(move || {
            multi_sender(conn4, conn6, &targets, base_id, max_ttl, rounds, delay)
        })
    };

    let mut receivers = Vec::new();
    if let Some(conn) = conn4 {
        let matrices = matrices.clone();
        receivers.push(tokio::task::spawn_blocking(move || {
            receiver_loop(conn.as_ref(), &matrices, base_id, max_ttl, rounds, deadline)
        }));
    }
    if let Some(conn) = conn6 {
        let matrices = matrices.clone();
        receivers.push(tokio::task::spawn_blocking(move || {
            receiver_loop(conn.as_ref(), &matrices, base_id, max_ttl, rounds, deadline)
        }));
    }

    let _ = sender.await;
    join_all(receivers).await;
    drop(matrices);

    let mut result = HashMap::with_capacity(targets.len());
    for target in targets {
        let rows = finalize(target.matrix.into_rows(), cache, max_ttl).await;
        result.insert(target.host, rows);
    }
    result
}
