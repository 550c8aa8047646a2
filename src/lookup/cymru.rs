//! Team Cymru origin AS queries
//!
//! AS numbers come from TXT records under `origin.asn.cymru.com` (IPv4)
//! and `origin6.asn.cymru.com` (IPv6). The record format is
//! `"15169 | 8.8.8.0/24 | US | arin | 2000-03-30"`; only the first field
//! is consumed.

use hickory_resolver::TokioResolver;
use std::net::IpAddr;
use tracing::trace;

const HEX: &[u8; 16] = b"0123456789abcdef";

/// Build the DNS name that answers "which AS announces this address".
///
/// IPv4 `a.b.c.d` becomes `d.c.b.a.origin.asn.cymru.com`; IPv6 becomes the
/// 32 nybbles of the address reversed and dot-separated under
/// `origin6.asn.cymru.com`.
pub(crate) fn origin_query(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.origin.asn.cymru.com", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut name = String::with_capacity(64 + 22);
            for byte in v6.octets().iter().rev() {
                name.push(HEX[(byte & 0x0f) as usize] as char);
                name.push('.');
                name.push(HEX[(byte >> 4) as usize] as char);
                name.push('.');
            }
            name.push_str("origin6.asn.cymru.com");
            name
        }
    }
}

/// Parse the first field of a Cymru origin TXT record as an AS number.
///
/// Returns -1 for records without the `" | "` separator or with a
/// non-numeric first field (multi-origin records fall in the latter bucket).
pub(crate) fn parse_origin_txt(txt: &str) -> i64 {
    let mut fields = txt.split(" | ");
    let Some(first) = fields.next() else {
        return -1;
    };
    if fields.next().is_none() {
        return -1;
    }
    first.parse::<i64>().unwrap_or(-1)
}

/// Resolve the announcing AS number for `ip`, or -1 on any failure.
pub(crate) async fn lookup_origin_as(resolver: &TokioResolver, ip: IpAddr) -> i64 {
    let query = origin_query(ip);
    let lookup = match resolver.txt_lookup(query.clone()).await {
        Ok(lookup) => lookup,
        Err(err) => {
            trace!(%ip, %query, %err, "origin TXT lookup failed");
            return -1;
        }
    };
    let Some(record) = lookup.iter().next() else {
        return -1;
    };
    let txt = record
        .iter()
        .map(|data| String::from_utf8_lossy(data))
        .collect::<Vec<_>>()
        .join("");
    parse_origin_txt(&txt)
}
