//! Configuration for trace operations

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

/// Parameters shared by every trace mode.
///
/// Use [`TraceOptions::builder`] for a fluent API:
///
/// ```
/// use hoptrace::TraceOptions;
/// use std::time::Duration;
///
/// let opts = TraceOptions::builder()
///     .max_rtt(Duration::from_millis(500))
///     .max_ttl(20)
///     .build();
/// assert_eq!(opts.max_ttl, 20);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceOptions {
    /// Source address for the IPv4 socket; unspecified (`0.0.0.0`) if `None`
    pub source_v4: Option<Ipv4Addr>,
    /// Source address for the IPv6 socket; unspecified (`::`) if `None`
    pub source_v6: Option<Ipv6Addr>,
    /// Maximum time to wait for the reply to a single probe (default: 1s)
    pub max_rtt: Duration,
    /// Largest TTL / hop limit to probe (default: 30)
    pub max_ttl: u8,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            source_v4: None,
            source_v6: None,
            max_rtt: Duration::from_secs(1),
            max_ttl: 30,
        }
    }
}

impl TraceOptions {
    /// Start building a set of options from the defaults
    pub fn builder() -> TraceOptionsBuilder {
        TraceOptionsBuilder {
            opts: Self::default(),
        }
    }
}

/// Builder for [`TraceOptions`]
#[derive(Debug, Clone)]
pub struct TraceOptionsBuilder {
    opts: TraceOptions,
}

impl TraceOptionsBuilder {
    /// Bind the IPv4 socket to this source address
    pub fn source_v4(mut self, addr: Ipv4Addr) -> Self {
        self.opts.source_v4 = Some(addr);
        self
    }

    /// Bind the IPv6 socket to this source address
    pub fn source_v6(mut self, addr: Ipv6Addr) -> Self {
        self.opts.source_v6 = Some(addr);
        self
    }

    /// Maximum time to wait for the reply to a single probe
    pub fn max_rtt(mut self, max_rtt: Duration) -> Self {
        self.opts.max_rtt = max_rtt;
        self
    }

    /// Largest TTL / hop limit to probe
    pub fn max_ttl(mut self, max_ttl: u8) -> Self {
        self.opts.max_ttl = max_ttl;
        self
    }

    /// Finish building
    pub fn build(self) -> TraceOptions {
        self.opts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = TraceOptions::default();
        assert_eq!(opts.max_ttl, 30);
        assert_eq!(opts.max_rtt, Duration::from_secs(1));
        assert!(opts.source_v4.is_none());
        assert!(opts.source_v6.is_none());
    }

    #[test]
    fn builder_overrides() {
        let opts = TraceOptions::builder()
            .source_v4(Ipv4Addr::new(192, 0, 2, 1))
            .max_rtt(Duration::from_millis(250))
            .max_ttl(12)
            .build();
        assert_eq!(opts.source_v4, Some(Ipv4Addr::new(192, 0, 2, 1)));
        assert_eq!(opts.max_rtt, Duration::from_millis(250));
        assert_eq!(opts.max_ttl, 12);
    }
}
