use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use tracing::debug;
use vhosts_packet::dns::{QCLASS_IN, QTYPE_A};
use vhosts_packet::{parse_single_query, DnsAnswerBuilder, UdpPacket};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("hosts line {line}: {reason}")]
pub struct HostsError {
    pub line: usize,
    pub reason: &'static str,
}

/// Hostname → IPv4 table used to answer DNS queries locally.
///
/// Names are stored lower-case without a trailing dot. A `*.example.com` entry matches any strict
/// subdomain of `example.com`; exact entries take precedence, then the longest matching wildcard.
/// The first mapping registered for a name wins.
#[derive(Debug, Clone, Default)]
pub struct HostsTable {
    exact: HashMap<String, Ipv4Addr>,
    wildcards: Vec<(String, Ipv4Addr)>,
}

impl HostsTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `/etc/hosts` syntax: `<address> <name> [<name>...]`, `#` comments.
    ///
    /// IPv6 lines are skipped.
    pub fn parse(text: &str) -> Result<Self, HostsError> {
        let mut table = Self::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let content = raw.split('#').next().unwrap_or_default();
            let mut fields = content.split_whitespace();
            let Some(addr) = fields.next() else {
                continue;
            };
            let addr = match addr.parse::<Ipv4Addr>() {
                Ok(addr) => addr,
                Err(_) if addr.parse::<Ipv6Addr>().is_ok() => continue,
                Err(_) => {
                    return Err(HostsError {
                        line,
                        reason: "invalid IPv4 address",
                    })
                }
            };

            let mut names = fields.peekable();
            if names.peek().is_none() {
                return Err(HostsError {
                    line,
                    reason: "address without hostname",
                });
            }
            for name in names {
                if !table.insert(name, addr) && normalize(name).is_empty() {
                    return Err(HostsError {
                        line,
                        reason: "empty hostname",
                    });
                }
            }
        }
        Ok(table)
    }

    /// Register `name → addr`. Returns false if the name was empty or already mapped.
    pub fn insert(&mut self, name: &str, addr: Ipv4Addr) -> bool {
        let name = normalize(name);
        if let Some(suffix) = name.strip_prefix("*.") {
            if suffix.is_empty() || self.wildcards.iter().any(|(s, _)| s == suffix) {
                return false;
            }
            self.wildcards.push((suffix.to_string(), addr));
            // Longest suffix first so the most specific wildcard wins.
            self.wildcards
                .sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()));
            return true;
        }
        if name.is_empty() || self.exact.contains_key(&name) {
            return false;
        }
        self.exact.insert(name, addr);
        true
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcards.is_empty()
    }

    pub fn lookup(&self, name: &str) -> Option<Ipv4Addr> {
        let name = normalize(name);
        if let Some(addr) = self.exact.get(&name) {
            return Some(*addr);
        }
        self.wildcards
            .iter()
            .find(|(suffix, _)| is_strict_subdomain(&name, suffix))
            .map(|(_, addr)| *addr)
    }
}

impl<S: AsRef<str>> FromIterator<(S, Ipv4Addr)> for HostsTable {
    fn from_iter<I: IntoIterator<Item = (S, Ipv4Addr)>>(iter: I) -> Self {
        let mut table = Self::new();
        for (name, addr) in iter {
            table.insert(name.as_ref(), addr);
        }
        table
    }
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

fn is_strict_subdomain(name: &str, suffix: &str) -> bool {
    let Some(rest) = name.strip_suffix(suffix) else {
        return false;
    };
    rest.len() > 1 && rest.ends_with('.')
}

/// Answers DNS queries for names in a [`HostsTable`] by rewriting the query datagram in place.
#[derive(Debug, Clone)]
pub struct DnsInterceptor {
    hosts: HostsTable,
    ttl: u32,
}

// Header + longest QNAME + question trailer + one A record.
const MAX_ANSWER_LEN: usize = 12 + 255 + 4 + 16;

impl DnsInterceptor {
    pub fn new(hosts: HostsTable, ttl: u32) -> Self {
        Self { hosts, ttl }
    }

    pub fn hosts(&self) -> &HostsTable {
        &self.hosts
    }

    /// An empty table intercepts nothing; every port-53 datagram is relayed upstream.
    pub fn is_active(&self) -> bool {
        !self.hosts.is_empty()
    }

    /// Turn `packet` into the response to the query it carries.
    ///
    /// Returns `Err(packet)` untouched when the payload is not a plain single-question query, the
    /// class is not IN, or the name is not in the table. A mapped name queried with a type other
    /// than A gets an empty NOERROR answer.
    pub fn answer<B>(&self, mut packet: UdpPacket<B>) -> Result<UdpPacket<B>, UdpPacket<B>>
    where
        B: AsRef<[u8]> + AsMut<[u8]>,
    {
        let mut out = [0u8; MAX_ANSWER_LEN];
        let len = match self.synthesize(packet.payload(), &mut out) {
            Some(len) => len,
            None => return Err(packet),
        };

        packet.swap_direction();
        match packet.rewrite_payload(&out[..len]) {
            Ok(()) => Ok(packet),
            Err(err) => {
                debug!(error = %err, "failed to write DNS answer");
                packet.swap_direction();
                Err(packet)
            }
        }
    }

    fn synthesize(&self, payload: &[u8], out: &mut [u8]) -> Option<usize> {
        let query = match parse_single_query(payload) {
            Ok(query) => query,
            Err(err) => {
                debug!(error = %err, "not intercepting DNS datagram");
                return None;
            }
        };
        if query.qclass != QCLASS_IN {
            return None;
        }
        let name = query.name().ok()?;
        let addr = self.hosts.lookup(&name)?;
        debug!(name = %name, qtype = query.qtype, addr = %addr, "answering DNS query locally");

        let builder = DnsAnswerBuilder {
            query: &query,
            answer_a: (query.qtype == QTYPE_A).then_some(addr),
            ttl: self.ttl,
        };
        builder.write(out).ok()
    }
}
