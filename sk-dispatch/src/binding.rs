//! Binding model and its kernel wire format.
//!
//! A binding maps (protocol, address prefix, port) to a label. Bindings are
//! stored in a longest-prefix-match trie whose key embeds the protocol and
//! port in the 32 bits ahead of the address, so one trie serves both
//! address families and wildcard ports.

use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::str::FromStr;

use aya::maps::lpm_trie::Key;
use clap::ValueEnum;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use sk_dispatch_common::{BindingKey, BINDING_HEADER_BITS, IPV4_PREFIX_OFFSET};

use crate::errors::{DispatchError, Result};

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

/// L4 protocols the data plane understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub const fn number(self) -> u8 {
        match self {
            Protocol::Tcp => sk_dispatch_common::IPPROTO_TCP,
            Protocol::Udp => sk_dispatch_common::IPPROTO_UDP,
        }
    }

    pub fn from_number(n: u8) -> Option<Protocol> {
        match n {
            sk_dispatch_common::IPPROTO_TCP => Some(Protocol::Tcp),
            sk_dispatch_common::IPPROTO_UDP => Some(Protocol::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

/// Redirects traffic for (protocol, prefix, port) to a label.
///
/// The prefix is canonicalised to its network address on construction.
/// A port of 0 matches any destination port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub label: String,
    pub protocol: Protocol,
    pub prefix: IpNet,
    pub port: u16,
}

impl Binding {
    pub fn new(label: &str, protocol: Protocol, prefix: IpNet, port: u16) -> Binding {
        Binding {
            label: label.to_string(),
            protocol,
            prefix: prefix.trunc(),
            port,
        }
    }

    /// Encode the binding into its LPM key.
    ///
    /// The prefix length counts the 32 header bits (protocol, padding,
    /// port) plus the address prefix; IPv4 prefixes shift by 96 into the
    /// IPv4-mapped region of the IPv6 space.
    pub(crate) fn lpm_key(&self) -> Key<BindingKey> {
        let (addr, prefix_len) = match self.prefix {
            IpNet::V4(net) => (
                net.addr().to_ipv6_mapped(),
                IPV4_PREFIX_OFFSET + u32::from(net.prefix_len()),
            ),
            IpNet::V6(net) => (net.addr(), u32::from(net.prefix_len())),
        };

        Key::new(
            BINDING_HEADER_BITS + prefix_len,
            BindingKey {
                protocol: self.protocol.number(),
                _pad: 0,
                port: self.port.to_be(),
                addr: addr.octets(),
            },
        )
    }

    /// Decode a kernel key back into a binding owned by `label`.
    ///
    /// Fails with `Corrupt` if the key holds a protocol or prefix length
    /// the control plane never writes.
    pub(crate) fn from_lpm_key(label: &str, key: &Key<BindingKey>) -> Result<Binding> {
        let data = key.data();
        let total = key.prefix_len();

        let protocol = Protocol::from_number(data.protocol).ok_or_else(|| {
            DispatchError::Corrupt(format!("binding key has protocol {}", data.protocol))
        })?;

        let prefix_len = total.checked_sub(BINDING_HEADER_BITS).ok_or_else(|| {
            DispatchError::Corrupt(format!("binding key has prefix length {total}"))
        })?;

        let addr = Ipv6Addr::from(data.addr);
        let prefix = match addr.to_ipv4_mapped() {
            Some(v4) if prefix_len >= IPV4_PREFIX_OFFSET => {
                let len = (prefix_len - IPV4_PREFIX_OFFSET) as u8;
                IpNet::V4(Ipv4Net::new(v4, len).map_err(|_| {
                    DispatchError::Corrupt(format!("binding key has prefix length {total}"))
                })?)
            }
            _ => IpNet::V6(Ipv6Net::new(addr, prefix_len as u8).map_err(|_| {
                DispatchError::Corrupt(format!("binding key has prefix length {total}"))
            })?),
        };

        Ok(Binding {
            label: label.to_string(),
            protocol,
            prefix,
            port: u16::from_be(data.port),
        })
    }

    /// Address as 16 bytes, IPv4 in mapped form. Sort key material.
    fn addr_bytes(&self) -> [u8; 16] {
        match self.prefix {
            IpNet::V4(net) => net.addr().to_ipv6_mapped().octets(),
            IpNet::V6(net) => net.addr().octets(),
        }
    }

    /// Prefix length in the shared 128-bit space.
    fn mapped_prefix_len(&self) -> u32 {
        match self.prefix {
            IpNet::V4(net) => IPV4_PREFIX_OFFSET + u32::from(net.prefix_len()),
            IpNet::V6(net) => u32::from(net.prefix_len()),
        }
    }
}

// Display order matches list output: protocol, prefix, port, label.
impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} -> {}",
            self.protocol, self.prefix, self.port, self.label
        )
    }
}

impl Ord for Binding {
    fn cmp(&self, other: &Binding) -> Ordering {
        self.label
            .cmp(&other.label)
            .then_with(|| self.protocol.number().cmp(&other.protocol.number()))
            .then_with(|| self.port.cmp(&other.port))
            .then_with(|| self.addr_bytes().cmp(&other.addr_bytes()))
            .then_with(|| self.mapped_prefix_len().cmp(&other.mapped_prefix_len()))
    }
}

impl PartialOrd for Binding {
    fn partial_cmp(&self, other: &Binding) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Parse `ip` or `ip/len` into a prefix. A bare address gets the full
/// prefix length of its family.
pub fn parse_prefix(s: &str) -> std::result::Result<IpNet, String> {
    if s.contains('/') {
        IpNet::from_str(s).map_err(|e| format!("invalid prefix {s:?}: {e}"))
    } else {
        IpAddr::from_str(s)
            .map(IpNet::from)
            .map_err(|e| format!("invalid address {s:?}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(label: &str, protocol: Protocol, prefix: &str, port: u16) -> Binding {
        Binding::new(label, protocol, prefix.parse().unwrap(), port)
    }

    #[test]
    fn ipv4_key_layout() {
        let b = binding("web", Protocol::Tcp, "192.0.2.0/24", 80);
        let key = b.lpm_key();

        // 32 header bits + 96 mapped offset + /24. Copy out of the packed
        // key before asserting.
        let prefix_len = key.prefix_len();
        assert_eq!(prefix_len, 32 + 96 + 24);
        let data = key.data();
        assert_eq!(data.protocol, 6);
        assert_eq!(data._pad, 0);
        assert_eq!(u16::from_be(data.port), 80);
        assert_eq!(
            data.addr,
            [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 192, 0, 2, 0]
        );
    }

    #[test]
    fn ipv6_key_layout() {
        let b = binding("web", Protocol::Udp, "2001:db8::/32", 0);
        let key = b.lpm_key();

        let prefix_len = key.prefix_len();
        assert_eq!(prefix_len, 32 + 32);
        let data = key.data();
        assert_eq!(data.protocol, 17);
        assert_eq!(u16::from_be(data.port), 0);
        assert_eq!(data.addr[..4], [0x20, 0x01, 0x0d, 0xb8]);
    }

    #[test]
    fn key_round_trip() {
        for (proto, prefix, port) in [
            (Protocol::Tcp, "192.0.2.0/24", 80u16),
            (Protocol::Udp, "10.0.0.0/8", 0),
            (Protocol::Tcp, "127.0.0.1/32", 443),
            (Protocol::Udp, "2001:db8::/32", 53),
            (Protocol::Tcp, "::/0", 0),
            (Protocol::Tcp, "0.0.0.0/0", 0),
        ] {
            let b = binding("x", proto, prefix, port);
            let decoded = Binding::from_lpm_key("x", &b.lpm_key()).unwrap();
            assert_eq!(b, decoded, "round trip of {prefix}");
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        let key = Key::new(
            200,
            sk_dispatch_common::BindingKey {
                protocol: 99,
                _pad: 0,
                port: 0,
                addr: [0; 16],
            },
        );
        assert!(matches!(
            Binding::from_lpm_key("x", &key),
            Err(DispatchError::Corrupt(_))
        ));

        // Prefix length below the header bits can't come from us.
        let key = Key::new(
            8,
            sk_dispatch_common::BindingKey {
                protocol: 6,
                _pad: 0,
                port: 0,
                addr: [0; 16],
            },
        );
        assert!(matches!(
            Binding::from_lpm_key("x", &key),
            Err(DispatchError::Corrupt(_))
        ));
    }

    #[test]
    fn prefix_is_canonicalised() {
        let b = binding("web", Protocol::Tcp, "192.0.2.55/24", 80);
        assert_eq!(b.prefix.to_string(), "192.0.2.0/24");
    }

    #[test]
    fn sort_order() {
        let mut bindings = vec![
            binding("web", Protocol::Udp, "192.0.2.0/24", 80),
            binding("web", Protocol::Tcp, "192.0.2.0/24", 80),
            binding("app", Protocol::Tcp, "10.0.0.0/8", 0),
            binding("web", Protocol::Tcp, "192.0.2.0/25", 80),
            binding("web", Protocol::Tcp, "192.0.1.0/24", 80),
            binding("web", Protocol::Tcp, "192.0.2.0/24", 22),
        ];
        bindings.sort();

        let display: Vec<String> = bindings.iter().map(|b| b.to_string()).collect();
        assert_eq!(
            display,
            [
                "tcp 10.0.0.0/8 0 -> app",
                "tcp 192.0.2.0/24 22 -> web",
                "tcp 192.0.1.0/24 80 -> web",
                "tcp 192.0.2.0/24 80 -> web",
                "tcp 192.0.2.0/25 80 -> web",
                "udp 192.0.2.0/24 80 -> web",
            ]
        );
    }

    #[test]
    fn ipv4_sorts_before_matching_ipv6() {
        // An IPv4 /24 and its mapped IPv6 twin share address bytes; the
        // shorter mapped prefix length breaks the tie.
        let v4 = binding("x", Protocol::Tcp, "192.0.2.0/24", 0);
        let v6 = binding("x", Protocol::Tcp, "::ffff:c000:200/124", 0);
        assert!(v4 < v6);
    }

    #[test]
    fn parse_prefix_variants() {
        assert_eq!(
            parse_prefix("127.0.0.1").unwrap().to_string(),
            "127.0.0.1/32"
        );
        assert_eq!(
            parse_prefix("2001:db8::1").unwrap().to_string(),
            "2001:db8::1/128"
        );
        assert_eq!(
            parse_prefix("10.0.0.0/8").unwrap().to_string(),
            "10.0.0.0/8"
        );
        assert!(parse_prefix("not-an-address").is_err());
        assert!(parse_prefix("10.0.0.0/99").is_err());
    }
}
