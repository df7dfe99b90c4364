use std::net::IpAddr;

/// A parsed CIDR block. Bare addresses are treated as a full-length prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subnet {
    network: IpAddr,
    prefix_len: u8,
}

impl Subnet {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (addr, prefix) = match raw.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (raw, None),
        };
        let network: IpAddr = addr.parse().ok()?;
        let max_len = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix_len = match prefix {
            Some(prefix) => prefix.parse::<u8>().ok().filter(|len| *len <= max_len)?,
            None => max_len,
        };
        Some(Self {
            network,
            prefix_len,
        })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = canonical(ip);
        match (canonical(self.network), ip) {
            (IpAddr::V4(network), IpAddr::V4(ip)) => {
                prefix_eq(&network.octets(), &ip.octets(), self.prefix_len)
            }
            (IpAddr::V6(network), IpAddr::V6(ip)) => {
                prefix_eq(&network.octets(), &ip.octets(), self.prefix_len)
            }
            _ => false,
        }
    }
}

fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

fn prefix_eq(left: &[u8], right: &[u8], prefix_len: u8) -> bool {
    let full_bytes = usize::from(prefix_len / 8);
    let rem_bits = prefix_len % 8;
    if left[..full_bytes] != right[..full_bytes] {
        return false;
    }
    if rem_bits == 0 {
        return true;
    }
    let mask = 0xffu8 << (8 - rem_bits);
    (left[full_bytes] & mask) == (right[full_bytes] & mask)
}

/// `true` when `entries` is empty or any entry contains `ip`. Unparseable entries never match.
pub fn ip_allowed(entries: &[String], ip: IpAddr) -> bool {
    if entries.is_empty() {
        return true;
    }
    entries
        .iter()
        .filter_map(|entry| Subnet::parse(entry))
        .any(|subnet| subnet.contains(ip))
}
