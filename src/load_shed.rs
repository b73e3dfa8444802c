//! Admission-control configuration: the thresholds and whitelist consulted
//! by [`crate::acceptor::Acceptor::can_accept`].

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use crate::error::LoadShedConfigError;

/// An IPv4 or IPv6 network in CIDR notation, used for whitelist containment
/// checks. Stored as a masked address plus prefix length so containment is a
/// single masked comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrNetwork {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrNetwork {
    /// Parses `"ip/prefixlen"`, e.g. `"10.0.0.0/8"`.
    pub fn parse(s: &str) -> Option<Self> {
        let (ip_part, prefix_part) = s.split_once('/')?;
        let ip: IpAddr = ip_part.parse().ok()?;
        let prefix_len: u8 = prefix_part.parse().ok()?;
        let max_len = match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max_len {
            return None;
        }
        Some(CidrNetwork {
            network: mask(ip, prefix_len),
            prefix_len,
        })
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                mask(addr, self.prefix_len) == self.network
            }
            _ => false,
        }
    }
}

fn mask(addr: IpAddr, prefix_len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let mask = if prefix_len == 0 {
                0
            } else {
                u32::MAX << (32 - prefix_len as u32)
            };
            IpAddr::V4((bits & mask).into())
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let mask = if prefix_len == 0 {
                0
            } else {
                u128::MAX << (128 - prefix_len as u32)
            };
            IpAddr::V6((bits & mask).into())
        }
    }
}

/// Immutable admission-control thresholds, mirrors `LoadShedConfiguration`.
/// Whitelist lookups ignore port: an address is whitelisted or it isn't,
/// regardless of which ephemeral port the peer connected from.
#[derive(Debug, Clone)]
pub struct LoadShedConfiguration {
    pub enabled: bool,
    pub max_connections: u64,
    pub max_active_connections: u64,
    pub min_free_mem: u64,
    pub total_mem_bytes: u64,
    pub max_mem_usage: f64,
    pub max_cpu_usage: f64,
    pub min_cpu_idle: f64,
    pub logical_cpu_core_quorum: u32,
    pub num_logical_cpu_cores: u32,
    pub cpu_usage_exceed_window_size: u32,
    pub max_tcp_mem_usage: f64,
    pub poll_period: Duration,
    whitelist_addrs: HashSet<IpAddr>,
    whitelist_networks: Vec<CidrNetwork>,
}

impl Default for LoadShedConfiguration {
    fn default() -> Self {
        LoadShedConfiguration {
            enabled: false,
            max_connections: 0,
            max_active_connections: 0,
            min_free_mem: 0,
            total_mem_bytes: 0,
            max_mem_usage: 1.0,
            max_cpu_usage: 1.0,
            min_cpu_idle: 0.0,
            logical_cpu_core_quorum: 0,
            num_logical_cpu_cores: 1,
            cpu_usage_exceed_window_size: 1,
            max_tcp_mem_usage: 1.0,
            poll_period: Duration::from_secs(1),
            whitelist_addrs: HashSet::new(),
            whitelist_networks: Vec::new(),
        }
    }
}

impl LoadShedConfiguration {
    /// Adds a whitelist entry: either a bare address or a `"ip/prefixlen"`
    /// CIDR network.
    pub fn add_whitelist_addr(&mut self, entry: &str) {
        if let Some(network) = CidrNetwork::parse(entry) {
            self.whitelist_networks.push(network);
        } else if let Ok(addr) = entry.parse::<IpAddr>() {
            self.whitelist_addrs.insert(addr);
        } else {
            log::error!("load shed whitelist entry {entry:?} is neither an address nor a CIDR network, ignoring");
        }
    }

    /// Exact-match check first, then a CIDR containment walk.
    pub fn is_whitelisted(&self, addr: IpAddr) -> bool {
        if self.whitelist_addrs.contains(&addr) {
            return true;
        }
        self.whitelist_networks
            .iter()
            .any(|network| network.contains(addr))
    }

    /// Sanity-checks numeric ranges. Mirrors `LoadShedConfiguration::checkIsSane`.
    pub fn validate(&self) -> Result<(), LoadShedConfigError> {
        if self.cpu_usage_exceed_window_size < 1 {
            return Err(LoadShedConfigError::ZeroExceedWindow);
        }
        check_ratio("minCpuIdle", self.min_cpu_idle)?;
        if 1.0 - self.min_cpu_idle < self.max_cpu_usage {
            return Err(LoadShedConfigError::RatioOutOfRange {
                field: "maxCpuUsage",
                value: self.max_cpu_usage,
            });
        }
        check_ratio("maxCpuUsage", self.max_cpu_usage)?;
        check_ratio("maxMemUsage", self.max_mem_usage)?;
        if self.total_mem_bytes > 0 {
            let free_ratio = self.min_free_mem as f64 / self.total_mem_bytes as f64;
            if 1.0 - free_ratio < self.max_mem_usage {
                return Err(LoadShedConfigError::RatioOutOfRange {
                    field: "maxMemUsage",
                    value: self.max_mem_usage,
                });
            }
        }
        if self.min_free_mem > self.total_mem_bytes && self.total_mem_bytes > 0 {
            return Err(LoadShedConfigError::RatioOutOfRange {
                field: "minFreeMem",
                value: self.min_free_mem as f64,
            });
        }
        check_ratio("maxTcpMemUsage", self.max_tcp_mem_usage)?;
        if self.max_connections > 0 && self.max_active_connections > self.max_connections {
            return Err(LoadShedConfigError::ActiveExceedsTotal {
                active: self.max_active_connections,
                total: self.max_connections,
            });
        }
        Ok(())
    }
}

fn check_ratio(field: &'static str, value: f64) -> Result<(), LoadShedConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(LoadShedConfigError::RatioOutOfRange { field, value });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelist_exact_match() {
        let mut cfg = LoadShedConfiguration::default();
        cfg.add_whitelist_addr("127.0.0.1");
        assert!(cfg.is_whitelisted("127.0.0.1".parse().unwrap()));
        assert!(!cfg.is_whitelisted("127.0.0.2".parse().unwrap()));
    }

    #[test]
    fn whitelist_cidr_containment() {
        let mut cfg = LoadShedConfiguration::default();
        cfg.add_whitelist_addr("10.0.0.0/8");
        assert!(cfg.is_whitelisted("10.1.2.3".parse().unwrap()));
        assert!(!cfg.is_whitelisted("11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn validate_rejects_active_exceeding_total() {
        let mut cfg = LoadShedConfiguration::default();
        cfg.max_connections = 100;
        cfg.max_active_connections = 200;
        assert!(matches!(
            cfg.validate(),
            Err(LoadShedConfigError::ActiveExceedsTotal { .. })
        ));
    }

    #[test]
    fn validate_rejects_out_of_range_ratio() {
        let mut cfg = LoadShedConfiguration::default();
        cfg.max_cpu_usage = 1.5;
        assert!(matches!(
            cfg.validate(),
            Err(LoadShedConfigError::RatioOutOfRange { .. })
        ));
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(LoadShedConfiguration::default().validate().is_ok());
    }
}
