//! `/etc/resolv.conf` generation.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;

use podlite_shared::errors::{PodliteError, PodliteResult};

use crate::container::config::{ContainerConfig, NetworkMode};
use crate::container::state::NetworkStatus;
use crate::runtime::options::RuntimeOptions;

/// Stub listener of systemd-resolved, useless inside a private netns.
const RESOLVED_STUB: &str = "127.0.0.53";
const RESOLVED_UPSTREAM: &str = "/run/systemd/resolve/resolv.conf";

const DEFAULT_NAMESERVERS_V4: &[&str] = &["8.8.8.8", "8.8.4.4"];
const DEFAULT_NAMESERVERS_V6: &[&str] = &["2001:4860:4860::8888", "2001:4860:4860::8844"];

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ResolvConf {
    pub nameservers: Vec<String>,
    pub search: Vec<String>,
    pub options: Vec<String>,
}

impl ResolvConf {
    pub fn parse(content: &str) -> Self {
        let mut conf = ResolvConf::default();
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("nameserver") => conf.nameservers.extend(fields.next().map(str::to_string)),
                Some("search") | Some("domain") => {
                    conf.search = fields.map(str::to_string).collect();
                }
                Some("options") => conf.options.extend(fields.map(str::to_string)),
                _ => {}
            }
        }
        conf
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.search.is_empty() {
            out.push_str(&format!("search {}\n", self.search.join(" ")));
        }
        for ns in &self.nameservers {
            out.push_str(&format!("nameserver {}\n", ns));
        }
        if !self.options.is_empty() {
            out.push_str(&format!("options {}\n", self.options.join(" ")));
        }
        out
    }
}

fn is_localhost(ns: &str) -> bool {
    ns.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

fn read_host(path: &Path) -> PodliteResult<ResolvConf> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(PodliteError::from(e).context(format!("reading {}", path.display())));
        }
    };
    let conf = ResolvConf::parse(&content);
    if conf.nameservers.iter().any(|ns| ns == RESOLVED_STUB)
        && let Ok(upstream) = std::fs::read_to_string(RESOLVED_UPSTREAM)
    {
        return Ok(ResolvConf::parse(&upstream));
    }
    Ok(conf)
}

fn dedup(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

/// Build the resolv.conf content for a container that owns its network.
///
/// Explicit container settings win over runtime defaults, which win over
/// what the network backend and the host report.
pub(crate) fn generate(
    config: &ContainerConfig,
    options: &RuntimeOptions,
    network: &BTreeMap<String, NetworkStatus>,
) -> PodliteResult<String> {
    let host = read_host(&options.host_resolv_conf)?;
    let host_netns = config.network_mode == NetworkMode::Host;

    let nameservers = if !config.dns.servers.is_empty() {
        config.dns.servers.iter().map(IpAddr::to_string).collect()
    } else if !options.dns_servers.is_empty() {
        options.dns_servers.iter().map(IpAddr::to_string).collect()
    } else {
        let from_network = network
            .values()
            .flat_map(|s| s.dns_server_ips.iter().map(IpAddr::to_string));
        let from_host = host
            .nameservers
            .iter()
            .filter(|ns| host_netns || !is_localhost(ns))
            .cloned();
        let mut servers = dedup(from_network.chain(from_host));
        if servers.is_empty() {
            let ipv6 = network.values().flat_map(|s| s.addresses()).any(|ip| ip.is_ipv6());
            servers.extend(DEFAULT_NAMESERVERS_V4.iter().map(|s| s.to_string()));
            if ipv6 {
                servers.extend(DEFAULT_NAMESERVERS_V6.iter().map(|s| s.to_string()));
            }
        }
        servers
    };

    let search = if !config.dns.search.is_empty() {
        // A lone "." clears the search list.
        if config.dns.search.iter().any(|s| s == ".") {
            Vec::new()
        } else {
            dedup(config.dns.search.iter().cloned())
        }
    } else {
        dedup(
            network
                .values()
                .flat_map(|s| s.dns_search_domains.iter().cloned())
                .chain(options.dns_searches.iter().cloned())
                .chain(host.search.iter().cloned()),
        )
    };

    let opts = if !config.dns.options.is_empty() {
        config.dns.options.clone()
    } else if !options.dns_options.is_empty() {
        options.dns_options.clone()
    } else {
        host.options.clone()
    };

    Ok(ResolvConf { nameservers, search, options: opts }.render())
}
