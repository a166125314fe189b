//! Capture filter compilation.
//!
//! Turns include/exclude `ip`, `port` and `ip:port` rules into a
//! tcpdump-style boolean expression, and folds resolved pod IPs into the
//! OS-native filter of a node.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use crate::domain::NodeOs;
use crate::error::TranslateError;

const WILDCARD: &str = "*";

/// Ports recorded per IP. The empty string stands for "any" on either side.
type IpPorts = BTreeMap<String, BTreeSet<String>>;

/// Compile include/exclude rules into `INCLUDE and not EXCLUDE`.
///
/// Either side is dropped when empty, and both empty yields an empty string.
/// Output is canonically sorted so rule order does not matter.
pub fn compile(include: &[String], exclude: &[String]) -> Result<String, TranslateError> {
    let include = render(&parse_rules(include)?);
    let exclude = render(&parse_rules(exclude)?);

    Ok(match (include.is_empty(), exclude.is_empty()) {
        (false, false) => format!("{} and not {}", include, exclude),
        (false, true) => include,
        (true, false) => format!("not {}", exclude),
        (true, true) => String::new(),
    })
}

/// Merge resolved pod IPs into a node's filter.
///
/// Linux ORs `(host a or host b)` onto the filter. Windows renders netsh
/// `IPv4.Address=(..)` / `IPv6.Address=(..)` tokens, skipping IPs that do
/// not parse.
pub fn merge_pod_ips(filter: &str, ips: &[String], os: NodeOs) -> String {
    if ips.is_empty() {
        return filter.to_string();
    }

    match os {
        NodeOs::Linux => {
            let hosts = ips
                .iter()
                .map(|ip| format!("host {}", ip))
                .collect::<Vec<_>>()
                .join(" or ");
            if filter.is_empty() {
                format!("({})", hosts)
            } else {
                format!("{} or ({})", filter, hosts)
            }
        }
        NodeOs::Windows => {
            let mut v4 = Vec::new();
            let mut v6 = Vec::new();
            for ip in ips {
                match ip.parse::<IpAddr>() {
                    Ok(IpAddr::V4(addr)) => v4.push(addr.to_string()),
                    Ok(IpAddr::V6(addr)) => v6.push(addr.to_string()),
                    Err(_) => tracing::warn!(ip = %ip, "Skipping invalid pod IP in netsh filter"),
                }
            }

            let mut tokens = Vec::new();
            if !filter.is_empty() {
                tokens.push(filter.to_string());
            }
            if !v4.is_empty() {
                tokens.push(format!("IPv4.Address=({})", v4.join(",")));
            }
            if !v6.is_empty() {
                tokens.push(format!("IPv6.Address=({})", v6.join(",")));
            }
            tokens.join(" ")
        }
    }
}

fn parse_rules(rules: &[String]) -> Result<IpPorts, TranslateError> {
    let mut ip_ports = IpPorts::new();

    for rule in rules {
        let rule = rule.trim();
        if rule.is_empty() {
            continue;
        }
        let (ip, port) = parse_rule(rule)?;

        match (ip.as_str(), port.as_str()) {
            ("", "") => {
                // "*" or "*:*" puts no restriction on the filter.
            }
            ("", port) => {
                // Any IP on this port covers every specific IP on the same port.
                for ports in ip_ports.values_mut() {
                    ports.remove(port);
                }
                ip_ports
                    .entry(String::new())
                    .or_default()
                    .insert(port.to_string());
            }
            (ip, "") => {
                ip_ports.insert(ip.to_string(), BTreeSet::from([String::new()]));
            }
            (ip, port) => {
                let ports = ip_ports.entry(ip.to_string()).or_default();
                if !ports.contains("") {
                    ports.insert(port.to_string());
                }
            }
        }
    }

    Ok(ip_ports)
}

/// Split a rule into `(ip, port)`, with "" meaning any.
fn parse_rule(rule: &str) -> Result<(String, String), TranslateError> {
    let invalid = || TranslateError::InvalidFilter(rule.to_string());

    let (ip, port) = if let Some((ip, port)) = rule.rsplit_once(':').filter(|_| !is_bare_ipv6(rule)) {
        (ip, port)
    } else if rule == WILDCARD {
        (WILDCARD, WILDCARD)
    } else if rule.contains('.') || rule.contains(':') {
        (rule, WILDCARD)
    } else {
        (WILDCARD, rule)
    };

    let ip = match ip {
        WILDCARD | "" => String::new(),
        ip => {
            let ip = ip.trim_start_matches('[').trim_end_matches(']');
            ip.parse::<IpAddr>().map_err(|_| invalid())?.to_string()
        }
    };

    let port = match port {
        WILDCARD | "" => String::new(),
        port => port.parse::<u16>().map_err(|_| invalid())?.to_string(),
    };

    Ok((ip, port))
}

/// An IPv6 literal without brackets has more than one colon and no port.
fn is_bare_ipv6(rule: &str) -> bool {
    !rule.starts_with('[') && rule.matches(':').count() > 1
}

fn render(ip_ports: &IpPorts) -> String {
    let mut terms = Vec::new();

    for (ip, ports) in ip_ports {
        if ip.is_empty() {
            terms.extend(ports.iter().map(|port| format!("(port {})", port)));
        } else if ports.len() == 1 && ports.contains("") {
            terms.push(format!("(host {})", ip));
        } else {
            terms.extend(
                ports
                    .iter()
                    .map(|port| format!("(host {} and port {})", ip, port)),
            );
        }
    }

    if terms.is_empty() {
        String::new()
    } else {
        format!("({})", terms.join(" or "))
    }
}
