//! Turns the balancer's service record into the address list written onto
//! an ingress's load balancer status.

use serde::Serialize;
use std::net::IpAddr;

/// One ingress point of the fronting service's load balancer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngressPoint {
    pub ip: Option<String>,
    pub hostname: Option<String>,
}

/// How the well-known service exposes the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceRecord {
    /// A `type: ExternalName` service.
    ExternalName(String),
    /// Any other service type, with its load balancer ingress points.
    LoadBalancer(Vec<IngressPoint>),
}

impl ServiceRecord {
    /// Flattens the record to plain address strings. Points without an IP
    /// contribute their hostname instead.
    pub fn addresses(&self) -> Vec<String> {
        match self {
            ServiceRecord::ExternalName(name) => vec![name.clone()],
            ServiceRecord::LoadBalancer(points) => points
                .iter()
                .map(|point| match point.ip.as_deref() {
                    Some(ip) if !ip.is_empty() => ip.to_string(),
                    _ => point.hostname.clone().unwrap_or_default(),
                })
                .collect(),
        }
    }
}

/// An entry of `status.loadBalancer.ingress`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusEntry {
    Ip(String),
    Hostname(String),
}

impl StatusEntry {
    /// The IP string this entry sorts by; empty for hostnames.
    pub fn ip(&self) -> &str {
        match self {
            StatusEntry::Ip(ip) => ip,
            StatusEntry::Hostname(_) => "",
        }
    }
}

/// Classifies each address as an IP literal or a hostname and sorts the
/// result by IP string. The sort is stable, so hostnames keep their
/// relative order ahead of every IP entry.
pub fn endpoints_to_status(endpoints: &[String]) -> Vec<StatusEntry> {
    let mut entries: Vec<StatusEntry> = endpoints
        .iter()
        .map(|ep| match ep.parse::<IpAddr>() {
            Ok(_) => StatusEntry::Ip(ep.clone()),
            Err(_) => StatusEntry::Hostname(ep.clone()),
        })
        .collect();
    entries.sort_by(|a, b| a.ip().cmp(b.ip()));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_classifies_ip_and_hostname() {
        let status = endpoints_to_status(&strings(&["10.0.0.5", "example.com"]));
        assert_eq!(
            status,
            vec![StatusEntry::Hostname("example.com".into()), StatusEntry::Ip("10.0.0.5".into())]
        );
    }

    #[test]
    fn test_sorts_by_ip_string() {
        let status = endpoints_to_status(&strings(&["10.0.0.9", "10.0.0.10", "192.168.1.1"]));
        let ips: Vec<&str> = status.iter().map(|e| e.ip()).collect();
        // Lexicographic, not numeric.
        assert_eq!(ips, vec!["10.0.0.10", "10.0.0.9", "192.168.1.1"]);
    }

    #[test]
    fn test_hostnames_keep_relative_order() {
        let status = endpoints_to_status(&strings(&["b.example", "10.0.0.1", "a.example"]));
        assert_eq!(
            status,
            vec![
                StatusEntry::Hostname("b.example".into()),
                StatusEntry::Hostname("a.example".into()),
                StatusEntry::Ip("10.0.0.1".into()),
            ]
        );
    }

    #[test]
    fn test_ipv6_is_ip() {
        let status = endpoints_to_status(&strings(&["fd00::1"]));
        assert_eq!(status, vec![StatusEntry::Ip("fd00::1".into())]);
    }

    #[test]
    fn test_empty_input() {
        assert!(endpoints_to_status(&[]).is_empty());
    }

    #[test]
    fn test_external_name_addresses() {
        let record = ServiceRecord::ExternalName("lb.example.com".into());
        assert_eq!(record.addresses(), strings(&["lb.example.com"]));
    }

    #[test]
    fn test_load_balancer_addresses_prefer_ip() {
        let record = ServiceRecord::LoadBalancer(vec![
            IngressPoint { ip: Some("10.0.0.5".into()), hostname: Some("ignored".into()) },
            IngressPoint { ip: None, hostname: Some("elb.example.com".into()) },
            IngressPoint { ip: Some(String::new()), hostname: Some("alt.example.com".into()) },
        ]);
        assert_eq!(record.addresses(), strings(&["10.0.0.5", "elb.example.com", "alt.example.com"]));
    }

    #[test]
    fn test_status_entry_serializes_like_kubernetes() {
        let json = serde_json::to_value(vec![
            StatusEntry::Ip("10.0.0.5".into()),
            StatusEntry::Hostname("example.com".into()),
        ])
        .unwrap();
        assert_eq!(json, serde_json::json!([{"ip": "10.0.0.5"}, {"hostname": "example.com"}]));
    }
}
