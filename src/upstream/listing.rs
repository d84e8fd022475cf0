//! Read-only view of known origins.

use std::fmt::Write as _;

use serde::Serialize;

use super::Upstream;
use crate::http::HttpVersion;
use crate::store::ObjectStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OriginSummary {
    pub name: String,
    pub port: u16,
    pub proxy: bool,
    /// `"1.0"`, `"1.1"` or `"unknown"`.
    pub version: &'static str,
    /// `"yes"`, `"no"` or `"unknown"`.
    pub persistent: &'static str,
    /// Empty when pipelining is out of the question.
    pub pipeline: &'static str,
    /// Established connections within the usable slots.
    pub connections: usize,
    /// Established connections in slots beyond the usable ones.
    pub extra_connections: usize,
    pub slots: usize,
    pub queued: usize,
    /// Lies in tens, as counted against the origin.
    pub lies: i32,
    pub rtt_secs: Option<f64>,
    /// Bytes per second.
    pub rate: Option<u64>,
}

impl<S: ObjectStore> Upstream<S> {
    /// One entry per known origin, ordered by name and port.
    pub fn listing(&self) -> Vec<OriginSummary> {
        let mut out: Vec<OriginSummary> = self
            .origins
            .iter()
            .map(|(_, o)| {
                let (mut n, mut m) = (0, 0);
                for (i, slot) in o.slots.iter().enumerate() {
                    let Some(c) = slot.conn else { continue };
                    if self.conns[c].is_connecting() {
                        continue;
                    }
                    if i < o.num_slots {
                        n += 1;
                    } else {
                        m += 1;
                    }
                }
                OriginSummary {
                    name: o.key.name.clone(),
                    port: o.key.port,
                    proxy: o.key.is_proxy,
                    version: match o.version {
                        Some(HttpVersion::Http11) => "1.1",
                        Some(HttpVersion::Http10) => "1.0",
                        None => "unknown",
                    },
                    persistent: match o.persistence {
                        p if p < 0 => "no",
                        p if p > 0 => "yes",
                        _ => "unknown",
                    },
                    pipeline: o.pipeline.label(o.version, o.persistence),
                    connections: n,
                    extra_connections: m,
                    slots: o.num_slots,
                    queued: o.queue.len(),
                    lies: if o.lies > 0 { (o.lies + 9) / 10 } else { 0 },
                    rtt_secs: o.rtt_us.map(|us| us as f64 / 1_000_000.0),
                    rate: o.rate,
                }
            })
            .collect();
        out.sort_by(|a, b| (&a.name, a.port).cmp(&(&b.name, b.port)));
        out
    }
}

/// Plain text table of `origins`.
pub fn render_listing(origins: &[OriginSummary]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<32} {:<8} {:<10} {:<9} {:<12} {:<10} {:>8} {:>10}",
        "Server", "Version", "Persistent", "Pipeline", "Connections", "", "rtt", "rate"
    );
    for o in origins {
        let name = if o.port == 80 {
            o.name.clone()
        } else {
            format!("{}:{}", o.name, o.port)
        };
        let connections = if o.extra_connections > 0 {
            format!("{}/{} + {}", o.connections, o.slots, o.extra_connections)
        } else {
            format!("{}/{}", o.connections, o.slots)
        };
        let lies = if o.lies > 0 {
            format!("({} lies)", o.lies)
        } else {
            String::new()
        };
        let rtt = o.rtt_secs.map(|s| format!("{:.3}", s)).unwrap_or_default();
        let rate = o.rate.map(|r| r.to_string()).unwrap_or_default();
        let _ = writeln!(
            out,
            "{:<32} {:<8} {:<10} {:<9} {:<12} {:<10} {:>8} {:>10}",
            name, o.version, o.persistent, o.pipeline, connections, lies, rtt, rate
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(name: &str, port: u16) -> OriginSummary {
        OriginSummary {
            name: name.to_string(),
            port,
            proxy: false,
            version: "1.1",
            persistent: "yes",
            pipeline: "trying",
            connections: 1,
            extra_connections: 2,
            slots: 2,
            queued: 0,
            lies: 1,
            rtt_secs: Some(0.0125),
            rate: Some(20_000),
        }
    }

    #[test]
    fn renders_one_line_per_origin() {
        let text = render_listing(&[summary("example.com", 80), summary("example.org", 8080)]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("example.com "));
        assert!(lines[1].contains("1/2 + 2"));
        assert!(lines[1].contains("(1 lies)"));
        assert!(lines[1].contains("0.013") || lines[1].contains("0.012"));
        assert!(lines[2].starts_with("example.org:8080"));
    }

    #[test]
    fn serializes_to_json() {
        let json = serde_json::to_value(summary("example.com", 80)).unwrap();
        assert_eq!(json["name"], "example.com");
        assert_eq!(json["pipeline"], "trying");
        assert_eq!(json["rate"], 20_000);
    }
}
