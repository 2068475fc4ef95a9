use std::collections::BTreeMap;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use vigil_model::{Asset, ScanModule, Severity};

use super::{
    AdapterError, Capability, Invocation, ModuleAdapter, NativeRecord, Observation, ParseError,
    RawOutput, check_format, render_command,
};

const DEFAULT_COMMAND: &[&str] = &["ping", "-c", "{packet_count}", "{target}"];

const DEFAULT_OPTIONS: &[(&str, &str)] = &[("packet_count", "4")];

static SUMMARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+) packets transmitted, (\d+) (?:packets )?received")
        .expect("ping summary regex should compile")
});

static RTT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"= ([\d.]+)/([\d.]+)/([\d.]+)").expect("ping rtt regex should compile")
});

/// ICMP reachability check.
#[derive(Debug, Clone)]
pub struct PingAdapter {
    grace: Duration,
}

impl Default for PingAdapter {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl PingAdapter {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }
}

#[async_trait::async_trait]
impl ModuleAdapter for PingAdapter {
    fn kind(&self) -> &'static str {
        "ping"
    }

    fn capabilities(&self) -> Capability {
        Capability::Findings
    }

    fn build(&self, asset: &Asset, module: &ScanModule) -> Result<Invocation, AdapterError> {
        check_format(self, module)?;
        render_command(asset, module, DEFAULT_COMMAND, DEFAULT_OPTIONS, self.grace)
    }

    fn parse(&self, raw: &RawOutput) -> Result<Vec<NativeRecord>, ParseError> {
        let Some(caps) = SUMMARY.captures(&raw.stdout) else {
            return Err(ParseError::new("missing ping statistics line", Vec::new()));
        };
        let transmitted: u32 = caps[1].parse().unwrap_or(0);
        let received: u32 = caps[2].parse().unwrap_or(0);
        let reachable = received > 0;
        let rtt = RTT.captures(&raw.stdout).map(|c| {
            json!({ "min_ms": &c[1], "avg_ms": &c[2], "max_ms": &c[3] })
        });

        let mut signature = BTreeMap::new();
        signature.insert("reachable".to_string(), json!(reachable));

        Ok(vec![NativeRecord::Observation(Observation {
            title: if reachable {
                "Host reachable".to_string()
            } else {
                "Host unreachable".to_string()
            },
            severity: Severity::Info,
            signature,
            evidence: json!({
                "transmitted": transmitted,
                "received": received,
                "rtt": rtt,
            }),
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_linux_summary() {
        let raw = RawOutput {
            stdout: "4 packets transmitted, 4 received, 0% packet loss, time 3004ms\n\
                     rtt min/avg/max/mdev = 10.1/11.2/12.3/0.5 ms\n"
                .into(),
            ..Default::default()
        };
        let records = PingAdapter::default().parse(&raw).unwrap();
        let NativeRecord::Observation(obs) = &records[0] else {
            panic!("expected observation");
        };
        assert_eq!(obs.title, "Host reachable");
        assert_eq!(obs.evidence["rtt"]["avg_ms"], json!("11.2"));
    }

    #[test]
    fn total_loss_is_unreachable() {
        let raw = RawOutput {
            stdout: "4 packets transmitted, 0 packets received, 100.0% packet loss\n".into(),
            ..Default::default()
        };
        let records = PingAdapter::default().parse(&raw).unwrap();
        let NativeRecord::Observation(obs) = &records[0] else {
            panic!("expected observation");
        };
        assert_eq!(obs.signature["reachable"], json!(false));
    }
}
