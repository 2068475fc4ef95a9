use std::collections::BTreeMap;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};
use vigil_model::{Asset, ScanModule, Severity};

use super::{
    AdapterError, Capability, Invocation, ModuleAdapter, NativeRecord, Observation, ParseError,
    RawOutput, check_format, render_command,
};

const DEFAULT_COMMAND: &[&str] = &[
    "nmap",
    "-p-",
    "--open",
    "-sV",
    "--host-timeout",
    "{host_timeout}s",
    "{target}",
];

const DEFAULT_OPTIONS: &[(&str, &str)] = &[("host_timeout", "30")];

/// `80/tcp   open  http    nginx 1.25.3`
static PORT_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{1,5})/(tcp|udp)\s+(\S+)\s+(\S+)(?:\s+(.*))?$")
        .expect("nmap port line regex should compile")
});

static REPORT_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Nmap scan report for (\S+)(?: \((\S+)\))?")
        .expect("nmap report line regex should compile")
});

/// Port scanner. Each open port becomes one observation.
#[derive(Debug, Clone)]
pub struct NmapAdapter {
    grace: Duration,
}

impl Default for NmapAdapter {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl NmapAdapter {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }
}

#[async_trait::async_trait]
impl ModuleAdapter for NmapAdapter {
    fn kind(&self) -> &'static str {
        "nmap"
    }

    fn capabilities(&self) -> Capability {
        Capability::Findings
    }

    fn build(&self, asset: &Asset, module: &ScanModule) -> Result<Invocation, AdapterError> {
        check_format(self, module)?;
        render_command(asset, module, DEFAULT_COMMAND, DEFAULT_OPTIONS, self.grace)
    }

    fn parse(&self, raw: &RawOutput) -> Result<Vec<NativeRecord>, ParseError> {
        let mut records = Vec::new();
        let mut host: Option<String> = None;
        let mut saw_report = false;

        for line in raw.stdout.lines().map(str::trim) {
            if let Some(caps) = REPORT_LINE.captures(line) {
                saw_report = true;
                host = caps
                    .get(2)
                    .or_else(|| caps.get(1))
                    .map(|m| m.as_str().to_string());
                continue;
            }
            let Some(caps) = PORT_LINE.captures(line) else {
                continue;
            };
            if &caps[3] != "open" {
                continue;
            }
            let port: u16 = match caps[1].parse() {
                Ok(port) => port,
                Err(_) => continue,
            };
            let protocol = caps[2].to_string();
            let service = caps[4].to_string();
            let version = caps.get(5).map(|m| m.as_str().trim().to_string());

            let mut signature = BTreeMap::new();
            signature.insert("port".to_string(), json!(port));
            signature.insert("protocol".to_string(), json!(protocol));
            signature.insert("service".to_string(), json!(service));

            records.push(NativeRecord::Observation(Observation {
                title: format!("Open Port {port}/{protocol} - {service}"),
                severity: Severity::Low,
                signature,
                evidence: json!({
                    "host": host,
                    "version": version.map(Value::String).unwrap_or(Value::Null),
                    "line": line,
                }),
            }));
        }

        if records.is_empty() && !saw_report && !raw.stdout.trim().is_empty() {
            return Err(ParseError::new("no nmap scan report in output", records));
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Starting Nmap 7.94 ( https://nmap.org ) at 2024-05-01 10:00 UTC
Nmap scan report for example.com (93.184.216.34)
Host is up (0.011s latency).
Not shown: 65533 filtered tcp ports (no-response)
PORT    STATE SERVICE  VERSION
80/tcp  open  http     ECAcc (nyb/1D2E)
443/tcp open  ssl/http ECAcc (nyb/1D2E)
8080/tcp closed http-proxy
";

    #[test]
    fn open_ports_become_observations() {
        let raw = RawOutput {
            stdout: SAMPLE.into(),
            ..Default::default()
        };
        let records = NmapAdapter::default().parse(&raw).unwrap();
        assert_eq!(records.len(), 2);
        let NativeRecord::Observation(first) = &records[0] else {
            panic!("expected observation");
        };
        assert_eq!(first.title, "Open Port 80/tcp - http");
        assert_eq!(first.signature["port"], json!(80));
        assert_eq!(first.evidence["host"], json!("93.184.216.34"));
    }

    #[test]
    fn host_with_no_open_ports_is_empty_not_error() {
        let raw = RawOutput {
            stdout: "Nmap scan report for example.com\nHost is up.\n".into(),
            ..Default::default()
        };
        assert!(NmapAdapter::default().parse(&raw).unwrap().is_empty());
    }

    #[test]
    fn unrelated_output_is_a_parse_error() {
        let raw = RawOutput {
            stdout: "segmentation fault\n".into(),
            ..Default::default()
        };
        let err = NmapAdapter::default().parse(&raw).unwrap_err();
        assert!(err.partial.is_empty());
    }
}
