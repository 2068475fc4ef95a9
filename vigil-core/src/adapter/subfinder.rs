use std::time::Duration;

use vigil_model::{Asset, AssetKind, OutputFormat, ScanModule, asset::normalize_value};

use super::{
    AdapterError, Capability, Invocation, ModuleAdapter, NativeRecord, ParseError, RawOutput,
    check_format, render_command,
};

const DEFAULT_COMMAND: &[&str] = &["subfinder", "-d", "{target}", "-silent"];

/// Passive subdomain enumeration. Emits one host per output line.
#[derive(Debug, Clone)]
pub struct SubfinderAdapter {
    grace: Duration,
}

impl Default for SubfinderAdapter {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl SubfinderAdapter {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }
}

#[async_trait::async_trait]
impl ModuleAdapter for SubfinderAdapter {
    fn kind(&self) -> &'static str {
        "subfinder"
    }

    fn capabilities(&self) -> Capability {
        Capability::Assets
    }

    fn build(&self, asset: &Asset, module: &ScanModule) -> Result<Invocation, AdapterError> {
        check_format(self, module)?;
        if asset.kind == AssetKind::Ip {
            return Err(AdapterError::Build(format!(
                "subdomain enumeration needs a domain, got ip {}",
                asset.value
            )));
        }
        render_command(asset, module, DEFAULT_COMMAND, &[], self.grace)
    }

    fn parse(&self, raw: &RawOutput) -> Result<Vec<NativeRecord>, ParseError> {
        let mut hosts = Vec::new();
        let mut rejected = Vec::new();
        for line in raw.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            // Wildcard DNS entries stand for the zone itself.
            let host = line.strip_prefix("*.").unwrap_or(line);
            match normalize_value(host) {
                Ok(host) => hosts.push(NativeRecord::Host(host)),
                Err(_) => rejected.push(line.to_string()),
            }
        }
        if rejected.is_empty() {
            Ok(hosts)
        } else {
            Err(ParseError::new(
                format!("{} unparseable host lines: {}", rejected.len(), rejected.join(", ")),
                hosts,
            ))
        }
    }

    fn supported_formats(&self) -> &'static [OutputFormat] {
        &[OutputFormat::Text]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(stdout: &str) -> RawOutput {
        RawOutput {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    #[test]
    fn one_host_per_line() {
        let records = SubfinderAdapter::default()
            .parse(&raw("api.example.com\n\nWWW.example.com\n"))
            .unwrap();
        assert_eq!(
            records,
            vec![
                NativeRecord::Host("api.example.com".into()),
                NativeRecord::Host("www.example.com".into()),
            ]
        );
    }

    #[test]
    fn garbage_lines_keep_partial_results() {
        let err = SubfinderAdapter::default()
            .parse(&raw("api.example.com\n[WRN] rate limited by source\n"))
            .unwrap_err();
        assert_eq!(err.partial, vec![NativeRecord::Host("api.example.com".into())]);
    }

    #[test]
    fn wildcard_entries_collapse_to_their_zone() {
        let records = SubfinderAdapter::default()
            .parse(&raw("*.dev.example.com\n*\n"))
            .unwrap_err();
        assert_eq!(records.partial, vec![NativeRecord::Host("dev.example.com".into())]);
    }

    #[test]
    fn refuses_ip_targets() {
        let asset = Asset::new(AssetKind::Ip, "10.0.0.1".into(), None, None, 0);
        let module = ScanModule::new("subfinder", "subfinder");
        assert!(SubfinderAdapter::default().build(&asset, &module).is_err());
    }
}
