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

const DEFAULT_COMMAND: &[&str] = &["nuclei", "-u", "{target}", "-silent", "-nc"];

/// `[template-id] [protocol] [severity] matched-at [extra]`
static RESULT_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[(.*?)\] \[(.*?)\] \[(.*?)\] (.*?)(?:\s+\[(.*?)\])?$")
        .expect("nuclei result regex should compile")
});

/// Template based vulnerability scanner.
#[derive(Debug, Clone)]
pub struct NucleiAdapter {
    grace: Duration,
}

impl Default for NucleiAdapter {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl NucleiAdapter {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }
}

#[async_trait::async_trait]
impl ModuleAdapter for NucleiAdapter {
    fn kind(&self) -> &'static str {
        "nuclei"
    }

    fn capabilities(&self) -> Capability {
        Capability::Findings
    }

    fn build(&self, asset: &Asset, module: &ScanModule) -> Result<Invocation, AdapterError> {
        check_format(self, module)?;
        render_command(asset, module, DEFAULT_COMMAND, &[], self.grace)
    }

    fn parse(&self, raw: &RawOutput) -> Result<Vec<NativeRecord>, ParseError> {
        let mut records = Vec::new();
        let mut rejected = 0usize;

        for line in raw.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let Some(caps) = RESULT_LINE.captures(line) else {
                rejected += 1;
                continue;
            };
            let template = caps[1].to_string();
            let protocol = caps[2].to_string();
            // Unknown labels such as `unknown` are kept as informational.
            let severity = caps[3].parse().unwrap_or(Severity::Info);
            let matched_at = caps[4].trim().to_string();
            let extra = caps.get(5).map(|m| m.as_str().to_string());

            let mut signature = BTreeMap::new();
            signature.insert("template".to_string(), json!(template));
            signature.insert("protocol".to_string(), json!(protocol));
            signature.insert("matched_at".to_string(), json!(matched_at));
            if let Some(extra) = &extra {
                signature.insert("extra".to_string(), json!(extra));
            }

            records.push(NativeRecord::Observation(Observation {
                title: format!("{template} ({protocol})"),
                severity,
                signature,
                evidence: json!({
                    "severity_label": &caps[3],
                    "line": line,
                }),
            }));
        }

        if rejected > 0 {
            return Err(ParseError::new(
                format!("{rejected} lines did not match the nuclei result format"),
                records,
            ));
        }
        Ok(records)
    }
}
