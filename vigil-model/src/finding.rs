use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ModelError;
use crate::ids::{AssetId, FindingId, ModuleId, ScanId};

/// Ordered from least to most severe so `>=` expresses "at least".
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl FromStr for Severity {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" | "informational" => Ok(Severity::Info),
            "low" => Ok(Severity::Low),
            "medium" | "moderate" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(ModelError::InvalidSeverity(other.to_string())),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(label)
    }
}

/// Normalized, deduplicated observation. `fingerprint` is unique per
/// `(asset_id, module_id)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: FindingId,
    pub asset_id: AssetId,
    pub module_id: ModuleId,
    pub fingerprint: String,
    pub severity: Severity,
    pub title: String,
    pub evidence: Value,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrence_count: u64,
    /// Most recent scan that observed this finding.
    pub last_scan: Option<ScanId>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingFilter {
    pub asset: Option<AssetId>,
    pub module: Option<ModuleId>,
    /// Minimum severity.
    pub severity: Option<Severity>,
    /// Only findings seen at or after this instant.
    pub since: Option<DateTime<Utc>>,
}

impl FindingFilter {
    pub fn matches(&self, finding: &Finding) -> bool {
        if self.asset.is_some_and(|asset| asset != finding.asset_id) {
            return false;
        }
        if self
            .module
            .as_ref()
            .is_some_and(|module| module != &finding.module_id)
        {
            return false;
        }
        if self.severity.is_some_and(|min| finding.severity < min) {
            return false;
        }
        if self.since.is_some_and(|since| finding.last_seen < since) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn finding(severity: Severity) -> Finding {
        let now = Utc::now();
        Finding {
            id: FindingId::new(),
            asset_id: AssetId::new(),
            module_id: ModuleId::from("nuclei"),
            fingerprint: "abc".into(),
            severity,
            title: "t".into(),
            evidence: json!({}),
            first_seen: now,
            last_seen: now,
            occurrence_count: 1,
            last_scan: None,
        }
    }

    #[test]
    fn severity_parses_aliases() {
        assert_eq!("CRITICAL".parse::<Severity>().unwrap(), Severity::Critical);
        assert_eq!("informational".parse::<Severity>().unwrap(), Severity::Info);
        assert!("bogus".parse::<Severity>().is_err());
    }

    #[test]
    fn filter_applies_minimum_severity() {
        let filter = FindingFilter {
            severity: Some(Severity::High),
            ..Default::default()
        };
        assert!(filter.matches(&finding(Severity::Critical)));
        assert!(!filter.matches(&finding(Severity::Medium)));
    }

    #[test]
    fn filter_by_module_and_asset() {
        let f = finding(Severity::Low);
        let filter = FindingFilter {
            asset: Some(f.asset_id),
            module: Some(ModuleId::from("nuclei")),
            ..Default::default()
        };
        assert!(filter.matches(&f));
        let other = FindingFilter {
            module: Some(ModuleId::from("nmap")),
            ..Default::default()
        };
        assert!(!other.matches(&f));
    }
}
