use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::ids::{AssetId, ScanId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Domain,
    Subdomain,
    Ip,
}

impl AssetKind {
    /// Infer the kind of a normalized value. Two-label names are treated as
    /// registrable domains; anything deeper is a subdomain.
    pub fn classify(value: &str) -> AssetKind {
        if value.parse::<IpAddr>().is_ok() {
            AssetKind::Ip
        } else if value.split('.').count() > 2 {
            AssetKind::Subdomain
        } else {
            AssetKind::Domain
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetKind::Domain => write!(f, "domain"),
            AssetKind::Subdomain => write!(f, "subdomain"),
            AssetKind::Ip => write!(f, "ip"),
        }
    }
}

/// Canonical network entity tracked by the registry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    pub kind: AssetKind,
    /// Normalized lowercase value; `(kind, value)` is unique.
    pub value: String,
    /// Root domain for subdomains.
    pub parent: Option<AssetId>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Scan that created the asset. `None` for user-added assets.
    pub discovered_by: Option<ScanId>,
    /// Distance from a user-added root in the discovery graph.
    pub depth: u32,
}

impl Asset {
    pub fn new(
        kind: AssetKind,
        value: String,
        parent: Option<AssetId>,
        discovered_by: Option<ScanId>,
        depth: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: AssetId::new(),
            kind,
            value,
            parent,
            first_seen: now,
            last_seen: now,
            discovered_by,
            depth,
        }
    }

    /// Stable identity used in fingerprints. Independent of the deployment's
    /// generated ids.
    pub fn canonical_key(&self) -> String {
        format!("{}:{}", self.kind, self.value)
    }
}

/// Trim, strip a trailing root dot and lowercase a raw host value.
pub fn normalize_value(raw: &str) -> Result<String, ModelError> {
    let trimmed = raw.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(ModelError::InvalidAsset(raw.to_string()));
    }
    if trimmed.parse::<IpAddr>().is_ok() {
        return Ok(trimmed.to_string());
    }
    // Hostname characters only; wildcards and URLs are not assets.
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(ModelError::InvalidAsset(raw.to_string()));
    }
    if trimmed.split('.').any(str::is_empty) {
        return Err(ModelError::InvalidAsset(raw.to_string()));
    }
    Ok(trimmed.to_ascii_lowercase())
}

/// Registrable root of a normalized subdomain (last two labels).
pub fn root_domain(value: &str) -> Option<String> {
    let labels: Vec<&str> = value.split('.').collect();
    if labels.len() < 3 {
        return None;
    }
    Some(labels[labels.len() - 2..].join("."))
}
