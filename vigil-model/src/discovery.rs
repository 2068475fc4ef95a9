use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AssetId, ScanId};

/// Provenance link: `scan` running against `parent` discovered `child`.
/// `depth` is always the parent's depth plus one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryEdge {
    pub parent: AssetId,
    pub child: AssetId,
    pub scan: ScanId,
    pub depth: u32,
    pub created_at: DateTime<Utc>,
}
