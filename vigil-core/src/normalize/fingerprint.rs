//! Versioned finding fingerprints.
//!
//! v1 hashes, with SHA-256, the UTF-8 text
//!
//! ```text
//! vigil-fp:v1
//! {asset_kind}:{asset_value}
//! {module_id}
//! {title}
//! {canonical signature json}
//! ```
//!
//! Assets and modules are identified by their canonical value and slug, never
//! by generated ids, so fingerprints compare across deployments. The
//! signature is serialized with object keys sorted at every level and no
//! insignificant whitespace.

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};
use vigil_model::{Asset, ModuleId};

pub const FINGERPRINT_VERSION: &str = "vigil-fp:v1";

pub fn fingerprint(
    asset: &Asset,
    module: &ModuleId,
    title: &str,
    signature: &BTreeMap<String, Value>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(FINGERPRINT_VERSION.as_bytes());
    hasher.update(b"\n");
    hasher.update(asset.canonical_key().as_bytes());
    hasher.update(b"\n");
    hasher.update(module.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(title.trim().as_bytes());
    hasher.update(b"\n");
    let object = Value::Object(signature.clone().into_iter().collect());
    hasher.update(canonical_json(&object).as_bytes());
    hex::encode(hasher.finalize())
}

/// Serialize `value` with sorted object keys regardless of map ordering.
///
/// Objects are rebuilt in key order so the output is the same whether or not
/// serde_json's `preserve_order` feature is enabled somewhere in the build.
pub fn canonical_json(value: &Value) -> String {
    sorted(value).to_string()
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, inner)| (key.clone(), sorted(inner)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        scalar => scalar.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vigil_model::AssetKind;

    fn asset(value: &str) -> Asset {
        Asset::new(AssetKind::Domain, value.into(), None, None, 0)
    }

    fn signature(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn independent_of_asset_id_and_field_order() {
        let module = ModuleId::from("nmap");
        let a = fingerprint(
            &asset("example.com"),
            &module,
            "Open Port 22/tcp - ssh",
            &signature(&[("port", json!(22)), ("meta", json!({"b": 1, "a": 2}))]),
        );
        let b = fingerprint(
            &asset("example.com"),
            &module,
            "Open Port 22/tcp - ssh",
            &signature(&[("meta", json!({"a": 2, "b": 1})), ("port", json!(22))]),
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn differs_by_asset_and_module() {
        let sig = signature(&[("port", json!(22))]);
        let base = fingerprint(&asset("example.com"), &ModuleId::from("nmap"), "t", &sig);
        assert_ne!(
            base,
            fingerprint(&asset("example.org"), &ModuleId::from("nmap"), "t", &sig)
        );
        assert_ne!(
            base,
            fingerprint(&asset("example.com"), &ModuleId::from("nuclei"), "t", &sig)
        );
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        assert_eq!(
            canonical_json(&json!({"z": [{"y": 1, "x": null}], "a": "s"})),
            r#"{"a":"s","z":[{"x":null,"y":1}]}"#
        );
    }
}
