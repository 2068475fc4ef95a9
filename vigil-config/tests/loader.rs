use std::collections::HashMap;
use std::fs;

use tempfile::TempDir;
use vigil_config::{AssetSeed, ConfigSource, VigilConfig};
use vigil_model::{AssetKind, ModuleId, ScanPriority};

const SAMPLE_TOML: &str = r#"
assets = ["example.com", { value = "10.0.0.1", kind = "ip" }]
ignored = ["internal.example.com"]

[orchestrator.worker]
pool_size = 2

[orchestrator.discovery]
max_depth = 1
fan_out_budget = 10

[orchestrator.discovery.policy]
subdomains = ["ports"]

[[modules]]
id = "subdomains"
adapter = "subfinder"

[[modules]]
id = "ports"
adapter = "nmap"
timeout_secs = 120
max_concurrency = 1
options = { host_timeout = "60" }

[[schedules]]
asset = "example.com"
module = "subdomains"
interval_secs = 3600
priority = "P1"
"#;

fn env(vars: &[(&str, String)]) -> impl Fn(&str) -> Option<String> + use<> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    move |key| vars.get(key).cloned()
}

#[test]
fn toml_file_overrides_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vigil.toml");
    fs::write(&path, SAMPLE_TOML).unwrap();

    let config = VigilConfig::load_from_file(&path).unwrap();
    assert_eq!(config.orchestrator.worker.pool_size, 2);
    // Unset sections keep their defaults.
    assert_eq!(config.orchestrator.retry.max_retries, 3);
    assert_eq!(config.orchestrator.discovery.max_depth, 1);
    assert_eq!(
        config.orchestrator.discovery.policy.get(&ModuleId::new("subdomains")),
        Some(&vec![ModuleId::new("ports")])
    );

    assert_eq!(config.modules.len(), 2);
    let ports = &config.modules[1];
    assert_eq!(ports.timeout_secs, 120);
    assert_eq!(ports.options.get("host_timeout").map(String::as_str), Some("60"));
    assert!(ports.enabled);

    assert_eq!(config.assets[0], AssetSeed::Value("example.com".into()));
    assert_eq!(config.assets[1].kind(), Some(AssetKind::Ip));
    assert_eq!(config.schedules[0].priority, ScanPriority::P1);
    assert_eq!(config.schedules[0].interval().as_secs(), 3600);
    assert_eq!(config.ignored, vec!["internal.example.com".to_string()]);
}

#[test]
fn env_path_wins_over_inline_json_and_default_files() {
    let dir = TempDir::new().unwrap();
    let explicit = dir.path().join("custom.toml");
    fs::write(&explicit, SAMPLE_TOML).unwrap();
    fs::write(dir.path().join("vigil.json"), r#"{"ignored": ["x.test"]}"#).unwrap();

    let lookup = env(&[
        ("VIGIL_CONFIG_PATH", explicit.display().to_string()),
        ("VIGIL_CONFIG_JSON", r#"{"ignored": ["y.test"]}"#.to_string()),
    ]);
    let (config, source) = VigilConfig::load_with(lookup, dir.path()).unwrap();
    assert_eq!(source, ConfigSource::EnvPath(explicit));
    assert_eq!(config.modules.len(), 2);
}

#[test]
fn inline_json_is_used_when_no_path_is_set() {
    let dir = TempDir::new().unwrap();
    let lookup = env(&[(
        "VIGIL_CONFIG_JSON",
        r#"{"orchestrator": {"worker": {"pool_size": 9}}}"#.to_string(),
    )]);
    let (config, source) = VigilConfig::load_with(lookup, dir.path()).unwrap();
    assert_eq!(source, ConfigSource::EnvInline);
    assert_eq!(config.orchestrator.worker.pool_size, 9);
    // Modules fall back to the built-in catalog.
    assert_eq!(config.modules.len(), 4);
}

#[test]
fn default_file_candidates_are_discovered() {
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join("config")).unwrap();
    let path = dir.path().join("config/vigil.json");
    fs::write(&path, r#"{"ignored": ["x.test"]}"#).unwrap();

    let (config, source) = VigilConfig::load_with(env(&[]), dir.path()).unwrap();
    assert_eq!(source, ConfigSource::File(path));
    assert_eq!(config.ignored, vec!["x.test".to_string()]);
}

#[test]
fn falls_back_to_defaults() {
    let dir = TempDir::new().unwrap();
    let (config, source) = VigilConfig::load_with(env(&[]), dir.path()).unwrap();
    assert_eq!(source, ConfigSource::Default);
    assert_eq!(config.modules.len(), 4);
    assert_eq!(
        config.orchestrator.discovery.policy.get(&ModuleId::new("subfinder")),
        Some(&vec![ModuleId::new("nmap")])
    );
}

#[test]
fn extensionless_files_try_toml_then_json() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vigilrc");
    fs::write(&path, r#"{"ignored": ["z.test"]}"#).unwrap();
    let config = VigilConfig::load_from_file(&path).unwrap();
    assert_eq!(config.ignored, vec!["z.test".to_string()]);

    fs::write(&path, "this is = = not config").unwrap();
    let err = VigilConfig::load_from_file(&path).unwrap_err();
    assert!(err.to_string().contains("toml error"));
}

#[test]
fn missing_file_reports_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent.toml");
    let err = VigilConfig::load_from_file(&path).unwrap_err();
    assert!(format!("{err:#}").contains("absent.toml"));
}
