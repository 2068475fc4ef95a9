//! Tool adapter boundary.
//!
//! Every external scanner is driven through [`ModuleAdapter`]: `build` turns an
//! asset and module definition into an [`Invocation`], `execute` runs it under a
//! cancellation token, and `parse` turns the captured [`RawOutput`] into an
//! ordered list of [`NativeRecord`]s. Adapters never touch shared state; the
//! worker feeds their records to the normalizer.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use vigil_model::{Asset, FailureKind, OutputFormat, ScanModule, Severity};

pub mod nmap;
pub mod nuclei;
pub mod ping;
pub mod process;
pub mod registry;
pub mod subfinder;

pub use nmap::NmapAdapter;
pub use nuclei::NucleiAdapter;
pub use ping::PingAdapter;
pub use registry::AdapterRegistry;
pub use subfinder::SubfinderAdapter;

/// What kind of records an adapter may emit.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Findings,
    Assets,
    Both,
}

impl Capability {
    pub fn produces_findings(self) -> bool {
        matches!(self, Capability::Findings | Capability::Both)
    }

    pub fn produces_assets(self) -> bool {
        matches!(self, Capability::Assets | Capability::Both)
    }
}

/// Fully rendered process invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub target: String,
    /// Time between SIGTERM and a forced kill when the scan is cancelled.
    pub grace: Duration,
}

impl Invocation {
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// A vulnerability or observation reported by a tool.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub title: String,
    pub severity: Severity,
    /// Identity fields that make two observations "the same" across runs.
    /// Only these feed the fingerprint.
    pub signature: BTreeMap<String, Value>,
    /// Everything else worth keeping.
    pub evidence: Value,
}

/// Tool-native record prior to normalization.
#[derive(Clone, Debug, PartialEq)]
pub enum NativeRecord {
    Observation(Observation),
    /// A host name or address discovered by the tool.
    Host(String),
}

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("permission denied executing {0}")]
    PermissionDenied(String),

    #[error("execution cancelled")]
    Cancelled,

    #[error("tool exited with {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },

    #[error("cannot build invocation: {0}")]
    Build(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdapterError {
    /// Classification recorded on the scan.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            AdapterError::ToolNotFound(_) => FailureKind::ToolNotFound,
            AdapterError::PermissionDenied(_) => FailureKind::PermissionDenied,
            AdapterError::Cancelled => FailureKind::Cancelled,
            AdapterError::Exited { .. } | AdapterError::Io(_) => FailureKind::ToolExited,
            AdapterError::Build(_) => FailureKind::Configuration,
        }
    }
}

/// Parse failure that keeps whatever could be recovered.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("parse error: {message} ({} records recovered)", .partial.len())]
pub struct ParseError {
    pub message: String,
    pub partial: Vec<NativeRecord>,
}

impl ParseError {
    pub fn new(message: impl Into<String>, partial: Vec<NativeRecord>) -> Self {
        Self {
            message: message.into(),
            partial,
        }
    }
}

#[async_trait]
pub trait ModuleAdapter: Send + Sync {
    /// Adapter type name matched against `ScanModule::adapter`.
    fn kind(&self) -> &'static str;

    fn capabilities(&self) -> Capability;

    fn supported_formats(&self) -> &'static [OutputFormat] {
        &[OutputFormat::Text]
    }

    fn build(&self, asset: &Asset, module: &ScanModule) -> Result<Invocation, AdapterError>;

    async fn execute(
        &self,
        invocation: &Invocation,
        cancel: CancellationToken,
    ) -> Result<RawOutput, AdapterError> {
        process::run(invocation, cancel).await
    }

    fn parse(&self, raw: &RawOutput) -> Result<Vec<NativeRecord>, ParseError>;
}

impl fmt::Debug for dyn ModuleAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleAdapter")
            .field("kind", &self.kind())
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

/// Render a module's command template for `asset`.
///
/// `{target}` expands to the asset value and `{name}` to `module.options[name]`,
/// falling back to `defaults`. An empty module command uses `fallback`.
pub fn render_command(
    asset: &Asset,
    module: &ScanModule,
    fallback: &[&str],
    defaults: &[(&str, &str)],
    grace: Duration,
) -> Result<Invocation, AdapterError> {
    let template: Vec<String> = if module.command.is_empty() {
        fallback.iter().map(|s| s.to_string()).collect()
    } else {
        module.command.clone()
    };

    let mut rendered = Vec::with_capacity(template.len());
    for part in &template {
        rendered.push(expand(part, asset, module, defaults)?);
    }

    let mut parts = rendered.into_iter();
    let program = parts
        .next()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| AdapterError::Build(format!("module {} has an empty command", module.id)))?;

    tracing::trace!(
        target: "scan::adapter",
        module = %module.id,
        format = %module.output_format,
        program = %program,
        "invocation rendered"
    );

    Ok(Invocation {
        program,
        args: parts.collect(),
        target: asset.value.clone(),
        grace,
    })
}

fn expand(
    part: &str,
    asset: &Asset,
    module: &ScanModule,
    defaults: &[(&str, &str)],
) -> Result<String, AdapterError> {
    let mut out = String::with_capacity(part.len());
    let mut rest = part;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .ok_or_else(|| AdapterError::Build(format!("unterminated placeholder in `{part}`")))?;
        let name = &after[..end];
        let value = if name == "target" {
            asset.value.clone()
        } else if let Some(value) = module.options.get(name) {
            value.clone()
        } else if let Some((_, value)) = defaults.iter().find(|(key, _)| *key == name) {
            value.to_string()
        } else {
            return Err(AdapterError::Build(format!(
                "unknown placeholder `{{{name}}}` in module {}",
                module.id
            )));
        };
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Reject modules whose declared output format the adapter cannot parse.
pub fn check_format(
    adapter: &dyn ModuleAdapter,
    module: &ScanModule,
) -> Result<(), AdapterError> {
    if adapter.supported_formats().contains(&module.output_format) {
        Ok(())
    } else {
        Err(AdapterError::Build(format!(
            "adapter {} cannot parse {} output",
            adapter.kind(),
            module.output_format
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_model::AssetKind;

    fn asset() -> Asset {
        Asset::new(AssetKind::Domain, "example.com".into(), None, None, 0)
    }

    #[test]
    fn renders_target_and_options() {
        let mut module = ScanModule::new("ping", "ping");
        module.command = vec!["ping".into(), "-c".into(), "{count}".into(), "{target}".into()];
        module.options.insert("count".into(), "2".into());
        let inv = render_command(&asset(), &module, &[], &[], Duration::from_secs(1)).unwrap();
        assert_eq!(inv.program, "ping");
        assert_eq!(inv.args, vec!["-c", "2", "example.com"]);
    }

    #[test]
    fn falls_back_to_default_template_and_option_defaults() {
        let module = ScanModule::new("ping", "ping");
        let inv = render_command(
            &asset(),
            &module,
            &["ping", "-c", "{count}", "{target}"],
            &[("count", "4")],
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(inv.command_line(), "ping -c 4 example.com");
    }

    #[test]
    fn unknown_placeholder_is_a_build_error() {
        let mut module = ScanModule::new("x", "x");
        module.command = vec!["tool".into(), "--{nope}".into()];
        let err = render_command(&asset(), &module, &[], &[], Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, AdapterError::Build(_)));
        assert_eq!(err.failure_kind(), FailureKind::Configuration);
    }
}
