use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::{bundle::ScriptEncoding, fanout::DEFAULT_CONCURRENCY};

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

/// Engine settings shared by every operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EngineConfig {
    /// Upper bound on concurrently issued per-object requests.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Recorded as `meta.origin` in exports (usually the tenant URL and realm).
    #[serde(default)]
    pub origin: Option<String>,
    /// Recorded as `meta.exportedBy` in exports.
    #[serde(default)]
    pub exported_by: Option<String>,
    /// Default script encoding for exports.
    #[serde(default)]
    pub script_encoding: ScriptEncoding,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            concurrency: DEFAULT_CONCURRENCY,
            origin: None,
            exported_by: None,
            script_encoding: ScriptEncoding::default(),
        }
    }
}

impl EngineConfig {
    /// Load settings from disk, accepting JSON by default and TOML when the `toml` feature is enabled.
    pub fn load_from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        let txt = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read engine config at {}", path_ref.display()))?;
        Self::parse(&txt).with_context(|| format!("invalid engine config {}", path_ref.display()))
    }

    pub fn parse(txt: &str) -> anyhow::Result<Self> {
        let json_err = match serde_json::from_str::<Self>(txt) {
            Ok(value) => return value.validated(),
            Err(e) => e,
        };

        #[cfg(feature = "toml")]
        {
            if let Ok(value) = toml::from_str::<Self>(txt) {
                return value.validated();
            }
            anyhow::bail!("expected JSON or TOML: {json_err}");
        }

        #[cfg(not(feature = "toml"))]
        {
            anyhow::bail!("expected JSON (enable `toml` feature for TOML support): {json_err}");
        }
    }

    fn validated(self) -> anyhow::Result<Self> {
        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be at least 1");
        }
        Ok(self)
    }
}
