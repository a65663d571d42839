//! Provider configuration: identity, listening port, workspace root, the
//! billing split, telemetry, and the tool whitelist itself.
//!
//! Loaded once at provider start and immutable thereafter.  Every section
//! has full defaults so a missing or partial file still yields a runnable
//! config; environment overrides are applied after the file is read.

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use hireling_tools::{ToolDefinition, ToolRegistry};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Identity this provider settles under.
    pub id: String,
    pub display_name: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            id: "provider-local".to_string(),
            display_name: "Local Provider".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Overridden at runtime by `HIRELING_PORT` when set.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 7700,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Session workspaces are created as `<root>/<session-id>/`.
    /// Overridden at runtime by `HIRELING_WORKSPACE_ROOT` when set.
    pub root: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: "/tmp/hireling-workspaces".to_string(),
        }
    }
}

/// Settlement split percentages.  Must sum to exactly 100; `validate`
/// fails loudly otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    pub provider_pct: u32,
    pub platform_pct: u32,
    pub reserve_pct: u32,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            provider_pct: 90,
            platform_pct: 7,
            reserve_pct: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Overridden at runtime by `HIRELING_LOG` when set.
    pub log_level: String,
    /// When set, a daily-rotating log file is written here in addition to
    /// stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub provider: ProviderConfig,
    pub server: ServerConfig,
    pub workspace: WorkspaceConfig,
    pub billing: BillingConfig,
    pub telemetry: TelemetryConfig,
    /// The whitelist: `[[tool]]` tables in the TOML file.
    #[serde(rename = "tool")]
    pub tools: Vec<ToolDefinition>,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("HIRELING_PORT") {
            if !value.is_empty() {
                config.server.port = value
                    .parse()
                    .with_context(|| format!("HIRELING_PORT is not a port number: '{value}'"))?;
            }
        }
        if let Ok(value) = env::var("HIRELING_WORKSPACE_ROOT") {
            if !value.is_empty() {
                config.workspace.root = value;
            }
        }
        if let Ok(value) = env::var("HIRELING_LOG") {
            if !value.is_empty() {
                config.telemetry.log_level = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Startup validation: the split must sum to 100, the workspace root
    /// must be set, and every whitelist entry must produce a valid
    /// registry (unique ids, compilable patterns, sane limits).
    pub fn validate(&self) -> Result<()> {
        let sum = self.billing.provider_pct + self.billing.platform_pct + self.billing.reserve_pct;
        if sum != 100 {
            bail!("billing split sums to {sum}, expected exactly 100");
        }
        if self.workspace.root.trim().is_empty() {
            bail!("workspace.root must not be empty");
        }
        self.build_registry()?;
        Ok(())
    }

    /// Compile the whitelist into a ready registry.
    pub fn build_registry(&self) -> Result<ToolRegistry> {
        ToolRegistry::new(self.tools.clone()).context("invalid tool whitelist")
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
