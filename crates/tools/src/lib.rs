//! Whitelist catalog of executable tools and the argument validation gate.
//!
//! The registry is built once from configuration at provider start and is
//! read-only afterwards — it is shared as a plain `Arc` with no locks.
//! Caller-supplied argument bags are loose JSON; nothing reaches the
//! subprocess boundary until [`ToolRegistry::validate_args`] has turned
//! the bag into typed [`ArgValue`]s against the tool's declared specs.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use hireling_types::Cents;

// ── Argument specs ───────────────────────────────────────────────────────────

/// Declared type of a tool argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArgType {
    String,
    Number,
    Boolean,
    FilePath,
}

impl std::fmt::Display for ArgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ArgType::String => "string",
            ArgType::Number => "number",
            ArgType::Boolean => "boolean",
            ArgType::FilePath => "file-path",
        };
        f.write_str(s)
    }
}

/// Describes a single argument a tool accepts, with its optional
/// validation constraints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub arg_type: ArgType,
    #[serde(default)]
    pub required: bool,
    /// Lower bound, numbers only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Upper bound, numbers only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Closed set of permitted values, strings only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<String>,
    /// Regex the value must match in full, strings only.  Compiled once at
    /// registry build; a bad pattern is a startup error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl ArgSpec {
    pub fn required(name: impl Into<String>, arg_type: ArgType) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            arg_type,
            required: true,
            min: None,
            max: None,
            allowed_values: Vec::new(),
            pattern: None,
        }
    }

    pub fn optional(name: impl Into<String>, arg_type: ArgType) -> Self {
        Self {
            required: false,
            ..Self::required(name, arg_type)
        }
    }
}

/// Best-effort resource ceilings for a tool's subprocess.  Memory and
/// disk-write translate to rlimits on unix; CPU percent is advisory only.
/// The hard guarantee is always the wall-clock limit, never these.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceCaps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_percent: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_disk_write_mb: Option<u64>,
}

/// One whitelisted tool.  Loaded from configuration at provider start and
/// never mutated at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique key agents invoke the tool by.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Program to execute, optionally with leading fixed arguments
    /// (whitespace-split).  Validated argument values are appended in
    /// declared order.
    pub command: String,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
    /// Hard wall-clock limit.
    pub max_duration_secs: u64,
    /// Billing rate in cents per minute of effective execution time.
    pub price_per_minute: Cents,
    #[serde(default)]
    pub caps: ResourceCaps,
}

impl ToolDefinition {
    /// Worst-case billed milliseconds: the tool's full wall-clock limit.
    pub fn max_duration_ms(&self) -> u64 {
        self.max_duration_secs.saturating_mul(1_000)
    }
}

// ── Validated values ─────────────────────────────────────────────────────────

/// A caller-supplied value after it has passed validation.  The tagged
/// variant is the only argument representation the execution engine
/// accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    String(String),
    Number(f64),
    Boolean(bool),
    FilePath(String),
}

impl ArgValue {
    /// Render the value as a process argument.  Whole numbers drop the
    /// trailing `.0` so `sleep 5` is spelled the way the binary expects.
    pub fn render(&self) -> String {
        match self {
            ArgValue::String(s) | ArgValue::FilePath(s) => s.clone(),
            ArgValue::Boolean(b) => b.to_string(),
            ArgValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
        }
    }
}

/// Arguments in the tool's declared order, ready for argv assembly.
#[derive(Debug, Clone, Default)]
pub struct ValidatedArgs {
    values: Vec<(String, ArgValue)>,
}

impl ValidatedArgs {
    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Declared-order iteration, exactly as the argv will be built.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgValue)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// JSON object form for the execution record.
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .values
            .iter()
            .map(|(n, v)| {
                let value = match v {
                    ArgValue::String(s) | ArgValue::FilePath(s) => {
                        serde_json::Value::String(s.clone())
                    }
                    ArgValue::Number(n) => serde_json::json!(n),
                    ArgValue::Boolean(b) => serde_json::Value::Bool(*b),
                };
                (n.clone(), value)
            })
            .collect();
        serde_json::Value::Object(map)
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Argument validation failures.  Always recoverable by the caller
/// correcting its input.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required argument '{0}'")]
    MissingRequired(String),
    #[error("argument '{arg}' must be a {expected}")]
    WrongType { arg: String, expected: ArgType },
    #[error("argument '{arg}' is out of range ({value} not in [{min}, {max}])")]
    OutOfRange {
        arg: String,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("argument '{arg}' value '{value}' is not one of the allowed values")]
    NotAllowed { arg: String, value: String },
    #[error("argument '{arg}' does not match the required pattern")]
    PatternMismatch { arg: String },
    #[error("unknown argument '{0}'")]
    UnknownArgument(String),
}

/// Registry construction failures: a misconfigured whitelist is a startup
/// error, never a request-time surprise.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate tool id '{0}'")]
    DuplicateToolId(String),
    #[error("tool '{0}' has an empty command")]
    EmptyCommand(String),
    #[error("tool '{0}' has a zero wall-clock limit")]
    ZeroDuration(String),
    #[error("tool '{tool}' argument '{arg}': invalid pattern: {source}")]
    InvalidPattern {
        tool: String,
        arg: String,
        #[source]
        source: Box<regex::Error>,
    },
    #[error("tool '{tool}' argument '{arg}': {detail}")]
    BadConstraint {
        tool: String,
        arg: String,
        detail: String,
    },
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// The provider's whitelist.  `new` validates every definition and
/// compiles every declared pattern up front.
#[derive(Debug)]
pub struct ToolRegistry {
    tools: Vec<ToolDefinition>,
    patterns: HashMap<(String, String), Regex>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<ToolDefinition>) -> Result<Self, RegistryError> {
        let mut patterns = HashMap::new();
        let mut seen: Vec<&str> = Vec::new();

        for tool in &tools {
            if seen.contains(&tool.id.as_str()) {
                return Err(RegistryError::DuplicateToolId(tool.id.clone()));
            }
            seen.push(&tool.id);

            if tool.command.trim().is_empty() {
                return Err(RegistryError::EmptyCommand(tool.id.clone()));
            }
            if tool.max_duration_secs == 0 {
                return Err(RegistryError::ZeroDuration(tool.id.clone()));
            }

            for spec in &tool.args {
                let numeric = spec.arg_type == ArgType::Number;
                let textual = matches!(spec.arg_type, ArgType::String | ArgType::FilePath);

                if (spec.min.is_some() || spec.max.is_some()) && !numeric {
                    return Err(RegistryError::BadConstraint {
                        tool: tool.id.clone(),
                        arg: spec.name.clone(),
                        detail: "min/max only apply to number arguments".into(),
                    });
                }
                if (!spec.allowed_values.is_empty() || spec.pattern.is_some()) && !textual {
                    return Err(RegistryError::BadConstraint {
                        tool: tool.id.clone(),
                        arg: spec.name.clone(),
                        detail: "allowed_values/pattern only apply to string arguments".into(),
                    });
                }
                if let Some(raw) = &spec.pattern {
                    // Anchor so the value must match in full.
                    let regex = Regex::new(&format!("^(?:{raw})$")).map_err(|source| {
                        RegistryError::InvalidPattern {
                            tool: tool.id.clone(),
                            arg: spec.name.clone(),
                            source: Box::new(source),
                        }
                    })?;
                    patterns.insert((tool.id.clone(), spec.name.clone()), regex);
                }
            }
        }

        Ok(Self { tools, patterns })
    }

    pub fn lookup(&self, tool_id: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|t| t.id == tool_id)
    }

    pub fn list(&self) -> &[ToolDefinition] {
        &self.tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate a caller's raw argument bag against `tool`'s specs.
    ///
    /// Checks, in order per declared argument: presence of required
    /// values, JSON type against the declared [`ArgType`], numeric
    /// min/max, allowed-values membership, and full-match pattern.
    /// Supplied names that the tool never declared are rejected outright.
    pub fn validate_args(
        &self,
        tool: &ToolDefinition,
        supplied: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<ValidatedArgs, ValidationError> {
        for name in supplied.keys() {
            if !tool.args.iter().any(|spec| &spec.name == name) {
                return Err(ValidationError::UnknownArgument(name.clone()));
            }
        }

        let mut values = Vec::new();
        for spec in &tool.args {
            let Some(raw) = supplied.get(&spec.name) else {
                if spec.required {
                    return Err(ValidationError::MissingRequired(spec.name.clone()));
                }
                continue;
            };
            let value = self.check_value(tool, spec, raw)?;
            values.push((spec.name.clone(), value));
        }
        Ok(ValidatedArgs { values })
    }

    fn check_value(
        &self,
        tool: &ToolDefinition,
        spec: &ArgSpec,
        raw: &serde_json::Value,
    ) -> Result<ArgValue, ValidationError> {
        let wrong_type = || ValidationError::WrongType {
            arg: spec.name.clone(),
            expected: spec.arg_type,
        };

        match spec.arg_type {
            ArgType::Number => {
                let value = raw.as_f64().ok_or_else(wrong_type)?;
                let min = spec.min.unwrap_or(f64::NEG_INFINITY);
                let max = spec.max.unwrap_or(f64::INFINITY);
                if value < min || value > max {
                    return Err(ValidationError::OutOfRange {
                        arg: spec.name.clone(),
                        value,
                        min,
                        max,
                    });
                }
                Ok(ArgValue::Number(value))
            }
            ArgType::Boolean => {
                let value = raw.as_bool().ok_or_else(wrong_type)?;
                Ok(ArgValue::Boolean(value))
            }
            ArgType::String | ArgType::FilePath => {
                let value = raw.as_str().ok_or_else(wrong_type)?;
                if !spec.allowed_values.is_empty()
                    && !spec.allowed_values.iter().any(|v| v == value)
                {
                    return Err(ValidationError::NotAllowed {
                        arg: spec.name.clone(),
                        value: value.to_string(),
                    });
                }
                if let Some(regex) = self.patterns.get(&(tool.id.clone(), spec.name.clone())) {
                    if !regex.is_match(value) {
                        return Err(ValidationError::PatternMismatch {
                            arg: spec.name.clone(),
                        });
                    }
                }
                Ok(match spec.arg_type {
                    ArgType::FilePath => ArgValue::FilePath(value.to_string()),
                    _ => ArgValue::String(value.to_string()),
                })
            }
        }
    }
}
