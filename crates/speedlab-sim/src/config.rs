use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::capture::CaptureOptions;
use crate::error::ConfigurationError;
use crate::normalize::NormalizeOptions;
use crate::session::SessionOptions;
use crate::topology::{LinkShaping, Topology};
use crate::workload::Workload;

pub const CONFIG_VERSION: u32 = 1;

/// Largest link rate accepted from a lab file (100 Gbit/s).
pub const MAX_BANDWIDTH_MBIT: u64 = 100_000;

/// Largest delay or jitter accepted from a lab file.
pub const MAX_DELAY_MS: u64 = 60_000;

/// Lab used when no config file is given: two hosts on a 100 Mbit/s,
/// 100 ms link, a traffic source and the program under test on `left_h`.
pub const DEFAULT_CONFIG: &str = r#"
version = 1
endpoints = ["left_h", "right_h"]

[[links]]
a = "left_h"
b = "right_h"
bandwidth_mbit = 100
delay_ms = 100

[normalize]
offloads = ["tx", "rx"]

[[workloads]]
name = "traffic"
endpoint = "left_h"
command = "yes | nc -l 0.0.0.0 8000"

[[workloads]]
name = "smol-speed"
endpoint = "left_h"
command = "./target/release/smol-speed"
stdout = "out.txt"
stderr = "err.txt"
"#;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LabConfigInput {
    pub version: u32,
    pub output_dir: Option<PathBuf>,
    pub endpoints: Vec<String>,
    pub links: Vec<LinkConfigInput>,
    pub normalize: NormalizeConfigInput,
    pub capture: CaptureConfigInput,
    pub workloads: Vec<WorkloadConfigInput>,
    pub backend: BackendConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkConfigInput {
    pub a: String,
    pub b: String,
    pub bandwidth_mbit: u64,
    pub delay_ms: u64,
    pub jitter_ms: Option<u64>,
    pub loss_percent: Option<f32>,
    pub queue_limit: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NormalizeConfigInput {
    pub offloads: Option<Vec<String>>,
    pub flush_addresses: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfigInput {
    pub enabled: Option<bool>,
    pub program: Option<String>,
    pub args: Vec<String>,
    pub ready_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkloadConfigInput {
    pub name: Option<String>,
    pub endpoint: String,
    pub command: String,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub workdir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfigInput {
    pub namespace_prefix: Option<String>,
    pub use_sudo: Option<bool>,
    pub assign_addresses: Option<bool>,
    pub terminate_grace_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub namespace_prefix: String,
    pub use_sudo: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            namespace_prefix: "speedlab-".into(),
            use_sudo: true,
        }
    }
}

/// A fully validated lab description.
#[derive(Debug, Clone)]
pub struct LabConfig {
    pub version: u32,
    pub output_dir: PathBuf,
    pub topology: Topology,
    pub normalize: NormalizeOptions,
    /// `None` when capture is disabled.
    pub capture: Option<CaptureOptions>,
    pub workloads: Vec<Workload>,
    pub backend: BackendConfig,
    pub session: SessionOptions,
}

impl LabConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigurationError> {
        LabConfigInput::from_toml_str(input)?.resolve()
    }

    pub fn builtin() -> Result<Self, ConfigurationError> {
        Self::from_toml_str(DEFAULT_CONFIG)
    }
}

impl LabConfigInput {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigurationError> {
        toml::from_str(input).map_err(|e| ConfigurationError::Parse(e.to_string()))
    }

    pub fn resolve(self) -> Result<LabConfig, ConfigurationError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigurationError::UnsupportedVersion(version));
        }

        let mut builder = Topology::builder();
        for name in &self.endpoints {
            builder = builder.endpoint(name.trim());
        }
        for (idx, link) in self.links.into_iter().enumerate() {
            if link.bandwidth_mbit > MAX_BANDWIDTH_MBIT {
                return Err(ConfigurationError::Invalid(format!(
                    "link {idx}: bandwidth_mbit {} exceeds {MAX_BANDWIDTH_MBIT}",
                    link.bandwidth_mbit
                )));
            }
            let timings = [("delay_ms", Some(link.delay_ms)), ("jitter_ms", link.jitter_ms)];
            for (field, value) in timings {
                if let Some(ms) = value.filter(|ms| *ms > MAX_DELAY_MS) {
                    return Err(ConfigurationError::Invalid(format!(
                        "link {idx}: {field} {ms} exceeds {MAX_DELAY_MS}"
                    )));
                }
            }
            let mut shaping =
                LinkShaping::new(link.bandwidth_mbit, Duration::from_millis(link.delay_ms));
            if let Some(jitter) = link.jitter_ms {
                shaping = shaping.with_jitter(Duration::from_millis(jitter));
            }
            if let Some(loss) = link.loss_percent {
                if !(0.0..=100.0).contains(&loss) {
                    return Err(ConfigurationError::Invalid(format!(
                        "loss_percent {loss} outside 0..=100"
                    )));
                }
                shaping = shaping.with_loss(loss);
            }
            if let Some(limit) = link.queue_limit {
                shaping = shaping.with_queue_limit(limit);
            }
            builder = builder.link(link.a.trim(), link.b.trim(), shaping);
        }
        let topology = builder.build()?;

        let normalize = {
            let defaults = NormalizeOptions::default();
            let offloads: Vec<String> = self
                .normalize
                .offloads
                .unwrap_or(defaults.offloads)
                .into_iter()
                .map(|o| o.trim().to_string())
                .collect();
            if offloads.iter().any(String::is_empty) {
                return Err(ConfigurationError::Invalid(
                    "offload feature names must not be empty".into(),
                ));
            }
            NormalizeOptions {
                offloads,
                flush_addresses: self
                    .normalize
                    .flush_addresses
                    .unwrap_or(defaults.flush_addresses),
            }
        };

        let capture = if self.capture.enabled.unwrap_or(true) {
            let defaults = CaptureOptions::default();
            Some(CaptureOptions {
                program: self.capture.program.unwrap_or(defaults.program),
                extra_args: self.capture.args,
                ready_timeout: self
                    .capture
                    .ready_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.ready_timeout),
                poll_interval: defaults.poll_interval,
            })
        } else {
            None
        };

        let mut labels = HashSet::new();
        let mut workloads = Vec::with_capacity(self.workloads.len());
        for (idx, w) in self.workloads.into_iter().enumerate() {
            let label = w
                .name
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| format!("workload-{idx}"));
            if !labels.insert(label.clone()) {
                return Err(ConfigurationError::Invalid(format!(
                    "workload name {label} used more than once"
                )));
            }
            let endpoint = w.endpoint.trim().to_string();
            if topology.endpoint(&endpoint).is_none() {
                return Err(ConfigurationError::UnknownWorkloadEndpoint {
                    workload: label,
                    endpoint,
                });
            }
            if w.command.trim().is_empty() {
                return Err(ConfigurationError::Invalid(format!(
                    "workload {label} has an empty command"
                )));
            }
            workloads.push(Workload {
                label,
                endpoint,
                command: w.command,
                stdout: w.stdout,
                stderr: w.stderr,
                workdir: w.workdir,
            });
        }

        let backend_defaults = BackendConfig::default();
        let session_defaults = SessionOptions::default();
        Ok(LabConfig {
            version,
            output_dir: self.output_dir.unwrap_or_else(|| PathBuf::from(".")),
            topology,
            normalize,
            capture,
            workloads,
            backend: BackendConfig {
                namespace_prefix: self
                    .backend
                    .namespace_prefix
                    .unwrap_or(backend_defaults.namespace_prefix),
                use_sudo: self.backend.use_sudo.unwrap_or(backend_defaults.use_sudo),
            },
            session: SessionOptions {
                assign_addresses: self
                    .backend
                    .assign_addresses
                    .unwrap_or(session_defaults.assign_addresses),
                terminate_grace: self
                    .backend
                    .terminate_grace_ms
                    .map(Duration::from_millis)
                    .unwrap_or(session_defaults.terminate_grace),
            },
        })
    }
}
