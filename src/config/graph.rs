//! Type definitions for the static configuration graph.
//!
//! The graph describes worker servers and their instances, and the pipeline
//! topology: stages, jobs, their worker endpoint bindings, declared input
//! parts and declared result-output encodings. It is loaded once at process
//! start and read-only thereafter.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Default bounded timeout for dispatch/cancel/status calls, in seconds.
///
/// Dispatch is a hand-off, not the job's execution, so this stays short.
pub const DEFAULT_DISPATCH_TIMEOUT_SECS: u64 = 10;

/// Default bounded timeout for health probes, in seconds.
pub const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 2;

/// A logical external worker service with one or more instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Minimum number of instances expected to be up. When this equals the
    /// total instance count, health filtering is skipped entirely and the
    /// static configuration is trusted.
    #[serde(default)]
    pub min_up: usize,
    /// Relative health-check endpoint, e.g. `/actuator/health`.
    #[serde(default = "default_health_endpoint")]
    pub health_endpoint: String,
    /// Health probe timeout in seconds.
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,
    /// Deployed instances, in configuration order (used as the tie-break
    /// when ranking by load).
    pub instances: Vec<InstanceConfig>,
}

fn default_health_endpoint() -> String {
    "/actuator/health".to_string()
}

fn default_health_timeout() -> u64 {
    DEFAULT_HEALTH_TIMEOUT_SECS
}

/// One deployed, independently health-checked endpoint of a worker server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Unique instance name within its server.
    pub name: String,
    /// Base URL of the instance.
    pub url: String,
    /// Declared maximum number of parallel processes.
    pub max_parallel: usize,
    /// Host the worker should call back on; overrides the graph-wide
    /// callback base when set.
    #[serde(default)]
    pub callback_host: Option<String>,
}

/// Relative endpoint templates for one job. The status and cancel templates
/// contain a `{id}` placeholder substituted with the worker-assigned id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEndpoints {
    pub start: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub cancel: Option<String>,
}

/// Where a job's input dataset comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// The most recently produced dataset, walking preceding stages and
    /// processes backward; falls back to the project's original dataset.
    LastOrOriginal,
    /// The dataset produced by a specific named job.
    Job(String),
}

/// Declaration of one named input part sent with the start request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputPart {
    /// Multipart part name.
    pub part: String,
    /// Dataset selector.
    #[serde(default = "default_source")]
    pub source: DataSource,
    /// Hold-out filter applied when exporting the input.
    #[serde(default)]
    pub hold_out: HoldOutSelectorConfig,
}

fn default_source() -> DataSource {
    DataSource::LastOrOriginal
}

/// Hold-out filter declared in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldOutSelectorConfig {
    #[default]
    All,
    HoldOut,
    NotHoldOut,
}

/// How a named result part delivered by the worker is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputEncoding {
    /// Raw tabular rows parsed against the source dataset schema.
    Data,
    /// A fully-typed serialized dataset carrying its own schema.
    DataSet,
    /// A failure payload even though transport succeeded.
    Error,
    /// A plain-text failure message.
    ErrorMessage,
    /// Stored verbatim as a named result blob.
    File,
}

/// Declaration of one named result part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputPart {
    /// Multipart part name.
    pub part: String,
    /// Interpretation of the part's payload.
    pub encoding: OutputEncoding,
}

/// One configured unit of work bound to an external worker endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobGraph {
    /// Unique job name within its stage.
    pub name: String,
    /// Target worker server; `None` marks the job NOT_REQUIRED (no external
    /// step).
    #[serde(default)]
    pub server: Option<String>,
    /// Endpoint templates, relative to the bound instance's base URL.
    #[serde(default)]
    pub endpoints: Option<JobEndpoints>,
    /// Declared input parts.
    #[serde(default)]
    pub inputs: Vec<InputPart>,
    /// Declared result-output encodings by part name.
    #[serde(default)]
    pub outputs: Vec<OutputPart>,
    /// The job depends on a generated hold-out split; without one it is
    /// skipped with a descriptive status instead of being dispatched.
    #[serde(default)]
    pub requires_hold_out: bool,
    /// Default skip flag applied when the pipeline is instantiated.
    #[serde(default)]
    pub skip: bool,
}

impl JobGraph {
    /// Whether this job runs an external step at all.
    pub fn is_required(&self) -> bool {
        self.server.is_some()
    }
}

/// An ordered sub-sequence of jobs tracked as a unit of status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageGraph {
    /// Unique stage name within the pipeline.
    pub name: String,
    /// Jobs in execution order.
    pub jobs: Vec<JobGraph>,
}

/// The full pipeline topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineGraph {
    /// Stages in execution order.
    pub stages: Vec<StageGraph>,
}

/// The complete static configuration handed to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineGraph {
    /// Worker servers by name.
    pub servers: HashMap<String, ServerConfig>,
    /// The pipeline topology.
    pub pipeline: PipelineGraph,
    /// Base URL the callback endpoint is reachable on, e.g.
    /// `http://engine:8080`. Instance-level `callback_host` overrides this.
    pub callback_base: String,
    /// Connect/read timeout for dispatch, cancel and status calls.
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_secs: u64,
}

fn default_dispatch_timeout() -> u64 {
    DEFAULT_DISPATCH_TIMEOUT_SECS
}

impl EngineGraph {
    /// Looks up a stage and its index by name.
    pub fn stage(&self, name: &str) -> Option<(usize, &StageGraph)> {
        self.pipeline
            .stages
            .iter()
            .enumerate()
            .find(|(_, s)| s.name == name)
    }

    /// Looks up the job definition at a stage/job position.
    pub fn job(&self, stage_index: usize, job_index: usize) -> Option<&JobGraph> {
        self.pipeline
            .stages
            .get(stage_index)
            .and_then(|s| s.jobs.get(job_index))
    }

    /// Looks up a server definition by name.
    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.get(name)
    }

    /// The callback URL for a given correlation id, from the instance's
    /// callback host when configured, otherwise the graph-wide base.
    pub fn callback_url(&self, instance: &InstanceConfig, correlation_id: uuid::Uuid) -> String {
        let base = instance
            .callback_host
            .as_deref()
            .unwrap_or(&self.callback_base);
        format!(
            "{}/api/process/{}/callback",
            base.trim_end_matches('/'),
            correlation_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(name: &str) -> InstanceConfig {
        InstanceConfig {
            name: name.to_string(),
            url: format!("http://{}:8000", name),
            max_parallel: 2,
            callback_host: None,
        }
    }

    fn minimal_graph() -> EngineGraph {
        let mut servers = HashMap::new();
        servers.insert(
            "synthesis".to_string(),
            ServerConfig {
                min_up: 0,
                health_endpoint: "/actuator/health".to_string(),
                health_timeout_secs: 2,
                instances: vec![instance("synthesis-0")],
            },
        );
        EngineGraph {
            servers,
            pipeline: PipelineGraph {
                stages: vec![StageGraph {
                    name: "execution".to_string(),
                    jobs: vec![JobGraph {
                        name: "synthesis".to_string(),
                        server: Some("synthesis".to_string()),
                        endpoints: Some(JobEndpoints {
                            start: "/start_synthesis".to_string(),
                            status: Some("/status/{id}".to_string()),
                            cancel: Some("/cancel/{id}".to_string()),
                        }),
                        inputs: vec![],
                        outputs: vec![OutputPart {
                            part: "synthetic_data".to_string(),
                            encoding: OutputEncoding::Data,
                        }],
                        requires_hold_out: false,
                        skip: false,
                    }],
                }],
            },
            callback_base: "http://engine:8080/".to_string(),
            dispatch_timeout_secs: 10,
        }
    }

    #[test]
    fn test_stage_lookup() {
        let graph = minimal_graph();
        let (idx, stage) = graph.stage("execution").expect("stage should exist");
        assert_eq!(idx, 0);
        assert_eq!(stage.jobs.len(), 1);
        assert!(graph.stage("missing").is_none());
    }

    #[test]
    fn test_job_lookup_by_position() {
        let graph = minimal_graph();
        let job = graph.job(0, 0).expect("job should exist");
        assert_eq!(job.name, "synthesis");
        assert_eq!(job.outputs[0].encoding, OutputEncoding::Data);
        assert!(graph.job(0, 1).is_none());
        assert!(graph.job(1, 0).is_none());
    }

    #[test]
    fn test_callback_url_trims_trailing_slash() {
        let graph = minimal_graph();
        let id = uuid::Uuid::new_v4();
        let inst = &graph.servers["synthesis"].instances[0];
        let url = graph.callback_url(inst, id);
        assert_eq!(url, format!("http://engine:8080/api/process/{}/callback", id));
    }

    #[test]
    fn test_callback_host_override() {
        let graph = minimal_graph();
        let id = uuid::Uuid::new_v4();
        let mut inst = graph.servers["synthesis"].instances[0].clone();
        inst.callback_host = Some("http://edge:9000".to_string());
        let url = graph.callback_url(&inst, id);
        assert!(url.starts_with("http://edge:9000/api/process/"));
    }
}
