//! Entity records for the project → stage → process → dataset graph.
//!
//! Children hold parent/sibling identifiers, never back-pointers; lookups go
//! through the registry. Process records are created once when the pipeline
//! is instantiated and reused across runs.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::{JobGraph, StageGraph};
use crate::dataset::DataConfiguration;

use super::status::{ProcessStatus, StageStatus};

/// Hold-out descriptor of a dataset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HoldOut {
    /// Seed the sampler is re-seeded with.
    pub seed: u64,
    /// Fraction of rows held out, in `[0, 1]`.
    pub percentage: f64,
    /// Whether a split has been generated.
    pub generated: bool,
}

/// Metadata of one stored dataset.
#[derive(Debug, Clone)]
pub struct DatasetMeta {
    /// Numeric identifier; the physical table name derives from it.
    pub id: i64,
    /// Ordered column definitions.
    pub data_configuration: DataConfiguration,
    /// The physical table exists and is populated.
    pub stored_data: bool,
    /// Write-once lock: once set, the dataset may only be deleted, never
    /// overwritten.
    pub confirmed_data: bool,
    /// Hold-out descriptor, if one was ever requested.
    pub hold_out: Option<HoldOut>,
}

impl DatasetMeta {
    /// Creates metadata for a freshly allocated dataset id.
    pub fn new(id: i64, data_configuration: DataConfiguration) -> Self {
        Self {
            id,
            data_configuration,
            stored_data: false,
            confirmed_data: false,
            hold_out: None,
        }
    }

    /// Whether a hold-out split has been generated for this dataset.
    pub fn hold_out_available(&self) -> bool {
        self.stored_data && self.hold_out.map(|h| h.generated).unwrap_or(false)
    }
}

/// Opaque job configuration attached before dispatch.
#[derive(Debug, Clone)]
pub struct JobConfiguration {
    /// Serialized configuration payload, forwarded verbatim to the worker.
    pub payload: String,
    /// Where the payload came from.
    pub source_url: Option<String>,
}

/// The worker instance a running process is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceBinding {
    /// Server name in the configuration graph.
    pub server: String,
    /// Instance name within that server.
    pub instance: String,
}

/// One job's execution record.
#[derive(Debug, Clone)]
pub struct Process {
    /// Job name; resolves the definition in the configuration graph.
    pub job_name: String,
    /// Target server name, copied from the job definition (`None` for jobs
    /// with no external step).
    pub server: Option<String>,
    /// Current state-machine status.
    pub status: ProcessStatus,
    /// Skip this job when the stage runs.
    pub skip: bool,
    /// Opaque configuration payload; dispatch requires it.
    pub configuration: Option<JobConfiguration>,
    /// Set iff status is SCHEDULED; FIFO tie-break for the queue.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Worker-assigned process identifier.
    pub external_id: Option<String>,
    /// Token embedded in the callback URL; cleared when the process leaves
    /// RUNNING, so a late or duplicate callback cannot match.
    pub correlation_id: Option<Uuid>,
    /// The instance currently bound, if any.
    pub bound_instance: Option<InstanceBinding>,
    /// Free-text last-known detail message.
    pub status_detail: Option<String>,
    /// Named result blobs delivered by the worker.
    pub result_files: HashMap<String, Vec<u8>>,
    /// Dataset produced by this job, if it is data-producing.
    pub dataset: Option<DatasetMeta>,
}

impl Process {
    /// Creates the record for a configured job.
    pub fn new(job: &JobGraph) -> Self {
        let status = if job.is_required() {
            ProcessStatus::NotStarted
        } else {
            ProcessStatus::NotRequired
        };
        Self {
            job_name: job.name.clone(),
            server: job.server.clone(),
            status,
            skip: job.skip,
            configuration: None,
            scheduled_at: None,
            external_id: None,
            correlation_id: None,
            bound_instance: None,
            status_detail: None,
            result_files: HashMap::new(),
            dataset: None,
        }
    }

    /// Clears the worker binding fields (instance, correlation id, external
    /// id, scheduled time).
    pub fn clear_binding(&mut self) {
        self.scheduled_at = None;
        self.external_id = None;
        self.correlation_id = None;
        self.bound_instance = None;
    }

    /// Resets the record to its initial state for a re-run, returning the
    /// dataset metadata that must be deleted by the caller.
    ///
    /// The caller checks `confirmed_data` before invoking this.
    pub fn reset(&mut self) -> Option<DatasetMeta> {
        self.status = if self.server.is_some() {
            ProcessStatus::NotStarted
        } else {
            ProcessStatus::NotRequired
        };
        self.clear_binding();
        self.status_detail = None;
        self.result_files.clear();
        self.dataset.take()
    }
}

/// One ordered sub-sequence of jobs, tracked as a unit of status.
#[derive(Debug, Clone)]
pub struct Stage {
    /// Stage name; resolves the definition in the configuration graph.
    pub name: String,
    /// Aggregate status.
    pub status: StageStatus,
    /// Index of the job currently executing or last attempted.
    ///
    /// Invariant: `None` exactly when the stage is not running.
    pub current_job: Option<usize>,
    /// Job records in execution order.
    pub processes: Vec<Process>,
}

impl Stage {
    /// Creates the records for a configured stage.
    pub fn new(graph: &StageGraph) -> Self {
        Self {
            name: graph.name.clone(),
            status: StageStatus::NotStarted,
            current_job: None,
            processes: graph.jobs.iter().map(Process::new).collect(),
        }
    }

    /// Looks up a process and its index by job name.
    pub fn process_by_job(&self, job_name: &str) -> Option<(usize, &Process)> {
        self.processes
            .iter()
            .enumerate()
            .find(|(_, p)| p.job_name == job_name)
    }
}

/// One project owning a pipeline instance.
#[derive(Debug, Clone)]
pub struct Project {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Stages in execution order.
    pub stages: Vec<Stage>,
    /// The project's source dataset, uploaded before the pipeline runs.
    pub original_dataset: Option<DatasetMeta>,
}

impl Project {
    /// Looks up a stage and its index by name.
    pub fn stage_by_name(&self, name: &str) -> Option<(usize, &Stage)> {
        self.stages.iter().enumerate().find(|(_, s)| s.name == name)
    }

    /// Collects every dataset id owned by this project.
    pub fn dataset_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .original_dataset
            .iter()
            .map(|d| d.id)
            .collect();
        for stage in &self.stages {
            for process in &stage.processes {
                if let Some(dataset) = &process.dataset {
                    ids.push(dataset.id);
                }
            }
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobGraph;

    fn job(name: &str, server: Option<&str>) -> JobGraph {
        JobGraph {
            name: name.to_string(),
            server: server.map(str::to_string),
            endpoints: None,
            inputs: vec![],
            outputs: vec![],
            requires_hold_out: false,
            skip: false,
        }
    }

    #[test]
    fn test_new_process_status_reflects_binding() {
        let bound = Process::new(&job("synthesis", Some("synthesis")));
        assert_eq!(bound.status, ProcessStatus::NotStarted);

        let unbound = Process::new(&job("bookkeeping", None));
        assert_eq!(unbound.status, ProcessStatus::NotRequired);
    }

    #[test]
    fn test_reset_clears_results_and_returns_dataset() {
        let mut process = Process::new(&job("synthesis", Some("synthesis")));
        process.status = ProcessStatus::Finished;
        process.external_id = Some("pid-1".to_string());
        process.correlation_id = Some(Uuid::new_v4());
        process.result_files.insert("report".to_string(), vec![1, 2]);
        process.dataset = Some(DatasetMeta::new(7, DataConfiguration::default()));

        let dataset = process.reset().expect("dataset should be returned");
        assert_eq!(dataset.id, 7);
        assert_eq!(process.status, ProcessStatus::NotStarted);
        assert!(process.external_id.is_none());
        assert!(process.correlation_id.is_none());
        assert!(process.result_files.is_empty());
        assert!(process.dataset.is_none());
    }

    #[test]
    fn test_hold_out_available_requires_generated_split() {
        let mut meta = DatasetMeta::new(1, DataConfiguration::default());
        assert!(!meta.hold_out_available());

        meta.stored_data = true;
        assert!(!meta.hold_out_available());

        meta.hold_out = Some(HoldOut {
            seed: 42,
            percentage: 0.2,
            generated: false,
        });
        assert!(!meta.hold_out_available());

        meta.hold_out = Some(HoldOut {
            seed: 42,
            percentage: 0.2,
            generated: true,
        });
        assert!(meta.hold_out_available());
    }
}
