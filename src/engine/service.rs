//! The top-level pipeline execution service.
//!
//! Owns the static configuration graph, the in-memory project registry, the
//! dataset store and the worker transport, and exposes the operations an
//! embedding server drives: project and dataset management, job
//! configuration, stage start/cancel, status queries, hold-out generation
//! and export.

use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineGraph;
use crate::dataset::{
    convert_row, DataConfiguration, DatasetStore, ExportOptions, ExportService, ExportedTable,
    TransformationError, Value,
};
use crate::error::{DatasetError, EngineError};
use crate::registry::{
    DatasetMeta, HoldOut, JobConfiguration, Process, ProcessStatus, Project, ProjectRegistry,
};
use crate::worker::{render_endpoint, InstancePool, WorkerTransport};

/// Identifies one dataset within a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetRef {
    /// The project's uploaded source dataset.
    Original,
    /// The dataset produced by a job.
    Job { stage: String, job: String },
}

/// Snapshot of one process for status queries.
#[derive(Debug, Clone)]
pub struct ProcessSummary {
    pub job_name: String,
    pub status: ProcessStatus,
    pub status_detail: Option<String>,
    pub has_dataset: bool,
}

/// Snapshot of one stage for status queries.
#[derive(Debug, Clone)]
pub struct StageStatusView {
    pub name: String,
    pub status: crate::registry::StageStatus,
    /// Index of the job currently executing; `None` when not running.
    pub current_job: Option<usize>,
    pub processes: Vec<ProcessSummary>,
}

/// Detailed status of one process, with the worker's opaque status document
/// when the process is running and a status endpoint is configured.
#[derive(Debug, Clone)]
pub struct ProcessStatusView {
    pub job_name: String,
    pub status: ProcessStatus,
    pub status_detail: Option<String>,
    pub worker_status: Option<serde_json::Value>,
}

/// The orchestration engine.
///
/// Cheap to clone; all state is shared. Clones are handed to detached tasks
/// for fire-and-forget worker calls.
#[derive(Clone)]
pub struct PipelineExecutionService {
    pub(crate) graph: Arc<EngineGraph>,
    pub(crate) registry: Arc<ProjectRegistry>,
    pub(crate) store: DatasetStore,
    pub(crate) export: ExportService,
    pub(crate) transport: Arc<dyn WorkerTransport>,
    pub(crate) pool: InstancePool,
}

impl PipelineExecutionService {
    /// Creates the service on an existing database pool and transport.
    ///
    /// `first_dataset_id` seeds the dataset id allocator; pass the successor
    /// of the highest existing table id when resuming over a non-empty
    /// database.
    pub fn new(
        graph: EngineGraph,
        db_pool: PgPool,
        transport: Arc<dyn WorkerTransport>,
        first_dataset_id: i64,
    ) -> Self {
        let store = DatasetStore::new(db_pool);
        Self {
            graph: Arc::new(graph),
            registry: Arc::new(ProjectRegistry::new(first_dataset_id)),
            export: ExportService::new(store.clone()),
            store,
            transport: transport.clone(),
            pool: InstancePool::new(transport),
        }
    }

    /// Instantiates the configured pipeline as a new project.
    pub async fn create_project(&self) -> Uuid {
        let id = self.registry.create_project(&self.graph).await;
        info!(project = %id, "created project");
        id
    }

    /// Deletes a project and drops every dataset it owns.
    pub async fn delete_project(&self, project_id: Uuid) -> Result<(), EngineError> {
        let handle = self
            .registry
            .remove_project(project_id)
            .await
            .ok_or(EngineError::ProjectNotFound(project_id))?;

        let dataset_ids = {
            let project = handle.lock().await;
            project.dataset_ids()
        };
        for dataset_id in dataset_ids {
            if let Err(e) = self.store.delete(dataset_id).await {
                warn!(project = %project_id, dataset_id, error = %e, "failed to drop dataset");
            }
        }
        info!(project = %project_id, "deleted project");
        Ok(())
    }

    /// Stores the project's source dataset from raw (untyped) rows.
    ///
    /// Conversion never blocks storage: unconvertible cells are stored as
    /// NULL with a transformation error recorded out of band. Replacing an
    /// existing source dataset is refused once it is confirmed.
    pub async fn store_original_data(
        &self,
        project_id: Uuid,
        config: DataConfiguration,
        raw_rows: &[Vec<Option<String>>],
    ) -> Result<i64, EngineError> {
        config.check().map_err(|e| EngineError::Internal(e.to_string()))?;

        let handle = self.project(project_id).await?;
        let previous = {
            let mut project = handle.lock().await;
            if let Some(existing) = &project.original_dataset {
                if existing.confirmed_data {
                    return Err(DatasetError::Confirmed(existing.id).into());
                }
            }
            project.original_dataset.take()
        };
        if let Some(old) = previous {
            self.store.delete(old.id).await.map_err(EngineError::from)?;
        }

        let dataset_id = self.registry.allocate_dataset_id();
        let meta = self
            .persist_raw_rows(dataset_id, &config, raw_rows)
            .await?;

        let mut project = handle.lock().await;
        project.original_dataset = Some(meta);
        info!(project = %project_id, dataset_id, rows = raw_rows.len(), "stored source dataset");
        Ok(dataset_id)
    }

    /// Converts and persists raw rows into a fresh dataset table.
    ///
    /// On insert failure the half-written table is dropped so the database
    /// returns to its last consistent state.
    pub(crate) async fn persist_raw_rows(
        &self,
        dataset_id: i64,
        config: &DataConfiguration,
        raw_rows: &[Vec<Option<String>>],
    ) -> Result<DatasetMeta, EngineError> {
        let mut typed = Vec::with_capacity(raw_rows.len());
        let mut errors: Vec<TransformationError> = Vec::new();
        for (row_index, raw) in raw_rows.iter().enumerate() {
            let (values, row_errors) = convert_row(raw, config, row_index as i64)?;
            typed.push(values);
            errors.extend(row_errors);
        }
        self.persist_typed_rows(dataset_id, config, &typed, &errors)
            .await
    }

    /// Persists already-typed rows into a fresh dataset table.
    pub(crate) async fn persist_typed_rows(
        &self,
        dataset_id: i64,
        config: &DataConfiguration,
        rows: &[Vec<Value>],
        errors: &[TransformationError],
    ) -> Result<DatasetMeta, EngineError> {
        self.store.create_table(dataset_id, config).await?;

        if let Err(e) = self.store.insert_rows(dataset_id, config, rows).await {
            // Compensating drop: never leave a half-written table behind.
            if let Err(drop_err) = self.store.delete(dataset_id).await {
                warn!(dataset_id, error = %drop_err, "compensating drop failed");
            }
            return Err(e.into());
        }
        self.store
            .store_transformation_errors(dataset_id, errors)
            .await?;

        let mut meta = DatasetMeta::new(dataset_id, config.clone());
        meta.stored_data = true;
        Ok(meta)
    }

    /// Attaches a configuration payload to a job.
    pub async fn configure_job(
        &self,
        project_id: Uuid,
        stage_name: &str,
        job_name: &str,
        payload: String,
        source_url: Option<String>,
    ) -> Result<(), EngineError> {
        let handle = self.project(project_id).await?;
        let mut project = handle.lock().await;
        let (stage_index, _) = project
            .stage_by_name(stage_name)
            .ok_or_else(|| EngineError::StageNotFound(stage_name.to_string()))?;
        let (process_index, process) = project.stages[stage_index]
            .process_by_job(job_name)
            .ok_or_else(|| EngineError::JobNotFound {
                stage: stage_name.to_string(),
                job: job_name.to_string(),
            })?;
        if process.status.is_active() {
            return Err(EngineError::InvalidStageState {
                stage: stage_name.to_string(),
                status: process.status.to_string(),
            });
        }
        project.stages[stage_index].processes[process_index].configuration =
            Some(JobConfiguration { payload, source_url });
        Ok(())
    }

    /// Marks a dataset confirmed. Write-once: a confirmed dataset may only
    /// be deleted with its project, never overwritten.
    pub async fn confirm_dataset(
        &self,
        project_id: Uuid,
        dataset: &DatasetRef,
    ) -> Result<(), EngineError> {
        let handle = self.project(project_id).await?;
        let mut project = handle.lock().await;
        let meta = dataset_meta_mut(&mut project, dataset)?;
        if !meta.stored_data {
            return Err(DatasetError::NoStoredData(meta.id).into());
        }
        meta.confirmed_data = true;
        info!(project = %project_id, dataset_id = meta.id, "confirmed dataset");
        Ok(())
    }

    /// Generates a reproducible hold-out split on a dataset.
    ///
    /// Returns the number of rows selected. Repeated calls with the same
    /// seed and percentage reproduce the same partition.
    pub async fn generate_hold_out(
        &self,
        project_id: Uuid,
        dataset: &DatasetRef,
        seed: u64,
        percentage: f64,
    ) -> Result<u64, EngineError> {
        let handle = self.project(project_id).await?;

        let dataset_id = {
            let mut project = handle.lock().await;
            let meta = dataset_meta_mut(&mut project, dataset)?;
            if !meta.stored_data {
                return Err(DatasetError::NoStoredData(meta.id).into());
            }
            meta.id
        };

        // Validation happens inside the store before any mutation; only a
        // successful split updates the descriptor.
        let selected = self
            .store
            .generate_hold_out_split(dataset_id, seed, percentage)
            .await?;

        let mut project = handle.lock().await;
        let meta = dataset_meta_mut(&mut project, dataset)?;
        meta.hold_out = Some(HoldOut {
            seed,
            percentage,
            generated: true,
        });
        Ok(selected)
    }

    /// Exports a dataset with selection, filtering, pagination and
    /// error-cell encoding.
    pub async fn export_dataset(
        &self,
        project_id: Uuid,
        dataset: &DatasetRef,
        options: &ExportOptions,
    ) -> Result<ExportedTable, EngineError> {
        let handle = self.project(project_id).await?;
        let (dataset_id, schema) = {
            let mut project = handle.lock().await;
            let meta = dataset_meta_mut(&mut project, dataset)?;
            if !meta.stored_data {
                return Err(DatasetError::NoStoredData(meta.id).into());
            }
            (meta.id, meta.data_configuration.clone())
        };
        Ok(self.export.export(dataset_id, &schema, options).await?)
    }

    /// Status snapshot of one stage.
    pub async fn stage_status(
        &self,
        project_id: Uuid,
        stage_name: &str,
    ) -> Result<StageStatusView, EngineError> {
        let handle = self.project(project_id).await?;
        let project = handle.lock().await;
        let (_, stage) = project
            .stage_by_name(stage_name)
            .ok_or_else(|| EngineError::StageNotFound(stage_name.to_string()))?;
        Ok(StageStatusView {
            name: stage.name.clone(),
            status: stage.status,
            current_job: stage.current_job,
            processes: stage
                .processes
                .iter()
                .map(|p| ProcessSummary {
                    job_name: p.job_name.clone(),
                    status: p.status,
                    status_detail: p.status_detail.clone(),
                    has_dataset: p.dataset.is_some(),
                })
                .collect(),
        })
    }

    /// Detailed status of one process.
    ///
    /// For a RUNNING process with a configured status endpoint the worker's
    /// opaque status document is fetched and forwarded verbatim; a fetch
    /// failure degrades to the locally known status.
    pub async fn process_status(
        &self,
        project_id: Uuid,
        stage_name: &str,
        job_name: &str,
    ) -> Result<ProcessStatusView, EngineError> {
        let handle = self.project(project_id).await?;
        let (view, probe) = {
            let project = handle.lock().await;
            let (stage_index, stage) = project
                .stage_by_name(stage_name)
                .ok_or_else(|| EngineError::StageNotFound(stage_name.to_string()))?;
            let (process_index, process) =
                stage
                    .process_by_job(job_name)
                    .ok_or_else(|| EngineError::JobNotFound {
                        stage: stage_name.to_string(),
                        job: job_name.to_string(),
                    })?;
            let view = ProcessStatusView {
                job_name: process.job_name.clone(),
                status: process.status,
                status_detail: process.status_detail.clone(),
                worker_status: None,
            };
            let probe = self.worker_status_probe(&project, stage_index, process_index);
            (view, probe)
        };

        let mut view = view;
        if let Some((instance, endpoint)) = probe {
            match self.transport.fetch_status(&instance, &endpoint).await {
                Ok(doc) => view.worker_status = Some(doc),
                Err(e) => {
                    warn!(job = %view.job_name, error = %e, "worker status fetch failed");
                }
            }
        }
        Ok(view)
    }

    /// Resolves the instance and rendered status endpoint for a RUNNING
    /// process, if a status fetch is possible.
    pub(crate) fn worker_status_probe(
        &self,
        project: &Project,
        stage_index: usize,
        process_index: usize,
    ) -> Option<(crate::config::InstanceConfig, String)> {
        let process = &project.stages[stage_index].processes[process_index];
        if process.status != ProcessStatus::Running {
            return None;
        }
        let binding = process.bound_instance.as_ref()?;
        let external_id = process.external_id.as_deref()?;
        let job = self.graph.job(stage_index, process_index)?;
        let template = job.endpoints.as_ref()?.status.as_deref()?;
        let server = self.graph.server(&binding.server)?;
        let instance = server
            .instances
            .iter()
            .find(|i| i.name == binding.instance)?;
        Some((instance.clone(), render_endpoint(template, external_id)))
    }

    pub(crate) async fn project(
        &self,
        project_id: Uuid,
    ) -> Result<Arc<Mutex<Project>>, EngineError> {
        self.registry
            .project(project_id)
            .await
            .ok_or(EngineError::ProjectNotFound(project_id))
    }
}

/// Resolves a dataset reference to its metadata within a locked project.
pub(crate) fn dataset_meta_mut<'a>(
    project: &'a mut Project,
    dataset: &DatasetRef,
) -> Result<&'a mut DatasetMeta, EngineError> {
    match dataset {
        DatasetRef::Original => project
            .original_dataset
            .as_mut()
            .ok_or_else(|| EngineError::NoSourceDataset("original".to_string())),
        DatasetRef::Job { stage, job } => {
            let (stage_index, s) = project
                .stage_by_name(stage)
                .ok_or_else(|| EngineError::StageNotFound(stage.clone()))?;
            let (process_index, _) =
                s.process_by_job(job).ok_or_else(|| EngineError::JobNotFound {
                    stage: stage.clone(),
                    job: job.clone(),
                })?;
            project.stages[stage_index].processes[process_index]
                .dataset
                .as_mut()
                .ok_or_else(|| EngineError::NoSourceDataset(job.clone()))
        }
    }
}

/// Resolves the source dataset for a job input, per the precedence rules:
/// a named job source picks that job's dataset; "last or original" walks the
/// consuming stage's preceding processes backward, then prior stages
/// backward, and falls back to the project's source dataset. Only datasets
/// with stored data count.
pub(crate) fn resolve_source_dataset(
    project: &Project,
    stage_index: usize,
    process_index: usize,
    source: &crate::config::DataSource,
) -> Option<DatasetMeta> {
    let stored = |p: &Process| p.dataset.clone().filter(|d| d.stored_data);
    match source {
        crate::config::DataSource::Job(name) => project
            .stages
            .iter()
            .flat_map(|s| s.processes.iter())
            .find(|p| &p.job_name == name)
            .and_then(stored),
        crate::config::DataSource::LastOrOriginal => {
            let own_stage = &project.stages[stage_index];
            for process in own_stage.processes[..process_index].iter().rev() {
                if let Some(meta) = stored(process) {
                    return Some(meta);
                }
            }
            for stage in project.stages[..stage_index].iter().rev() {
                for process in stage.processes.iter().rev() {
                    if let Some(meta) = stored(process) {
                        return Some(meta);
                    }
                }
            }
            project
                .original_dataset
                .clone()
                .filter(|d| d.stored_data)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataSource;
    use crate::registry::{Stage, StageStatus};
    use chrono::Utc;

    fn project_with_datasets() -> Project {
        let mut original = DatasetMeta::new(1, DataConfiguration::default());
        original.stored_data = true;

        let process = |job: &str, dataset: Option<DatasetMeta>| Process {
            job_name: job.to_string(),
            server: Some("s".to_string()),
            status: ProcessStatus::NotStarted,
            skip: false,
            configuration: None,
            scheduled_at: None,
            external_id: None,
            correlation_id: None,
            bound_instance: None,
            status_detail: None,
            result_files: Default::default(),
            dataset,
        };

        let mut produced = DatasetMeta::new(2, DataConfiguration::default());
        produced.stored_data = true;
        let mut unstored = DatasetMeta::new(3, DataConfiguration::default());
        unstored.stored_data = false;

        Project {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            stages: vec![
                Stage {
                    name: "prepare".to_string(),
                    status: StageStatus::Finished,
                    current_job: None,
                    processes: vec![process("transform", Some(produced))],
                },
                Stage {
                    name: "execute".to_string(),
                    status: StageStatus::NotStarted,
                    current_job: None,
                    processes: vec![
                        process("synthesis", Some(unstored)),
                        process("evaluation", None),
                    ],
                },
            ],
            original_dataset: Some(original),
        }
    }

    #[test]
    fn test_last_or_original_prefers_latest_stored() {
        let project = project_with_datasets();
        // Consuming job is stage 1, process 1; the unstored dataset at
        // (1, 0) is skipped, the stored one from stage 0 wins.
        let meta = resolve_source_dataset(&project, 1, 1, &DataSource::LastOrOriginal)
            .expect("should resolve");
        assert_eq!(meta.id, 2);
    }

    #[test]
    fn test_last_or_original_falls_back_to_source_dataset() {
        let mut project = project_with_datasets();
        project.stages[0].processes[0].dataset = None;
        let meta = resolve_source_dataset(&project, 1, 1, &DataSource::LastOrOriginal)
            .expect("should resolve");
        assert_eq!(meta.id, 1);
    }

    #[test]
    fn test_named_job_source() {
        let project = project_with_datasets();
        let meta = resolve_source_dataset(
            &project,
            1,
            1,
            &DataSource::Job("transform".to_string()),
        )
        .expect("should resolve");
        assert_eq!(meta.id, 2);

        assert!(resolve_source_dataset(
            &project,
            1,
            1,
            &DataSource::Job("synthesis".to_string())
        )
        .is_none());
    }

    #[test]
    fn test_dataset_ref_resolution() {
        let mut project = project_with_datasets();
        let meta = dataset_meta_mut(&mut project, &DatasetRef::Original).expect("should resolve");
        assert_eq!(meta.id, 1);

        let meta = dataset_meta_mut(
            &mut project,
            &DatasetRef::Job {
                stage: "prepare".to_string(),
                job: "transform".to_string(),
            },
        )
        .expect("should resolve");
        assert_eq!(meta.id, 2);

        let err = dataset_meta_mut(
            &mut project,
            &DatasetRef::Job {
                stage: "execute".to_string(),
                job: "evaluation".to_string(),
            },
        )
        .expect_err("no dataset");
        assert!(matches!(err, EngineError::NoSourceDataset(_)));
    }
}
