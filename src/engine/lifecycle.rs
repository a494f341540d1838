//! Stage lifecycle: start, advance, cancel, error transitions.
//!
//! All transitions happen under the owning project's lock; outbound worker
//! calls never do. Skip decisions (explicit skip flag, missing hold-out
//! split) are made locally and move the process straight to SKIPPED with a
//! descriptive status, without any network traffic.

use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DataSource;
use crate::error::{DatasetError, EngineError};
use crate::registry::{ProcessRef, ProcessStatus, Stage, StageStatus};

use super::scheduler::DispatchOutcome;
use super::service::{resolve_source_dataset, PipelineExecutionService};

/// A fire-and-forget cancel call captured under the lock.
struct CancelTarget {
    server: String,
    instance: String,
    endpoint: String,
    session_key: String,
    external_id: String,
}

/// Re-derives a stage's aggregate status and maintains the invariant that
/// the current job index is set exactly while the stage is running.
pub(crate) fn refresh_stage(stage: &mut Stage) {
    let statuses: Vec<ProcessStatus> = stage.processes.iter().map(|p| p.status).collect();
    stage.status = StageStatus::aggregate(&statuses);
    if stage.status != StageStatus::Running {
        stage.current_job = None;
    }
}

impl PipelineExecutionService {
    /// Starts a stage, optionally from a specific job.
    ///
    /// Every job preceding the starting point must be complete. The records
    /// from the starting point onward are reset for the run; the reset is
    /// refused if any of them owns a confirmed dataset. Errors are never
    /// retried implicitly: re-running an errored job goes through this
    /// operation.
    pub async fn start_stage(
        &self,
        project_id: Uuid,
        stage_name: &str,
        from_job: Option<&str>,
        ignore_capacity: bool,
    ) -> Result<(), EngineError> {
        let handle = self.project(project_id).await?;

        let (stage_index, start_index, orphaned) = {
            let mut project = handle.lock().await;
            let (stage_index, stage) = project
                .stage_by_name(stage_name)
                .ok_or_else(|| EngineError::StageNotFound(stage_name.to_string()))?;
            if stage.processes.iter().any(|p| p.status.is_active()) {
                return Err(EngineError::InvalidStageState {
                    stage: stage_name.to_string(),
                    status: stage.status.to_string(),
                });
            }

            let start_index = match from_job {
                None => 0,
                Some(job) => {
                    let (index, _) =
                        stage
                            .process_by_job(job)
                            .ok_or_else(|| EngineError::JobNotFound {
                                stage: stage_name.to_string(),
                                job: job.to_string(),
                            })?;
                    if let Some(unfinished) = stage.processes[..index]
                        .iter()
                        .find(|p| !p.status.is_complete())
                    {
                        return Err(EngineError::PrecedingJobUnfinished(
                            unfinished.job_name.clone(),
                        ));
                    }
                    index
                }
            };

            // A confirmed dataset anywhere in the tail blocks the reset
            // before anything is touched.
            let stage = &mut project.stages[stage_index];
            if let Some(confirmed) = stage.processes[start_index..]
                .iter()
                .filter_map(|p| p.dataset.as_ref())
                .find(|d| d.confirmed_data)
            {
                return Err(DatasetError::Confirmed(confirmed.id).into());
            }

            let orphaned: Vec<i64> = stage.processes[start_index..]
                .iter_mut()
                .filter_map(|p| p.reset())
                .map(|d| d.id)
                .collect();
            stage.status = StageStatus::Running;
            stage.current_job = Some(start_index);
            (stage_index, start_index, orphaned)
        };

        for dataset_id in orphaned {
            if let Err(e) = self.store.delete(dataset_id).await {
                warn!(project = %project_id, dataset_id, error = %e, "failed to drop dataset");
            }
        }

        info!(project = %project_id, stage = stage_name, start_index, "starting stage");
        self.run_from(project_id, stage_index, start_index, ignore_capacity)
            .await
    }

    /// Advances a stage after the job at `finished_index` completed.
    pub(crate) async fn advance_stage(
        &self,
        project_id: Uuid,
        stage_index: usize,
        finished_index: usize,
    ) -> Result<(), EngineError> {
        self.run_from(project_id, stage_index, finished_index + 1, false)
            .await
    }

    /// Walks the stage forward from `start_index`, settling skip decisions
    /// locally, and dispatches the first job that actually has to run.
    async fn run_from(
        &self,
        project_id: Uuid,
        stage_index: usize,
        start_index: usize,
        ignore_capacity: bool,
    ) -> Result<(), EngineError> {
        let handle = self.project(project_id).await?;

        let position = {
            let mut project = handle.lock().await;
            let mut index = start_index;
            loop {
                let job_count = project.stages[stage_index].processes.len();
                if index >= job_count {
                    refresh_stage(&mut project.stages[stage_index]);
                    info!(project = %project_id, stage_index, "stage complete");
                    break None;
                }

                let requires_hold_out = self
                    .graph
                    .job(stage_index, index)
                    .map(|j| j.requires_hold_out)
                    .unwrap_or(false);
                let hold_out_missing = requires_hold_out
                    && !self
                        .job_source_dataset(&project, stage_index, index)
                        .map(|d| d.hold_out_available())
                        .unwrap_or(false);

                let process = &mut project.stages[stage_index].processes[index];
                if process.status == ProcessStatus::NotRequired {
                    index += 1;
                    continue;
                }
                if process.skip {
                    process.status = ProcessStatus::Skipped;
                    process.status_detail = Some("skipped by configuration".to_string());
                    index += 1;
                    continue;
                }
                if hold_out_missing {
                    process.status = ProcessStatus::Skipped;
                    process.status_detail = Some(
                        "skipped: requires a hold-out split that has not been generated"
                            .to_string(),
                    );
                    info!(project = %project_id, job = %process.job_name, "skipping job without hold-out split");
                    index += 1;
                    continue;
                }

                let stage = &mut project.stages[stage_index];
                stage.current_job = Some(index);
                stage.status = StageStatus::Running;
                break Some(ProcessRef {
                    project_id,
                    stage_index,
                    process_index: index,
                });
            }
        };

        let Some(position) = position else {
            return Ok(());
        };

        match self.dispatch(position, ignore_capacity).await {
            Ok(DispatchOutcome::Queued) => {
                info!(project = %project_id, stage_index, "job queued for capacity");
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => {
                // A worker failure already moved the process to ERROR; a
                // user error left it untouched. Re-derive the stage status
                // either way so the current-index invariant holds.
                {
                    let mut project = handle.lock().await;
                    refresh_stage(&mut project.stages[stage_index]);
                }
                if let Some(server) = self
                    .graph
                    .job(stage_index, position.process_index)
                    .and_then(|j| j.server.clone())
                {
                    self.drain_queue(&server).await;
                }
                Err(e)
            }
        }
    }

    /// Cancels a stage.
    ///
    /// SCHEDULED jobs are canceled purely locally; RUNNING jobs additionally
    /// get a best-effort cancel request that is neither awaited for
    /// acknowledgment nor retried. A late callback after cancellation is an
    /// unknown-process no-op because the correlation id is cleared here.
    pub async fn cancel_stage(
        &self,
        project_id: Uuid,
        stage_name: &str,
    ) -> Result<(), EngineError> {
        let handle = self.project(project_id).await?;

        let (targets, mut servers) = {
            let mut project = handle.lock().await;
            let (stage_index, _) = project
                .stage_by_name(stage_name)
                .ok_or_else(|| EngineError::StageNotFound(stage_name.to_string()))?;

            let mut targets = Vec::new();
            let mut servers = Vec::new();
            for (process_index, process) in project.stages[stage_index]
                .processes
                .iter_mut()
                .enumerate()
            {
                if !process.status.is_active() {
                    continue;
                }
                if process.status == ProcessStatus::Running {
                    if let Some(target) = self.cancel_target(stage_index, process_index, process) {
                        targets.push(target);
                    }
                }
                if let Some(server) = &process.server {
                    servers.push(server.clone());
                }
                process.status = ProcessStatus::Canceled;
                process.status_detail = Some("canceled".to_string());
                process.clear_binding();
            }

            let stage = &mut project.stages[stage_index];
            stage.status = StageStatus::Canceled;
            stage.current_job = None;
            (targets, servers)
        };

        info!(project = %project_id, stage = stage_name, cancels = targets.len(), "canceled stage");

        for target in targets {
            let transport = self.transport.clone();
            let graph = self.graph.clone();
            tokio::spawn(async move {
                let Some(server) = graph.server(&target.server) else {
                    return;
                };
                let Some(instance) = server.instances.iter().find(|i| i.name == target.instance)
                else {
                    return;
                };
                if let Err(e) = transport
                    .cancel(
                        instance,
                        &target.endpoint,
                        &target.session_key,
                        &target.external_id,
                    )
                    .await
                {
                    warn!(instance = %target.instance, error = %e, "cancel request failed");
                }
            });
        }

        // Canceling frees capacity.
        servers.sort();
        servers.dedup();
        for server in servers {
            self.drain_queue(&server).await;
        }
        Ok(())
    }

    /// Moves a process to ERROR, clearing its binding fields.
    pub(crate) async fn mark_process_error(
        &self,
        position: ProcessRef,
        detail: String,
    ) -> Result<(), EngineError> {
        let handle = self.project(position.project_id).await?;
        let mut project = handle.lock().await;
        let process = &mut project.stages[position.stage_index].processes[position.process_index];
        warn!(project = %position.project_id, job = %process.job_name, detail = %detail, "process errored");
        process.status = ProcessStatus::Error;
        process.status_detail = Some(detail);
        process.clear_binding();
        refresh_stage(&mut project.stages[position.stage_index]);
        Ok(())
    }

    /// Resolves the dataset a job reads from, for hold-out gating. The first
    /// declared input decides; a job without declared inputs reads the
    /// latest dataset.
    pub(crate) fn job_source_dataset(
        &self,
        project: &crate::registry::Project,
        stage_index: usize,
        process_index: usize,
    ) -> Option<crate::registry::DatasetMeta> {
        let source = self
            .graph
            .job(stage_index, process_index)
            .and_then(|j| j.inputs.first())
            .map(|i| i.source.clone())
            .unwrap_or(DataSource::LastOrOriginal);
        resolve_source_dataset(project, stage_index, process_index, &source)
    }

    fn cancel_target(
        &self,
        stage_index: usize,
        process_index: usize,
        process: &crate::registry::Process,
    ) -> Option<CancelTarget> {
        let binding = process.bound_instance.as_ref()?;
        let external_id = process.external_id.as_deref()?;
        let template = self
            .graph
            .job(stage_index, process_index)?
            .endpoints
            .as_ref()?
            .cancel
            .as_deref()?;
        Some(CancelTarget {
            server: binding.server.clone(),
            instance: binding.instance.clone(),
            endpoint: crate::worker::render_endpoint(template, external_id),
            session_key: process
                .correlation_id
                .map(|c| c.to_string())
                .unwrap_or_default(),
            external_id: external_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Process;

    fn process(job: &str, status: ProcessStatus) -> Process {
        Process {
            job_name: job.to_string(),
            server: Some("s".to_string()),
            status,
            skip: false,
            configuration: None,
            scheduled_at: None,
            external_id: None,
            correlation_id: None,
            bound_instance: None,
            status_detail: None,
            result_files: Default::default(),
            dataset: None,
        }
    }

    #[test]
    fn test_refresh_stage_clears_index_when_not_running() {
        let mut stage = Stage {
            name: "execution".to_string(),
            status: StageStatus::Running,
            current_job: Some(1),
            processes: vec![
                process("a", ProcessStatus::Finished),
                process("b", ProcessStatus::Finished),
            ],
        };
        refresh_stage(&mut stage);
        assert_eq!(stage.status, StageStatus::Finished);
        assert_eq!(stage.current_job, None);
    }

    #[test]
    fn test_refresh_stage_keeps_index_while_running() {
        let mut stage = Stage {
            name: "execution".to_string(),
            status: StageStatus::Running,
            current_job: Some(1),
            processes: vec![
                process("a", ProcessStatus::Finished),
                process("b", ProcessStatus::Running),
            ],
        };
        refresh_stage(&mut stage);
        assert_eq!(stage.status, StageStatus::Running);
        assert_eq!(stage.current_job, Some(1));
    }

    #[test]
    fn test_refresh_stage_error_dominates() {
        let mut stage = Stage {
            name: "execution".to_string(),
            status: StageStatus::Running,
            current_job: Some(0),
            processes: vec![
                process("a", ProcessStatus::Error),
                process("b", ProcessStatus::NotStarted),
            ],
        };
        refresh_stage(&mut stage);
        assert_eq!(stage.status, StageStatus::Error);
        assert_eq!(stage.current_job, None);
    }
}
