//! Dispatching processes to worker instances and draining the capacity
//! queue.
//!
//! Capacity is never reserved: dispatch derives each instance's live load
//! from committed process state at decision time. A process that finds no
//! instance is enqueued by moving it to SCHEDULED with a timestamp; the
//! queue is the set of SCHEDULED processes, drained oldest-first whenever an
//! event may have freed a slot. There is no background loop.

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::dataset::{ExportOptions, HoldOutSelector};
use crate::error::EngineError;
use crate::registry::{InstanceBinding, ProcessRef, ProcessStatus};
use crate::worker::{Selection, StartPart, StartRequest};

use super::lifecycle::refresh_stage;
use super::service::{resolve_source_dataset, PipelineExecutionService};

/// What a dispatch attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The start request was accepted; the process is RUNNING.
    Started,
    /// No instance could take the process; it is SCHEDULED in the queue.
    Queued,
    /// The process was already running or its state changed concurrently;
    /// nothing was done.
    AlreadySatisfied,
}

/// Everything a dispatch needs, captured under the project lock so the
/// outbound call can happen without it.
struct DispatchPlan {
    job_name: String,
    server_name: String,
    start_endpoint: String,
    configuration: String,
    /// (part name, dataset id, schema, hold-out filter)
    inputs: Vec<PlannedInput>,
}

struct PlannedInput {
    part: String,
    dataset_id: i64,
    schema: crate::dataset::DataConfiguration,
    hold_out: HoldOutSelector,
}

impl PipelineExecutionService {
    /// Dispatches one process to a worker instance, or enqueues it.
    ///
    /// Idempotent for processes that are already RUNNING. A dispatch failure
    /// (timeout or rejection alike) moves the process to ERROR and surfaces
    /// as an external error; the caller decides whether to propagate or to
    /// continue with the next queue candidate.
    pub(crate) async fn dispatch(
        &self,
        position: ProcessRef,
        ignore_capacity: bool,
    ) -> Result<DispatchOutcome, EngineError> {
        let handle = self.project(position.project_id).await?;

        let plan = {
            let project = handle.lock().await;
            let process =
                &project.stages[position.stage_index].processes[position.process_index];
            match process.status {
                ProcessStatus::Running => return Ok(DispatchOutcome::AlreadySatisfied),
                ProcessStatus::NotStarted | ProcessStatus::Scheduled => {}
                other => {
                    return Err(EngineError::Internal(format!(
                        "dispatch on process '{}' in state {}",
                        process.job_name, other
                    )))
                }
            }

            let job = self
                .graph
                .job(position.stage_index, position.process_index)
                .ok_or_else(|| {
                    EngineError::Internal(format!(
                        "no job definition at stage {} index {}",
                        position.stage_index, position.process_index
                    ))
                })?;
            let server_name = job.server.clone().ok_or_else(|| {
                EngineError::Internal(format!("job '{}' has no server binding", job.name))
            })?;
            let start_endpoint = job
                .endpoints
                .as_ref()
                .map(|e| e.start.clone())
                .ok_or_else(|| {
                    EngineError::Internal(format!("job '{}' has no endpoints", job.name))
                })?;
            let configuration = process
                .configuration
                .as_ref()
                .map(|c| c.payload.clone())
                .ok_or_else(|| EngineError::JobNotConfigured(job.name.clone()))?;

            let mut inputs = Vec::with_capacity(job.inputs.len());
            for input in &job.inputs {
                let meta = resolve_source_dataset(
                    &project,
                    position.stage_index,
                    position.process_index,
                    &input.source,
                )
                .ok_or_else(|| EngineError::NoSourceDataset(job.name.clone()))?;
                inputs.push(PlannedInput {
                    part: input.part.clone(),
                    dataset_id: meta.id,
                    schema: meta.data_configuration.clone(),
                    hold_out: input.hold_out.into(),
                });
            }

            DispatchPlan {
                job_name: job.name.clone(),
                server_name,
                start_endpoint,
                configuration,
                inputs,
            }
        };

        let server = self
            .graph
            .server(&plan.server_name)
            .ok_or_else(|| {
                EngineError::Internal(format!("unknown server '{}'", plan.server_name))
            })?
            .clone();

        let loads = self.instance_loads(&plan.server_name, &server).await;
        let selection = self
            .pool
            .select_instance(&server, &loads, ignore_capacity)
            .await;
        let instance_index = match selection {
            Selection::Instance(index) => index,
            Selection::NoCapacity | Selection::NoneHealthy => {
                self.enqueue(&handle, position, &plan, selection).await;
                return Ok(DispatchOutcome::Queued);
            }
        };
        let instance = server.instances[instance_index].clone();

        let parts = match self.export_inputs(&plan).await {
            Ok(parts) => parts,
            Err(e) => {
                self.mark_process_error(position, format!("input export failed: {}", e))
                    .await?;
                return Err(e);
            }
        };
        let correlation_id = Uuid::new_v4();
        let request = StartRequest {
            endpoint: plan.start_endpoint.clone(),
            session_key: correlation_id.to_string(),
            callback_url: self.graph.callback_url(&instance, correlation_id),
            configuration: plan.configuration.clone(),
            parts,
        };

        // Bind before the call: the correlation id is live from the moment
        // the worker can see it in the callback URL.
        {
            let mut project = handle.lock().await;
            let process =
                &mut project.stages[position.stage_index].processes[position.process_index];
            if !matches!(
                process.status,
                ProcessStatus::NotStarted | ProcessStatus::Scheduled
            ) {
                debug!(job = %plan.job_name, status = %process.status, "dispatch superseded");
                return Ok(DispatchOutcome::AlreadySatisfied);
            }
            process.status = ProcessStatus::Running;
            process.scheduled_at = None;
            process.correlation_id = Some(correlation_id);
            process.bound_instance = Some(InstanceBinding {
                server: plan.server_name.clone(),
                instance: instance.name.clone(),
            });
        }

        info!(
            job = %plan.job_name,
            instance = %instance.name,
            correlation = %correlation_id,
            "dispatching process"
        );

        match self.transport.start_process(&instance, &request).await {
            Ok(response) => {
                let mut project = handle.lock().await;
                let process =
                    &mut project.stages[position.stage_index].processes[position.process_index];
                // The callback may already have finished the process.
                if process.correlation_id == Some(correlation_id)
                    || process.status == ProcessStatus::Finished
                {
                    process.external_id = Some(response.process_id);
                }
                Ok(DispatchOutcome::Started)
            }
            Err(e) => {
                self.mark_process_error(position, format!("dispatch failed: {}", e))
                    .await?;
                Err(EngineError::Worker(e))
            }
        }
    }

    /// Drains the capacity queue of one server: oldest SCHEDULED process
    /// first, until the queue is empty or capacity runs out again. A failed
    /// candidate is taken out of the queue as ERROR; the drain moves on to
    /// the next one.
    pub async fn drain_queue(&self, server: &str) {
        loop {
            let Some(queued) = self.registry.oldest_scheduled(server).await else {
                return;
            };
            match self.dispatch(queued.position, false).await {
                Ok(DispatchOutcome::Queued) => {
                    debug!(server, "queue drain stopped: no capacity");
                    return;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(server, error = %e, "queued dispatch failed; continuing drain");
                    self.fail_if_scheduled(queued.position, format!("dispatch failed: {}", e))
                        .await;
                    continue;
                }
            }
        }
    }

    /// Takes a candidate out of the queue after a failure that happened
    /// before any state change. Left SCHEDULED, the drain would select the
    /// same process again and never terminate.
    async fn fail_if_scheduled(&self, position: ProcessRef, detail: String) {
        let Ok(handle) = self.project(position.project_id).await else {
            return;
        };
        let mut project = handle.lock().await;
        let process =
            &mut project.stages[position.stage_index].processes[position.process_index];
        if process.status != ProcessStatus::Scheduled {
            return;
        }
        warn!(job = %process.job_name, detail = %detail, "queued process errored");
        process.status = ProcessStatus::Error;
        process.status_detail = Some(detail);
        process.clear_binding();
        refresh_stage(&mut project.stages[position.stage_index]);
    }

    /// Live RUNNING count per instance, in configuration order.
    async fn instance_loads(&self, server_name: &str, server: &ServerConfig) -> Vec<usize> {
        let mut loads = Vec::with_capacity(server.instances.len());
        for instance in &server.instances {
            loads.push(self.registry.running_count(server_name, &instance.name).await);
        }
        loads
    }

    /// Moves a process into the queue, preserving an existing enqueue
    /// timestamp so the FIFO order is by first enqueue.
    async fn enqueue(
        &self,
        handle: &std::sync::Arc<tokio::sync::Mutex<crate::registry::Project>>,
        position: ProcessRef,
        plan: &DispatchPlan,
        selection: Selection,
    ) {
        let mut project = handle.lock().await;
        let process = &mut project.stages[position.stage_index].processes[position.process_index];
        if process.status != ProcessStatus::Scheduled {
            process.status = ProcessStatus::Scheduled;
            process.scheduled_at = Some(Utc::now());
        }
        info!(
            job = %plan.job_name,
            server = %plan.server_name,
            reason = ?selection,
            "no instance available; process queued"
        );
    }

    /// Exports the planned input datasets as JSON multipart payloads.
    async fn export_inputs(&self, plan: &DispatchPlan) -> Result<Vec<StartPart>, EngineError> {
        let mut parts = Vec::with_capacity(plan.inputs.len());
        for input in &plan.inputs {
            let options = ExportOptions {
                hold_out: input.hold_out,
                ..ExportOptions::default()
            };
            let table = self
                .export
                .export(input.dataset_id, &input.schema, &options)
                .await?;
            let payload =
                serde_json::to_vec(&table).map_err(|e| EngineError::Internal(e.to_string()))?;
            parts.push(StartPart {
                name: input.part.clone(),
                file_name: format!("{}.json", input.part),
                payload,
            });
        }
        Ok(parts)
    }
}
