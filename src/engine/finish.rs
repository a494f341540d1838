//! The asynchronous finish protocol.
//!
//! Workers report completion by posting multipart result parts to the
//! callback URL carrying the correlation id. The id is single-use: it is
//! cleared the moment the callback is accepted, so duplicate deliveries and
//! late post-cancel callbacks resolve to no process and are rejected as
//! user errors. Result application is isolated from the state transition: a
//! malformed payload moves the process to ERROR instead of propagating.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dataset::{ColumnConfiguration, DataConfiguration, Value};
use crate::error::{EngineError, WorkerError};
use crate::registry::{DatasetMeta, ProcessRef, ProcessStatus};

use super::lifecycle::refresh_stage;
use super::service::PipelineExecutionService;

/// One named part of a finish callback.
#[derive(Debug, Clone)]
pub struct ResultPart {
    pub name: String,
    pub payload: Vec<u8>,
}

/// What the callback did to the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    Finished,
    /// The worker reported failure, or the results could not be applied.
    Errored,
}

/// Structured failure payload of an ERROR-encoded part.
#[derive(Debug, Deserialize)]
struct ErrorPartBody {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

/// A fully-typed dataset payload carrying its own schema.
#[derive(Debug, Deserialize)]
struct DataSetPayload {
    columns: Vec<ColumnConfiguration>,
    rows: Vec<Vec<serde_json::Value>>,
}

/// Applied results, ready to commit under the project lock.
struct AppliedResults {
    dataset: Option<DatasetMeta>,
    files: HashMap<String, Vec<u8>>,
    /// Failure reported by the worker despite successful transport.
    failure: Option<String>,
}

/// Per-part interpretation, snapshotted from the job definition.
#[derive(Debug, Clone)]
struct FinishContext {
    position: ProcessRef,
    job_name: String,
    server: Option<String>,
    /// part name -> declared encoding; unknown parts default to FILE.
    encodings: HashMap<String, crate::config::OutputEncoding>,
    /// Schema DATA parts are parsed against.
    source_schema: Option<DataConfiguration>,
    /// Instance + rendered endpoint for the diagnostic final status fetch.
    status_probe: Option<(crate::config::InstanceConfig, String)>,
}

impl PipelineExecutionService {
    /// Handles a finish callback.
    ///
    /// Returns a user error for unknown or already-consumed correlation ids.
    /// Any failure applying the results becomes an ERROR transition on the
    /// process, never a propagated error: the callback itself succeeded.
    pub async fn finish(
        &self,
        correlation_id: Uuid,
        parts: Vec<ResultPart>,
    ) -> Result<FinishOutcome, EngineError> {
        let position = self
            .registry
            .resolve_correlation(correlation_id)
            .await
            .ok_or(EngineError::NoSuchProcess(correlation_id))?;

        let context = self.accept_callback(correlation_id, position).await?;

        let applied = self.apply_results(&context, parts).await;

        let outcome = match applied {
            Ok(applied) if applied.failure.is_none() => {
                self.commit_finish(&context, applied).await?;
                FinishOutcome::Finished
            }
            Ok(applied) => {
                let detail = applied
                    .failure
                    .clone()
                    .unwrap_or_else(|| "worker reported failure".to_string());
                self.commit_failure(&context, applied.files, detail).await?;
                FinishOutcome::Errored
            }
            Err(e) => {
                warn!(job = %context.job_name, error = %e, "result application failed");
                self.commit_failure(
                    &context,
                    HashMap::new(),
                    format!("result application failed: {}", e),
                )
                .await?;
                FinishOutcome::Errored
            }
        };

        self.fetch_final_status(&context);

        if outcome == FinishOutcome::Finished {
            // Advance in its own lock scope; a failure here is logged and
            // the FINISHED transition stands.
            if let Err(e) = self
                .advance_stage(
                    position.project_id,
                    position.stage_index,
                    position.process_index,
                )
                .await
            {
                warn!(job = %context.job_name, error = %e, "advancing after finish failed");
            }
        }

        // The finished or errored process freed a slot either way.
        if let Some(server) = &context.server {
            self.drain_queue(server).await;
        }
        Ok(outcome)
    }

    /// Consumes the correlation id and snapshots everything result
    /// application needs, in one lock scope.
    async fn accept_callback(
        &self,
        correlation_id: Uuid,
        position: ProcessRef,
    ) -> Result<FinishContext, EngineError> {
        let handle = self
            .registry
            .project(position.project_id)
            .await
            .ok_or(EngineError::NoSuchProcess(correlation_id))?;
        let mut project = handle.lock().await;

        let status_probe =
            self.worker_status_probe(&project, position.stage_index, position.process_index);
        let source_schema = self
            .job_source_dataset(&project, position.stage_index, position.process_index)
            .map(|d| d.data_configuration);

        let process =
            &mut project.stages[position.stage_index].processes[position.process_index];
        if process.correlation_id != Some(correlation_id) {
            // Lost the race against a duplicate delivery or a cancel.
            return Err(EngineError::NoSuchProcess(correlation_id));
        }
        process.correlation_id = None;

        let job = self
            .graph
            .job(position.stage_index, position.process_index)
            .ok_or_else(|| {
                EngineError::Internal(format!("no job definition for '{}'", process.job_name))
            })?;

        info!(job = %process.job_name, correlation = %correlation_id, "callback accepted");
        Ok(FinishContext {
            position,
            job_name: process.job_name.clone(),
            server: process.server.clone(),
            encodings: job
                .outputs
                .iter()
                .map(|o| (o.part.clone(), o.encoding))
                .collect(),
            source_schema,
            status_probe,
        })
    }

    /// Interprets the delivered parts per their declared encodings.
    async fn apply_results(
        &self,
        context: &FinishContext,
        parts: Vec<ResultPart>,
    ) -> Result<AppliedResults, EngineError> {
        use crate::config::OutputEncoding;

        let mut applied = AppliedResults {
            dataset: None,
            files: HashMap::new(),
            failure: None,
        };

        for part in parts {
            let encoding = context
                .encodings
                .get(&part.name)
                .copied()
                .unwrap_or(OutputEncoding::File);
            match encoding {
                OutputEncoding::Error => {
                    applied.failure = Some(parse_error_part(&part));
                }
                OutputEncoding::ErrorMessage => {
                    applied.failure =
                        Some(String::from_utf8_lossy(&part.payload).trim().to_string());
                }
                OutputEncoding::Data => {
                    let meta = self.apply_data_part(context, &part).await?;
                    applied.dataset = Some(meta);
                }
                OutputEncoding::DataSet => {
                    let meta = self.apply_data_set_part(&part).await?;
                    applied.dataset = Some(meta);
                }
                OutputEncoding::File => {
                    applied.files.insert(part.name, part.payload);
                }
            }
        }
        Ok(applied)
    }

    /// DATA: raw rows parsed against the source dataset's schema.
    async fn apply_data_part(
        &self,
        context: &FinishContext,
        part: &ResultPart,
    ) -> Result<DatasetMeta, EngineError> {
        let schema = context
            .source_schema
            .as_ref()
            .ok_or_else(|| EngineError::NoSourceDataset(context.job_name.clone()))?;
        let raw_rows: Vec<Vec<Option<String>>> =
            serde_json::from_slice(&part.payload).map_err(|e| EngineError::MalformedPayload {
                part: part.name.clone(),
                detail: e.to_string(),
            })?;

        let dataset_id = self.registry.allocate_dataset_id();
        self.persist_raw_rows(dataset_id, schema, &raw_rows).await
    }

    /// DATA_SET: a fully-typed payload carrying its own schema.
    async fn apply_data_set_part(&self, part: &ResultPart) -> Result<DatasetMeta, EngineError> {
        let payload: DataSetPayload =
            serde_json::from_slice(&part.payload).map_err(|e| EngineError::MalformedPayload {
                part: part.name.clone(),
                detail: e.to_string(),
            })?;
        let schema = DataConfiguration::new(payload.columns);
        schema
            .check()
            .map_err(|e| EngineError::MalformedPayload {
                part: part.name.clone(),
                detail: e.to_string(),
            })?;

        let mut rows = Vec::with_capacity(payload.rows.len());
        for (row_index, row) in payload.rows.iter().enumerate() {
            if row.len() != schema.columns.len() {
                return Err(EngineError::MalformedPayload {
                    part: part.name.clone(),
                    detail: format!(
                        "row {} has {} cells, schema declares {}",
                        row_index,
                        row.len(),
                        schema.columns.len()
                    ),
                });
            }
            let mut values = Vec::with_capacity(row.len());
            for (column, cell) in schema.columns.iter().zip(row.iter()) {
                values.push(Value::from_json(cell, column.data_type, row_index, column.index)?);
            }
            rows.push(values);
        }

        let dataset_id = self.registry.allocate_dataset_id();
        self.persist_typed_rows(dataset_id, &schema, &rows, &[])
            .await
    }

    /// Commits a successful finish under the project lock.
    async fn commit_finish(
        &self,
        context: &FinishContext,
        applied: AppliedResults,
    ) -> Result<(), EngineError> {
        let handle = self.project(context.position.project_id).await?;
        let mut project = handle.lock().await;
        let process = &mut project.stages[context.position.stage_index].processes
            [context.position.process_index];
        process.status = ProcessStatus::Finished;
        process.clear_binding();
        process.status_detail = None;
        process.result_files.extend(applied.files);
        if applied.dataset.is_some() {
            process.dataset = applied.dataset;
        }
        info!(job = %context.job_name, "process finished");
        refresh_stage(&mut project.stages[context.position.stage_index]);
        Ok(())
    }

    /// Commits a failed finish: the worker reported an error, or the
    /// results could not be applied.
    async fn commit_failure(
        &self,
        context: &FinishContext,
        files: HashMap<String, Vec<u8>>,
        detail: String,
    ) -> Result<(), EngineError> {
        let handle = self.project(context.position.project_id).await?;
        {
            let mut project = handle.lock().await;
            let process = &mut project.stages[context.position.stage_index].processes
                [context.position.process_index];
            process.result_files.extend(files);
        }
        self.mark_process_error(context.position, detail).await
    }

    /// Fire-and-forget diagnostic fetch of the worker's final status
    /// document. Failures are logged and dropped.
    fn fetch_final_status(&self, context: &FinishContext) {
        let Some((instance, endpoint)) = context.status_probe.clone() else {
            return;
        };
        let transport = self.transport.clone();
        let job_name = context.job_name.clone();
        tokio::spawn(async move {
            match transport.fetch_status(&instance, &endpoint).await {
                Ok(doc) => info!(job = %job_name, status = %doc, "final worker status"),
                Err(WorkerError::Timeout(_)) => {}
                Err(e) => warn!(job = %job_name, error = %e, "final status fetch failed"),
            }
        });
    }
}

/// Extracts a human-readable message from an ERROR part, falling back to the
/// raw payload when it is not the structured form.
fn parse_error_part(part: &ResultPart) -> String {
    match serde_json::from_slice::<ErrorPartBody>(&part.payload) {
        Ok(body) => {
            let message = body
                .message
                .or(body.detail)
                .unwrap_or_else(|| "worker reported failure".to_string());
            match (body.kind, body.code) {
                (_, Some(code)) => format!("{}: {}", code, message),
                (Some(kind), None) => format!("{}: {}", kind, message),
                (None, None) => message,
            }
        }
        Err(_) => String::from_utf8_lossy(&part.payload).trim().to_string(),
    }
}
