//! Process orchestration: stage lifecycle, capacity scheduling and the
//! asynchronous finish protocol.
//!
//! The engine is event-driven: every state change happens inside a caller's
//! request or a worker's callback, never in a background loop. The capacity
//! queue is drained whenever an event may have freed a slot.

pub mod finish;
pub mod lifecycle;
pub mod scheduler;
pub mod service;

pub use finish::{FinishOutcome, ResultPart};
pub use scheduler::DispatchOutcome;
pub use service::{
    DatasetRef, PipelineExecutionService, ProcessStatusView, ProcessSummary, StageStatusView,
};

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use sqlx::postgres::PgPoolOptions;
    use uuid::Uuid;

    use chrono::Utc;

    use crate::config::{
        DataSource, EngineGraph, HoldOutSelectorConfig, InputPart, InstanceConfig, JobEndpoints,
        JobGraph, OutputEncoding, OutputPart, PipelineGraph, ServerConfig, StageGraph,
    };
    use crate::dataset::DataConfiguration;
    use crate::error::{EngineError, WorkerError};
    use crate::registry::{DatasetMeta, ProcessStatus, StageStatus};
    use crate::worker::{StartRequest, StartResponse, WorkerTransport};

    use super::*;

    /// Records start requests and lets tests inject failures.
    struct RecordingTransport {
        starts: Mutex<Vec<(String, StartRequest)>>,
        cancels: Mutex<Vec<String>>,
        next_pid: AtomicUsize,
        fail_starts: AtomicBool,
    }

    impl RecordingTransport {
        fn new() -> Self {
            Self {
                starts: Mutex::new(Vec::new()),
                cancels: Mutex::new(Vec::new()),
                next_pid: AtomicUsize::new(1),
                fail_starts: AtomicBool::new(false),
            }
        }

        fn start_count(&self) -> usize {
            self.starts.lock().expect("lock poisoned").len()
        }

        fn last_start(&self) -> (String, StartRequest) {
            self.starts
                .lock()
                .expect("lock poisoned")
                .last()
                .cloned()
                .expect("no start recorded")
        }
    }

    #[async_trait]
    impl WorkerTransport for RecordingTransport {
        async fn start_process(
            &self,
            instance: &InstanceConfig,
            request: &StartRequest,
        ) -> Result<StartResponse, WorkerError> {
            if self.fail_starts.load(Ordering::SeqCst) {
                return Err(WorkerError::UnexpectedStatus {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            self.starts
                .lock()
                .expect("lock poisoned")
                .push((instance.name.clone(), request.clone()));
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            Ok(StartResponse {
                process_id: format!("pid-{}", pid),
            })
        }

        async fn fetch_status(
            &self,
            _instance: &InstanceConfig,
            _endpoint: &str,
        ) -> Result<serde_json::Value, WorkerError> {
            Ok(serde_json::json!({"status": "done"}))
        }

        async fn cancel(
            &self,
            _instance: &InstanceConfig,
            _endpoint: &str,
            _session_key: &str,
            external_id: &str,
        ) -> Result<(), WorkerError> {
            self.cancels
                .lock()
                .expect("lock poisoned")
                .push(external_id.to_string());
            Ok(())
        }

        async fn probe_health(
            &self,
            _instance: &InstanceConfig,
            _endpoint: &str,
            _timeout: Duration,
        ) -> bool {
            true
        }
    }

    fn job(name: &str, skip: bool, requires_hold_out: bool) -> JobGraph {
        JobGraph {
            name: name.to_string(),
            server: Some("synthesis".to_string()),
            endpoints: Some(JobEndpoints {
                start: "/start".to_string(),
                status: Some("/status/{id}".to_string()),
                cancel: Some("/cancel/{id}".to_string()),
            }),
            inputs: vec![],
            outputs: vec![OutputPart {
                part: "report".to_string(),
                encoding: OutputEncoding::File,
            }],
            requires_hold_out,
            skip,
        }
    }

    fn graph(jobs: Vec<JobGraph>, max_parallel: usize) -> EngineGraph {
        let mut servers = HashMap::new();
        servers.insert(
            "synthesis".to_string(),
            ServerConfig {
                min_up: 1,
                health_endpoint: "/actuator/health".to_string(),
                health_timeout_secs: 2,
                instances: vec![InstanceConfig {
                    name: "synthesis-0".to_string(),
                    url: "http://synthesis-0:8000".to_string(),
                    max_parallel,
                    callback_host: None,
                }],
            },
        );
        EngineGraph {
            servers,
            pipeline: PipelineGraph {
                stages: vec![StageGraph {
                    name: "execution".to_string(),
                    jobs,
                }],
            },
            callback_base: "http://engine:8080".to_string(),
            dispatch_timeout_secs: 10,
        }
    }

    /// The database is never reached by jobs without declared inputs, so a
    /// lazy pool suffices for lifecycle tests.
    fn service(
        graph: EngineGraph,
        transport: Arc<RecordingTransport>,
    ) -> PipelineExecutionService {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://flowforge@localhost/flowforge_test")
            .expect("lazy pool");
        PipelineExecutionService::new(graph, pool, transport, 1)
    }

    async fn configured_project(svc: &PipelineExecutionService, jobs: &[&str]) -> Uuid {
        let project = svc.create_project().await;
        for job in jobs {
            svc.configure_job(project, "execution", job, "{}".to_string(), None)
                .await
                .expect("configure");
        }
        project
    }

    async fn correlation_of(svc: &PipelineExecutionService, project: Uuid, index: usize) -> Uuid {
        let handle = svc.registry.project(project).await.expect("project");
        let p = handle.lock().await;
        p.stages[0].processes[index]
            .correlation_id
            .expect("correlation id")
    }

    #[tokio::test]
    async fn test_start_dispatches_and_binds() {
        let transport = Arc::new(RecordingTransport::new());
        let svc = service(graph(vec![job("synthesis", false, false)], 2), transport.clone());
        let project = configured_project(&svc, &["synthesis"]).await;

        svc.start_stage(project, "execution", None, false)
            .await
            .expect("start");

        assert_eq!(transport.start_count(), 1);
        let (instance, request) = transport.last_start();
        assert_eq!(instance, "synthesis-0");
        assert!(request.callback_url.contains("/api/process/"));
        assert_eq!(request.session_key, {
            let c = correlation_of(&svc, project, 0).await;
            c.to_string()
        });

        let status = svc.stage_status(project, "execution").await.expect("status");
        assert_eq!(status.status, StageStatus::Running);
        assert_eq!(status.current_job, Some(0));
        assert_eq!(status.processes[0].status, ProcessStatus::Running);
    }

    #[tokio::test]
    async fn test_start_unconfigured_job_is_a_user_error() {
        let transport = Arc::new(RecordingTransport::new());
        let svc = service(graph(vec![job("synthesis", false, false)], 2), transport.clone());
        let project = svc.create_project().await;

        let err = svc
            .start_stage(project, "execution", None, false)
            .await
            .expect_err("should fail");
        assert!(matches!(err, EngineError::JobNotConfigured(_)));
        assert!(err.is_user_error());
        assert_eq!(transport.start_count(), 0);

        // Nothing ran, so the stage must not report running.
        let status = svc.stage_status(project, "execution").await.expect("status");
        assert_eq!(status.status, StageStatus::NotStarted);
        assert_eq!(status.current_job, None);
    }

    #[tokio::test]
    async fn test_finish_with_file_part_stores_result() {
        let transport = Arc::new(RecordingTransport::new());
        let svc = service(graph(vec![job("synthesis", false, false)], 2), transport.clone());
        let project = configured_project(&svc, &["synthesis"]).await;
        svc.start_stage(project, "execution", None, false)
            .await
            .expect("start");
        let correlation = correlation_of(&svc, project, 0).await;

        let outcome = svc
            .finish(
                correlation,
                vec![ResultPart {
                    name: "report".to_string(),
                    payload: b"summary".to_vec(),
                }],
            )
            .await
            .expect("finish");
        assert_eq!(outcome, FinishOutcome::Finished);

        let handle = svc.registry.project(project).await.expect("project");
        let p = handle.lock().await;
        let process = &p.stages[0].processes[0];
        assert_eq!(process.status, ProcessStatus::Finished);
        assert_eq!(process.correlation_id, None);
        assert_eq!(process.bound_instance, None);
        assert_eq!(process.result_files["report"], b"summary".to_vec());
        assert_eq!(p.stages[0].status, StageStatus::Finished);
        assert_eq!(p.stages[0].current_job, None);
    }

    #[tokio::test]
    async fn test_duplicate_callback_is_rejected() {
        let transport = Arc::new(RecordingTransport::new());
        let svc = service(graph(vec![job("synthesis", false, false)], 2), transport);
        let project = configured_project(&svc, &["synthesis"]).await;
        svc.start_stage(project, "execution", None, false)
            .await
            .expect("start");
        let correlation = correlation_of(&svc, project, 0).await;

        svc.finish(correlation, vec![]).await.expect("first finish");
        let err = svc
            .finish(correlation, vec![])
            .await
            .expect_err("second delivery");
        assert!(matches!(err, EngineError::NoSuchProcess(_)));
        assert!(err.is_user_error());
    }

    #[tokio::test]
    async fn test_error_part_moves_process_to_error() {
        let mut failing_job = job("synthesis", false, false);
        failing_job.outputs.push(OutputPart {
            part: "error".to_string(),
            encoding: OutputEncoding::Error,
        });
        let transport = Arc::new(RecordingTransport::new());
        let svc = service(graph(vec![failing_job], 2), transport);
        let project = configured_project(&svc, &["synthesis"]).await;
        svc.start_stage(project, "execution", None, false)
            .await
            .expect("start");
        let correlation = correlation_of(&svc, project, 0).await;

        let outcome = svc
            .finish(
                correlation,
                vec![ResultPart {
                    name: "error".to_string(),
                    payload: br#"{"code":"OOM","message":"out of memory"}"#.to_vec(),
                }],
            )
            .await
            .expect("callback accepted");
        assert_eq!(outcome, FinishOutcome::Errored);

        let status = svc.stage_status(project, "execution").await.expect("status");
        assert_eq!(status.status, StageStatus::Error);
        assert_eq!(status.processes[0].status, ProcessStatus::Error);
        assert!(status.processes[0]
            .status_detail
            .as_deref()
            .expect("detail")
            .contains("OOM"));
    }

    #[tokio::test]
    async fn test_saturated_instance_queues_and_drains_on_finish() {
        let transport = Arc::new(RecordingTransport::new());
        let svc = service(graph(vec![job("synthesis", false, false)], 1), transport.clone());
        let first = configured_project(&svc, &["synthesis"]).await;
        let second = configured_project(&svc, &["synthesis"]).await;

        svc.start_stage(first, "execution", None, false)
            .await
            .expect("start first");
        svc.start_stage(second, "execution", None, false)
            .await
            .expect("start second");

        assert_eq!(transport.start_count(), 1);
        {
            let handle = svc.registry.project(second).await.expect("project");
            let p = handle.lock().await;
            let process = &p.stages[0].processes[0];
            assert_eq!(process.status, ProcessStatus::Scheduled);
            assert!(process.scheduled_at.is_some());
        }

        // Finishing the first frees the slot; the drain dispatches the
        // queued process.
        let correlation = correlation_of(&svc, first, 0).await;
        svc.finish(correlation, vec![]).await.expect("finish");

        assert_eq!(transport.start_count(), 2);
        let handle = svc.registry.project(second).await.expect("project");
        let p = handle.lock().await;
        assert_eq!(p.stages[0].processes[0].status, ProcessStatus::Running);
    }

    #[tokio::test]
    async fn test_drain_removes_candidate_that_cannot_resolve_inputs() {
        let transport = Arc::new(RecordingTransport::new());
        let mut consuming = job("synthesis", false, false);
        consuming.inputs.push(InputPart {
            part: "input".to_string(),
            source: DataSource::LastOrOriginal,
            hold_out: HoldOutSelectorConfig::All,
        });
        let svc = service(graph(vec![consuming], 1), transport.clone());
        let project = configured_project(&svc, &["synthesis"]).await;

        // Queue the process by hand; its input can no longer resolve because
        // no dataset with stored data exists.
        {
            let handle = svc.registry.project(project).await.expect("project");
            let mut p = handle.lock().await;
            let process = &mut p.stages[0].processes[0];
            process.status = ProcessStatus::Scheduled;
            process.scheduled_at = Some(Utc::now());
        }

        tokio::time::timeout(Duration::from_secs(5), svc.drain_queue("synthesis"))
            .await
            .expect("drain should terminate");

        assert_eq!(transport.start_count(), 0);
        let handle = svc.registry.project(project).await.expect("project");
        let p = handle.lock().await;
        assert_eq!(p.stages[0].processes[0].status, ProcessStatus::Error);
        assert_eq!(p.stages[0].status, StageStatus::Error);
    }

    #[tokio::test]
    async fn test_skip_flag_settles_without_network() {
        let transport = Arc::new(RecordingTransport::new());
        let svc = service(graph(vec![job("synthesis", true, false)], 2), transport.clone());
        let project = configured_project(&svc, &["synthesis"]).await;

        svc.start_stage(project, "execution", None, false)
            .await
            .expect("start");

        assert_eq!(transport.start_count(), 0);
        let status = svc.stage_status(project, "execution").await.expect("status");
        assert_eq!(status.status, StageStatus::Finished);
        assert_eq!(status.processes[0].status, ProcessStatus::Skipped);
    }

    #[tokio::test]
    async fn test_missing_hold_out_split_skips_without_network() {
        let transport = Arc::new(RecordingTransport::new());
        let svc = service(graph(vec![job("synthesis", false, true)], 2), transport.clone());
        let project = configured_project(&svc, &["synthesis"]).await;

        // A stored source dataset without a generated split.
        {
            let handle = svc.registry.project(project).await.expect("project");
            let mut p = handle.lock().await;
            let mut meta = DatasetMeta::new(1, DataConfiguration::default());
            meta.stored_data = true;
            p.original_dataset = Some(meta);
        }

        svc.start_stage(project, "execution", None, false)
            .await
            .expect("start");

        assert_eq!(transport.start_count(), 0);
        let status = svc.stage_status(project, "execution").await.expect("status");
        assert_eq!(status.processes[0].status, ProcessStatus::Skipped);
        assert!(status.processes[0]
            .status_detail
            .as_deref()
            .expect("detail")
            .contains("hold-out"));
    }

    #[tokio::test]
    async fn test_cancel_clears_correlation_and_rejects_late_callback() {
        let transport = Arc::new(RecordingTransport::new());
        let svc = service(graph(vec![job("synthesis", false, false)], 2), transport);
        let project = configured_project(&svc, &["synthesis"]).await;
        svc.start_stage(project, "execution", None, false)
            .await
            .expect("start");
        let correlation = correlation_of(&svc, project, 0).await;

        svc.cancel_stage(project, "execution").await.expect("cancel");

        let status = svc.stage_status(project, "execution").await.expect("status");
        assert_eq!(status.status, StageStatus::Canceled);
        assert_eq!(status.current_job, None);
        assert_eq!(status.processes[0].status, ProcessStatus::Canceled);

        let err = svc
            .finish(correlation, vec![])
            .await
            .expect_err("late callback");
        assert!(matches!(err, EngineError::NoSuchProcess(_)));
    }

    #[tokio::test]
    async fn test_dispatch_failure_marks_process_error() {
        let transport = Arc::new(RecordingTransport::new());
        transport.fail_starts.store(true, Ordering::SeqCst);
        let svc = service(graph(vec![job("synthesis", false, false)], 2), transport);
        let project = configured_project(&svc, &["synthesis"]).await;

        let err = svc
            .start_stage(project, "execution", None, false)
            .await
            .expect_err("should fail");
        assert!(matches!(err, EngineError::Worker(_)));

        let status = svc.stage_status(project, "execution").await.expect("status");
        assert_eq!(status.status, StageStatus::Error);
        assert_eq!(status.processes[0].status, ProcessStatus::Error);
        assert!(status.processes[0]
            .status_detail
            .as_deref()
            .expect("detail")
            .contains("dispatch failed"));
    }

    #[tokio::test]
    async fn test_start_from_job_requires_preceding_completion() {
        let transport = Arc::new(RecordingTransport::new());
        let svc = service(
            graph(
                vec![job("synthesis", false, false), job("evaluation", false, false)],
                2,
            ),
            transport,
        );
        let project = configured_project(&svc, &["synthesis", "evaluation"]).await;

        let err = svc
            .start_stage(project, "execution", Some("evaluation"), false)
            .await
            .expect_err("should fail");
        assert!(matches!(err, EngineError::PrecedingJobUnfinished(_)));
    }

    #[tokio::test]
    async fn test_restart_refused_while_confirmed_dataset_in_tail() {
        let transport = Arc::new(RecordingTransport::new());
        let svc = service(graph(vec![job("synthesis", false, false)], 2), transport);
        let project = configured_project(&svc, &["synthesis"]).await;

        {
            let handle = svc.registry.project(project).await.expect("project");
            let mut p = handle.lock().await;
            let mut meta = DatasetMeta::new(9, DataConfiguration::default());
            meta.stored_data = true;
            meta.confirmed_data = true;
            let process = &mut p.stages[0].processes[0];
            process.status = ProcessStatus::Finished;
            process.dataset = Some(meta);
        }

        let err = svc
            .start_stage(project, "execution", None, false)
            .await
            .expect_err("should refuse");
        assert_eq!(err.code(), "DATASET_CONFIRMED");
    }

    #[tokio::test]
    async fn test_finish_advances_to_next_job() {
        let transport = Arc::new(RecordingTransport::new());
        let svc = service(
            graph(
                vec![job("synthesis", false, false), job("evaluation", false, false)],
                2,
            ),
            transport.clone(),
        );
        let project = configured_project(&svc, &["synthesis", "evaluation"]).await;
        svc.start_stage(project, "execution", None, false)
            .await
            .expect("start");
        let correlation = correlation_of(&svc, project, 0).await;

        svc.finish(correlation, vec![]).await.expect("finish");

        assert_eq!(transport.start_count(), 2);
        let status = svc.stage_status(project, "execution").await.expect("status");
        assert_eq!(status.status, StageStatus::Running);
        assert_eq!(status.current_job, Some(1));
        assert_eq!(status.processes[0].status, ProcessStatus::Finished);
        assert_eq!(status.processes[1].status, ProcessStatus::Running);
    }
}
