//! In-memory project registry.
//!
//! Projects are the aggregate root: each one lives behind its own async
//! mutex, so every mutation of a project's stages, processes and dataset
//! metadata happens under a single lock. Cross-project scans (capacity
//! counting, queue draining, correlation lookup) take the outer map read
//! lock, then each project lock briefly in turn.

pub mod entity;
pub mod status;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::config::EngineGraph;

pub use entity::{
    DatasetMeta, HoldOut, InstanceBinding, JobConfiguration, Process, Project, Stage,
};
pub use status::{ProcessStatus, StageStatus};

/// Position of one process within the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessRef {
    pub project_id: Uuid,
    pub stage_index: usize,
    pub process_index: usize,
}

/// A process waiting in the capacity queue.
#[derive(Debug, Clone)]
pub struct QueuedProcess {
    pub position: ProcessRef,
    pub scheduled_at: DateTime<Utc>,
}

/// The registry of all live projects.
pub struct ProjectRegistry {
    projects: RwLock<HashMap<Uuid, Arc<Mutex<Project>>>>,
    next_dataset_id: AtomicI64,
}

impl ProjectRegistry {
    /// Creates an empty registry, allocating dataset ids from `first_id`.
    pub fn new(first_id: i64) -> Self {
        Self {
            projects: RwLock::new(HashMap::new()),
            next_dataset_id: AtomicI64::new(first_id),
        }
    }

    /// Allocates the next dataset id.
    pub fn allocate_dataset_id(&self) -> i64 {
        self.next_dataset_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Instantiates the configured pipeline as a new project.
    pub async fn create_project(&self, graph: &EngineGraph) -> Uuid {
        let id = Uuid::new_v4();
        let project = Project {
            id,
            created_at: Utc::now(),
            stages: graph.pipeline.stages.iter().map(Stage::new).collect(),
            original_dataset: None,
        };
        self.projects
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(project)));
        id
    }

    /// Returns the lock handle of a project.
    pub async fn project(&self, id: Uuid) -> Option<Arc<Mutex<Project>>> {
        self.projects.read().await.get(&id).cloned()
    }

    /// Removes a project from the registry, returning its handle so the
    /// caller can tear down owned datasets.
    pub async fn remove_project(&self, id: Uuid) -> Option<Arc<Mutex<Project>>> {
        self.projects.write().await.remove(&id)
    }

    /// Ids of all registered projects.
    pub async fn project_ids(&self) -> Vec<Uuid> {
        self.projects.read().await.keys().copied().collect()
    }

    /// Resolves a callback correlation id to the process holding it.
    ///
    /// Correlation ids are cleared the moment a process leaves RUNNING, so a
    /// duplicate or late callback resolves to nothing.
    pub async fn resolve_correlation(&self, correlation_id: Uuid) -> Option<ProcessRef> {
        let handles: Vec<(Uuid, Arc<Mutex<Project>>)> = {
            let projects = self.projects.read().await;
            projects.iter().map(|(id, h)| (*id, h.clone())).collect()
        };
        for (project_id, handle) in handles {
            let project = handle.lock().await;
            for (stage_index, stage) in project.stages.iter().enumerate() {
                for (process_index, process) in stage.processes.iter().enumerate() {
                    if process.correlation_id == Some(correlation_id) {
                        return Some(ProcessRef {
                            project_id,
                            stage_index,
                            process_index,
                        });
                    }
                }
            }
        }
        None
    }

    /// Counts processes currently RUNNING on one instance of a server,
    /// across all projects. This is the live load figure capacity decisions
    /// are made from.
    pub async fn running_count(&self, server: &str, instance: &str) -> usize {
        let handles: Vec<Arc<Mutex<Project>>> = {
            let projects = self.projects.read().await;
            projects.values().cloned().collect()
        };
        let mut count = 0;
        for handle in handles {
            let project = handle.lock().await;
            for stage in &project.stages {
                for process in &stage.processes {
                    if process.status == ProcessStatus::Running
                        && process
                            .bound_instance
                            .as_ref()
                            .map(|b| b.server == server && b.instance == instance)
                            .unwrap_or(false)
                    {
                        count += 1;
                    }
                }
            }
        }
        count
    }

    /// Finds the SCHEDULED process targeting a server that has waited
    /// longest, by scheduled time.
    pub async fn oldest_scheduled(&self, server: &str) -> Option<QueuedProcess> {
        let handles: Vec<(Uuid, Arc<Mutex<Project>>)> = {
            let projects = self.projects.read().await;
            projects.iter().map(|(id, h)| (*id, h.clone())).collect()
        };
        let mut oldest: Option<QueuedProcess> = None;
        for (project_id, handle) in handles {
            let project = handle.lock().await;
            for (stage_index, stage) in project.stages.iter().enumerate() {
                for (process_index, process) in stage.processes.iter().enumerate() {
                    if process.status != ProcessStatus::Scheduled {
                        continue;
                    }
                    if process.server.as_deref() != Some(server) {
                        continue;
                    }
                    let Some(scheduled_at) = process.scheduled_at else {
                        continue;
                    };
                    let is_older = oldest
                        .as_ref()
                        .map(|q| scheduled_at < q.scheduled_at)
                        .unwrap_or(true);
                    if is_older {
                        oldest = Some(QueuedProcess {
                            position: ProcessRef {
                                project_id,
                                stage_index,
                                process_index,
                            },
                            scheduled_at,
                        });
                    }
                }
            }
        }
        oldest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineGraph, JobGraph, PipelineGraph, StageGraph};
    use chrono::Duration;

    fn graph() -> EngineGraph {
        EngineGraph {
            servers: HashMap::new(),
            pipeline: PipelineGraph {
                stages: vec![StageGraph {
                    name: "execution".to_string(),
                    jobs: vec![
                        JobGraph {
                            name: "synthesis".to_string(),
                            server: Some("synthesis".to_string()),
                            endpoints: None,
                            inputs: vec![],
                            outputs: vec![],
                            requires_hold_out: false,
                            skip: false,
                        },
                        JobGraph {
                            name: "evaluation".to_string(),
                            server: Some("evaluation".to_string()),
                            endpoints: None,
                            inputs: vec![],
                            outputs: vec![],
                            requires_hold_out: false,
                            skip: false,
                        },
                    ],
                }],
            },
            callback_base: "http://engine:8080".to_string(),
            dispatch_timeout_secs: 10,
        }
    }

    #[tokio::test]
    async fn test_create_and_lookup_project() {
        let registry = ProjectRegistry::new(1);
        let id = registry.create_project(&graph()).await;

        let handle = registry.project(id).await.expect("project should exist");
        let project = handle.lock().await;
        assert_eq!(project.stages.len(), 1);
        assert_eq!(project.stages[0].processes.len(), 2);
        assert_eq!(project.stages[0].status, StageStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_dataset_ids_are_unique() {
        let registry = ProjectRegistry::new(100);
        assert_eq!(registry.allocate_dataset_id(), 100);
        assert_eq!(registry.allocate_dataset_id(), 101);
        assert_eq!(registry.allocate_dataset_id(), 102);
    }

    #[tokio::test]
    async fn test_resolve_correlation_finds_running_process() {
        let registry = ProjectRegistry::new(1);
        let id = registry.create_project(&graph()).await;
        let correlation = Uuid::new_v4();

        {
            let handle = registry.project(id).await.expect("project should exist");
            let mut project = handle.lock().await;
            let process = &mut project.stages[0].processes[0];
            process.status = ProcessStatus::Running;
            process.correlation_id = Some(correlation);
        }

        let position = registry
            .resolve_correlation(correlation)
            .await
            .expect("should resolve");
        assert_eq!(position.project_id, id);
        assert_eq!(position.stage_index, 0);
        assert_eq!(position.process_index, 0);

        assert!(registry.resolve_correlation(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_running_count_per_instance() {
        let registry = ProjectRegistry::new(1);
        let a = registry.create_project(&graph()).await;
        let b = registry.create_project(&graph()).await;

        for (project_id, instance) in [(a, "synthesis-0"), (b, "synthesis-0")] {
            let handle = registry
                .project(project_id)
                .await
                .expect("project should exist");
            let mut project = handle.lock().await;
            let process = &mut project.stages[0].processes[0];
            process.status = ProcessStatus::Running;
            process.bound_instance = Some(InstanceBinding {
                server: "synthesis".to_string(),
                instance: instance.to_string(),
            });
        }

        assert_eq!(registry.running_count("synthesis", "synthesis-0").await, 2);
        assert_eq!(registry.running_count("synthesis", "synthesis-1").await, 0);
        assert_eq!(registry.running_count("evaluation", "synthesis-0").await, 0);
    }

    #[tokio::test]
    async fn test_oldest_scheduled_orders_by_time() {
        let registry = ProjectRegistry::new(1);
        let a = registry.create_project(&graph()).await;
        let b = registry.create_project(&graph()).await;
        let now = Utc::now();

        for (project_id, age) in [(a, 5), (b, 30)] {
            let handle = registry
                .project(project_id)
                .await
                .expect("project should exist");
            let mut project = handle.lock().await;
            let process = &mut project.stages[0].processes[0];
            process.status = ProcessStatus::Scheduled;
            process.scheduled_at = Some(now - Duration::seconds(age));
        }

        let queued = registry
            .oldest_scheduled("synthesis")
            .await
            .expect("should find queued process");
        assert_eq!(queued.position.project_id, b);

        assert!(registry.oldest_scheduled("evaluation").await.is_none());
    }
}
