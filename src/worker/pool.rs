//! Worker instance selection.
//!
//! Capacity is tracked nowhere: the caller derives each instance's live load
//! by counting RUNNING processes bound to it, and selection ranks healthy
//! instances by that load. Declared capacity is advisory under
//! `ignore_capacity`, which exists for manual single-job runs.

use std::sync::Arc;
use std::time::Duration;

use crate::config::ServerConfig;

use super::client::WorkerTransport;

/// Outcome of trying to pick an instance for a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Index of the chosen instance within the server's configuration.
    Instance(usize),
    /// Every healthy instance is at declared capacity.
    NoCapacity,
    /// No instance passed the health probe.
    NoneHealthy,
}

/// Selects instances of one worker server.
#[derive(Clone)]
pub struct InstancePool {
    transport: Arc<dyn WorkerTransport>,
}

impl InstancePool {
    pub fn new(transport: Arc<dyn WorkerTransport>) -> Self {
        Self { transport }
    }

    /// Picks the least-loaded instance able to take one more process.
    ///
    /// `loads[i]` is the live RUNNING count of instance `i`. Health probing
    /// is skipped entirely when `min_up` covers all instances, trusting the
    /// static configuration. Ties break toward configuration order.
    pub async fn select_instance(
        &self,
        server: &ServerConfig,
        loads: &[usize],
        ignore_capacity: bool,
    ) -> Selection {
        let healthy = self.healthy_instances(server).await;
        if healthy.is_empty() {
            return Selection::NoneHealthy;
        }

        let mut candidates: Vec<usize> = healthy
            .into_iter()
            .filter(|&i| {
                ignore_capacity || loads.get(i).copied().unwrap_or(0) < server.instances[i].max_parallel
            })
            .collect();
        if candidates.is_empty() {
            return Selection::NoCapacity;
        }

        // Stable sort keeps configuration order among equally loaded
        // instances.
        candidates.sort_by_key(|&i| loads.get(i).copied().unwrap_or(0));
        Selection::Instance(candidates[0])
    }

    /// Indexes of instances considered up.
    async fn healthy_instances(&self, server: &ServerConfig) -> Vec<usize> {
        if server.min_up >= server.instances.len() {
            return (0..server.instances.len()).collect();
        }
        let timeout = Duration::from_secs(server.health_timeout_secs);
        let mut up = Vec::new();
        for (index, instance) in server.instances.iter().enumerate() {
            if self
                .transport
                .probe_health(instance, &server.health_endpoint, timeout)
                .await
            {
                up.push(index);
            } else {
                tracing::warn!(instance = %instance.name, "Instance failed health probe");
            }
        }
        up
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceConfig;
    use crate::error::WorkerError;
    use crate::worker::client::{StartRequest, StartResponse};
    use async_trait::async_trait;
    use std::collections::HashSet;

    /// Transport fake that reports a fixed set of instances as down.
    struct FakeTransport {
        down: HashSet<String>,
    }

    #[async_trait]
    impl WorkerTransport for FakeTransport {
        async fn start_process(
            &self,
            _instance: &InstanceConfig,
            _request: &StartRequest,
        ) -> Result<StartResponse, WorkerError> {
            unimplemented!("not used by selection tests")
        }

        async fn fetch_status(
            &self,
            _instance: &InstanceConfig,
            _endpoint: &str,
        ) -> Result<serde_json::Value, WorkerError> {
            unimplemented!("not used by selection tests")
        }

        async fn cancel(
            &self,
            _instance: &InstanceConfig,
            _endpoint: &str,
            _session_key: &str,
            _external_id: &str,
        ) -> Result<(), WorkerError> {
            unimplemented!("not used by selection tests")
        }

        async fn probe_health(
            &self,
            instance: &InstanceConfig,
            _endpoint: &str,
            _timeout: Duration,
        ) -> bool {
            !self.down.contains(&instance.name)
        }
    }

    fn pool(down: &[&str]) -> InstancePool {
        InstancePool::new(Arc::new(FakeTransport {
            down: down.iter().map(|s| s.to_string()).collect(),
        }))
    }

    fn server(min_up: usize, capacities: &[usize]) -> ServerConfig {
        ServerConfig {
            min_up,
            health_endpoint: "/actuator/health".to_string(),
            health_timeout_secs: 2,
            instances: capacities
                .iter()
                .enumerate()
                .map(|(i, &max_parallel)| InstanceConfig {
                    name: format!("w-{}", i),
                    url: format!("http://w-{}:8000", i),
                    max_parallel,
                    callback_host: None,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_least_loaded_wins() {
        let server = server(0, &[4, 4, 4]);
        let selection = pool(&[]).select_instance(&server, &[3, 1, 2], false).await;
        assert_eq!(selection, Selection::Instance(1));
    }

    #[tokio::test]
    async fn test_tie_breaks_toward_configuration_order() {
        let server = server(0, &[4, 4]);
        let selection = pool(&[]).select_instance(&server, &[2, 2], false).await;
        assert_eq!(selection, Selection::Instance(0));
    }

    #[tokio::test]
    async fn test_full_instances_are_skipped() {
        let server = server(0, &[2, 4]);
        let selection = pool(&[]).select_instance(&server, &[2, 3], false).await;
        assert_eq!(selection, Selection::Instance(1));
    }

    #[tokio::test]
    async fn test_all_full_reports_no_capacity() {
        let server = server(0, &[2, 2]);
        let selection = pool(&[]).select_instance(&server, &[2, 2], false).await;
        assert_eq!(selection, Selection::NoCapacity);
    }

    #[tokio::test]
    async fn test_ignore_capacity_overrides_declared_limit() {
        let server = server(0, &[2, 2]);
        let selection = pool(&[]).select_instance(&server, &[2, 3], true).await;
        assert_eq!(selection, Selection::Instance(0));
    }

    #[tokio::test]
    async fn test_unhealthy_instances_are_excluded() {
        let server = server(0, &[4, 4]);
        let selection = pool(&["w-0"]).select_instance(&server, &[0, 3], false).await;
        assert_eq!(selection, Selection::Instance(1));
    }

    #[tokio::test]
    async fn test_no_healthy_instance() {
        let server = server(0, &[4, 4]);
        let selection = pool(&["w-0", "w-1"])
            .select_instance(&server, &[0, 0], false)
            .await;
        assert_eq!(selection, Selection::NoneHealthy);
    }

    #[tokio::test]
    async fn test_min_up_covering_all_skips_probing() {
        let server = server(2, &[4, 4]);
        // Both are "down", yet selection still trusts the configuration.
        let selection = pool(&["w-0", "w-1"])
            .select_instance(&server, &[1, 0], false)
            .await;
        assert_eq!(selection, Selection::Instance(1));
    }
}
