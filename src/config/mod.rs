//! Static configuration graph for the engine.
//!
//! The graph is loaded once from YAML, validated, and treated as read-only
//! for the lifetime of the process. Routing, authentication and request
//! validation live outside this crate; the engine only consumes the
//! already-validated topology.

pub mod graph;

pub use graph::{
    DataSource, EngineGraph, HoldOutSelectorConfig, InputPart, InstanceConfig, JobEndpoints,
    JobGraph, OutputEncoding, OutputPart, PipelineGraph, ServerConfig, StageGraph,
};

use std::collections::HashSet;
use std::path::Path;

use crate::error::ConfigError;

/// Loads and validates an engine graph from a YAML file.
pub fn load_graph(path: impl AsRef<Path>) -> Result<EngineGraph, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let graph: EngineGraph = serde_yaml::from_str(&contents)?;
    check_graph(&graph)?;
    Ok(graph)
}

/// Validates a configuration graph.
///
/// Checks that server references resolve, names are unique, every server has
/// at least one instance, and endpoint templates carry the placeholders they
/// need. Column identifiers are validated separately where dataset schemas
/// enter the system.
pub fn check_graph(graph: &EngineGraph) -> Result<(), ConfigError> {
    for (name, server) in &graph.servers {
        if server.instances.is_empty() {
            return Err(ConfigError::NoInstances(name.clone()));
        }
        let mut instance_names = HashSet::new();
        for instance in &server.instances {
            if !instance_names.insert(instance.name.as_str()) {
                return Err(ConfigError::DuplicateName {
                    kind: "instance",
                    name: instance.name.clone(),
                });
            }
        }
    }

    let mut stage_names = HashSet::new();
    for stage in &graph.pipeline.stages {
        if !stage_names.insert(stage.name.as_str()) {
            return Err(ConfigError::DuplicateName {
                kind: "stage",
                name: stage.name.clone(),
            });
        }

        let mut job_names = HashSet::new();
        for job in &stage.jobs {
            if !job_names.insert(job.name.as_str()) {
                return Err(ConfigError::DuplicateName {
                    kind: "job",
                    name: job.name.clone(),
                });
            }

            if let Some(server) = &job.server {
                if !graph.servers.contains_key(server) {
                    return Err(ConfigError::UnknownServer {
                        job: job.name.clone(),
                        server: server.clone(),
                    });
                }
                if job.endpoints.is_none() {
                    return Err(ConfigError::Validation(format!(
                        "job '{}' is bound to server '{}' but declares no endpoints",
                        job.name, server
                    )));
                }
            }

            if let Some(endpoints) = &job.endpoints {
                for template in [&endpoints.status, &endpoints.cancel].into_iter().flatten() {
                    if !template.contains("{id}") {
                        return Err(ConfigError::MissingPlaceholder {
                            job: job.name.clone(),
                            template: template.clone(),
                            placeholder: "{id}",
                        });
                    }
                }
            }

            let mut part_names = HashSet::new();
            for part in job.inputs.iter().map(|p| &p.part).chain(job.outputs.iter().map(|p| &p.part)) {
                if !part_names.insert(part.as_str()) {
                    return Err(ConfigError::DuplicateName {
                        kind: "part",
                        name: part.clone(),
                    });
                }
            }
        }
    }

    Ok(())
}

/// Whether a column identifier is safe to splice into SQL statements.
pub fn is_valid_column_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRAPH_YAML: &str = r#"
servers:
  synthesis:
    min_up: 1
    instances:
      - name: synthesis-0
        url: http://synthesis-0:8000
        max_parallel: 2
pipeline:
  stages:
    - name: execution
      jobs:
        - name: synthesis
          server: synthesis
          endpoints:
            start: /start_synthesis
            status: /status/{id}
            cancel: /cancel/{id}
          outputs:
            - part: synthetic_data
              encoding: DATA
callback_base: http://engine:8080
"#;

    #[test]
    fn test_parse_and_check_graph() {
        let graph: EngineGraph = serde_yaml::from_str(GRAPH_YAML).expect("should parse");
        check_graph(&graph).expect("should validate");
        assert_eq!(graph.dispatch_timeout_secs, 10);
        assert_eq!(graph.servers["synthesis"].health_timeout_secs, 2);
    }

    #[test]
    fn test_unknown_server_rejected() {
        let mut graph: EngineGraph = serde_yaml::from_str(GRAPH_YAML).expect("should parse");
        graph.pipeline.stages[0].jobs[0].server = Some("missing".to_string());
        let err = check_graph(&graph).expect_err("should fail");
        assert!(matches!(err, ConfigError::UnknownServer { .. }));
    }

    #[test]
    fn test_status_template_requires_placeholder() {
        let mut graph: EngineGraph = serde_yaml::from_str(GRAPH_YAML).expect("should parse");
        graph.pipeline.stages[0].jobs[0]
            .endpoints
            .as_mut()
            .expect("endpoints present")
            .status = Some("/status".to_string());
        let err = check_graph(&graph).expect_err("should fail");
        assert!(matches!(err, ConfigError::MissingPlaceholder { .. }));
    }

    #[test]
    fn test_duplicate_job_name_rejected() {
        let mut graph: EngineGraph = serde_yaml::from_str(GRAPH_YAML).expect("should parse");
        let job = graph.pipeline.stages[0].jobs[0].clone();
        graph.pipeline.stages[0].jobs.push(job);
        let err = check_graph(&graph).expect_err("should fail");
        assert!(matches!(err, ConfigError::DuplicateName { kind: "job", .. }));
    }

    #[test]
    fn test_column_name_validation() {
        assert!(is_valid_column_name("age"));
        assert!(is_valid_column_name("_birth_date2"));
        assert!(!is_valid_column_name("2fast"));
        assert!(!is_valid_column_name("drop table"));
        assert!(!is_valid_column_name(""));
        assert!(!is_valid_column_name("name\"; --"));
    }
}
