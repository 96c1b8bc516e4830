//! The serialized DAG document (`specs/{branch}/dag.yaml`).
//!
//! Round-trips the engine's tasks, phases, and session assignments.
//! Deserialization checks mandatory fields explicitly so a truncated or
//! hand-edited document fails with the missing field named.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::fs;
use std::path::Path;

use crate::dag::DagEngine;
use crate::errors::{FlowError, Result};
use crate::model::{TaskInfo, TaskStatus};

pub const DAG_SCHEMA_VERSION: &str = "1.0";

/// One task record in the document; every engine-visible field is exposed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagNode {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub session: usize,
    pub parallelizable: bool,
    #[serde(default)]
    pub story: Option<String>,
}

/// A named phase with the tasks that may run concurrently in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagPhase {
    pub name: String,
    pub tasks: Vec<DagNode>,
}

/// Top-level dag.yaml schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagDocument {
    pub version: String,
    pub spec_id: String,
    pub generated_at: String,
    pub num_sessions: usize,
    pub phases: Vec<DagPhase>,
}

impl DagDocument {
    /// Snapshot an engine into document form. Unassigned tasks serialize as
    /// session 0.
    pub fn from_engine(engine: &DagEngine, spec_id: &str, num_sessions: usize) -> Self {
        let phases = engine
            .get_phases()
            .into_iter()
            .enumerate()
            .map(|(idx, task_ids)| DagPhase {
                name: format!("phase-{idx}"),
                tasks: task_ids
                    .iter()
                    .map(|id| {
                        let task = engine.get_task(id).expect("phase ids come from the engine");
                        DagNode {
                            id: task.id.clone(),
                            name: task.name.clone(),
                            description: task
                                .description
                                .clone()
                                .unwrap_or_else(|| task.name.clone()),
                            files: task.files.clone(),
                            dependencies: task.dependencies.clone(),
                            session: task.session.unwrap_or(0),
                            parallelizable: task.parallelizable,
                            story: task.story.clone(),
                        }
                    })
                    .collect(),
            })
            .collect();

        Self {
            version: DAG_SCHEMA_VERSION.to_string(),
            spec_id: spec_id.to_string(),
            generated_at: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            num_sessions,
            phases,
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Parse a document, naming the first missing mandatory field.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(content)
            .map_err(|_| FlowError::CorruptDag {
                field: "document".to_string(),
            })?;

        let mapping = value.as_mapping().ok_or_else(|| FlowError::CorruptDag {
            field: "document".to_string(),
        })?;

        for field in ["version", "spec_id", "generated_at", "num_sessions", "phases"] {
            if !mapping.contains_key(&Value::from(field)) {
                return Err(FlowError::CorruptDag {
                    field: field.to_string(),
                });
            }
        }

        let doc: Self = serde_yaml::from_value(value).map_err(|e| FlowError::CorruptDag {
            field: missing_field_name(&e.to_string()),
        })?;

        if doc.num_sessions < 1 {
            return Err(FlowError::CorruptDag {
                field: "num_sessions".to_string(),
            });
        }
        Ok(doc)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_yaml()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(FlowError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        Self::from_yaml(&fs::read_to_string(path)?)
    }

    /// Flatten the document back into the task list the engine consumes,
    /// preserving session assignments.
    pub fn into_tasks(self) -> Vec<TaskInfo> {
        self.phases
            .into_iter()
            .flat_map(|phase| phase.tasks)
            .map(|node| TaskInfo {
                id: node.id,
                name: node.name,
                description: Some(node.description),
                dependencies: node.dependencies,
                session: Some(node.session),
                parallelizable: node.parallelizable,
                story: node.story,
                files: node.files,
                status: TaskStatus::Pending,
            })
            .collect()
    }

    /// Rebuild an engine from the document.
    pub fn into_engine(self) -> Result<DagEngine> {
        DagEngine::new(self.into_tasks())
    }
}

/// Pull the field name out of a serde "missing field `x`" message; fall back
/// to the whole message for other shape errors.
fn missing_field_name(message: &str) -> String {
    if let Some(start) = message.find("missing field `") {
        let rest = &message[start + "missing field `".len()..];
        if let Some(end) = rest.find('`') {
            return rest[..end].to_string();
        }
    }
    message.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskInfo;

    fn engine() -> DagEngine {
        let mut engine = DagEngine::new(vec![
            TaskInfo::new("T001", "Setup database", vec![]),
            TaskInfo::new("T002", "Build API", vec!["T001".to_string()]).parallel(true),
            TaskInfo::new("T003", "Build UI", vec!["T001".to_string()]).parallel(true),
        ])
        .unwrap();
        engine.assign_sessions(2).unwrap();
        engine
    }

    #[test]
    fn document_carries_schema_header() {
        let doc = DagDocument::from_engine(&engine(), "001-test", 2);
        assert_eq!(doc.version, "1.0");
        assert_eq!(doc.spec_id, "001-test");
        assert_eq!(doc.num_sessions, 2);
        assert!(doc.generated_at.ends_with('Z'));
        assert_eq!(doc.phases.len(), 2);
        assert_eq!(doc.phases[0].name, "phase-0");
        assert_eq!(doc.phases[1].name, "phase-1");
    }

    #[test]
    fn round_trip_preserves_assignments() {
        let doc = DagDocument::from_engine(&engine(), "001-test", 2);
        let yaml = doc.to_yaml().unwrap();
        let parsed = DagDocument::from_yaml(&yaml).unwrap();
        assert_eq!(parsed, doc);

        let rebuilt = parsed.into_engine().unwrap();
        assert_eq!(rebuilt.task_count(), 3);
        assert_eq!(rebuilt.get_task("T001").unwrap().session, Some(0));
        assert_eq!(rebuilt.get_task("T002").unwrap().session, Some(0));
        assert_eq!(rebuilt.get_task("T003").unwrap().session, Some(1));
        assert_eq!(
            rebuilt.get_task("T002").unwrap().dependencies,
            vec!["T001".to_string()]
        );
    }

    #[test]
    fn missing_top_level_field_is_named() {
        let yaml = "version: '1.0'\nspec_id: 001-test\nphases: []\n";
        let err = DagDocument::from_yaml(yaml).unwrap_err();
        match err {
            FlowError::CorruptDag { field } => assert_eq!(field, "generated_at"),
            other => panic!("expected CorruptDag, got {other:?}"),
        }
    }

    #[test]
    fn missing_task_field_is_named() {
        let yaml = r#"
version: "1.0"
spec_id: 001-test
generated_at: 2025-11-28T10:30:00Z
num_sessions: 1
phases:
  - name: phase-0
    tasks:
      - id: T001
        name: Setup
        session: 0
        parallelizable: false
"#;
        // description is mandatory on task nodes
        let err = DagDocument::from_yaml(yaml).unwrap_err();
        match err {
            FlowError::CorruptDag { field } => assert_eq!(field, "description"),
            other => panic!("expected CorruptDag, got {other:?}"),
        }
    }

    #[test]
    fn zero_sessions_rejected() {
        let yaml = r#"
version: "1.0"
spec_id: 001-test
generated_at: 2025-11-28T10:30:00Z
num_sessions: 0
phases: []
"#;
        let err = DagDocument::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, FlowError::CorruptDag { field } if field == "num_sessions"));
    }

    #[test]
    fn save_and_load(){
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("specs").join("main").join("dag.yaml");
        let doc = DagDocument::from_engine(&engine(), "001-test", 2);
        doc.save(&path).unwrap();
        let loaded = DagDocument::load(&path).unwrap();
        assert_eq!(loaded, doc);
    }

    #[test]
    fn load_missing_file() {
        let err = DagDocument::load(Path::new("/nonexistent/dag.yaml")).unwrap_err();
        assert!(matches!(err, FlowError::FileNotFound { .. }));
    }
}
