//! Persistence collaborators for graph definitions and run records.
//!
//! [`MemoryStore`] keeps everything in process; [`FileStore`] writes one
//! pretty-printed JSON file per graph and per run under a root directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;

use flowgraph_types::{ExecutionResult, FlowError, Result};

use crate::definition::GraphDefinition;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Persist a definition. `graph_id` must already be assigned.
    async fn create_graph(&self, def: GraphDefinition) -> Result<GraphDefinition>;
    async fn get_graph(&self, graph_id: &str) -> Result<Option<GraphDefinition>>;
    /// All stored definitions, ordered by id.
    async fn list_graphs(&self) -> Result<Vec<GraphDefinition>>;
    /// Returns `false` when nothing was stored under `graph_id`.
    async fn delete_graph(&self, graph_id: &str) -> Result<bool>;
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, record: &ExecutionResult) -> Result<()>;
    /// Overwrite an existing record; `NotFound` if it was never created.
    async fn update_run(&self, record: &ExecutionResult) -> Result<()>;
    async fn get_run(&self, run_id: &str) -> Result<Option<ExecutionResult>>;
    /// Records for one graph, or all records, oldest first.
    async fn list_runs(&self, graph_id: Option<&str>) -> Result<Vec<ExecutionResult>>;
}

fn require_id(def: &GraphDefinition) -> Result<String> {
    def.graph_id
        .clone()
        .ok_or_else(|| FlowError::Other(format!("graph '{}' has no graph_id", def.name)))
}

fn sort_runs(runs: &mut [ExecutionResult]) {
    runs.sort_by(|a, b| {
        a.started_at
            .cmp(&b.started_at)
            .then_with(|| a.run_id.cmp(&b.run_id))
    });
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryStore {
    graphs: RwLock<HashMap<String, GraphDefinition>>,
    runs: RwLock<HashMap<String, ExecutionResult>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphStore for MemoryStore {
    async fn create_graph(&self, def: GraphDefinition) -> Result<GraphDefinition> {
        let id = require_id(&def)?;
        self.graphs.write().await.insert(id, def.clone());
        Ok(def)
    }

    async fn get_graph(&self, graph_id: &str) -> Result<Option<GraphDefinition>> {
        Ok(self.graphs.read().await.get(graph_id).cloned())
    }

    async fn list_graphs(&self) -> Result<Vec<GraphDefinition>> {
        let mut graphs: Vec<_> = self.graphs.read().await.values().cloned().collect();
        graphs.sort_by(|a, b| a.graph_id.cmp(&b.graph_id));
        Ok(graphs)
    }

    async fn delete_graph(&self, graph_id: &str) -> Result<bool> {
        Ok(self.graphs.write().await.remove(graph_id).is_some())
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn create_run(&self, record: &ExecutionResult) -> Result<()> {
        self.runs
            .write()
            .await
            .insert(record.run_id.clone(), record.clone());
        Ok(())
    }

    async fn update_run(&self, record: &ExecutionResult) -> Result<()> {
        let mut runs = self.runs.write().await;
        let slot = runs.get_mut(&record.run_id).ok_or_else(|| FlowError::NotFound {
            kind: "run",
            id: record.run_id.clone(),
        })?;
        *slot = record.clone();
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<ExecutionResult>> {
        Ok(self.runs.read().await.get(run_id).cloned())
    }

    async fn list_runs(&self, graph_id: Option<&str>) -> Result<Vec<ExecutionResult>> {
        let mut runs: Vec<_> = self
            .runs
            .read()
            .await
            .values()
            .filter(|r| graph_id.map_or(true, |g| r.graph_id == g))
            .cloned()
            .collect();
        sort_runs(&mut runs);
        Ok(runs)
    }
}

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

/// JSON files under `<root>/graphs/<id>.json` and `<root>/runs/<id>.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, dir: &str, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.starts_with('.') || id.contains(|c: char| c == '/' || c == '\\') {
            return Err(FlowError::Other(format!("invalid store id '{id}'")));
        }
        Ok(self.root.join(dir).join(format!("{id}.json")))
    }

    async fn write_json<T: serde::Serialize + Sync>(&self, path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(value)?;
        tokio::fs::write(path, json).await?;
        tracing::debug!(path = %path.display(), "Stored record");
        Ok(())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(None);
        }
        let json = tokio::fs::read_to_string(path).await?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    async fn read_dir_json<T: serde::de::DeserializeOwned>(&self, dir: &str) -> Result<Vec<T>> {
        let dir = self.root.join(dir);
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }
        let mut items = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |e| e != "json") {
                continue;
            }
            match Self::read_json(&path).await {
                Ok(Some(item)) => items.push(item),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "Skipping unreadable record"
                    );
                }
            }
        }
        Ok(items)
    }
}

#[async_trait]
impl GraphStore for FileStore {
    async fn create_graph(&self, def: GraphDefinition) -> Result<GraphDefinition> {
        let id = require_id(&def)?;
        let path = self.path("graphs", &id)?;
        self.write_json(&path, &def).await?;
        Ok(def)
    }

    async fn get_graph(&self, graph_id: &str) -> Result<Option<GraphDefinition>> {
        Self::read_json(&self.path("graphs", graph_id)?).await
    }

    async fn list_graphs(&self) -> Result<Vec<GraphDefinition>> {
        let mut graphs: Vec<GraphDefinition> = self.read_dir_json("graphs").await?;
        graphs.sort_by(|a, b| a.graph_id.cmp(&b.graph_id));
        Ok(graphs)
    }

    async fn delete_graph(&self, graph_id: &str) -> Result<bool> {
        let path = self.path("graphs", graph_id)?;
        if !tokio::fs::try_exists(&path).await? {
            return Ok(false);
        }
        tokio::fs::remove_file(&path).await?;
        Ok(true)
    }
}

#[async_trait]
impl RunStore for FileStore {
    async fn create_run(&self, record: &ExecutionResult) -> Result<()> {
        let path = self.path("runs", &record.run_id)?;
        self.write_json(&path, record).await
    }

    async fn update_run(&self, record: &ExecutionResult) -> Result<()> {
        let path = self.path("runs", &record.run_id)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(FlowError::NotFound {
                kind: "run",
                id: record.run_id.clone(),
            });
        }
        self.write_json(&path, record).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<ExecutionResult>> {
        Self::read_json(&self.path("runs", run_id)?).await
    }

    async fn list_runs(&self, graph_id: Option<&str>) -> Result<Vec<ExecutionResult>> {
        let mut runs: Vec<ExecutionResult> = self.read_dir_json("runs").await?;
        runs.retain(|r| graph_id.map_or(true, |g| r.graph_id == g));
        sort_runs(&mut runs);
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::NodeSpec;
    use flowgraph_types::{RunState, RunStatus};

    fn def(id: &str) -> GraphDefinition {
        let mut def = GraphDefinition::new(format!("Graph {id}"), "a")
            .with_node(NodeSpec::passthrough("a"));
        def.graph_id = Some(id.into());
        def
    }

    fn temp_root(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("flowgraph-store-{tag}-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn memory_graph_crud() {
        let store = MemoryStore::new();
        store.create_graph(def("g2")).await.unwrap();
        store.create_graph(def("g1")).await.unwrap();

        assert_eq!(store.get_graph("g1").await.unwrap().unwrap().name, "Graph g1");
        let ids: Vec<_> = store
            .list_graphs()
            .await
            .unwrap()
            .into_iter()
            .filter_map(|g| g.graph_id)
            .collect();
        assert_eq!(ids, ["g1", "g2"]);

        assert!(store.delete_graph("g1").await.unwrap());
        assert!(!store.delete_graph("g1").await.unwrap());
        assert!(store.get_graph("g1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn graph_without_id_is_rejected() {
        let store = MemoryStore::new();
        let mut d = def("x");
        d.graph_id = None;
        assert!(store.create_graph(d).await.is_err());
    }

    #[tokio::test]
    async fn memory_run_lifecycle() {
        let store = MemoryStore::new();
        let mut record = ExecutionResult::pending("r1", "g1", RunState::new());
        store.create_run(&record).await.unwrap();

        record.status = RunStatus::Running;
        store.update_run(&record).await.unwrap();
        assert_eq!(
            store.get_run("r1").await.unwrap().unwrap().status,
            RunStatus::Running
        );

        store
            .create_run(&ExecutionResult::pending("r2", "g2", RunState::new()))
            .await
            .unwrap();
        assert_eq!(store.list_runs(Some("g1")).await.unwrap().len(), 1);
        assert_eq!(store.list_runs(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn updating_unknown_run_is_not_found() {
        let store = MemoryStore::new();
        let record = ExecutionResult::pending("ghost", "g", RunState::new());
        let err = store.update_run(&record).await.unwrap_err();
        assert!(matches!(err, FlowError::NotFound { kind: "run", .. }));
    }

    #[tokio::test]
    async fn file_store_round_trips_graphs_and_runs() {
        let root = temp_root("roundtrip");
        let store = FileStore::new(&root);

        store.create_graph(def("g1")).await.unwrap();
        assert_eq!(store.get_graph("g1").await.unwrap(), Some(def("g1")));
        assert_eq!(store.list_graphs().await.unwrap().len(), 1);

        let mut record = ExecutionResult::pending("r1", "g1", RunState::new());
        store.create_run(&record).await.unwrap();
        record.status = RunStatus::Completed;
        store.update_run(&record).await.unwrap();
        let loaded = store.get_run("r1").await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(store.list_runs(Some("g1")).await.unwrap().len(), 1);

        assert!(store.delete_graph("g1").await.unwrap());
        assert!(store.get_graph("g1").await.unwrap().is_none());

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn file_store_missing_directory_lists_empty() {
        let store = FileStore::new(temp_root("empty"));
        assert!(store.list_graphs().await.unwrap().is_empty());
        assert!(store.list_runs(None).await.unwrap().is_empty());
        assert!(store.get_run("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_rejects_path_like_ids() {
        let store = FileStore::new(temp_root("ids"));
        assert!(store.get_graph("../etc/passwd").await.is_err());
        assert!(store.get_run("").await.is_err());
    }
}
