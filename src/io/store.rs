use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{ProjectRecord, ProjectStatus, StageResult};

/// Durable store for projects and stage results.
///
/// Stage results are keyed by (project id, stage type); every write must be
/// durable before the call returns.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Get a project by id
    async fn project(&self, id: &str) -> Result<Option<ProjectRecord>, StoreError>;

    /// Insert or overwrite a project
    async fn insert_project(&self, project: &ProjectRecord) -> Result<(), StoreError>;

    /// Update the run-level status of a project
    async fn set_project_status(&self, id: &str, status: ProjectStatus)
    -> Result<(), StoreError>;

    /// Insert a result, replacing any row for the same (project, stage type)
    async fn insert_result(&self, result: &StageResult) -> Result<(), StoreError>;

    /// Update an existing result by id
    async fn update_result(&self, result: &StageResult) -> Result<(), StoreError>;

    /// All results of a project
    async fn results_for_project(&self, id: &str) -> Result<Vec<StageResult>, StoreError>;
}

/// Everything stored for one project
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProjectDocument {
    project: ProjectRecord,
    #[serde(default)]
    results: Vec<StageResult>,
}

impl ProjectDocument {
    fn upsert(&mut self, result: &StageResult) {
        self.results.retain(|r| r.stage_type != result.stage_type);
        self.results.push(result.clone());
    }

    fn update(&mut self, result: &StageResult) -> Result<(), StoreError> {
        let slot = self
            .results
            .iter_mut()
            .find(|r| r.id == result.id)
            .ok_or(StoreError::ResultNotFound(result.id))?;
        *slot = result.clone();
        Ok(())
    }

    fn set_status(&mut self, status: ProjectStatus) {
        self.project.status = status;
        self.project.updated_at = Utc::now();
    }
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<String, ProjectDocument>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a result by id
    pub fn result(&self, id: Uuid) -> Option<StageResult> {
        self.documents
            .lock()
            .values()
            .flat_map(|d| d.results.iter())
            .find(|r| r.id == id)
            .cloned()
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn project(&self, id: &str) -> Result<Option<ProjectRecord>, StoreError> {
        Ok(self.documents.lock().get(id).map(|d| d.project.clone()))
    }

    async fn insert_project(&self, project: &ProjectRecord) -> Result<(), StoreError> {
        let mut documents = self.documents.lock();
        match documents.get_mut(&project.id) {
            Some(document) => document.project = project.clone(),
            None => {
                documents.insert(
                    project.id.clone(),
                    ProjectDocument {
                        project: project.clone(),
                        results: Vec::new(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn set_project_status(
        &self,
        id: &str,
        status: ProjectStatus,
    ) -> Result<(), StoreError> {
        let mut documents = self.documents.lock();
        let document = documents
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        document.set_status(status);
        Ok(())
    }

    async fn insert_result(&self, result: &StageResult) -> Result<(), StoreError> {
        let mut documents = self.documents.lock();
        let document = documents
            .get_mut(&result.project_id)
            .ok_or_else(|| StoreError::NotFound(result.project_id.clone()))?;
        document.upsert(result);
        Ok(())
    }

    async fn update_result(&self, result: &StageResult) -> Result<(), StoreError> {
        let mut documents = self.documents.lock();
        let document = documents
            .get_mut(&result.project_id)
            .ok_or_else(|| StoreError::NotFound(result.project_id.clone()))?;
        document.update(result)
    }

    async fn results_for_project(&self, id: &str) -> Result<Vec<StageResult>, StoreError> {
        Ok(self
            .documents
            .lock()
            .get(id)
            .map(|d| d.results.clone())
            .unwrap_or_default())
    }
}

/// Store keeping one pretty-printed JSON document per project
pub struct JsonFileStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles on the same file
    lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open (and create if needed) a store directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        let safe: String = id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }

    fn read(&self, id: &str) -> Result<Option<ProjectDocument>, StoreError> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn write(&self, document: &ProjectDocument) -> Result<(), StoreError> {
        let path = self.path_for(&document.project.id);
        let tmp = path.with_extension("json.tmp");
        let file = std::fs::File::create(&tmp)?;
        serde_json::to_writer_pretty(&file, document)?;
        file.sync_all()?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn modify<F>(&self, id: &str, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut ProjectDocument) -> Result<(), StoreError>,
    {
        let _guard = self.lock.lock();
        let mut document = self
            .read(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        f(&mut document)?;
        self.write(&document)
    }
}

#[async_trait]
impl PipelineStore for JsonFileStore {
    async fn project(&self, id: &str) -> Result<Option<ProjectRecord>, StoreError> {
        let _guard = self.lock.lock();
        Ok(self.read(id)?.map(|d| d.project))
    }

    async fn insert_project(&self, project: &ProjectRecord) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let document = match self.read(&project.id)? {
            Some(mut existing) => {
                existing.project = project.clone();
                existing
            }
            None => ProjectDocument {
                project: project.clone(),
                results: Vec::new(),
            },
        };
        self.write(&document)
    }

    async fn set_project_status(
        &self,
        id: &str,
        status: ProjectStatus,
    ) -> Result<(), StoreError> {
        self.modify(id, |d| {
            d.set_status(status);
            Ok(())
        })
    }

    async fn insert_result(&self, result: &StageResult) -> Result<(), StoreError> {
        self.modify(&result.project_id, |d| {
            d.upsert(result);
            Ok(())
        })
    }

    async fn update_result(&self, result: &StageResult) -> Result<(), StoreError> {
        self.modify(&result.project_id, |d| d.update(result))
    }

    async fn results_for_project(&self, id: &str) -> Result<Vec<StageResult>, StoreError> {
        let _guard = self.lock.lock();
        Ok(self.read(id)?.map(|d| d.results).unwrap_or_default())
    }
}
