//! Estado de documentos en un namespace compartido, con índices
//! secundarios por estado y por `track_id`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{load_json, storage_file, write_json, DocStatusStorage};
use crate::error::RagResult;
use crate::models::{DocProcessingStatus, DocStatus};
use crate::shared::{Namespace, SharedStorage};

#[derive(Debug, Default)]
pub struct DocStatusTable {
    docs: HashMap<String, DocProcessingStatus>,
    by_status: HashMap<DocStatus, BTreeSet<String>>,
    by_track: HashMap<String, BTreeSet<String>>,
}

impl DocStatusTable {
    fn from_docs(docs: HashMap<String, DocProcessingStatus>) -> Self {
        let mut table = Self::default();
        for (id, doc) in docs {
            table.insert(id, doc);
        }
        table
    }

    fn insert(&mut self, id: String, doc: DocProcessingStatus) {
        if let Some(prev) = self.docs.get(&id) {
            if let Some(ids) = self.by_status.get_mut(&prev.status) {
                ids.remove(&id);
            }
            if let Some(ids) = self.by_track.get_mut(&prev.track_id) {
                ids.remove(&id);
            }
        }
        self.by_status.entry(doc.status).or_default().insert(id.clone());
        self.by_track
            .entry(doc.track_id.clone())
            .or_default()
            .insert(id.clone());
        self.docs.insert(id, doc);
    }

    fn select<'a>(&self, ids: impl IntoIterator<Item = &'a String>) -> HashMap<String, DocProcessingStatus> {
        ids.into_iter()
            .filter_map(|id| self.docs.get(id).map(|d| (id.clone(), d.clone())))
            .collect()
    }
}

pub struct JsonDocStatusStorage {
    file: PathBuf,
    table: Arc<Namespace<DocStatusTable>>,
}

impl JsonDocStatusStorage {
    pub async fn open(shared: &SharedStorage, working_dir: &Path, namespace: &str) -> RagResult<Self> {
        let file = storage_file(working_dir, "kv_store", namespace);
        let loaded: HashMap<String, DocProcessingStatus> = load_json(&file).await?;
        info!("Estado de documentos '{namespace}' cargado ({} registros).", loaded.len());
        let table = shared.namespace_with(namespace, || DocStatusTable::from_docs(loaded))?;
        Ok(Self { file, table })
    }
}

#[async_trait]
impl DocStatusStorage for JsonDocStatusStorage {
    async fn upsert(&self, data: HashMap<String, DocProcessingStatus>) -> RagResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut table = self.table.lock().await;
        for (id, doc) in data {
            debug!("doc_status: {id} -> {}", doc.status);
            table.insert(id, doc);
        }
        self.table.mark_dirty();
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> RagResult<Option<DocProcessingStatus>> {
        Ok(self.table.lock().await.docs.get(id).cloned())
    }

    async fn get_by_ids(&self, ids: &[String]) -> RagResult<Vec<Option<DocProcessingStatus>>> {
        let table = self.table.lock().await;
        Ok(ids.iter().map(|id| table.docs.get(id).cloned()).collect())
    }

    async fn filter_keys(&self, keys: &HashSet<String>) -> RagResult<HashSet<String>> {
        let table = self.table.lock().await;
        Ok(keys
            .iter()
            .filter(|k| !table.docs.contains_key(*k))
            .cloned()
            .collect())
    }

    async fn get_docs_by_status(
        &self,
        status: DocStatus,
    ) -> RagResult<HashMap<String, DocProcessingStatus>> {
        let table = self.table.lock().await;
        Ok(table
            .by_status
            .get(&status)
            .map(|ids| table.select(ids))
            .unwrap_or_default())
    }

    async fn get_docs_by_track_id(
        &self,
        track_id: &str,
    ) -> RagResult<HashMap<String, DocProcessingStatus>> {
        let table = self.table.lock().await;
        Ok(table
            .by_track
            .get(track_id)
            .map(|ids| table.select(ids))
            .unwrap_or_default())
    }

    async fn get_status_counts(&self) -> RagResult<HashMap<DocStatus, usize>> {
        let table = self.table.lock().await;
        Ok(table
            .by_status
            .iter()
            .map(|(status, ids)| (*status, ids.len()))
            .collect())
    }

    async fn index_done_callback(&self) -> RagResult<()> {
        if !self.table.take_dirty() {
            return Ok(());
        }
        let table = self.table.lock().await;
        write_json(&self.file, &table.docs).await
    }

    async fn drop_all(&self) -> RagResult<()> {
        *self.table.lock().await = DocStatusTable::default();
        self.table.mark_dirty();
        self.index_done_callback().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn status(track: &str, st: DocStatus) -> DocProcessingStatus {
        DocProcessingStatus {
            content_summary: "s".into(),
            content_length: 1,
            file_path: "f.txt".into(),
            status: st,
            created_at: "2024-01-01T00:00:00Z".into(),
            updated_at: "2024-01-01T00:00:00Z".into(),
            track_id: track.into(),
            chunks_count: None,
            chunks_list: Vec::new(),
            error_msg: None,
            metadata: Map::new(),
        }
    }

    #[tokio::test]
    async fn indices_follow_status_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let shared = SharedStorage::initialize(1);
        let store = JsonDocStatusStorage::open(&shared, dir.path(), "doc_status").await.unwrap();
        store
            .upsert(HashMap::from([
                ("d1".to_string(), status("t1", DocStatus::Pending)),
                ("d2".to_string(), status("t1", DocStatus::Pending)),
                ("d3".to_string(), status("t2", DocStatus::Pending)),
            ]))
            .await
            .unwrap();
        store
            .upsert(HashMap::from([("d1".to_string(), status("t1", DocStatus::Processed))]))
            .await
            .unwrap();

        let pending = store.get_docs_by_status(DocStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(!pending.contains_key("d1"));
        assert_eq!(store.get_docs_by_status(DocStatus::Processed).await.unwrap().len(), 1);
        assert_eq!(store.get_docs_by_track_id("t1").await.unwrap().len(), 2);
        assert!(store.get_docs_by_track_id("nope").await.unwrap().is_empty());
        let counts = store.get_status_counts().await.unwrap();
        assert_eq!(counts.get(&DocStatus::Pending), Some(&2));
    }

    #[tokio::test]
    async fn reload_rebuilds_indices() {
        let dir = tempfile::tempdir().unwrap();
        {
            let shared = SharedStorage::initialize(1);
            let store = JsonDocStatusStorage::open(&shared, dir.path(), "doc_status").await.unwrap();
            store
                .upsert(HashMap::from([("d1".to_string(), status("t9", DocStatus::Failed))]))
                .await
                .unwrap();
            store.index_done_callback().await.unwrap();
        }
        let shared = SharedStorage::initialize(1);
        let store = JsonDocStatusStorage::open(&shared, dir.path(), "doc_status").await.unwrap();
        assert_eq!(store.get_docs_by_status(DocStatus::Failed).await.unwrap().len(), 1);
        assert_eq!(store.get_docs_by_track_id("t9").await.unwrap().len(), 1);
    }
}
