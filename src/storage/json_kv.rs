//! Store KV en un namespace compartido, volcado a `kv_store_{namespace}.json`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use super::{load_json, storage_file, write_json, KvStorage};
use crate::error::RagResult;
use crate::shared::{Namespace, SharedStorage};

pub struct JsonKvStorage<T> {
    namespace: String,
    file: PathBuf,
    data: Arc<Namespace<HashMap<String, T>>>,
}

impl<T> JsonKvStorage<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Abre el store. Si otro handle del mismo grupo ya creó el namespace,
    /// se reutiliza su contenido en memoria en lugar del fichero.
    pub async fn open(
        shared: &SharedStorage,
        working_dir: &Path,
        namespace: &str,
    ) -> RagResult<Self> {
        let file = storage_file(working_dir, "kv_store", namespace);
        let loaded: HashMap<String, T> = load_json(&file).await?;
        let loaded_count = loaded.len();
        let data = shared.namespace_with(namespace, || loaded)?;
        info!("KV '{namespace}' cargado ({loaded_count} registros en disco).");
        Ok(Self {
            namespace: namespace.to_string(),
            file,
            data,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[async_trait]
impl<T> KvStorage<T> for JsonKvStorage<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn get_by_id(&self, id: &str) -> RagResult<Option<T>> {
        Ok(self.data.lock().await.get(id).cloned())
    }

    async fn get_by_ids(&self, ids: &[String]) -> RagResult<Vec<Option<T>>> {
        let data = self.data.lock().await;
        Ok(ids.iter().map(|id| data.get(id).cloned()).collect())
    }

    async fn filter_keys(&self, keys: &HashSet<String>) -> RagResult<HashSet<String>> {
        let data = self.data.lock().await;
        Ok(keys
            .iter()
            .filter(|k| !data.contains_key(*k))
            .cloned()
            .collect())
    }

    async fn upsert(&self, data: HashMap<String, T>) -> RagResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        debug!("KV '{}': upsert de {} registros", self.namespace, data.len());
        self.data.lock().await.extend(data);
        self.data.mark_dirty();
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> RagResult<()> {
        let mut data = self.data.lock().await;
        for id in ids {
            data.remove(id);
        }
        self.data.mark_dirty();
        Ok(())
    }

    async fn is_empty(&self) -> RagResult<bool> {
        Ok(self.data.lock().await.is_empty())
    }

    async fn index_done_callback(&self) -> RagResult<()> {
        if !self.data.take_dirty() {
            return Ok(());
        }
        let data = self.data.lock().await;
        write_json(&self.file, &*data).await?;
        debug!("KV '{}' volcado a {}", self.namespace, self.file.display());
        Ok(())
    }

    async fn drop_all(&self) -> RagResult<()> {
        self.data.lock().await.clear();
        self.data.mark_dirty();
        self.index_done_callback().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_by_ids_preserves_order_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let shared = SharedStorage::initialize(1);
        let kv = JsonKvStorage::<String>::open(&shared, dir.path(), "t").await.unwrap();
        kv.upsert(HashMap::from([
            ("a".to_string(), "A".to_string()),
            ("b".to_string(), "B".to_string()),
        ]))
        .await
        .unwrap();
        let got = kv
            .get_by_ids(&["b".to_string(), "zz".to_string(), "a".to_string()])
            .await
            .unwrap();
        assert_eq!(got, vec![Some("B".to_string()), None, Some("A".to_string())]);
        let missing = kv
            .filter_keys(&HashSet::from(["a".to_string(), "c".to_string()]))
            .await
            .unwrap();
        assert_eq!(missing, HashSet::from(["c".to_string()]));
    }

    #[tokio::test]
    async fn index_done_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        {
            let shared = SharedStorage::initialize(1);
            let kv = JsonKvStorage::<u32>::open(&shared, dir.path(), "n").await.unwrap();
            kv.upsert(HashMap::from([("x".to_string(), 7)])).await.unwrap();
            kv.index_done_callback().await.unwrap();
            shared.finalize();
        }
        let shared = SharedStorage::initialize(1);
        let kv = JsonKvStorage::<u32>::open(&shared, dir.path(), "n").await.unwrap();
        assert_eq!(kv.get_by_id("x").await.unwrap(), Some(7));
    }
}
