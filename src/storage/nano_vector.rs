//! Índice vectorial en memoria (similitud coseno), volcado a
//! `vdb_{namespace}.json`. Puede aplicar los filtros de etiquetas de forma
//! nativa o declararse sin soporte para ejercitar el filtrado en cliente.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::{load_json, storage_file, write_json, VectorData, VectorRecord, VectorStorage, VectorStoreConfig};
use crate::error::{RagError, RagResult};
use crate::llm::EmbeddingFunc;
use crate::shared::{Namespace, SharedStorage};
use crate::tags::{TagFilters, Tags};
use crate::utils::now_ts;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredVector {
    vector: Vec<f64>,
    payload: Map<String, Value>,
    #[serde(default)]
    tags: Option<Tags>,
    created_at: i64,
}

impl StoredVector {
    fn to_record(&self, id: &str, distance: Option<f64>) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            payload: self.payload.clone(),
            tags: self.tags.clone(),
            created_at: self.created_at,
            distance,
        }
    }
}

type VectorTable = HashMap<String, StoredVector>;

pub struct NanoVectorStorage {
    namespace: String,
    file: PathBuf,
    embedding: Arc<dyn EmbeddingFunc>,
    config: VectorStoreConfig,
    data: Arc<Namespace<VectorTable>>,
}

impl NanoVectorStorage {
    pub async fn open(
        shared: &SharedStorage,
        working_dir: &Path,
        namespace: &str,
        embedding: Arc<dyn EmbeddingFunc>,
        config: VectorStoreConfig,
    ) -> RagResult<Self> {
        let file = storage_file(working_dir, "vdb", namespace);
        let loaded: VectorTable = load_json(&file).await?;
        info!("Índice vectorial '{namespace}' cargado ({} vectores).", loaded.len());
        let data = shared.namespace_with(&format!("vdb:{namespace}"), || loaded)?;
        Ok(Self {
            namespace: namespace.to_string(),
            file,
            embedding,
            config,
            data,
        })
    }

    /// Embebe `texts` en lotes de `embedding_batch_num`, en paralelo y
    /// preservando el orden.
    async fn embed_batched(&self, texts: Vec<String>) -> RagResult<Vec<Vec<f64>>> {
        let batch = self.config.embedding_batch_num.max(1);
        let batches: Vec<Vec<String>> = texts.chunks(batch).map(<[String]>::to_vec).collect();
        let results: Vec<Vec<Vec<f64>>> = stream::iter(batches)
            .map(|b| {
                let embedding = self.embedding.clone();
                async move {
                    let vectors = embedding.embed(&b).await?;
                    if vectors.len() != b.len() {
                        return Err(RagError::Llm(format!(
                            "embedding returned {} vectors for {} texts",
                            vectors.len(),
                            b.len()
                        )));
                    }
                    Ok(vectors)
                }
            })
            .buffered(4)
            .try_collect()
            .await?;
        Ok(results.into_iter().flatten().collect())
    }
}

pub(crate) fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[async_trait]
impl VectorStorage for NanoVectorStorage {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn supports_tag_filters(&self) -> bool {
        self.config.native_tag_filters
    }

    async fn upsert(&self, data: HashMap<String, VectorData>) -> RagResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let (ids, items): (Vec<String>, Vec<VectorData>) = data.into_iter().unzip();
        let texts: Vec<String> = items.iter().map(|d| d.content.clone()).collect();
        let vectors = self.embed_batched(texts).await?;
        let dim = self.embedding.embedding_dim();
        let now = now_ts();

        let mut table = self.data.lock().await;
        for ((id, item), vector) in ids.into_iter().zip(items).zip(vectors) {
            if vector.len() != dim {
                return Err(RagError::Storage(format!(
                    "vector for '{id}' has dimension {}, expected {dim}",
                    vector.len()
                )));
            }
            let created_at = table.get(&id).map(|v| v.created_at).unwrap_or(now);
            table.insert(
                id,
                StoredVector {
                    vector,
                    payload: self.config.project_payload(&item.payload),
                    tags: item.tags,
                    created_at,
                },
            );
        }
        self.data.mark_dirty();
        debug!("Índice '{}': {} vectores", self.namespace, table.len());
        Ok(())
    }

    async fn query(
        &self,
        query: &str,
        top_k: usize,
        ids: Option<&[String]>,
        filters: Option<&TagFilters>,
    ) -> RagResult<Vec<VectorRecord>> {
        let query_vec = self
            .embedding
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RagError::Llm("empty embedding for query".into()))?;

        let filters = filters.filter(|f| self.config.native_tag_filters && !f.is_empty());
        let table = self.data.lock().await;
        let mut scored: Vec<VectorRecord> = table
            .iter()
            .filter(|(id, _)| ids.map_or(true, |allowed| allowed.contains(id)))
            .filter(|(_, v)| match filters {
                Some(f) => v.tags.as_ref().is_some_and(|t| f.matches(t)),
                None => true,
            })
            .filter_map(|(id, v)| {
                let sim = cosine_similarity(&query_vec, &v.vector);
                (sim >= self.config.cosine_better_than_threshold).then(|| v.to_record(id, Some(sim)))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.distance
                .partial_cmp(&a.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn get_by_id(&self, id: &str) -> RagResult<Option<VectorRecord>> {
        Ok(self.data.lock().await.get(id).map(|v| v.to_record(id, None)))
    }

    async fn get_by_ids(&self, ids: &[String]) -> RagResult<Vec<Option<VectorRecord>>> {
        let table = self.data.lock().await;
        Ok(ids
            .iter()
            .map(|id| table.get(id).map(|v| v.to_record(id, None)))
            .collect())
    }

    async fn get_vectors_by_ids(&self, ids: &[String]) -> RagResult<HashMap<String, Vec<f64>>> {
        let table = self.data.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| table.get(id).map(|v| (id.clone(), v.vector.clone())))
            .collect())
    }

    async fn delete(&self, ids: &[String]) -> RagResult<()> {
        let mut table = self.data.lock().await;
        for id in ids {
            table.remove(id);
        }
        self.data.mark_dirty();
        Ok(())
    }

    async fn index_done_callback(&self) -> RagResult<()> {
        if !self.data.take_dirty() {
            return Ok(());
        }
        let table = self.data.lock().await;
        write_json(&self.file, &*table).await
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
    use crate::tags::tags_from_value;
    use serde_json::json;

    /// Embedding por letras iniciales: textos con la misma inicial se parecen.
    struct LetterEmbedding;

    #[async_trait]
    impl EmbeddingFunc for LetterEmbedding {
        fn embedding_dim(&self) -> usize {
            4
        }

        async fn embed(&self, texts: &[String]) -> RagResult<Vec<Vec<f64>>> {
            Ok(texts
                .iter()
                .map(|t| match t.chars().next() {
                    Some('a') => vec![1.0, 0.1, 0.0, 0.0],
                    Some('b') => vec![0.1, 1.0, 0.0, 0.0],
                    _ => vec![0.0, 0.0, 1.0, 0.0],
                })
                .collect())
        }
    }

    async fn store(dir: &Path, native: bool) -> NanoVectorStorage {
        let shared = SharedStorage::initialize(1);
        let mut cfg = VectorStoreConfig::new(&["content".to_string()]);
        cfg.native_tag_filters = native;
        let vdb = NanoVectorStorage::open(&shared, dir, "chunks", Arc::new(LetterEmbedding), cfg)
            .await
            .unwrap();
        let mut payload = Map::new();
        payload.insert("content".into(), json!("alpha text"));
        payload.insert("ignored".into(), json!("x"));
        vdb.upsert(HashMap::from([
            (
                "c1".to_string(),
                VectorData {
                    content: "alpha text".into(),
                    payload: payload.clone(),
                    tags: Some(tags_from_value(&json!({"project": "alpha"})).unwrap()),
                },
            ),
            (
                "c2".to_string(),
                VectorData {
                    content: "another alpha".into(),
                    payload,
                    tags: Some(tags_from_value(&json!({"project": "beta"})).unwrap()),
                },
            ),
            (
                "c3".to_string(),
                VectorData {
                    content: "beta text".into(),
                    payload: Map::new(),
                    tags: None,
                },
            ),
        ]))
        .await
        .unwrap();
        vdb
    }

    #[tokio::test]
    async fn query_ranks_and_projects_payload() {
        let dir = tempfile::tempdir().unwrap();
        let vdb = store(dir.path(), true).await;
        let hits = vdb.query("a question", 10, None, None).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
        assert!(hits[0].payload.get("ignored").is_none());
        assert!(hits[0].distance.unwrap() > 0.9);
    }

    #[tokio::test]
    async fn native_filter_is_applied_only_when_supported() {
        let dir = tempfile::tempdir().unwrap();
        let filters = TagFilters::new(
            [("project".to_string(), "alpha".to_string())].into_iter().collect(),
            Default::default(),
        );

        let native = store(dir.path(), true).await;
        assert!(native.supports_tag_filters());
        let hits = native.query("a", 10, None, Some(&filters)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "c1");

        let other = tempfile::tempdir().unwrap();
        let plain = store(other.path(), false).await;
        assert!(!plain.supports_tag_filters());
        let hits = plain.query("a", 10, None, Some(&filters)).await.unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn ids_restrict_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let vdb = store(dir.path(), true).await;
        let only = vec!["c2".to_string()];
        let hits = vdb.query("a", 10, Some(&only), None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "c2");
    }

    #[test]
    fn cosine_handles_degenerate_vectors() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-9);
    }
}
