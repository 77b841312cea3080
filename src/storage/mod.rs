//! Contratos de almacenamiento que el núcleo exige a cualquier backend:
//! KV, vectorial, grafo y estado de documentos.
//!
//! Backends incluidos:
//!   - `json_kv` / `doc_status`: mapas en namespaces compartidos, volcados a JSON.
//!   - `nano_vector`: índice vectorial en memoria (coseno), filtrado nativo opcional.
//!   - `memory_graph`: grafo en memoria volcado a JSON.
//!   - `neo4j_graph` / `neo4j_vector`: Neo4j vía `neo4rs`.

pub mod doc_status;
pub mod json_kv;
pub mod memory_graph;
pub mod neo4j_graph;
pub mod neo4j_vector;
pub mod nano_vector;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RagResult;
use crate::models::{DocProcessingStatus, DocStatus, EdgeData, KnowledgeGraph, NodeData};
use crate::tags::{TagFilters, Tags};

pub use doc_status::JsonDocStatusStorage;
pub use json_kv::JsonKvStorage;
pub use memory_graph::MemoryGraphStorage;
pub use nano_vector::NanoVectorStorage;
pub use neo4j_graph::Neo4jGraphStorage;
pub use neo4j_vector::Neo4jVectorStorage;

// Nombres de namespace usados por el motor.
pub const NS_FULL_DOCS: &str = "full_docs";
pub const NS_TEXT_CHUNKS: &str = "text_chunks";
pub const NS_LLM_CACHE: &str = "llm_response_cache";
pub const NS_DOC_STATUS: &str = "doc_status";
pub const NS_CHUNKS_VDB: &str = "chunks";
pub const NS_ENTITIES_VDB: &str = "entities";
pub const NS_RELATIONSHIPS_VDB: &str = "relationships";
pub const NS_GRAPH: &str = "chunk_entity_relation";

#[async_trait]
pub trait KvStorage<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    async fn get_by_id(&self, id: &str) -> RagResult<Option<T>>;

    /// Conserva el orden de `ids`; `None` para los que no existen.
    async fn get_by_ids(&self, ids: &[String]) -> RagResult<Vec<Option<T>>>;

    /// Devuelve las claves de `keys` que aún no existen.
    async fn filter_keys(&self, keys: &HashSet<String>) -> RagResult<HashSet<String>>;

    async fn upsert(&self, data: HashMap<String, T>) -> RagResult<()>;

    async fn delete(&self, ids: &[String]) -> RagResult<()>;

    async fn is_empty(&self) -> RagResult<bool>;

    /// Vuelca los cambios y los hace visibles a otros procesos.
    async fn index_done_callback(&self) -> RagResult<()>;

    async fn drop_all(&self) -> RagResult<()>;
}

/// Datos a indexar en un store vectorial. `content` es el texto que se
/// embebe; del `payload` el backend conserva sólo sus `meta_fields`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VectorData {
    pub content: String,
    pub payload: Map<String, Value>,
    pub tags: Option<Tags>,
}

/// Registro devuelto por un store vectorial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub tags: Option<Tags>,
    pub created_at: i64,
    /// Similitud coseno con la consulta; sólo en resultados de `query`.
    #[serde(default)]
    pub distance: Option<f64>,
}

impl VectorRecord {
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Parámetros comunes de los stores vectoriales.
#[derive(Debug, Clone)]
pub struct VectorStoreConfig {
    /// Campos del payload que el backend conserva.
    pub meta_fields: Vec<String>,
    pub cosine_better_than_threshold: f64,
    pub embedding_batch_num: usize,
    pub native_tag_filters: bool,
}

impl VectorStoreConfig {
    pub fn new(meta_fields: &[String]) -> Self {
        Self {
            meta_fields: meta_fields.to_vec(),
            cosine_better_than_threshold: 0.2,
            embedding_batch_num: 32,
            native_tag_filters: true,
        }
    }

    /// Recorta el payload a `meta_fields`.
    pub fn project_payload(&self, payload: &Map<String, Value>) -> Map<String, Value> {
        payload
            .iter()
            .filter(|(k, _)| self.meta_fields.iter().any(|f| f == *k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[async_trait]
pub trait VectorStorage: Send + Sync {
    fn namespace(&self) -> &str;

    /// Indica si `query` aplica los filtros de etiquetas de forma nativa.
    /// Un backend que no los admite recibe siempre `None`.
    fn supports_tag_filters(&self) -> bool {
        false
    }

    async fn upsert(&self, data: HashMap<String, VectorData>) -> RagResult<()>;

    async fn query(
        &self,
        query: &str,
        top_k: usize,
        ids: Option<&[String]>,
        filters: Option<&TagFilters>,
    ) -> RagResult<Vec<VectorRecord>>;

    async fn get_by_id(&self, id: &str) -> RagResult<Option<VectorRecord>>;

    async fn get_by_ids(&self, ids: &[String]) -> RagResult<Vec<Option<VectorRecord>>>;

    async fn get_vectors_by_ids(&self, ids: &[String]) -> RagResult<HashMap<String, Vec<f64>>>;

    async fn delete(&self, ids: &[String]) -> RagResult<()>;

    async fn index_done_callback(&self) -> RagResult<()>;

    async fn drop_all(&self) -> RagResult<()>;
}

#[async_trait]
pub trait GraphStorage: Send + Sync {
    async fn has_node(&self, node_id: &str) -> RagResult<bool>;

    async fn has_edge(&self, src: &str, tgt: &str) -> RagResult<bool>;

    async fn get_node(&self, node_id: &str) -> RagResult<Option<NodeData>>;

    /// Las aristas son no dirigidas: `(a, b)` y `(b, a)` son la misma.
    async fn get_edge(&self, src: &str, tgt: &str) -> RagResult<Option<EdgeData>>;

    async fn get_nodes_batch(&self, node_ids: &[String]) -> RagResult<HashMap<String, NodeData>>;

    async fn get_edges_batch(
        &self,
        pairs: &[(String, String)],
    ) -> RagResult<HashMap<(String, String), EdgeData>>;

    async fn node_degree(&self, node_id: &str) -> RagResult<usize>;

    async fn node_degrees_batch(&self, node_ids: &[String]) -> RagResult<HashMap<String, usize>>;

    /// Grado de arista = suma de los grados de sus extremos.
    async fn edge_degrees_batch(
        &self,
        pairs: &[(String, String)],
    ) -> RagResult<HashMap<(String, String), usize>> {
        let mut ids: Vec<String> = pairs
            .iter()
            .flat_map(|(a, b)| [a.clone(), b.clone()])
            .collect();
        ids.sort();
        ids.dedup();
        let degrees = self.node_degrees_batch(&ids).await?;
        Ok(pairs
            .iter()
            .map(|(a, b)| {
                let d = degrees.get(a).copied().unwrap_or(0) + degrees.get(b).copied().unwrap_or(0);
                ((a.clone(), b.clone()), d)
            })
            .collect())
    }

    /// Aristas incidentes en `node_id` como pares `(node_id, vecino)`.
    async fn get_node_edges(&self, node_id: &str) -> RagResult<Vec<(String, String)>>;

    async fn get_nodes_edges_batch(
        &self,
        node_ids: &[String],
    ) -> RagResult<HashMap<String, Vec<(String, String)>>> {
        let mut out = HashMap::with_capacity(node_ids.len());
        for id in node_ids {
            out.insert(id.clone(), self.get_node_edges(id).await?);
        }
        Ok(out)
    }

    async fn upsert_node(&self, node_id: &str, data: NodeData) -> RagResult<()>;

    async fn upsert_edge(&self, src: &str, tgt: &str, data: EdgeData) -> RagResult<()>;

    async fn get_all_labels(&self) -> RagResult<Vec<String>>;

    /// Subgrafo alrededor de `label` (o todo el grafo con `"*"`).
    async fn get_knowledge_graph(
        &self,
        label: &str,
        max_depth: usize,
        max_nodes: usize,
    ) -> RagResult<KnowledgeGraph>;

    async fn index_done_callback(&self) -> RagResult<()>;

    async fn drop_all(&self) -> RagResult<()>;
}

#[async_trait]
pub trait DocStatusStorage: Send + Sync {
    async fn upsert(&self, data: HashMap<String, DocProcessingStatus>) -> RagResult<()>;

    async fn get_by_id(&self, id: &str) -> RagResult<Option<DocProcessingStatus>>;

    async fn get_by_ids(&self, ids: &[String]) -> RagResult<Vec<Option<DocProcessingStatus>>>;

    async fn filter_keys(&self, keys: &HashSet<String>) -> RagResult<HashSet<String>>;

    async fn get_docs_by_status(
        &self,
        status: DocStatus,
    ) -> RagResult<HashMap<String, DocProcessingStatus>>;

    async fn get_docs_by_track_id(
        &self,
        track_id: &str,
    ) -> RagResult<HashMap<String, DocProcessingStatus>>;

    async fn get_status_counts(&self) -> RagResult<HashMap<DocStatus, usize>>;

    async fn index_done_callback(&self) -> RagResult<()>;

    async fn drop_all(&self) -> RagResult<()>;
}

// --- Persistencia JSON compartida por los backends locales ---

pub(crate) fn storage_file(working_dir: &Path, prefix: &str, namespace: &str) -> PathBuf {
    working_dir.join(format!("{prefix}_{namespace}.json"))
}

pub(crate) async fn load_json<T: DeserializeOwned + Default>(path: &Path) -> RagResult<T> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => Ok(T::default()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

pub(crate) async fn write_json<T: Serialize>(path: &Path, value: &T) -> RagResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
