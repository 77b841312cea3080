//! Neo4j como store vectorial: un label y un índice vectorial por namespace.
//!
//! No admite filtros de etiquetas nativos: el payload y las etiquetas se
//! guardan como cadenas JSON y el motor de consulta filtra en cliente.
//! La puntuación de Neo4j está normalizada a [0, 1]; aquí se devuelve como
//! similitud coseno en [-1, 1].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use neo4rs::{query, Graph, Query, Row};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{VectorData, VectorRecord, VectorStorage, VectorStoreConfig};
use crate::error::{RagError, RagResult};
use crate::llm::EmbeddingFunc;
use crate::neo4j_client;
use crate::tags::{TagFilters, Tags};
use crate::utils::now_ts;

fn storage_err(e: neo4rs::Error) -> RagError {
    RagError::Storage(format!("neo4j: {e}"))
}

fn score_to_cosine(score: f64) -> f64 {
    score * 2.0 - 1.0
}

const RECORD_RETURN: &str =
    "n.id AS id, n.payload_json AS payload_json, n.tags_json AS tags_json, n.created_at AS created_at";

pub struct Neo4jVectorStorage {
    namespace: String,
    label: String,
    index_name: String,
    graph: Arc<Graph>,
    embedding: Arc<dyn EmbeddingFunc>,
    config: VectorStoreConfig,
}

impl Neo4jVectorStorage {
    /// Crea el handle y asegura el índice vectorial del namespace.
    pub async fn open(
        graph: Arc<Graph>,
        namespace: &str,
        embedding: Arc<dyn EmbeddingFunc>,
        config: VectorStoreConfig,
    ) -> RagResult<Self> {
        let label = format!("Vdb_{namespace}");
        let index_name = format!("{namespace}_embedding_index");
        neo4j_client::ensure_vector_index(&graph, &index_name, &label, embedding.embedding_dim())
            .await
            .map_err(|e| RagError::Storage(e.to_string()))?;
        info!("Store vectorial Neo4j '{namespace}' listo (label {label}).");
        Ok(Self {
            namespace: namespace.to_string(),
            label,
            index_name,
            graph,
            embedding,
            config,
        })
    }

    async fn rows(&self, q: Query) -> RagResult<Vec<Row>> {
        let mut cursor = self.graph.execute(q).await.map_err(storage_err)?;
        let mut out = Vec::new();
        while let Some(row) = cursor.next().await.map_err(storage_err)? {
            out.push(row);
        }
        Ok(out)
    }

    fn record_from_row(&self, row: &Row, distance: Option<f64>) -> Option<VectorRecord> {
        let id: String = row.get("id")?;
        let payload = row
            .get::<String>("payload_json")
            .and_then(|raw| serde_json::from_str::<Map<String, Value>>(&raw).ok())
            .unwrap_or_default();
        let tags = match row.get::<String>("tags_json").filter(|raw| !raw.is_empty()) {
            Some(raw) => match serde_json::from_str::<Tags>(&raw) {
                Ok(tags) => Some(tags),
                Err(e) => {
                    warn!("Etiquetas ilegibles en {}/{id}: {e}", self.namespace);
                    None
                }
            },
            None => None,
        };
        Some(VectorRecord {
            id,
            payload,
            tags,
            created_at: row.get("created_at").unwrap_or_default(),
            distance,
        })
    }
}

#[async_trait]
impl VectorStorage for Neo4jVectorStorage {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn upsert(&self, data: HashMap<String, VectorData>) -> RagResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let (ids, items): (Vec<String>, Vec<VectorData>) = data.into_iter().unzip();
        let texts: Vec<String> = items.iter().map(|d| d.content.clone()).collect();
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.embedding_batch_num.max(1)) {
            vectors.extend(self.embedding.embed(batch).await?);
        }
        if vectors.len() != ids.len() {
            return Err(RagError::Llm(format!(
                "embedding returned {} vectors for {} texts",
                vectors.len(),
                ids.len()
            )));
        }

        let cypher = format!(
            "MERGE (n:{label} {{id: $id}}) \
             SET n.payload_json = $payload_json, n.tags_json = $tags_json, \
                 n.created_at = coalesce(n.created_at, $now), n.embedding = $embedding",
            label = self.label
        );
        let now = now_ts();
        for ((id, item), vector) in ids.into_iter().zip(items).zip(vectors) {
            let payload = serde_json::to_string(&self.config.project_payload(&item.payload))?;
            let tags = match &item.tags {
                Some(tags) => serde_json::to_string(tags)?,
                None => String::new(),
            };
            self.graph
                .run(
                    query(&cypher)
                        .param("id", id)
                        .param("payload_json", payload)
                        .param("tags_json", tags)
                        .param("now", now)
                        .param("embedding", vector),
                )
                .await
                .map_err(storage_err)?;
        }
        debug!("Store vectorial Neo4j '{}' actualizado", self.namespace);
        Ok(())
    }

    async fn query(
        &self,
        query_text: &str,
        top_k: usize,
        ids: Option<&[String]>,
        _filters: Option<&TagFilters>,
    ) -> RagResult<Vec<VectorRecord>> {
        let query_vec = self
            .embedding
            .embed(&[query_text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RagError::Llm("empty embedding for query".into()))?;

        let q = match ids {
            // Restricción por ids: similitud calculada sobre los candidatos.
            Some(allowed) => query(&format!(
                "MATCH (n:{label}) WHERE n.id IN $ids \
                 WITH n, vector.similarity.cosine(n.embedding, $embedding) AS score \
                 RETURN {RECORD_RETURN}, score ORDER BY score DESC LIMIT $k",
                label = self.label
            ))
            .param("ids", allowed.to_vec()),
            None => query(&format!(
                "CALL db.index.vector.queryNodes($index_name, $k, $embedding) \
                 YIELD node AS n, score \
                 RETURN {RECORD_RETURN}, score ORDER BY score DESC"
            ))
            .param("index_name", self.index_name.clone()),
        }
        .param("k", top_k as i64)
        .param("embedding", query_vec);

        let rows = self.rows(q).await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let sim = score_to_cosine(row.get::<f64>("score")?);
                if sim < self.config.cosine_better_than_threshold {
                    return None;
                }
                self.record_from_row(row, Some(sim))
            })
            .collect())
    }

    async fn get_by_id(&self, id: &str) -> RagResult<Option<VectorRecord>> {
        Ok(self
            .get_by_ids(&[id.to_string()])
            .await?
            .into_iter()
            .next()
            .flatten())
    }

    async fn get_by_ids(&self, ids: &[String]) -> RagResult<Vec<Option<VectorRecord>>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self
            .rows(
                query(&format!(
                    "MATCH (n:{label}) WHERE n.id IN $ids RETURN {RECORD_RETURN}",
                    label = self.label
                ))
                .param("ids", ids.to_vec()),
            )
            .await?;
        let mut found: HashMap<String, VectorRecord> = rows
            .iter()
            .filter_map(|row| self.record_from_row(row, None))
            .map(|r| (r.id.clone(), r))
            .collect();
        Ok(ids.iter().map(|id| found.remove(id)).collect())
    }

    async fn get_vectors_by_ids(&self, ids: &[String]) -> RagResult<HashMap<String, Vec<f64>>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = self
            .rows(
                query(&format!(
                    "MATCH (n:{label}) WHERE n.id IN $ids RETURN n.id AS id, n.embedding AS embedding",
                    label = self.label
                ))
                .param("ids", ids.to_vec()),
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| Some((r.get::<String>("id")?, r.get::<Vec<f64>>("embedding")?)))
            .collect())
    }

    async fn delete(&self, ids: &[String]) -> RagResult<()> {
        self.graph
            .run(
                query(&format!(
                    "MATCH (n:{label}) WHERE n.id IN $ids DETACH DELETE n",
                    label = self.label
                ))
                .param("ids", ids.to_vec()),
            )
            .await
            .map_err(storage_err)
    }

    async fn index_done_callback(&self) -> RagResult<()> {
        Ok(())
    }

    async fn drop_all(&self) -> RagResult<()> {
        self.graph
            .run(query(&format!("MATCH (n:{label}) DETACH DELETE n", label = self.label)))
            .await
            .map_err(storage_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neo4j_score_maps_back_to_cosine() {
        assert!((score_to_cosine(1.0) - 1.0).abs() < 1e-12);
        assert!((score_to_cosine(0.5)).abs() < 1e-12);
        assert!((score_to_cosine(0.0) + 1.0).abs() < 1e-12);
    }
}
