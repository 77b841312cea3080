//! Grafo de conocimiento sobre Neo4j: nodos `:Entity` y relaciones
//! `:DIRECTED` guardadas con el par ordenado y consultadas sin dirección.
//! `tags_json` se guarda como cadena JSON.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use neo4rs::{query, Graph, Query, Row};
use serde_json::Value;
use tracing::{debug, info};

use super::GraphStorage;
use crate::error::{RagError, RagResult};
use crate::models::{EdgeData, KgEdge, KgNode, KnowledgeGraph, NodeData};
use crate::utils::sorted_pair;

fn storage_err(e: neo4rs::Error) -> RagError {
    RagError::Storage(format!("neo4j: {e}"))
}

fn tags_param(tags_json: &Option<Value>) -> String {
    match tags_json {
        Some(Value::String(raw)) => raw.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn tags_from_row(row: &Row) -> Option<Value> {
    row.get::<String>("tags_json")
        .filter(|raw| !raw.is_empty())
        .map(Value::String)
}

fn node_from_row(row: &Row) -> Option<NodeData> {
    Some(NodeData {
        entity_id: row.get("id")?,
        entity_type: row.get("entity_type").unwrap_or_default(),
        description: row.get("description").unwrap_or_default(),
        source_id: row.get("source_id").unwrap_or_default(),
        file_path: row.get("file_path").unwrap_or_default(),
        created_at: row.get("created_at").unwrap_or_default(),
        tags_json: tags_from_row(row),
    })
}

fn edge_from_row(row: &Row) -> EdgeData {
    EdgeData {
        description: row.get("description").unwrap_or_default(),
        keywords: row.get("keywords").unwrap_or_default(),
        weight: row.get("weight").unwrap_or(1.0),
        source_id: row.get("source_id").unwrap_or_default(),
        file_path: row.get("file_path").unwrap_or_default(),
        created_at: row.get("created_at").unwrap_or_default(),
        tags_json: tags_from_row(row),
    }
}

const NODE_RETURN: &str = "n.id AS id, n.entity_type AS entity_type, n.description AS description, \
     n.source_id AS source_id, n.file_path AS file_path, n.created_at AS created_at, \
     n.tags_json AS tags_json";

const EDGE_RETURN: &str = "r.description AS description, r.keywords AS keywords, r.weight AS weight, \
     r.source_id AS source_id, r.file_path AS file_path, r.created_at AS created_at, \
     r.tags_json AS tags_json";

pub struct Neo4jGraphStorage {
    graph: Arc<Graph>,
}

impl Neo4jGraphStorage {
    pub fn new(graph: Arc<Graph>) -> Self {
        Self { graph }
    }

    async fn rows(&self, q: Query) -> RagResult<Vec<Row>> {
        let mut cursor = self.graph.execute(q).await.map_err(storage_err)?;
        let mut out = Vec::new();
        while let Some(row) = cursor.next().await.map_err(storage_err)? {
            out.push(row);
        }
        Ok(out)
    }

    async fn neighbours(&self, node_id: &str) -> RagResult<Vec<String>> {
        let rows = self
            .rows(
                query("MATCH (n:Entity {id: $id})-[:DIRECTED]-(m:Entity) RETURN DISTINCT m.id AS id ORDER BY id")
                    .param("id", node_id),
            )
            .await?;
        Ok(rows.iter().filter_map(|r| r.get::<String>("id")).collect())
    }

    async fn subgraph(&self, selected: Vec<String>, is_truncated: bool) -> RagResult<KnowledgeGraph> {
        let nodes = self.get_nodes_batch(&selected).await?;
        let rows = self
            .rows(
                query(&format!(
                    "MATCH (a:Entity)-[r:DIRECTED]-(b:Entity) \
                     WHERE a.id IN $ids AND b.id IN $ids AND a.id < b.id \
                     RETURN a.id AS src, b.id AS tgt, {EDGE_RETURN}"
                ))
                .param("ids", selected.clone()),
            )
            .await?;
        let mut edges = Vec::with_capacity(rows.len());
        for row in &rows {
            let (Some(src), Some(tgt)) = (row.get::<String>("src"), row.get::<String>("tgt")) else {
                continue;
            };
            edges.push(KgEdge {
                id: format!("{src}-{tgt}"),
                edge_type: Some("DIRECTED".to_string()),
                source: src,
                target: tgt,
                properties: edge_from_row(row).to_properties(),
            });
        }
        edges.sort_by(|x, y| x.id.cmp(&y.id));
        let nodes = selected
            .iter()
            .filter_map(|id| {
                nodes.get(id).map(|n| KgNode {
                    id: id.clone(),
                    labels: vec![id.clone()],
                    properties: n.to_properties(),
                })
            })
            .collect();
        Ok(KnowledgeGraph {
            nodes,
            edges,
            is_truncated,
        })
    }
}

#[async_trait]
impl GraphStorage for Neo4jGraphStorage {
    async fn has_node(&self, node_id: &str) -> RagResult<bool> {
        Ok(self.get_node(node_id).await?.is_some())
    }

    async fn has_edge(&self, src: &str, tgt: &str) -> RagResult<bool> {
        Ok(self.get_edge(src, tgt).await?.is_some())
    }

    async fn get_node(&self, node_id: &str) -> RagResult<Option<NodeData>> {
        let rows = self
            .rows(query(&format!("MATCH (n:Entity {{id: $id}}) RETURN {NODE_RETURN}")).param("id", node_id))
            .await?;
        Ok(rows.first().and_then(node_from_row))
    }

    async fn get_edge(&self, src: &str, tgt: &str) -> RagResult<Option<EdgeData>> {
        let (a, b) = sorted_pair(src, tgt);
        let rows = self
            .rows(
                query(&format!(
                    "MATCH (a:Entity {{id: $a}})-[r:DIRECTED]-(b:Entity {{id: $b}}) RETURN {EDGE_RETURN} LIMIT 1"
                ))
                .param("a", a)
                .param("b", b),
            )
            .await?;
        Ok(rows.first().map(edge_from_row))
    }

    async fn get_nodes_batch(&self, node_ids: &[String]) -> RagResult<HashMap<String, NodeData>> {
        if node_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = self
            .rows(
                query(&format!(
                    "UNWIND $ids AS nid MATCH (n:Entity {{id: nid}}) RETURN {NODE_RETURN}"
                ))
                .param("ids", node_ids.to_vec()),
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(node_from_row)
            .map(|n| (n.entity_id.clone(), n))
            .collect())
    }

    async fn get_edges_batch(
        &self,
        pairs: &[(String, String)],
    ) -> RagResult<HashMap<(String, String), EdgeData>> {
        let mut out = HashMap::with_capacity(pairs.len());
        for (a, b) in pairs {
            if let Some(edge) = self.get_edge(a, b).await? {
                out.insert((a.clone(), b.clone()), edge);
            }
        }
        Ok(out)
    }

    async fn node_degree(&self, node_id: &str) -> RagResult<usize> {
        let rows = self
            .rows(
                query("MATCH (n:Entity {id: $id}) OPTIONAL MATCH (n)-[r:DIRECTED]-() RETURN count(r) AS degree")
                    .param("id", node_id),
            )
            .await?;
        Ok(rows
            .first()
            .and_then(|r| r.get::<i64>("degree"))
            .unwrap_or(0)
            .max(0) as usize)
    }

    async fn node_degrees_batch(&self, node_ids: &[String]) -> RagResult<HashMap<String, usize>> {
        if node_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = self
            .rows(
                query(
                    "UNWIND $ids AS nid \
                     OPTIONAL MATCH (n:Entity {id: nid})-[r:DIRECTED]-() \
                     RETURN nid AS id, count(r) AS degree",
                )
                .param("ids", node_ids.to_vec()),
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| {
                let id = r.get::<String>("id")?;
                let degree = r.get::<i64>("degree").unwrap_or(0).max(0) as usize;
                Some((id, degree))
            })
            .collect())
    }

    async fn get_node_edges(&self, node_id: &str) -> RagResult<Vec<(String, String)>> {
        Ok(self
            .neighbours(node_id)
            .await?
            .into_iter()
            .map(|n| (node_id.to_string(), n))
            .collect())
    }

    async fn upsert_node(&self, node_id: &str, data: NodeData) -> RagResult<()> {
        let tags = tags_param(&data.tags_json);
        self.graph
            .run(
                query(
                    "MERGE (n:Entity {id: $id}) \
                     SET n.entity_id = $id, n.entity_type = $entity_type, n.description = $description, \
                         n.source_id = $source_id, n.file_path = $file_path, \
                         n.created_at = $created_at, n.tags_json = $tags_json",
                )
                .param("id", node_id)
                .param("entity_type", data.entity_type)
                .param("description", data.description)
                .param("source_id", data.source_id)
                .param("file_path", data.file_path)
                .param("created_at", data.created_at)
                .param("tags_json", tags),
            )
            .await
            .map_err(storage_err)?;
        debug!("neo4j: nodo {node_id} actualizado");
        Ok(())
    }

    async fn upsert_edge(&self, src: &str, tgt: &str, data: EdgeData) -> RagResult<()> {
        let (a, b) = sorted_pair(src, tgt);
        let tags = tags_param(&data.tags_json);
        self.graph
            .run(
                query(
                    "MATCH (a:Entity {id: $a}), (b:Entity {id: $b}) \
                     MERGE (a)-[r:DIRECTED]-(b) \
                     SET r.description = $description, r.keywords = $keywords, r.weight = $weight, \
                         r.source_id = $source_id, r.file_path = $file_path, \
                         r.created_at = $created_at, r.tags_json = $tags_json",
                )
                .param("a", a)
                .param("b", b)
                .param("description", data.description)
                .param("keywords", data.keywords)
                .param("weight", data.weight)
                .param("source_id", data.source_id)
                .param("file_path", data.file_path)
                .param("created_at", data.created_at)
                .param("tags_json", tags),
            )
            .await
            .map_err(storage_err)
    }

    async fn get_all_labels(&self) -> RagResult<Vec<String>> {
        let rows = self
            .rows(query("MATCH (n:Entity) RETURN n.id AS id ORDER BY id"))
            .await?;
        Ok(rows.iter().filter_map(|r| r.get::<String>("id")).collect())
    }

    async fn get_knowledge_graph(
        &self,
        label: &str,
        max_depth: usize,
        max_nodes: usize,
    ) -> RagResult<KnowledgeGraph> {
        if label == "*" {
            let rows = self
                .rows(
                    query(
                        "MATCH (n:Entity) OPTIONAL MATCH (n)-[r:DIRECTED]-() \
                         WITH n, count(r) AS degree \
                         RETURN n.id AS id ORDER BY degree DESC, id LIMIT $limit",
                    )
                    .param("limit", (max_nodes + 1) as i64),
                )
                .await?;
            let mut ids: Vec<String> = rows.iter().filter_map(|r| r.get::<String>("id")).collect();
            let is_truncated = ids.len() > max_nodes;
            ids.truncate(max_nodes);
            return self.subgraph(ids, is_truncated).await;
        }

        if !self.has_node(label).await? {
            return Ok(KnowledgeGraph::default());
        }

        let mut selected = vec![label.to_string()];
        let mut seen: HashSet<String> = HashSet::from([label.to_string()]);
        let mut queue = VecDeque::from([(label.to_string(), 0usize)]);
        let mut is_truncated = false;
        'bfs: while let Some((node, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for next in self.neighbours(&node).await? {
                if seen.contains(&next) {
                    continue;
                }
                if selected.len() >= max_nodes {
                    is_truncated = true;
                    break 'bfs;
                }
                seen.insert(next.clone());
                selected.push(next.clone());
                queue.push_back((next, depth + 1));
            }
        }
        self.subgraph(selected, is_truncated).await
    }

    async fn index_done_callback(&self) -> RagResult<()> {
        Ok(())
    }

    async fn drop_all(&self) -> RagResult<()> {
        self.graph
            .run(query("MATCH (n:Entity) DETACH DELETE n"))
            .await
            .map_err(storage_err)?;
        info!("neo4j: grafo de entidades vaciado");
        Ok(())
    }
}
