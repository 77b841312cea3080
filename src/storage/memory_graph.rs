//! Grafo de conocimiento en memoria, volcado a `graph_{namespace}.json`.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{load_json, storage_file, write_json, GraphStorage};
use crate::error::RagResult;
use crate::models::{EdgeData, KgEdge, KgNode, KnowledgeGraph, NodeData};
use crate::shared::{Namespace, SharedStorage};
use crate::utils::sorted_pair;

#[derive(Debug, Default, Serialize, Deserialize)]
struct GraphFile {
    nodes: HashMap<String, NodeData>,
    edges: Vec<StoredEdge>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEdge {
    source: String,
    target: String,
    data: EdgeData,
}

#[derive(Debug, Default)]
pub struct GraphTable {
    nodes: HashMap<String, NodeData>,
    edges: HashMap<(String, String), EdgeData>,
    adjacency: HashMap<String, BTreeSet<String>>,
}

impl GraphTable {
    fn from_file(file: GraphFile) -> Self {
        let mut table = Self {
            nodes: file.nodes,
            ..Self::default()
        };
        for edge in file.edges {
            table.put_edge(&edge.source, &edge.target, edge.data);
        }
        table
    }

    fn to_file(&self) -> GraphFile {
        let mut edges: Vec<StoredEdge> = self
            .edges
            .iter()
            .map(|((a, b), data)| StoredEdge {
                source: a.clone(),
                target: b.clone(),
                data: data.clone(),
            })
            .collect();
        edges.sort_by(|x, y| (&x.source, &x.target).cmp(&(&y.source, &y.target)));
        GraphFile {
            nodes: self.nodes.clone(),
            edges,
        }
    }

    fn put_edge(&mut self, src: &str, tgt: &str, data: EdgeData) {
        let key = sorted_pair(src, tgt);
        self.adjacency
            .entry(key.0.clone())
            .or_default()
            .insert(key.1.clone());
        self.adjacency
            .entry(key.1.clone())
            .or_default()
            .insert(key.0.clone());
        self.edges.insert(key, data);
    }

    fn degree(&self, node: &str) -> usize {
        self.adjacency.get(node).map_or(0, BTreeSet::len)
    }

    fn kg_node(&self, id: &str) -> Option<KgNode> {
        self.nodes.get(id).map(|n| KgNode {
            id: id.to_string(),
            labels: vec![id.to_string()],
            properties: n.to_properties(),
        })
    }

    /// Subgrafo inducido por `selected`.
    fn subgraph(&self, selected: &[String], is_truncated: bool) -> KnowledgeGraph {
        let set: HashSet<&String> = selected.iter().collect();
        let nodes = selected.iter().filter_map(|id| self.kg_node(id)).collect();
        let mut edges: Vec<KgEdge> = self
            .edges
            .iter()
            .filter(|((a, b), _)| set.contains(a) && set.contains(b))
            .map(|((a, b), data)| KgEdge {
                id: format!("{a}-{b}"),
                edge_type: Some("DIRECTED".to_string()),
                source: a.clone(),
                target: b.clone(),
                properties: data.to_properties(),
            })
            .collect();
        edges.sort_by(|x, y| x.id.cmp(&y.id));
        KnowledgeGraph {
            nodes,
            edges,
            is_truncated,
        }
    }
}

pub struct MemoryGraphStorage {
    namespace: String,
    file: PathBuf,
    data: Arc<Namespace<GraphTable>>,
}

impl MemoryGraphStorage {
    pub async fn open(shared: &SharedStorage, working_dir: &Path, namespace: &str) -> RagResult<Self> {
        let file = storage_file(working_dir, "graph", namespace);
        let loaded: GraphFile = load_json(&file).await?;
        info!(
            "Grafo '{namespace}' cargado ({} nodos, {} aristas).",
            loaded.nodes.len(),
            loaded.edges.len()
        );
        let data = shared.namespace_with(&format!("graph:{namespace}"), || GraphTable::from_file(loaded))?;
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
impl GraphStorage for MemoryGraphStorage {
    async fn has_node(&self, node_id: &str) -> RagResult<bool> {
        Ok(self.data.lock().await.nodes.contains_key(node_id))
    }

    async fn has_edge(&self, src: &str, tgt: &str) -> RagResult<bool> {
        Ok(self.data.lock().await.edges.contains_key(&sorted_pair(src, tgt)))
    }

    async fn get_node(&self, node_id: &str) -> RagResult<Option<NodeData>> {
        Ok(self.data.lock().await.nodes.get(node_id).cloned())
    }

    async fn get_edge(&self, src: &str, tgt: &str) -> RagResult<Option<EdgeData>> {
        Ok(self.data.lock().await.edges.get(&sorted_pair(src, tgt)).cloned())
    }

    async fn get_nodes_batch(&self, node_ids: &[String]) -> RagResult<HashMap<String, NodeData>> {
        let table = self.data.lock().await;
        Ok(node_ids
            .iter()
            .filter_map(|id| table.nodes.get(id).map(|n| (id.clone(), n.clone())))
            .collect())
    }

    async fn get_edges_batch(
        &self,
        pairs: &[(String, String)],
    ) -> RagResult<HashMap<(String, String), EdgeData>> {
        let table = self.data.lock().await;
        Ok(pairs
            .iter()
            .filter_map(|(a, b)| {
                table
                    .edges
                    .get(&sorted_pair(a, b))
                    .map(|e| ((a.clone(), b.clone()), e.clone()))
            })
            .collect())
    }

    async fn node_degree(&self, node_id: &str) -> RagResult<usize> {
        Ok(self.data.lock().await.degree(node_id))
    }

    async fn node_degrees_batch(&self, node_ids: &[String]) -> RagResult<HashMap<String, usize>> {
        let table = self.data.lock().await;
        Ok(node_ids
            .iter()
            .map(|id| (id.clone(), table.degree(id)))
            .collect())
    }

    async fn get_node_edges(&self, node_id: &str) -> RagResult<Vec<(String, String)>> {
        let table = self.data.lock().await;
        Ok(table
            .adjacency
            .get(node_id)
            .map(|neighbours| {
                neighbours
                    .iter()
                    .map(|n| (node_id.to_string(), n.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn upsert_node(&self, node_id: &str, data: NodeData) -> RagResult<()> {
        self.data.lock().await.nodes.insert(node_id.to_string(), data);
        self.data.mark_dirty();
        Ok(())
    }

    async fn upsert_edge(&self, src: &str, tgt: &str, data: EdgeData) -> RagResult<()> {
        self.data.lock().await.put_edge(src, tgt, data);
        self.data.mark_dirty();
        Ok(())
    }

    async fn get_all_labels(&self) -> RagResult<Vec<String>> {
        let table = self.data.lock().await;
        let mut labels: Vec<String> = table.nodes.keys().cloned().collect();
        labels.sort();
        Ok(labels)
    }

    async fn get_knowledge_graph(
        &self,
        label: &str,
        max_depth: usize,
        max_nodes: usize,
    ) -> RagResult<KnowledgeGraph> {
        let table = self.data.lock().await;

        if label == "*" {
            let mut all: Vec<&String> = table.nodes.keys().collect();
            all.sort_by(|a, b| table.degree(b).cmp(&table.degree(a)).then_with(|| a.cmp(b)));
            let is_truncated = all.len() > max_nodes;
            let selected: Vec<String> = all.into_iter().take(max_nodes).cloned().collect();
            return Ok(table.subgraph(&selected, is_truncated));
        }

        if !table.nodes.contains_key(label) {
            return Ok(KnowledgeGraph::default());
        }

        // BFS desde el nodo inicial.
        let mut selected = vec![label.to_string()];
        let mut seen: HashSet<String> = HashSet::from([label.to_string()]);
        let mut queue = VecDeque::from([(label.to_string(), 0usize)]);
        let mut is_truncated = false;
        while let Some((node, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            let Some(neighbours) = table.adjacency.get(&node) else {
                continue;
            };
            for next in neighbours {
                if seen.contains(next) {
                    continue;
                }
                if selected.len() >= max_nodes {
                    is_truncated = true;
                    break;
                }
                seen.insert(next.clone());
                selected.push(next.clone());
                queue.push_back((next.clone(), depth + 1));
            }
        }
        Ok(table.subgraph(&selected, is_truncated))
    }

    async fn index_done_callback(&self) -> RagResult<()> {
        if !self.data.take_dirty() {
            return Ok(());
        }
        let table = self.data.lock().await;
        write_json(&self.file, &table.to_file()).await
    }

    async fn drop_all(&self) -> RagResult<()> {
        *self.data.lock().await = GraphTable::default();
        self.data.mark_dirty();
        self.index_done_callback().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeData {
        NodeData {
            entity_id: name.into(),
            entity_type: "person".into(),
            description: format!("{name} desc"),
            source_id: "chunk-1".into(),
            file_path: "f.txt".into(),
            created_at: 0,
            tags_json: Some(serde_json::Value::String(r#"{"project":"alpha"}"#.into())),
        }
    }

    fn edge() -> EdgeData {
        EdgeData {
            description: "knows".into(),
            keywords: "friendship".into(),
            weight: 1.0,
            source_id: "chunk-1".into(),
            file_path: "f.txt".into(),
            created_at: 0,
            tags_json: None,
        }
    }

    async fn sample(dir: &Path) -> MemoryGraphStorage {
        let shared = SharedStorage::initialize(1);
        let g = MemoryGraphStorage::open(&shared, dir, "kg").await.unwrap();
        for n in ["Alice", "Bob", "Carol", "Dave"] {
            g.upsert_node(n, node(n)).await.unwrap();
        }
        g.upsert_edge("Bob", "Alice", edge()).await.unwrap();
        g.upsert_edge("Bob", "Carol", edge()).await.unwrap();
        g.upsert_edge("Carol", "Dave", edge()).await.unwrap();
        g
    }

    #[tokio::test]
    async fn edges_are_undirected() {
        let dir = tempfile::tempdir().unwrap();
        let g = sample(dir.path()).await;
        assert!(g.has_edge("Alice", "Bob").await.unwrap());
        assert!(g.has_edge("Bob", "Alice").await.unwrap());
        assert_eq!(g.node_degree("Bob").await.unwrap(), 2);
        let degrees = g
            .edge_degrees_batch(&[("Alice".to_string(), "Bob".to_string())])
            .await
            .unwrap();
        assert_eq!(degrees.values().next(), Some(&3));
        let edges = g.get_node_edges("Carol").await.unwrap();
        assert_eq!(edges.len(), 2);
        assert!(edges.iter().all(|(src, _)| src == "Carol"));
    }

    #[tokio::test]
    async fn knowledge_graph_respects_depth_and_limits() {
        let dir = tempfile::tempdir().unwrap();
        let g = sample(dir.path()).await;

        let kg = g.get_knowledge_graph("Alice", 1, 10).await.unwrap();
        let ids: Vec<&str> = kg.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["Alice", "Bob"]);
        assert_eq!(kg.edges.len(), 1);
        assert!(kg.nodes[0].properties.contains_key("tags_json"));

        let kg = g.get_knowledge_graph("Alice", 3, 2).await.unwrap();
        assert_eq!(kg.nodes.len(), 2);
        assert!(kg.is_truncated);

        let all = g.get_knowledge_graph("*", 1, 10).await.unwrap();
        assert_eq!(all.nodes.len(), 4);
        assert_eq!(all.edges.len(), 3);
        assert!(!all.is_truncated);

        assert!(g.get_knowledge_graph("Nobody", 2, 10).await.unwrap().nodes.is_empty());
    }

    #[tokio::test]
    async fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        {
            let g = sample(dir.path()).await;
            g.index_done_callback().await.unwrap();
        }
        let shared = SharedStorage::initialize(1);
        let g = MemoryGraphStorage::open(&shared, dir.path(), "kg").await.unwrap();
        assert_eq!(g.get_all_labels().await.unwrap().len(), 4);
        assert!(g.has_edge("Dave", "Carol").await.unwrap());
    }
}
