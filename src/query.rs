//! Motor de consultas: recuperación por modo, filtrado por etiquetas,
//! truncado por presupuesto y ensamblado del contexto.
//!
//! Los filtros sólo se delegan al store vectorial si declara soportarlos;
//! en cualquier caso cada candidato se revalida aquí con las etiquetas
//! resueltas en este orden: payload del vector, etiquetas de los chunks en
//! el KV y `tags_json` del grafo.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::engine::RagEngine;
use crate::error::RagResult;
use crate::llm::complete_with_cache;
use crate::models::{EdgeData, NodeData, QueryMode, QueryParam, TextChunk};
use crate::storage::{VectorRecord, VectorStorage};
use crate::tags::{aggregate_tags, decode_tags_json, TagFilters, Tags};
use crate::utils::{entity_vector_id, relation_vector_id, sorted_pair, split_field};

pub const FAIL_RESPONSE: &str = "Sorry, I'm not able to provide an answer to that question.[no-context]";

/// Factor de sobre-recuperación cuando el filtrado se hace en cliente.
const CLIENT_FILTER_OVERFETCH: usize = 4;
/// Tope de `top_k` y `chunk_top_k` por consulta.
pub const MAX_TOP_K: usize = 10_000;

const KEYWORDS_PROMPT: &str = r#"---Role---
You are a helpful assistant tasked with identifying both high-level and low-level keywords in the user's query.

---Goal---
Given the query, list both high-level and low-level keywords. High-level keywords focus on overarching concepts or themes, while low-level keywords focus on specific entities, details, or concrete terms.

---Instructions---
- Output the keywords in JSON format with two keys:
  - "high_level_keywords" for overarching concepts or themes
  - "low_level_keywords" for specific entities or details
- Output only the JSON object.

---Real Data---
Query: {query}

Output:
"#;

const RAG_RESPONSE_PROMPT: &str = r#"---Role---
You are a helpful assistant responding to user query about the Knowledge Graph and Document Chunks provided below.

---Goal---
Generate a concise response based on the Knowledge Base and follow the Response Rules. Summarize all information in the provided Knowledge Base. Do not include information not provided by the Knowledge Base.

---Knowledge Base---
{context_data}

---Response Rules---
- Target format and length: {response_type}
- Use markdown formatting with appropriate section headings
- If you don't know the answer, just say so."#;

/// Entidad tal como aparece en el contexto.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntity {
    pub entity: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub description: String,
    pub file_path: String,
    #[serde(skip)]
    pub source_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRelationship {
    pub entity1: String,
    pub entity2: String,
    pub description: String,
    pub keywords: String,
    pub weight: f64,
    pub file_path: String,
    #[serde(skip)]
    pub source_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextChunk {
    pub id: String,
    pub content: String,
    pub file_path: String,
}

/// Contexto ya filtrado y truncado.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryContext {
    pub entities: Vec<ContextEntity>,
    pub relationships: Vec<ContextRelationship>,
    pub chunks: Vec<ContextChunk>,
}

impl QueryContext {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty() && self.chunks.is_empty()
    }

    /// Texto que se entrega al LLM (o al llamante con `only_need_context`).
    pub fn render(&self, mode: QueryMode) -> String {
        if mode == QueryMode::Naive {
            return format!("---Document Chunks(DC)---\n\n{}", json_block(&self.chunks));
        }
        format!(
            "-----Entities(KG)-----\n\n{}\n\n-----Relationships(KG)-----\n\n{}\n\n-----Document Chunks(DC)-----\n\n{}",
            json_block(&self.entities),
            json_block(&self.relationships),
            json_block(&self.chunks),
        )
    }
}

fn json_block<T: Serialize>(items: &[T]) -> String {
    let body = serde_json::to_string_pretty(items).unwrap_or_else(|_| "[]".to_string());
    format!("```json\n{body}\n```")
}

#[derive(Debug, Default, Deserialize)]
struct KeywordsOutput {
    #[serde(default)]
    high_level_keywords: Vec<String>,
    #[serde(default)]
    low_level_keywords: Vec<String>,
}

/// Extrae el objeto JSON de la respuesta del LLM, tolerando texto o
/// vallas de código alrededor.
fn parse_keywords(raw: &str) -> (Vec<String>, Vec<String>) {
    let parsed = match (raw.find('{'), raw.rfind('}')) {
        (Some(start), Some(end)) if start < end => {
            serde_json::from_str::<KeywordsOutput>(&raw[start..=end])
        }
        _ => serde_json::from_str::<KeywordsOutput>(raw),
    };
    match parsed {
        Ok(out) => {
            let clean = |v: Vec<String>| -> Vec<String> {
                v.into_iter()
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .collect()
            };
            (clean(out.high_level_keywords), clean(out.low_level_keywords))
        }
        Err(e) => {
            warn!("Respuesta de palabras clave no es JSON válido: {e}");
            (Vec::new(), Vec::new())
        }
    }
}

/// Con filtro activo, un candidato sin etiquetas no pasa.
fn retain(tags: Option<&Tags>, filters: &TagFilters) -> bool {
    match tags {
        Some(tags) => filters.matches(tags),
        None => filters.is_empty(),
    }
}

fn non_empty(tags: Option<Tags>) -> Option<Tags> {
    tags.filter(|t| !t.is_empty())
}

fn graph_tags(value: Option<&Value>, what: &str) -> Option<Tags> {
    match value.map(decode_tags_json).transpose() {
        Ok(tags) => non_empty(tags.flatten()),
        Err(e) => {
            warn!("tags_json ilegible en {what}: {e}");
            None
        }
    }
}

fn source_ids(field: &str) -> Vec<String> {
    split_field(field).map(String::from).collect()
}

/// Recorta `items` para que la suma de tokens de sus entradas serializadas
/// no pase de `budget`.
fn truncate_by_tokens<T: Serialize>(
    items: &mut Vec<T>,
    budget: usize,
    count: impl Fn(&str) -> usize,
) -> usize {
    let mut used = 0;
    let mut keep = 0;
    for item in items.iter() {
        let text = serde_json::to_string(item).unwrap_or_default();
        let tokens = count(&text);
        if used + tokens > budget {
            break;
        }
        used += tokens;
        keep += 1;
    }
    items.truncate(keep);
    used
}

/// Caché de chunks del KV durante una consulta.
struct ChunkLookup(HashMap<String, Option<TextChunk>>);

impl ChunkLookup {
    fn tags_for<'a>(&self, ids: impl IntoIterator<Item = &'a String>) -> Option<Tags> {
        let found: Vec<&Tags> = ids
            .into_iter()
            .filter_map(|id| self.0.get(id).and_then(Option::as_ref))
            .map(|c| &c.tags)
            .collect();
        non_empty(Some(aggregate_tags(found)))
    }
}

impl RagEngine {
    /// Responde a `query`. Con `only_need_context` devuelve el contexto
    /// ensamblado sin llamar al LLM.
    pub async fn query(&self, query: &str, param: &QueryParam) -> RagResult<String> {
        let context = self.build_query_context(query, param).await?;
        if context.is_empty() {
            info!("Consulta sin contexto ({:?})", param.mode);
            return Ok(FAIL_RESPONSE.to_string());
        }
        let rendered = context.render(param.mode);
        if param.only_need_context {
            return Ok(rendered);
        }
        let system = RAG_RESPONSE_PROMPT
            .replace("{context_data}", &rendered)
            .replace("{response_type}", &param.response_type);
        complete_with_cache(
            self.llm.as_ref(),
            self.llm_cache(),
            "query",
            query,
            Some(&system),
            &param.conversation_history,
        )
        .await
    }

    /// Palabras clave (alto nivel, bajo nivel) de la consulta vía LLM.
    pub async fn extract_keywords(&self, query: &str) -> RagResult<(Vec<String>, Vec<String>)> {
        let prompt = KEYWORDS_PROMPT.replace("{query}", query);
        let raw = complete_with_cache(self.llm.as_ref(), self.llm_cache(), "keywords", &prompt, None, &[])
            .await?;
        Ok(parse_keywords(&raw))
    }

    /// Recupera, filtra y trunca el contexto de la consulta según su modo.
    pub async fn build_query_context(
        &self,
        query: &str,
        param: &QueryParam,
    ) -> RagResult<QueryContext> {
        let filters = param.tag_filters();
        let top_k = param.top_k.min(MAX_TOP_K);
        let chunk_top_k = param.chunk_top_k.min(MAX_TOP_K);
        let mut ctx = QueryContext::default();
        let mut vector_chunks = Vec::new();

        if matches!(param.mode, QueryMode::Naive | QueryMode::Mix) {
            vector_chunks = self.search_chunks(query, chunk_top_k, &filters).await?;
        }

        let mut entity_chunk_ids: Vec<String> = Vec::new();
        let mut relation_chunk_ids: Vec<String> = Vec::new();
        if param.mode != QueryMode::Naive {
            let (hl, ll) = self.resolve_keywords(query, param).await?;
            debug!("Palabras clave: alto nivel {hl:?}, bajo nivel {ll:?}");

            if param.mode.uses_entities() {
                let entities = self.search_entities(&ll.join(", "), top_k, &filters).await?;
                let relations = self.neighbour_relationships(&entities, top_k, &filters).await?;
                entity_chunk_ids.extend(entities.iter().flat_map(|e| source_ids(&e.source_id)));
                merge_entities(&mut ctx.entities, entities);
                merge_relationships(&mut ctx.relationships, relations);
            }
            if param.mode.uses_relationships() {
                let relations = self
                    .search_relationships(&hl.join(", "), top_k, &filters)
                    .await?;
                let entities = self.endpoint_entities(&relations, top_k, &filters).await?;
                relation_chunk_ids.extend(relations.iter().flat_map(|r| source_ids(&r.source_id)));
                merge_relationships(&mut ctx.relationships, relations);
                merge_entities(&mut ctx.entities, entities);
            }
        }

        let graph_chunks = self
            .chunks_by_ids(entity_chunk_ids.into_iter().chain(relation_chunk_ids), &filters)
            .await?;

        // Truncado independiente por tipo.
        let count = |text: &str| self.tokenizer.count_tokens(text);
        ctx.entities.truncate(top_k);
        ctx.relationships.truncate(top_k);
        let entity_tokens = truncate_by_tokens(&mut ctx.entities, param.max_entity_tokens, count);
        let relation_tokens =
            truncate_by_tokens(&mut ctx.relationships, param.max_relation_tokens, count);

        let mut seen = HashSet::new();
        ctx.chunks = vector_chunks
            .into_iter()
            .chain(graph_chunks)
            .filter(|c| seen.insert(c.id.clone()))
            .take(chunk_top_k)
            .collect();
        let chunk_budget = param
            .max_total_tokens
            .saturating_sub(entity_tokens + relation_tokens);
        truncate_by_tokens(&mut ctx.chunks, chunk_budget, count);

        info!(
            "Contexto {:?}: {} entidades, {} relaciones, {} chunks",
            param.mode,
            ctx.entities.len(),
            ctx.relationships.len(),
            ctx.chunks.len()
        );
        Ok(ctx)
    }

    /// Usa las palabras clave de `param` si las trae; si no, las extrae.
    /// Sin palabras clave se recurre al texto de la consulta.
    async fn resolve_keywords(
        &self,
        query: &str,
        param: &QueryParam,
    ) -> RagResult<(Vec<String>, Vec<String>)> {
        let (mut hl, mut ll) = (param.hl_keywords.clone(), param.ll_keywords.clone());
        if hl.is_empty() && ll.is_empty() {
            (hl, ll) = self.extract_keywords(query).await?;
        }
        if hl.is_empty() {
            hl = vec![query.to_string()];
        }
        if ll.is_empty() {
            ll = vec![query.to_string()];
        }
        Ok((hl, ll))
    }

    /// Búsqueda vectorial con filtros nativos si el backend los admite y
    /// sobre-recuperación si no.
    async fn vector_search(
        &self,
        vdb: &dyn VectorStorage,
        text: &str,
        top_k: usize,
        filters: &TagFilters,
    ) -> RagResult<Vec<VectorRecord>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let native = !filters.is_empty() && vdb.supports_tag_filters();
        let fetch = if !filters.is_empty() && !native {
            top_k.saturating_mul(CLIENT_FILTER_OVERFETCH)
        } else {
            top_k
        };
        vdb.query(text, fetch, None, native.then_some(filters)).await
    }

    async fn load_chunks(&self, ids: &BTreeSet<String>) -> RagResult<ChunkLookup> {
        let ids: Vec<String> = ids.iter().cloned().collect();
        let found = self.text_chunks.get_by_ids(&ids).await?;
        Ok(ChunkLookup(ids.into_iter().zip(found).collect()))
    }

    async fn search_chunks(
        &self,
        query: &str,
        top_k: usize,
        filters: &TagFilters,
    ) -> RagResult<Vec<ContextChunk>> {
        let records = self
            .vector_search(self.chunks_vdb.as_ref(), query, top_k, filters)
            .await?;
        let ids: BTreeSet<String> = records.iter().map(|r| r.id.clone()).collect();
        let lookup = self.load_chunks(&ids).await?;

        let mut out = Vec::new();
        for record in records {
            let kv = lookup.0.get(&record.id).and_then(Option::as_ref);
            let tags = non_empty(record.tags.clone())
                .or_else(|| kv.and_then(|c| non_empty(Some(c.tags.clone()))));
            if !retain(tags.as_ref(), filters) {
                continue;
            }
            let content = record
                .get_str("content")
                .map(String::from)
                .or_else(|| kv.map(|c| c.content.clone()));
            let Some(content) = content else {
                debug!("Chunk {} sin contenido; se descarta", record.id);
                continue;
            };
            let file_path = record
                .get_str("file_path")
                .map(String::from)
                .or_else(|| kv.map(|c| c.file_path.clone()))
                .unwrap_or_default();
            out.push(ContextChunk {
                id: record.id,
                content,
                file_path,
            });
            if out.len() == top_k {
                break;
            }
        }
        Ok(out)
    }

    /// Chunks referenciados por entidades o relaciones, en orden y sin
    /// repetir, filtrados por sus propias etiquetas.
    async fn chunks_by_ids(
        &self,
        ids: impl Iterator<Item = String>,
        filters: &TagFilters,
    ) -> RagResult<Vec<ContextChunk>> {
        let mut seen = HashSet::new();
        let ordered: Vec<String> = ids.filter(|id| seen.insert(id.clone())).collect();
        if ordered.is_empty() {
            return Ok(Vec::new());
        }
        let chunks = self.text_chunks.get_by_ids(&ordered).await?;
        Ok(ordered
            .into_iter()
            .zip(chunks)
            .filter_map(|(id, chunk)| chunk.map(|c| (id, c)))
            .filter(|(_, c)| retain(non_empty(Some(c.tags.clone())).as_ref(), filters))
            .map(|(id, c)| ContextChunk {
                id,
                content: c.content,
                file_path: c.file_path,
            })
            .collect())
    }

    fn entity_from_node(name: &str, node: &NodeData) -> ContextEntity {
        ContextEntity {
            entity: name.to_string(),
            entity_type: node.entity_type.clone(),
            description: node.description.clone(),
            file_path: node.file_path.clone(),
            source_id: node.source_id.clone(),
        }
    }

    fn relationship_from_edge(a: &str, b: &str, edge: &EdgeData) -> ContextRelationship {
        ContextRelationship {
            entity1: a.to_string(),
            entity2: b.to_string(),
            description: edge.description.clone(),
            keywords: edge.keywords.clone(),
            weight: edge.weight,
            file_path: edge.file_path.clone(),
            source_id: edge.source_id.clone(),
        }
    }

    /// Filtra nodos del grafo según sus etiquetas resueltas. `payload_tags`
    /// lleva las del registro vectorial de cada entidad, si lo hay.
    async fn filter_nodes(
        &self,
        nodes: Vec<(String, NodeData)>,
        payload_tags: &HashMap<String, Tags>,
        filters: &TagFilters,
    ) -> RagResult<Vec<ContextEntity>> {
        let ids: BTreeSet<String> = nodes
            .iter()
            .flat_map(|(_, n)| source_ids(&n.source_id))
            .collect();
        let lookup = self.load_chunks(&ids).await?;
        Ok(nodes
            .into_iter()
            .filter(|(name, node)| {
                let sources = source_ids(&node.source_id);
                let tags = payload_tags
                    .get(name)
                    .cloned()
                    .or_else(|| lookup.tags_for(&sources))
                    .or_else(|| graph_tags(node.tags_json.as_ref(), name));
                retain(tags.as_ref(), filters)
            })
            .map(|(name, node)| Self::entity_from_node(&name, &node))
            .collect())
    }

    async fn filter_edges(
        &self,
        edges: Vec<((String, String), EdgeData)>,
        payload_tags: &HashMap<(String, String), Tags>,
        filters: &TagFilters,
    ) -> RagResult<Vec<ContextRelationship>> {
        let ids: BTreeSet<String> = edges
            .iter()
            .flat_map(|(_, e)| source_ids(&e.source_id))
            .collect();
        let lookup = self.load_chunks(&ids).await?;
        Ok(edges
            .into_iter()
            .filter(|(pair, edge)| {
                let sources = source_ids(&edge.source_id);
                let tags = payload_tags
                    .get(pair)
                    .cloned()
                    .or_else(|| lookup.tags_for(&sources))
                    .or_else(|| graph_tags(edge.tags_json.as_ref(), &format!("{}-{}", pair.0, pair.1)));
                retain(tags.as_ref(), filters)
            })
            .map(|((a, b), edge)| Self::relationship_from_edge(&a, &b, &edge))
            .collect())
    }

    /// Entidades por similitud con las palabras clave de bajo nivel.
    async fn search_entities(
        &self,
        keywords: &str,
        top_k: usize,
        filters: &TagFilters,
    ) -> RagResult<Vec<ContextEntity>> {
        let records = self
            .vector_search(self.entities_vdb.as_ref(), keywords, top_k, filters)
            .await?;
        let mut names = Vec::new();
        let mut payload_tags = HashMap::new();
        for record in &records {
            let Some(name) = record.get_str("entity_name") else {
                continue;
            };
            if let Some(tags) = non_empty(record.tags.clone()) {
                payload_tags.insert(name.to_string(), tags);
            }
            names.push(name.to_string());
        }
        let mut nodes = self.graph.get_nodes_batch(&names).await?;
        let ordered: Vec<(String, NodeData)> = names
            .into_iter()
            .filter_map(|name| nodes.remove(&name).map(|n| (name, n)))
            .collect();
        let mut out = self.filter_nodes(ordered, &payload_tags, filters).await?;
        out.truncate(top_k);
        Ok(out)
    }

    /// Relaciones por similitud con las palabras clave de alto nivel.
    async fn search_relationships(
        &self,
        keywords: &str,
        top_k: usize,
        filters: &TagFilters,
    ) -> RagResult<Vec<ContextRelationship>> {
        let records = self
            .vector_search(self.relationships_vdb.as_ref(), keywords, top_k, filters)
            .await?;
        let mut pairs = Vec::new();
        let mut payload_tags = HashMap::new();
        for record in &records {
            let (Some(src), Some(tgt)) = (record.get_str("src_id"), record.get_str("tgt_id")) else {
                continue;
            };
            let pair = sorted_pair(src, tgt);
            if pairs.contains(&pair) {
                continue;
            }
            if let Some(tags) = non_empty(record.tags.clone()) {
                payload_tags.insert(pair.clone(), tags);
            }
            pairs.push(pair);
        }
        let mut edges = self.graph.get_edges_batch(&pairs).await?;
        let ordered: Vec<((String, String), EdgeData)> = pairs
            .into_iter()
            .filter_map(|pair| edges.remove(&pair).map(|e| (pair, e)))
            .collect();
        let mut out = self.filter_edges(ordered, &payload_tags, filters).await?;
        out.truncate(top_k);
        Ok(out)
    }

    /// Relaciones a un salto de las entidades encontradas, por grado y peso.
    async fn neighbour_relationships(
        &self,
        entities: &[ContextEntity],
        top_k: usize,
        filters: &TagFilters,
    ) -> RagResult<Vec<ContextRelationship>> {
        if entities.is_empty() {
            return Ok(Vec::new());
        }
        let names: Vec<String> = entities.iter().map(|e| e.entity.clone()).collect();
        let incident = self.graph.get_nodes_edges_batch(&names).await?;
        let mut pairs: Vec<(String, String)> = Vec::new();
        for name in &names {
            for (a, b) in incident.get(name).into_iter().flatten() {
                let pair = sorted_pair(a, b);
                if !pairs.contains(&pair) {
                    pairs.push(pair);
                }
            }
        }
        let mut edges = self.graph.get_edges_batch(&pairs).await?;
        let degrees = self.graph.edge_degrees_batch(&pairs).await?;
        let mut ordered: Vec<((String, String), EdgeData)> = pairs
            .into_iter()
            .filter_map(|pair| edges.remove(&pair).map(|e| (pair, e)))
            .collect();
        ordered.sort_by(|(pa, ea), (pb, eb)| {
            let da = degrees.get(pa).copied().unwrap_or(0);
            let db = degrees.get(pb).copied().unwrap_or(0);
            db.cmp(&da)
                .then_with(|| eb.weight.partial_cmp(&ea.weight).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| pa.cmp(pb))
        });

        let vector_ids: Vec<String> = ordered
            .iter()
            .map(|((a, b), _)| relation_vector_id(a, b))
            .collect();
        let payload_tags: HashMap<(String, String), Tags> = self
            .relationships_vdb
            .get_by_ids(&vector_ids)
            .await?
            .into_iter()
            .zip(ordered.iter())
            .filter_map(|(rec, (pair, _))| Some((pair.clone(), non_empty(rec?.tags)?)))
            .collect();

        let mut out = self.filter_edges(ordered, &payload_tags, filters).await?;
        out.truncate(top_k);
        Ok(out)
    }

    /// Entidades extremo de las relaciones encontradas.
    async fn endpoint_entities(
        &self,
        relations: &[ContextRelationship],
        top_k: usize,
        filters: &TagFilters,
    ) -> RagResult<Vec<ContextEntity>> {
        let mut names: Vec<String> = Vec::new();
        for r in relations {
            for name in [&r.entity1, &r.entity2] {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let mut nodes = self.graph.get_nodes_batch(&names).await?;
        let ordered: Vec<(String, NodeData)> = names
            .into_iter()
            .filter_map(|name| nodes.remove(&name).map(|n| (name, n)))
            .collect();

        let vector_ids: Vec<String> = ordered.iter().map(|(n, _)| entity_vector_id(n)).collect();
        let payload_tags: HashMap<String, Tags> = self
            .entities_vdb
            .get_by_ids(&vector_ids)
            .await?
            .into_iter()
            .zip(ordered.iter())
            .filter_map(|(rec, (name, _))| Some((name.clone(), non_empty(rec?.tags)?)))
            .collect();

        let mut out = self.filter_nodes(ordered, &payload_tags, filters).await?;
        out.truncate(top_k);
        Ok(out)
    }
}

/// Añade entidades no presentes aún, conservando el orden de llegada.
fn merge_entities(pool: &mut Vec<ContextEntity>, incoming: Vec<ContextEntity>) {
    for e in incoming {
        if !pool.iter().any(|p| p.entity == e.entity) {
            pool.push(e);
        }
    }
}

fn merge_relationships(pool: &mut Vec<ContextRelationship>, incoming: Vec<ContextRelationship>) {
    for r in incoming {
        let key = sorted_pair(&r.entity1, &r.entity2);
        if !pool
            .iter()
            .any(|p| sorted_pair(&p.entity1, &p.entity2) == key)
        {
            pool.push(r);
        }
    }
}
