//! Merge incremental de entidades y relaciones extraídas en el grafo y en
//! los índices vectoriales de entidades y relaciones.
//!
//! El merge es conmutativo e idempotente: descripciones, `source_id`,
//! `file_path` y palabras clave son conjuntos; el peso de una arista sólo
//! crece con chunks que aún no estaban en su `source_id`; las etiquetas se
//! funden con [`merge_tags`].

use std::collections::{BTreeMap, BTreeSet, HashMap};

use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::error::RagResult;
use crate::extraction::{ExtractedEntity, ExtractedRelationship, ParsedExtraction};
use crate::models::{EdgeData, NodeData, TextChunk};
use crate::shared::SharedStorage;
use crate::storage::{GraphStorage, KvStorage, VectorData, VectorStorage};
use crate::tags::{decode_tags_json, encode_tags_json, merge_tags, Tags};
use crate::utils::{entity_vector_id, join_field, now_ts, relation_vector_id, sorted_pair, split_field};

pub const UNKNOWN_ENTITY_TYPE: &str = "UNKNOWN";
const GRAPH_LOCK_NAMESPACE: &str = "graph";

/// Stores que toca el merge.
pub struct MergeTargets<'a> {
    pub graph: &'a dyn GraphStorage,
    pub entities_vdb: &'a dyn VectorStorage,
    pub relationships_vdb: &'a dyn VectorStorage,
    pub text_chunks: &'a dyn KvStorage<TextChunk>,
    pub shared: &'a SharedStorage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub entities: usize,
    pub relationships: usize,
}

fn tags_of(value: Option<&Value>, what: &str) -> Tags {
    match value.map(decode_tags_json).transpose() {
        Ok(tags) => tags.flatten().unwrap_or_default(),
        Err(e) => {
            warn!("tags_json ilegible en {what}: {e}");
            Tags::new()
        }
    }
}

fn tags_property(tags: &Tags) -> Option<Value> {
    (!tags.is_empty()).then(|| Value::String(encode_tags_json(tags)))
}

/// Funde sobre `acc` las etiquetas de los chunks, en orden de id.
fn fold_chunk_tags<'a>(
    acc: &mut Tags,
    chunk_ids: impl IntoIterator<Item = &'a String>,
    chunk_tags: &HashMap<String, Tags>,
) {
    for id in chunk_ids {
        if let Some(tags) = chunk_tags.get(id) {
            merge_tags(acc, tags);
        }
    }
}

/// Agrupa por nombre las entidades y por par ordenado las relaciones.
fn group_extractions(
    extractions: Vec<ParsedExtraction>,
) -> (
    BTreeMap<String, Vec<ExtractedEntity>>,
    BTreeMap<(String, String), Vec<ExtractedRelationship>>,
) {
    let mut entities: BTreeMap<String, Vec<ExtractedEntity>> = BTreeMap::new();
    let mut relations: BTreeMap<(String, String), Vec<ExtractedRelationship>> = BTreeMap::new();
    for extraction in extractions {
        for e in extraction.entities {
            entities.entry(e.entity_name.clone()).or_default().push(e);
        }
        for r in extraction.relationships {
            relations
                .entry(sorted_pair(&r.src_id, &r.tgt_id))
                .or_default()
                .push(r);
        }
    }
    (entities, relations)
}

async fn load_chunk_tags(
    text_chunks: &dyn KvStorage<TextChunk>,
    entities: &BTreeMap<String, Vec<ExtractedEntity>>,
    relations: &BTreeMap<(String, String), Vec<ExtractedRelationship>>,
) -> RagResult<HashMap<String, Tags>> {
    let ids: BTreeSet<String> = entities
        .values()
        .flatten()
        .map(|e| e.source_id.clone())
        .chain(relations.values().flatten().map(|r| r.source_id.clone()))
        .collect();
    let ids: Vec<String> = ids.into_iter().collect();
    let chunks = text_chunks.get_by_ids(&ids).await?;
    Ok(ids
        .into_iter()
        .zip(chunks)
        .filter_map(|(id, chunk)| chunk.map(|c| (id, c.tags)))
        .collect())
}

fn pick_entity_type(existing: Option<&NodeData>, group: &[ExtractedEntity]) -> String {
    if let Some(node) = existing {
        if node.entity_type != UNKNOWN_ENTITY_TYPE && !node.entity_type.is_empty() {
            return node.entity_type.clone();
        }
    }
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for e in group {
        *counts.entry(e.entity_type.as_str()).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(t, _)| t.to_string())
        .unwrap_or_else(|| UNKNOWN_ENTITY_TYPE.to_string())
}

async fn merge_entity(
    targets: &MergeTargets<'_>,
    name: &str,
    group: &[ExtractedEntity],
    chunk_tags: &HashMap<String, Tags>,
) -> RagResult<()> {
    let _guard = targets.shared.lock_keys(GRAPH_LOCK_NAMESPACE, [name]).await?;
    let existing = targets.graph.get_node(name).await?;

    let description = join_field(
        existing
            .iter()
            .flat_map(|n| split_field(&n.description))
            .chain(group.iter().map(|e| e.description.as_str())),
    );
    let source_id = join_field(
        existing
            .iter()
            .flat_map(|n| split_field(&n.source_id))
            .chain(group.iter().map(|e| e.source_id.as_str())),
    );
    let file_path = join_field(
        existing
            .iter()
            .flat_map(|n| split_field(&n.file_path))
            .chain(group.iter().map(|e| e.file_path.as_str())),
    );
    let mut tags = tags_of(
        existing.as_ref().and_then(|n| n.tags_json.as_ref()),
        &format!("entity {name}"),
    );
    let contributing: BTreeSet<&String> = group.iter().map(|e| &e.source_id).collect();
    fold_chunk_tags(&mut tags, contributing, chunk_tags);

    let node = NodeData {
        entity_id: name.to_string(),
        entity_type: pick_entity_type(existing.as_ref(), group),
        description,
        source_id,
        file_path,
        created_at: existing.as_ref().map_or_else(now_ts, |n| n.created_at),
        tags_json: tags_property(&tags),
    };
    targets.graph.upsert_node(name, node.clone()).await?;

    let content = format!("{name}\n{}", node.description);
    let payload: Map<String, Value> = [
        ("entity_name", json!(name)),
        ("entity_type", json!(node.entity_type)),
        ("content", json!(content)),
        ("source_id", json!(node.source_id)),
        ("file_path", json!(node.file_path)),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    targets
        .entities_vdb
        .upsert(HashMap::from([(
            entity_vector_id(name),
            VectorData {
                content,
                payload,
                tags: (!tags.is_empty()).then_some(tags),
            },
        )]))
        .await?;
    debug!("Entidad fusionada: {name}");
    Ok(())
}

async fn ensure_endpoint(
    graph: &dyn GraphStorage,
    name: &str,
    edge: &EdgeData,
) -> RagResult<()> {
    if graph.has_node(name).await? {
        return Ok(());
    }
    graph
        .upsert_node(
            name,
            NodeData {
                entity_id: name.to_string(),
                entity_type: UNKNOWN_ENTITY_TYPE.to_string(),
                description: edge.description.clone(),
                source_id: edge.source_id.clone(),
                file_path: edge.file_path.clone(),
                created_at: edge.created_at,
                tags_json: edge.tags_json.clone(),
            },
        )
        .await
}

async fn merge_relationship(
    targets: &MergeTargets<'_>,
    pair: &(String, String),
    group: &[ExtractedRelationship],
    chunk_tags: &HashMap<String, Tags>,
) -> RagResult<()> {
    let (a, b) = pair;
    let edge_key = format!("edge:{a}|{b}");
    let _guard = targets
        .shared
        .lock_keys(GRAPH_LOCK_NAMESPACE, [a.as_str(), b.as_str(), edge_key.as_str()])
        .await?;
    let existing = targets.graph.get_edge(a, b).await?;

    let known: BTreeSet<&str> = existing
        .iter()
        .flat_map(|e| split_field(&e.source_id))
        .collect();
    // Peso por chunk nuevo: el mayor que ese chunk aporta.
    let mut fresh: BTreeMap<&str, f64> = BTreeMap::new();
    for r in group.iter().filter(|r| !known.contains(r.source_id.as_str())) {
        let w = fresh.entry(r.source_id.as_str()).or_insert(r.weight);
        *w = w.max(r.weight);
    }
    let weight = existing.as_ref().map_or(0.0, |e| e.weight) + fresh.values().sum::<f64>();

    let description = join_field(
        existing
            .iter()
            .flat_map(|e| split_field(&e.description))
            .chain(group.iter().map(|r| r.description.as_str())),
    );
    let keywords = join_field(
        existing
            .iter()
            .flat_map(|e| split_field(&e.keywords))
            .chain(group.iter().map(|r| r.keywords.as_str())),
    );
    let source_id = join_field(known.iter().copied().chain(group.iter().map(|r| r.source_id.as_str())));
    let file_path = join_field(
        existing
            .iter()
            .flat_map(|e| split_field(&e.file_path))
            .chain(group.iter().map(|r| r.file_path.as_str())),
    );
    let mut tags = tags_of(
        existing.as_ref().and_then(|e| e.tags_json.as_ref()),
        &format!("relation {a}-{b}"),
    );
    let contributing: BTreeSet<&String> = group.iter().map(|r| &r.source_id).collect();
    fold_chunk_tags(&mut tags, contributing, chunk_tags);

    let edge = EdgeData {
        description,
        keywords,
        weight,
        source_id,
        file_path,
        created_at: existing.as_ref().map_or_else(now_ts, |e| e.created_at),
        tags_json: tags_property(&tags),
    };
    ensure_endpoint(targets.graph, a, &edge).await?;
    ensure_endpoint(targets.graph, b, &edge).await?;
    targets.graph.upsert_edge(a, b, edge.clone()).await?;

    let content = format!("{}\t{a}\n{b}\n{}", edge.keywords, edge.description);
    let payload: Map<String, Value> = [
        ("src_id", json!(a)),
        ("tgt_id", json!(b)),
        ("keywords", json!(edge.keywords)),
        ("content", json!(content)),
        ("source_id", json!(edge.source_id)),
        ("file_path", json!(edge.file_path)),
        ("weight", json!(edge.weight)),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    targets
        .relationships_vdb
        .upsert(HashMap::from([(
            relation_vector_id(a, b),
            VectorData {
                content,
                payload,
                tags: (!tags.is_empty()).then_some(tags),
            },
        )]))
        .await?;
    debug!("Relación fusionada: {a} - {b}");
    Ok(())
}

/// Fusiona las extracciones de un lote de chunks. Las etiquetas de cada
/// chunk se leen de `text_chunks`, así que los chunks deben estar escritos
/// antes de llamar.
pub async fn merge_nodes_and_edges(
    targets: &MergeTargets<'_>,
    extractions: Vec<ParsedExtraction>,
    concurrency: usize,
) -> RagResult<MergeStats> {
    let (entities, relations) = group_extractions(extractions);
    let chunk_tags = load_chunk_tags(targets.text_chunks, &entities, &relations).await?;
    let concurrency = concurrency.max(1);

    let entity_merges: Vec<_> = entities
        .iter()
        .map(|(name, group)| merge_entity(targets, name, group, &chunk_tags))
        .collect();
    stream::iter(entity_merges)
        .buffer_unordered(concurrency)
        .try_collect::<Vec<()>>()
        .await?;
    let relation_merges: Vec<_> = relations
        .iter()
        .map(|(pair, group)| merge_relationship(targets, pair, group, &chunk_tags))
        .collect();
    stream::iter(relation_merges)
        .buffer_unordered(concurrency)
        .try_collect::<Vec<()>>()
        .await?;

    let stats = MergeStats {
        entities: entities.len(),
        relationships: relations.len(),
    };
    info!(
        "Merge completado: {} entidades, {} relaciones",
        stats.entities, stats.relationships
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(name: &str, kind: &str) -> ExtractedEntity {
        ExtractedEntity {
            entity_name: name.into(),
            entity_type: kind.into(),
            description: String::new(),
            source_id: "c".into(),
            file_path: "f".into(),
        }
    }

    #[test]
    fn entity_type_prefers_existing_then_majority() {
        let group = vec![entity("A", "person"), entity("A", "org"), entity("A", "person")];
        assert_eq!(pick_entity_type(None, &group), "person");

        let node = NodeData {
            entity_id: "A".into(),
            entity_type: "geo".into(),
            description: String::new(),
            source_id: String::new(),
            file_path: String::new(),
            created_at: 0,
            tags_json: None,
        };
        assert_eq!(pick_entity_type(Some(&node), &group), "geo");
    }

    #[test]
    fn empty_tags_are_not_stored() {
        assert_eq!(tags_property(&Tags::new()), None);
        assert!(tags_of(Some(&Value::String("not json".into())), "x").is_empty());
    }
}
