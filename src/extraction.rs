//! Extracción de entidades y relaciones de un chunk mediante el LLM.
//!
//! Formato de salida esperado: registros separados por `##`, campos por
//! `<|>`, terminado en `<|COMPLETE|>`:
//!
//! ```text
//! ("entity"<|>Alice<|>person<|>Alice is an engineer)##
//! ("relationship"<|>Alice<|>Bob<|>Alice works with Bob<|>collaboration<|>0.9)##
//! <|COMPLETE|>
//! ```

use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use crate::error::{RagError, RagResult};
use crate::llm::{complete_with_cache, CachedResponse, CompletionFunc};
use crate::models::{ChatMessage, TextChunk};
use crate::storage::KvStorage;
use crate::utils::clean_str;

pub const TUPLE_DELIMITER: &str = "<|>";
pub const RECORD_DELIMITER: &str = "##";
pub const COMPLETION_DELIMITER: &str = "<|COMPLETE|>";

pub const DEFAULT_ENTITY_TYPES: &[&str] = &[
    "organization",
    "person",
    "geo",
    "event",
    "category",
];

const DEFAULT_ENTITY_TYPE: &str = "UNKNOWN";

const EXTRACTION_PROMPT: &str = r#"---Goal---
Given a text document and a list of entity types, identify all entities of those types from the text and all relationships among the identified entities.
Use {language} as output language.

---Steps---
1. Identify all entities. For each identified entity, extract:
- entity_name: Name of the entity, capitalized as in the text
- entity_type: One of the following types: [{entity_types}]
- entity_description: Comprehensive description of the entity's attributes and activities
Format each entity as ("entity"{tuple}<entity_name>{tuple}<entity_type>{tuple}<entity_description>)

2. From the entities identified in step 1, identify all pairs of (source_entity, target_entity) that are clearly related to each other. For each pair, extract:
- source_entity, target_entity: names as identified in step 1
- relationship_description: why the two entities are related
- relationship_keywords: high-level keywords summarizing the relationship
- relationship_strength: a numeric score for the strength of the relationship
Format each relationship as ("relationship"{tuple}<source_entity>{tuple}<target_entity>{tuple}<relationship_description>{tuple}<relationship_keywords>{tuple}<relationship_strength>)

3. Return output in {language} as a single list of all entities and relationships. Use **{record}** as the list delimiter.

4. When finished, output {completion}

---Real Data---
Entity_types: [{entity_types}]
Text:
{input_text}

Output:
"#;

const CONTINUE_PROMPT: &str = "MANY entities and relationships were missed in the last extraction. \
Add them below using the same format, without repeating the ones already extracted:";

const IF_LOOP_PROMPT: &str = "It appears some entities and relationships may have still been missed. \
Answer only `YES` or `NO` if there are still entities or relationships that need to be added.";

pub const SYSTEM_PROMPT: &str = "You are a precise information extraction assistant.";

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedEntity {
    pub entity_name: String,
    pub entity_type: String,
    pub description: String,
    pub source_id: String,
    pub file_path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedRelationship {
    pub src_id: String,
    pub tgt_id: String,
    pub description: String,
    pub keywords: String,
    pub weight: f64,
    pub source_id: String,
    pub file_path: String,
}

/// Resultado de extraer un chunk. `skipped` cuenta los registros mal formados.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedExtraction {
    pub entities: Vec<ExtractedEntity>,
    pub relationships: Vec<ExtractedRelationship>,
    pub skipped: usize,
}

impl ParsedExtraction {
    fn absorb(&mut self, other: ParsedExtraction) {
        self.entities.extend(other.entities);
        self.relationships.extend(other.relationships);
        self.skipped += other.skipped;
    }
}

enum Record {
    Entity(ExtractedEntity),
    Relationship(ExtractedRelationship),
}

fn parse_record(record: &str, chunk_id: &str, file_path: &str) -> RagResult<Record> {
    let inner = match (record.find('('), record.rfind(')')) {
        (Some(start), Some(end)) if start < end => &record[start + 1..end],
        _ => record,
    };
    let fields: Vec<String> = inner.split(TUPLE_DELIMITER).map(clean_str).collect();
    let kind = fields.first().map(|f| f.to_lowercase()).unwrap_or_default();

    match kind.as_str() {
        "entity" => {
            if fields.len() < 4 {
                return Err(RagError::ExtractionParse(format!(
                    "entity record with {} fields",
                    fields.len()
                )));
            }
            let name = fields[1].clone();
            if name.is_empty() {
                return Err(RagError::ExtractionParse("entity without name".into()));
            }
            let entity_type = if fields[2].is_empty() {
                DEFAULT_ENTITY_TYPE.to_string()
            } else {
                fields[2].to_lowercase()
            };
            Ok(Record::Entity(ExtractedEntity {
                entity_name: name,
                entity_type,
                description: fields[3].clone(),
                source_id: chunk_id.to_string(),
                file_path: file_path.to_string(),
            }))
        }
        "relationship" => {
            if fields.len() < 5 {
                return Err(RagError::ExtractionParse(format!(
                    "relationship record with {} fields",
                    fields.len()
                )));
            }
            let (src, tgt) = (fields[1].clone(), fields[2].clone());
            if src.is_empty() || tgt.is_empty() {
                return Err(RagError::ExtractionParse("relationship without endpoints".into()));
            }
            if src == tgt {
                return Err(RagError::ExtractionParse(format!("self-loop on '{src}'")));
            }
            let weight = fields
                .get(5)
                .and_then(|w| w.parse::<f64>().ok())
                .filter(|w| w.is_finite())
                .unwrap_or(1.0);
            Ok(Record::Relationship(ExtractedRelationship {
                src_id: src,
                tgt_id: tgt,
                description: fields[3].clone(),
                keywords: fields[4].clone(),
                weight,
                source_id: chunk_id.to_string(),
                file_path: file_path.to_string(),
            }))
        }
        other => Err(RagError::ExtractionParse(format!("unknown record kind '{other}'"))),
    }
}

/// Parsea la salida del LLM. Los registros mal formados se descartan y se
/// cuentan en `skipped`; nunca hacen fallar la extracción.
pub fn parse_extraction_output(raw: &str, chunk_id: &str, file_path: &str) -> ParsedExtraction {
    let body = raw.split(COMPLETION_DELIMITER).next().unwrap_or_default();
    let mut out = ParsedExtraction::default();
    for record in body.split(RECORD_DELIMITER) {
        let record = record.trim();
        if record.is_empty() {
            continue;
        }
        match parse_record(record, chunk_id, file_path) {
            Ok(Record::Entity(e)) => out.entities.push(e),
            Ok(Record::Relationship(r)) => out.relationships.push(r),
            Err(e) => {
                debug!("Registro descartado en {chunk_id}: {e}");
                out.skipped += 1;
            }
        }
    }
    out
}

pub fn build_extraction_prompt(content: &str, entity_types: &[String], language: &str) -> String {
    EXTRACTION_PROMPT
        .replace("{entity_types}", &entity_types.join(", "))
        .replace("{language}", language)
        .replace("{tuple}", TUPLE_DELIMITER)
        .replace("{record}", RECORD_DELIMITER)
        .replace("{completion}", COMPLETION_DELIMITER)
        .replace("{input_text}", content)
}

/// Colaboradores y parámetros de la extracción.
pub struct ExtractionContext<'a> {
    pub llm: &'a dyn CompletionFunc,
    pub cache: Option<&'a Arc<dyn KvStorage<CachedResponse>>>,
    pub max_gleaning: usize,
    pub language: &'a str,
    pub entity_types: &'a [String],
}

/// Extrae un chunk, con hasta `max_gleaning` rondas adicionales.
pub async fn extract_chunk(
    ctx: &ExtractionContext<'_>,
    chunk_id: &str,
    chunk: &TextChunk,
) -> RagResult<ParsedExtraction> {
    let prompt = build_extraction_prompt(&chunk.content, ctx.entity_types, ctx.language);
    let first = complete_with_cache(ctx.llm, ctx.cache, "extract", &prompt, Some(SYSTEM_PROMPT), &[]).await?;
    let mut result = parse_extraction_output(&first, chunk_id, &chunk.file_path);

    let mut history = vec![
        ChatMessage {
            role: "user".into(),
            content: prompt,
        },
        ChatMessage {
            role: "assistant".into(),
            content: first,
        },
    ];
    for round in 0..ctx.max_gleaning {
        let glean = complete_with_cache(
            ctx.llm,
            ctx.cache,
            "extract",
            CONTINUE_PROMPT,
            Some(SYSTEM_PROMPT),
            &history,
        )
        .await?;
        let parsed = parse_extraction_output(&glean, chunk_id, &chunk.file_path);
        let added = parsed.entities.len() + parsed.relationships.len();
        result.absorb(parsed);
        history.push(ChatMessage {
            role: "user".into(),
            content: CONTINUE_PROMPT.into(),
        });
        history.push(ChatMessage {
            role: "assistant".into(),
            content: glean,
        });
        if added == 0 || round + 1 == ctx.max_gleaning {
            break;
        }
        let more = complete_with_cache(
            ctx.llm,
            ctx.cache,
            "extract",
            IF_LOOP_PROMPT,
            Some(SYSTEM_PROMPT),
            &history,
        )
        .await?;
        if !more.trim().trim_matches('"').to_lowercase().starts_with("yes") {
            break;
        }
    }

    if result.skipped > 0 {
        warn!(
            "Chunk {chunk_id}: {} registros de extracción mal formados descartados",
            result.skipped
        );
    }
    debug!(
        "Chunk {chunk_id}: {} entidades, {} relaciones",
        result.entities.len(),
        result.relationships.len()
    );
    Ok(result)
}

/// Extrae varios chunks con a lo sumo `concurrency` llamadas en vuelo.
/// El primer error de LLM aborta el lote.
pub async fn extract_chunks(
    ctx: &ExtractionContext<'_>,
    chunks: &[(String, TextChunk)],
    concurrency: usize,
) -> RagResult<Vec<ParsedExtraction>> {
    let pending: Vec<_> = chunks
        .iter()
        .map(|(id, chunk)| extract_chunk(ctx, id, chunk))
        .collect();
    let results: Vec<ParsedExtraction> = stream::iter(pending)
        .buffer_unordered(concurrency.max(1))
        .try_collect()
        .await?;
    let skipped: usize = results.iter().map(|r| r.skipped).sum();
    info!(
        "Extracción completada: {} chunks ({} registros descartados)",
        chunks.len(),
        skipped
    );
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_entities_and_relationships() {
        let raw = concat!(
            "(\"entity\"<|>\"Alice\"<|>\"Person\"<|>\"Alice is an engineer\")##\n",
            "(\"entity\"<|>Bob<|>person<|>Bob manages the team)##\n",
            "(\"relationship\"<|>Alice<|>Bob<|>Alice reports to Bob<|>management<|>0.8)##\n",
            "<|COMPLETE|>"
        );
        let parsed = parse_extraction_output(raw, "chunk-1", "a.txt");
        assert_eq!(parsed.skipped, 0);
        assert_eq!(parsed.entities.len(), 2);
        assert_eq!(parsed.entities[0].entity_name, "Alice");
        assert_eq!(parsed.entities[0].entity_type, "person");
        assert_eq!(parsed.entities[0].source_id, "chunk-1");
        assert_eq!(parsed.relationships.len(), 1);
        let rel = &parsed.relationships[0];
        assert_eq!((rel.src_id.as_str(), rel.tgt_id.as_str()), ("Alice", "Bob"));
        assert!((rel.weight - 0.8).abs() < 1e-9);
        assert_eq!(rel.file_path, "a.txt");
    }

    #[test]
    fn malformed_records_are_skipped_and_counted() {
        let raw = concat!(
            "(\"entity\"<|>Alice<|>person)##",
            "(\"relationship\"<|>Alice<|>Alice<|>self<|>loop<|>1)##",
            "(\"widget\"<|>x<|>y<|>z)##",
            "(\"entity\"<|>Carol<|>person<|>Carol designs chips)##",
            "(\"relationship\"<|>Carol<|>Alice<|>friends<|>friendship<|>not-a-number)",
            "<|COMPLETE|>"
        );
        let parsed = parse_extraction_output(raw, "c", "f");
        assert_eq!(parsed.skipped, 3);
        assert_eq!(parsed.entities.len(), 1);
        assert_eq!(parsed.relationships.len(), 1);
        assert_eq!(parsed.relationships[0].weight, 1.0);
    }

    #[test]
    fn text_after_completion_is_ignored() {
        let raw = "(\"entity\"<|>A<|>x<|>d)##<|COMPLETE|>(\"entity\"<|>B<|>x<|>d)";
        let parsed = parse_extraction_output(raw, "c", "f");
        assert_eq!(parsed.entities.len(), 1);
    }

    #[test]
    fn prompt_embeds_delimiters_and_text() {
        let types: Vec<String> = DEFAULT_ENTITY_TYPES.iter().map(|s| s.to_string()).collect();
        let prompt = build_extraction_prompt("Alice met Bob.", &types, "English");
        assert!(prompt.contains("Alice met Bob."));
        assert!(prompt.contains(TUPLE_DELIMITER));
        assert!(prompt.contains(COMPLETION_DELIMITER));
        assert!(prompt.contains("organization, person"));
        assert!(!prompt.contains("{input_text}"));
    }
}
