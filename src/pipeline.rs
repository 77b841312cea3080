//! Pipeline de ingesta: encolado, procesado por documento y variantes de
//! inserción con chunks o grafo suministrados por el llamante.
//!
//! PENDING → PROCESSING → {PROCESSED, FAILED}. El paso a PROCESSING se hace
//! con el lock del documento tomado; los estados terminales no se reabren.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use crate::engine::RagEngine;
use crate::error::{RagError, RagResult};
use crate::extraction::{extract_chunks, ExtractedEntity, ExtractedRelationship, ParsedExtraction};
use crate::merge::{merge_nodes_and_edges, UNKNOWN_ENTITY_TYPE};
use crate::models::{CustomKg, DocProcessingStatus, DocStatus, ErrorFile, FullDoc, TextChunk};
use crate::shared::DocLockGuard;
use crate::storage::VectorData;
use crate::tags::{tags_to_value, Tags};
use crate::utils::{
    compute_mdhash_id, content_summary, generate_track_id, now_iso, now_ts, UNKNOWN_SOURCE,
};

const SUMMARY_MAX_CHARS: usize = 250;
pub const FILE_EXTRACTION_ERROR: &str = "file_extraction_error";

/// Resultado de una pasada de `process_enqueued`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub processed: Vec<String>,
    pub failed: Vec<String>,
    /// Documentos que otro worker tenía reservados o que ya eran terminales.
    pub skipped: Vec<String>,
    /// El pipeline estaba ocupado; la petición queda anotada para la pasada en curso.
    pub deferred: bool,
}

enum Outcome {
    Processed(String),
    Failed(String),
    Skipped(String),
}

fn chunk_id(doc_id: &str, content: &str) -> String {
    compute_mdhash_id(&format!("{doc_id}{content}"), "chunk-")
}

fn chunk_vector_data(chunk: &TextChunk) -> VectorData {
    let mut payload = Map::new();
    payload.insert("content".into(), json!(chunk.content));
    payload.insert("full_doc_id".into(), json!(chunk.full_doc_id));
    payload.insert("file_path".into(), json!(chunk.file_path));
    payload.insert("chunk_order_index".into(), json!(chunk.chunk_order_index));
    VectorData {
        content: chunk.content.clone(),
        payload,
        tags: (!chunk.tags.is_empty()).then(|| chunk.tags.clone()),
    }
}

impl RagEngine {
    fn doc_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.config.doc_lock_ttl_secs.max(1))
    }

    async fn update_pipeline<F>(&self, f: F) -> RagResult<()>
    where
        F: FnOnce(&mut crate::shared::PipelineStatus),
    {
        let status = self.shared.pipeline_status()?;
        let mut guard = status.lock().await;
        f(&mut guard);
        Ok(())
    }

    /// Registra los documentos como PENDING y devuelve el `track_id`.
    ///
    /// Se valida todo antes de escribir: si algo falla no se persiste nada.
    /// Contenidos idénticos generan documentos distintos.
    pub async fn enqueue(
        &self,
        contents: Vec<String>,
        file_paths: Option<Vec<String>>,
        tags: Option<Tags>,
        track_id: Option<String>,
    ) -> RagResult<String> {
        if contents.is_empty() {
            return Err(RagError::Validation("at least one document is required".into()));
        }
        if let Some(paths) = &file_paths {
            if paths.len() != contents.len() {
                return Err(RagError::Validation(format!(
                    "file_paths length ({}) does not match documents length ({})",
                    paths.len(),
                    contents.len()
                )));
            }
        }
        if let Some(idx) = contents.iter().position(|c| c.trim().is_empty()) {
            return Err(RagError::Validation(format!("document {idx} is empty")));
        }

        let track_id = track_id
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| generate_track_id("insert"));
        let tags = tags.unwrap_or_default();
        let paths = file_paths.unwrap_or_else(|| vec![UNKNOWN_SOURCE.to_string(); contents.len()]);

        // Ids por hash del contenido; las colisiones toman el menor sufijo libre.
        // El lock por hash base se mantiene hasta persistir el estado para que
        // dos encolados concurrentes no elijan el mismo id.
        let base_ids: Vec<String> = contents
            .iter()
            .map(|c| compute_mdhash_id(c, "doc-"))
            .collect();
        let _reservation = self.shared.lock_keys("doc", &base_ids).await?;
        let mut taken: HashSet<String> = HashSet::new();
        let mut ids = Vec::with_capacity(contents.len());
        for (content, base) in contents.iter().zip(&base_ids) {
            let mut id = base.clone();
            let mut n = 1;
            while taken.contains(&id) || self.doc_status.get_by_id(&id).await?.is_some() {
                id = compute_mdhash_id(&format!("{content}#{n}"), "doc-");
                n += 1;
            }
            taken.insert(id.clone());
            ids.push(id);
        }

        let now = now_iso();
        let mut metadata = Map::new();
        metadata.insert("tags".into(), tags_to_value(&tags));
        let mut full_docs = HashMap::with_capacity(contents.len());
        let mut statuses = HashMap::with_capacity(contents.len());
        for ((id, content), path) in ids.into_iter().zip(contents).zip(paths) {
            let path = if path.trim().is_empty() {
                UNKNOWN_SOURCE.to_string()
            } else {
                path
            };
            statuses.insert(
                id.clone(),
                DocProcessingStatus {
                    content_summary: content_summary(&content, SUMMARY_MAX_CHARS),
                    content_length: content.chars().count(),
                    file_path: path.clone(),
                    status: DocStatus::Pending,
                    created_at: now.clone(),
                    updated_at: now.clone(),
                    track_id: track_id.clone(),
                    chunks_count: None,
                    chunks_list: Vec::new(),
                    error_msg: None,
                    metadata: metadata.clone(),
                },
            );
            full_docs.insert(
                id,
                FullDoc {
                    content,
                    file_path: path,
                },
            );
        }
        let count = statuses.len();
        self.full_docs.upsert(full_docs).await?;
        self.doc_status.upsert(statuses).await?;
        self.full_docs.index_done_callback().await?;
        self.doc_status.index_done_callback().await?;
        info!("{count} documentos encolados (track_id={track_id})");
        Ok(track_id)
    }

    /// Registra como FAILED ficheros cuya extracción de texto falló.
    pub async fn enqueue_error(&self, error_files: Vec<ErrorFile>, track_id: &str) -> RagResult<()> {
        if error_files.is_empty() {
            return Ok(());
        }
        let now = now_iso();
        let mut statuses = HashMap::with_capacity(error_files.len());
        for (idx, file) in error_files.into_iter().enumerate() {
            let id = compute_mdhash_id(&format!("{track_id}:{idx}:{}", file.file_path), "error-");
            let mut metadata = Map::new();
            metadata.insert("error_type".into(), json!(FILE_EXTRACTION_ERROR));
            metadata.insert("error_description".into(), json!(file.error_description));
            statuses.insert(
                id,
                DocProcessingStatus {
                    content_summary: file.error_description.clone(),
                    content_length: file.file_size,
                    file_path: file.file_path,
                    status: DocStatus::Failed,
                    created_at: now.clone(),
                    updated_at: now.clone(),
                    track_id: track_id.to_string(),
                    chunks_count: Some(0),
                    chunks_list: Vec::new(),
                    error_msg: Some(file.original_error),
                    metadata,
                },
            );
        }
        warn!("{} ficheros registrados como fallidos (track_id={track_id})", statuses.len());
        self.doc_status.upsert(statuses).await?;
        self.doc_status.index_done_callback().await
    }

    /// Procesa los documentos pendientes. Si el pipeline ya está ocupado,
    /// la petición se anota y la pasada en curso volverá a buscar trabajo.
    pub async fn process_enqueued(&self) -> RagResult<ProcessReport> {
        {
            let status = self.shared.pipeline_status()?;
            let mut st = status.lock().await;
            if st.is_busy {
                st.request_pending = true;
                st.push_message("Pipeline ocupado: petición encolada");
                return Ok(ProcessReport {
                    deferred: true,
                    ..ProcessReport::default()
                });
            }
            st.is_busy = true;
            st.request_pending = false;
            st.job_name = format!("indexado {}", now_iso());
            st.docs = 0;
            st.processed_docs = 0;
            st.progress = 0.0;
        }

        let result = self.process_loop().await;

        self.update_pipeline(|st| {
            st.is_busy = false;
            st.request_pending = false;
            st.push_message(match &result {
                Ok(report) => format!(
                    "Pipeline terminado: {} procesados, {} fallidos",
                    report.processed.len(),
                    report.failed.len()
                ),
                Err(e) => format!("Pipeline abortado: {e}"),
            });
        })
        .await?;
        result
    }

    async fn claim_candidates(&self) -> RagResult<Vec<String>> {
        let mut candidates: BTreeMap<(String, String), ()> = BTreeMap::new();
        for (id, doc) in self.doc_status.get_docs_by_status(DocStatus::Pending).await? {
            candidates.insert((doc.created_at, id), ());
        }
        // PROCESSING sin lock vigente: worker caído.
        for (id, doc) in self.doc_status.get_docs_by_status(DocStatus::Processing).await? {
            if !self.shared.is_doc_locked(&id) {
                warn!("Documento {id} abandonado en PROCESSING; se reintenta.");
                candidates.insert((doc.created_at, id), ());
            }
        }
        Ok(candidates.into_keys().map(|(_, id)| id).collect())
    }

    async fn process_loop(&self) -> RagResult<ProcessReport> {
        let mut report = ProcessReport::default();
        loop {
            let candidates = self.claim_candidates().await?;
            if candidates.is_empty() {
                break;
            }
            let total = candidates.len();
            self.update_pipeline(|st| {
                st.docs += total;
                st.push_message(format!("Procesando {total} documentos"));
            })
            .await?;

            let jobs: Vec<_> = candidates
                .into_iter()
                .map(|id| self.process_document(id))
                .collect();
            let outcomes: Vec<Outcome> = stream::iter(jobs)
                .buffer_unordered(self.config.max_parallel_insert.max(1))
                .collect()
                .await;
            let mut progressed = false;
            for outcome in outcomes {
                match outcome {
                    Outcome::Processed(id) => {
                        progressed = true;
                        report.processed.push(id);
                    }
                    Outcome::Failed(id) => {
                        progressed = true;
                        report.failed.push(id);
                    }
                    Outcome::Skipped(id) => report.skipped.push(id),
                }
            }

            let pending = {
                let status = self.shared.pipeline_status()?;
                let mut st = status.lock().await;
                std::mem::take(&mut st.request_pending)
            };
            if !pending && !progressed {
                break;
            }
            if !pending {
                // Nada nuevo pedido; una pasada más sólo si quedan pendientes.
                if self
                    .doc_status
                    .get_docs_by_status(DocStatus::Pending)
                    .await?
                    .is_empty()
                {
                    break;
                }
            }
        }
        Ok(report)
    }

    async fn process_document(&self, doc_id: String) -> Outcome {
        let Some(guard) = self.shared.try_lock_doc(&doc_id, self.doc_lock_ttl()) else {
            return Outcome::Skipped(doc_id);
        };
        match self.process_locked(&doc_id, &guard).await {
            Ok(Some(())) => Outcome::Processed(doc_id),
            Ok(None) => Outcome::Skipped(doc_id),
            Err(e) => {
                error!("Documento {doc_id} fallido: {e}");
                if let Err(store_err) = self.mark_failed(&doc_id, &e).await {
                    error!("No se pudo registrar el fallo de {doc_id}: {store_err}");
                }
                Outcome::Failed(doc_id)
            }
        }
    }

    /// `Ok(None)` si el documento ya no es reclamable.
    async fn process_locked(&self, doc_id: &str, guard: &DocLockGuard) -> RagResult<Option<()>> {
        let Some(mut status) = self.doc_status.get_by_id(doc_id).await? else {
            return Ok(None);
        };
        if status.status.is_terminal() {
            return Ok(None);
        }
        status.status = DocStatus::Processing;
        status.updated_at = now_iso();
        status.error_msg = None;
        self.doc_status
            .upsert(HashMap::from([(doc_id.to_string(), status.clone())]))
            .await?;

        let chunk_ids = self.run_document(doc_id, &status, guard).await?;
        // Todo lo que puede fallar va antes de escribir el estado terminal.
        self.index_done_callback().await?;

        status.status = DocStatus::Processed;
        status.updated_at = now_iso();
        status.chunks_count = Some(chunk_ids.len());
        status.chunks_list = chunk_ids;
        self.doc_status
            .upsert(HashMap::from([(doc_id.to_string(), status)]))
            .await?;

        if let Err(e) = self.doc_status.index_done_callback().await {
            warn!("No se pudo persistir el estado de {doc_id}: {e}");
        }
        let progress = self
            .update_pipeline(|st| {
                st.processed_docs += 1;
                st.progress = if st.docs == 0 {
                    1.0
                } else {
                    st.processed_docs as f32 / st.docs as f32
                };
                st.push_message(format!("Documento {doc_id} procesado"));
            })
            .await;
        if let Err(e) = progress {
            warn!("Estado del pipeline no actualizado para {doc_id}: {e}");
        }
        Ok(Some(()))
    }

    async fn mark_failed(&self, doc_id: &str, err: &RagError) -> RagResult<()> {
        let Some(mut status) = self.doc_status.get_by_id(doc_id).await? else {
            return Ok(());
        };
        if status.status.is_terminal() {
            warn!("Documento {doc_id} ya es {:?}; no se marca como fallido", status.status);
            return Ok(());
        }
        status.status = DocStatus::Failed;
        status.updated_at = now_iso();
        status.error_msg = Some(err.to_string());
        status
            .metadata
            .insert("error_type".into(), Value::String(err.kind().to_string()));
        self.doc_status
            .upsert(HashMap::from([(doc_id.to_string(), status)]))
            .await?;
        self.doc_status.index_done_callback().await?;
        self.update_pipeline(|st| {
            st.processed_docs += 1;
            st.push_message(format!("Documento {doc_id} fallido: {err}"));
        })
        .await
    }

    /// Trocea, indexa, extrae y fusiona un documento. Devuelve los ids de
    /// sus chunks en orden.
    async fn run_document(
        &self,
        doc_id: &str,
        status: &DocProcessingStatus,
        guard: &DocLockGuard,
    ) -> RagResult<Vec<String>> {
        let doc = self
            .full_docs
            .get_by_id(doc_id)
            .await?
            .ok_or_else(|| RagError::Pipeline(format!("content of {doc_id} is missing")))?;
        let tags = status.tags()?;
        let pieces = self.chunker.chunk(&doc.content)?;
        let created_at = now_ts();

        let mut ordered: Vec<(String, TextChunk)> = Vec::with_capacity(pieces.len());
        let mut seen = HashSet::new();
        for piece in pieces {
            let id = chunk_id(doc_id, &piece.content);
            if !seen.insert(id.clone()) {
                continue;
            }
            ordered.push((
                id,
                TextChunk {
                    content: piece.content,
                    tokens: piece.tokens,
                    chunk_order_index: piece.chunk_order_index,
                    full_doc_id: doc_id.to_string(),
                    file_path: status.file_path.clone(),
                    tags: tags.clone(),
                    created_at,
                },
            ));
        }
        self.store_chunks(&ordered).await?;
        guard.refresh(self.doc_lock_ttl())?;

        let extractions = extract_chunks(
            &self.extraction_context(),
            &ordered,
            self.config.llm_max_async,
        )
        .await?;
        guard.refresh(self.doc_lock_ttl())?;

        merge_nodes_and_edges(&self.merge_targets(), extractions, self.config.llm_max_async)
            .await
            .map_err(|e| match e {
                RagError::Storage(msg) => RagError::Pipeline(format!("merge failed: {msg}")),
                other => other,
            })?;
        Ok(ordered.into_iter().map(|(id, _)| id).collect())
    }

    /// Escribe los chunks en el KV y en el índice vectorial de chunks.
    async fn store_chunks(&self, chunks: &[(String, TextChunk)]) -> RagResult<()> {
        let kv: HashMap<String, TextChunk> = chunks.iter().cloned().collect();
        let vectors: HashMap<String, VectorData> = chunks
            .iter()
            .map(|(id, c)| (id.clone(), chunk_vector_data(c)))
            .collect();
        self.text_chunks.upsert(kv).await?;
        self.chunks_vdb.upsert(vectors).await
    }

    /// Encola y procesa en una sola llamada.
    pub async fn insert(
        &self,
        contents: Vec<String>,
        file_paths: Option<Vec<String>>,
        tags: Option<Tags>,
    ) -> RagResult<String> {
        let track_id = self.enqueue(contents, file_paths, tags, None).await?;
        self.process_enqueued().await?;
        Ok(track_id)
    }

    /// Inserta un documento con chunks ya troceados por el llamante. Estos
    /// chunks no llevan etiquetas. Devuelve el id del documento.
    pub async fn insert_custom_chunks(
        &self,
        full_text: &str,
        text_chunks: Vec<String>,
        doc_id: Option<String>,
    ) -> RagResult<String> {
        if text_chunks.iter().all(|c| c.trim().is_empty()) {
            return Err(RagError::Validation("no chunks to insert".into()));
        }
        let doc_id = doc_id.unwrap_or_else(|| compute_mdhash_id(full_text, "doc-"));
        let created_at = now_ts();
        let mut ordered = Vec::new();
        let mut seen = HashSet::new();
        for (idx, content) in text_chunks.into_iter().enumerate() {
            let content = content.trim().to_string();
            if content.is_empty() {
                continue;
            }
            let id = chunk_id(&doc_id, &content);
            if !seen.insert(id.clone()) {
                continue;
            }
            ordered.push((
                id,
                TextChunk {
                    tokens: self.tokenizer.count_tokens(&content),
                    content,
                    chunk_order_index: idx,
                    full_doc_id: doc_id.clone(),
                    file_path: UNKNOWN_SOURCE.to_string(),
                    tags: Tags::new(),
                    created_at,
                },
            ));
        }

        let keys: HashSet<String> = ordered.iter().map(|(id, _)| id.clone()).collect();
        let missing = self.text_chunks.filter_keys(&keys).await?;
        ordered.retain(|(id, _)| missing.contains(id));
        if ordered.is_empty() {
            warn!("insert_custom_chunks: todos los chunks ya existían ({doc_id})");
            return Ok(doc_id);
        }

        self.full_docs
            .upsert(HashMap::from([(
                doc_id.clone(),
                FullDoc {
                    content: full_text.to_string(),
                    file_path: UNKNOWN_SOURCE.to_string(),
                },
            )]))
            .await?;
        self.store_chunks(&ordered).await?;
        let extractions = extract_chunks(
            &self.extraction_context(),
            &ordered,
            self.config.llm_max_async,
        )
        .await?;
        merge_nodes_and_edges(&self.merge_targets(), extractions, self.config.llm_max_async).await?;
        self.index_done_callback().await?;
        info!("{} chunks a medida insertados en {doc_id}", ordered.len());
        Ok(doc_id)
    }

    /// Inserta un grafo suministrado por el llamante. Los `source_id` de
    /// entidades y relaciones referencian los `source_id` de los chunks.
    pub async fn insert_custom_kg(&self, kg: CustomKg) -> RagResult<()> {
        let created_at = now_ts();
        let mut source_to_chunk: HashMap<String, String> = HashMap::new();
        let mut chunks: Vec<(String, TextChunk)> = Vec::new();
        for (idx, chunk) in kg.chunks.iter().enumerate() {
            let content = chunk.content.trim();
            if content.is_empty() {
                continue;
            }
            let full_doc_id = compute_mdhash_id(&chunk.source_id, "doc-");
            let id = chunk_id(&full_doc_id, content);
            source_to_chunk.insert(chunk.source_id.clone(), id.clone());
            chunks.push((
                id,
                TextChunk {
                    content: content.to_string(),
                    tokens: self.tokenizer.count_tokens(content),
                    chunk_order_index: idx,
                    full_doc_id,
                    file_path: chunk
                        .file_path
                        .clone()
                        .unwrap_or_else(|| "custom_kg".to_string()),
                    tags: chunk.tags.clone(),
                    created_at,
                },
            ));
        }
        self.store_chunks(&chunks).await?;

        let resolve = |source: &str| {
            source_to_chunk
                .get(source)
                .cloned()
                .unwrap_or_else(|| UNKNOWN_SOURCE.to_string())
        };
        let extraction = ParsedExtraction {
            entities: kg
                .entities
                .into_iter()
                .filter(|e| !e.entity_name.trim().is_empty())
                .map(|e| ExtractedEntity {
                    source_id: resolve(&e.source_id),
                    entity_name: e.entity_name.trim().to_string(),
                    entity_type: e
                        .entity_type
                        .unwrap_or_else(|| UNKNOWN_ENTITY_TYPE.to_string()),
                    description: e.description.unwrap_or_default(),
                    file_path: e.file_path.unwrap_or_else(|| "custom_kg".to_string()),
                })
                .collect(),
            relationships: kg
                .relationships
                .into_iter()
                .filter(|r| r.src_id != r.tgt_id)
                .map(|r| ExtractedRelationship {
                    source_id: resolve(&r.source_id),
                    src_id: r.src_id,
                    tgt_id: r.tgt_id,
                    description: r.description,
                    keywords: r.keywords,
                    weight: r.weight,
                    file_path: r.file_path.unwrap_or_else(|| "custom_kg".to_string()),
                })
                .collect(),
            skipped: 0,
        };
        merge_nodes_and_edges(&self.merge_targets(), vec![extraction], self.config.llm_max_async)
            .await?;
        self.index_done_callback().await?;
        info!("Grafo a medida insertado ({} chunks)", chunks.len());
        Ok(())
    }
}
