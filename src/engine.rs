//! `RagEngine`: agrupa stores, colaboradores LLM y la capa compartida.
//! La ingesta vive en `pipeline`, las consultas en `query`.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::try_join_all;
use tracing::info;

use crate::chunking::{Chunker, TokenSizeChunker, Tokenizer, WhitespaceTokenizer};
use crate::config::RagConfig;
use crate::error::RagResult;
use crate::extraction::{ExtractionContext, DEFAULT_ENTITY_TYPES};
use crate::llm::{CachedResponse, CompletionFunc, EmbeddingFunc};
use crate::merge::MergeTargets;
use crate::models::{DocProcessingStatus, DocStatus, FullDoc, KnowledgeGraph, TextChunk};
use crate::shared::{PipelineStatus, SharedStorage};
use crate::storage::{
    DocStatusStorage, GraphStorage, JsonDocStatusStorage, JsonKvStorage, KvStorage,
    MemoryGraphStorage, NanoVectorStorage, VectorStorage, VectorStoreConfig, NS_CHUNKS_VDB,
    NS_DOC_STATUS, NS_ENTITIES_VDB, NS_FULL_DOCS, NS_GRAPH, NS_LLM_CACHE, NS_RELATIONSHIPS_VDB,
    NS_TEXT_CHUNKS,
};

/// Configuración del store vectorial de `namespace` a partir de la del motor.
pub fn vector_store_config(config: &RagConfig, namespace: &str) -> VectorStoreConfig {
    let meta_fields = match namespace {
        NS_ENTITIES_VDB => &config.entity_meta_fields,
        NS_RELATIONSHIPS_VDB => &config.relationship_meta_fields,
        _ => &config.chunk_meta_fields,
    };
    VectorStoreConfig {
        meta_fields: meta_fields.clone(),
        cosine_better_than_threshold: config.cosine_better_than_threshold,
        embedding_batch_num: config.embedding_batch_num,
        native_tag_filters: config.vector_native_tag_filters,
    }
}

pub struct RagEngine {
    pub(crate) config: RagConfig,
    pub(crate) shared: SharedStorage,
    pub(crate) llm: Arc<dyn CompletionFunc>,
    pub(crate) chunker: Arc<dyn Chunker>,
    pub(crate) tokenizer: Arc<dyn Tokenizer>,
    pub(crate) entity_types: Vec<String>,

    pub(crate) full_docs: Arc<dyn KvStorage<FullDoc>>,
    pub(crate) text_chunks: Arc<dyn KvStorage<TextChunk>>,
    pub(crate) llm_cache: Arc<dyn KvStorage<CachedResponse>>,
    pub(crate) doc_status: Arc<dyn DocStatusStorage>,
    pub(crate) chunks_vdb: Arc<dyn VectorStorage>,
    pub(crate) entities_vdb: Arc<dyn VectorStorage>,
    pub(crate) relationships_vdb: Arc<dyn VectorStorage>,
    pub(crate) graph: Arc<dyn GraphStorage>,
}

/// Constructor del motor. Por defecto usa los backends locales (JSON,
/// índice vectorial en memoria y grafo en memoria) bajo `working_dir`.
pub struct RagEngineBuilder {
    config: RagConfig,
    llm: Arc<dyn CompletionFunc>,
    embedding: Arc<dyn EmbeddingFunc>,
    shared: Option<SharedStorage>,
    chunker: Option<Arc<dyn Chunker>>,
    tokenizer: Option<Arc<dyn Tokenizer>>,
    graph: Option<Arc<dyn GraphStorage>>,
    vectors: Option<[Arc<dyn VectorStorage>; 3]>,
}

impl RagEngineBuilder {
    pub fn shared(mut self, shared: SharedStorage) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn chunker(mut self, chunker: Arc<dyn Chunker>) -> Self {
        self.chunker = Some(chunker);
        self
    }

    pub fn tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    pub fn graph(mut self, graph: Arc<dyn GraphStorage>) -> Self {
        self.graph = Some(graph);
        self
    }

    /// Stores vectoriales de chunks, entidades y relaciones.
    pub fn vector_storages(
        mut self,
        chunks: Arc<dyn VectorStorage>,
        entities: Arc<dyn VectorStorage>,
        relationships: Arc<dyn VectorStorage>,
    ) -> Self {
        self.vectors = Some([chunks, entities, relationships]);
        self
    }

    pub async fn build(self) -> RagResult<RagEngine> {
        let config = self.config;
        let dir = config.working_dir.clone();
        tokio::fs::create_dir_all(&dir).await?;
        let shared = self
            .shared
            .unwrap_or_else(|| SharedStorage::initialize(config.workers));

        let full_docs: Arc<dyn KvStorage<FullDoc>> =
            Arc::new(JsonKvStorage::open(&shared, &dir, NS_FULL_DOCS).await?);
        let text_chunks: Arc<dyn KvStorage<TextChunk>> =
            Arc::new(JsonKvStorage::open(&shared, &dir, NS_TEXT_CHUNKS).await?);
        let llm_cache: Arc<dyn KvStorage<CachedResponse>> =
            Arc::new(JsonKvStorage::open(&shared, &dir, NS_LLM_CACHE).await?);
        let doc_status: Arc<dyn DocStatusStorage> =
            Arc::new(JsonDocStatusStorage::open(&shared, &dir, NS_DOC_STATUS).await?);

        let [chunks_vdb, entities_vdb, relationships_vdb] = match self.vectors {
            Some(vectors) => vectors,
            None => {
                let open = |ns: &'static str| {
                    NanoVectorStorage::open(
                        &shared,
                        &dir,
                        ns,
                        self.embedding.clone(),
                        vector_store_config(&config, ns),
                    )
                };
                let (chunks, entities, relationships) = tokio::try_join!(
                    open(NS_CHUNKS_VDB),
                    open(NS_ENTITIES_VDB),
                    open(NS_RELATIONSHIPS_VDB),
                )?;
                [
                    Arc::new(chunks) as Arc<dyn VectorStorage>,
                    Arc::new(entities) as Arc<dyn VectorStorage>,
                    Arc::new(relationships) as Arc<dyn VectorStorage>,
                ]
            }
        };

        let graph: Arc<dyn GraphStorage> = match self.graph {
            Some(graph) => graph,
            None => Arc::new(MemoryGraphStorage::open(&shared, &dir, NS_GRAPH).await?),
        };

        let chunker = self.chunker.unwrap_or_else(|| {
            Arc::new(TokenSizeChunker {
                max_token_size: config.chunk_token_size,
                overlap_token_size: config.chunk_overlap_token_size,
                split_by_character: config.split_by_character.clone(),
            }) as Arc<dyn Chunker>
        });
        let tokenizer = self
            .tokenizer
            .unwrap_or_else(|| Arc::new(WhitespaceTokenizer) as Arc<dyn Tokenizer>);

        info!("Motor RAG listo en {}", dir.display());
        Ok(RagEngine {
            config,
            shared,
            llm: self.llm,
            chunker,
            tokenizer,
            entity_types: DEFAULT_ENTITY_TYPES.iter().map(|s| s.to_string()).collect(),
            full_docs,
            text_chunks,
            llm_cache,
            doc_status,
            chunks_vdb,
            entities_vdb,
            relationships_vdb,
            graph,
        })
    }
}

impl RagEngine {
    pub fn builder(
        config: RagConfig,
        llm: Arc<dyn CompletionFunc>,
        embedding: Arc<dyn EmbeddingFunc>,
    ) -> RagEngineBuilder {
        RagEngineBuilder {
            config,
            llm,
            embedding,
            shared: None,
            chunker: None,
            tokenizer: None,
            graph: None,
            vectors: None,
        }
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    pub fn shared(&self) -> &SharedStorage {
        &self.shared
    }

    pub fn full_docs(&self) -> &Arc<dyn KvStorage<FullDoc>> {
        &self.full_docs
    }

    pub fn text_chunks(&self) -> &Arc<dyn KvStorage<TextChunk>> {
        &self.text_chunks
    }

    pub fn doc_status(&self) -> &Arc<dyn DocStatusStorage> {
        &self.doc_status
    }

    pub fn chunks_vdb(&self) -> &Arc<dyn VectorStorage> {
        &self.chunks_vdb
    }

    pub fn entities_vdb(&self) -> &Arc<dyn VectorStorage> {
        &self.entities_vdb
    }

    pub fn relationships_vdb(&self) -> &Arc<dyn VectorStorage> {
        &self.relationships_vdb
    }

    pub fn graph(&self) -> &Arc<dyn GraphStorage> {
        &self.graph
    }

    pub(crate) fn llm_cache(&self) -> Option<&Arc<dyn KvStorage<CachedResponse>>> {
        self.config.enable_llm_cache.then_some(&self.llm_cache)
    }

    pub(crate) fn merge_targets(&self) -> MergeTargets<'_> {
        MergeTargets {
            graph: self.graph.as_ref(),
            entities_vdb: self.entities_vdb.as_ref(),
            relationships_vdb: self.relationships_vdb.as_ref(),
            text_chunks: self.text_chunks.as_ref(),
            shared: &self.shared,
        }
    }

    pub(crate) fn extraction_context(&self) -> ExtractionContext<'_> {
        ExtractionContext {
            llm: self.llm.as_ref(),
            cache: self.llm_cache(),
            max_gleaning: self.config.entity_extract_max_gleaning,
            language: &self.config.summary_language,
            entity_types: &self.entity_types,
        }
    }

    /// Vuelca todos los stores.
    pub async fn index_done_callback(&self) -> RagResult<()> {
        tokio::try_join!(
            self.full_docs.index_done_callback(),
            self.text_chunks.index_done_callback(),
            self.llm_cache.index_done_callback(),
            self.doc_status.index_done_callback(),
            self.graph.index_done_callback(),
        )?;
        try_join_all([
            self.chunks_vdb.index_done_callback(),
            self.entities_vdb.index_done_callback(),
            self.relationships_vdb.index_done_callback(),
        ])
        .await?;
        Ok(())
    }

    /// Persiste y cierra la capa compartida. El motor no es usable después.
    pub async fn finalize(&self) -> RagResult<()> {
        self.index_done_callback().await?;
        self.shared.finalize();
        Ok(())
    }

    pub async fn get_knowledge_graph(
        &self,
        label: &str,
        max_depth: usize,
        max_nodes: usize,
    ) -> RagResult<KnowledgeGraph> {
        self.graph.get_knowledge_graph(label, max_depth, max_nodes).await
    }

    pub async fn get_all_labels(&self) -> RagResult<Vec<String>> {
        self.graph.get_all_labels().await
    }

    pub async fn get_docs_by_status(
        &self,
        status: DocStatus,
    ) -> RagResult<HashMap<String, DocProcessingStatus>> {
        self.doc_status.get_docs_by_status(status).await
    }

    pub async fn get_docs_by_track_id(
        &self,
        track_id: &str,
    ) -> RagResult<HashMap<String, DocProcessingStatus>> {
        self.doc_status.get_docs_by_track_id(track_id).await
    }

    pub async fn get_status_counts(&self) -> RagResult<HashMap<DocStatus, usize>> {
        self.doc_status.get_status_counts().await
    }

    /// Copia del estado actual del pipeline.
    pub async fn pipeline_status(&self) -> RagResult<PipelineStatus> {
        Ok(self.shared.pipeline_status()?.lock().await.clone())
    }
}
