//! Carga y gestión de configuración de la aplicación (servidor, LLM,
//! backends de almacenamiento y parámetros del motor RAG).

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};

#[derive(Clone, Debug)]
pub enum LlmProvider {
    OpenAI,
    Gemini,
    Ollama,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "gemini" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            other => Err(anyhow!("Proveedor LLM no soportado: {other}")),
        }
    }
}

/// Backend del grafo de conocimiento.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GraphBackend {
    Memory,
    Neo4j,
}

/// Backend de los índices vectoriales.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VectorBackend {
    Nano,
    Neo4j,
}

/// Parámetros del motor RAG.
#[derive(Clone, Debug)]
pub struct RagConfig {
    pub working_dir: PathBuf,
    pub workers: usize,

    pub chunk_token_size: usize,
    pub chunk_overlap_token_size: usize,
    pub split_by_character: Option<String>,

    pub embedding_dim: usize,
    pub embedding_batch_num: usize,
    pub llm_max_async: usize,
    pub max_parallel_insert: usize,
    pub entity_extract_max_gleaning: usize,
    pub summary_language: String,
    pub enable_llm_cache: bool,

    /// Similitud coseno mínima para devolver un resultado vectorial.
    pub cosine_better_than_threshold: f64,
    /// Si el índice vectorial local aplica los filtros de etiquetas de forma nativa.
    pub vector_native_tag_filters: bool,
    pub chunk_meta_fields: Vec<String>,
    pub entity_meta_fields: Vec<String>,
    pub relationship_meta_fields: Vec<String>,

    pub top_k: usize,
    pub chunk_top_k: usize,

    /// Caducidad del lock de un documento en PROCESSING.
    pub doc_lock_ttl_secs: u64,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("./rag_storage"),
            workers: 1,
            chunk_token_size: 1200,
            chunk_overlap_token_size: 100,
            split_by_character: None,
            embedding_dim: 1536,
            embedding_batch_num: 32,
            llm_max_async: 4,
            max_parallel_insert: 2,
            entity_extract_max_gleaning: 1,
            summary_language: "English".to_string(),
            enable_llm_cache: true,
            cosine_better_than_threshold: 0.2,
            vector_native_tag_filters: true,
            chunk_meta_fields: fields(&["content", "full_doc_id", "file_path"]),
            entity_meta_fields: fields(&[
                "entity_name",
                "entity_type",
                "content",
                "source_id",
                "file_path",
            ]),
            relationship_meta_fields: fields(&[
                "src_id",
                "tgt_id",
                "keywords",
                "content",
                "source_id",
                "file_path",
                "weight",
            ]),
            top_k: 40,
            chunk_top_k: 20,
            doc_lock_ttl_secs: 900,
        }
    }
}

fn fields(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

impl RagConfig {
    pub fn with_working_dir(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            ..Self::default()
        }
    }

    /// Sobrescribe los valores por defecto con las variables de entorno presentes.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let working_dir = match env::var("WORKING_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::data_dir()
                .map(|d| d.join("nexus_tagrag"))
                .unwrap_or(defaults.working_dir.clone()),
        };
        Ok(Self {
            working_dir,
            workers: env_or("WORKERS", defaults.workers)?,
            chunk_token_size: env_or("CHUNK_SIZE", defaults.chunk_token_size)?,
            chunk_overlap_token_size: env_or("CHUNK_OVERLAP_SIZE", defaults.chunk_overlap_token_size)?,
            split_by_character: env::var("SPLIT_BY_CHARACTER").ok().filter(|s| !s.is_empty()),
            embedding_dim: env_or("EMBEDDING_DIM", defaults.embedding_dim)?,
            embedding_batch_num: env_or("EMBEDDING_BATCH_NUM", defaults.embedding_batch_num)?,
            llm_max_async: env_or("MAX_ASYNC", defaults.llm_max_async)?,
            max_parallel_insert: env_or("MAX_PARALLEL_INSERT", defaults.max_parallel_insert)?,
            entity_extract_max_gleaning: env_or("MAX_GLEANING", defaults.entity_extract_max_gleaning)?,
            summary_language: env::var("SUMMARY_LANGUAGE").unwrap_or(defaults.summary_language),
            enable_llm_cache: env_or("ENABLE_LLM_CACHE", defaults.enable_llm_cache)?,
            cosine_better_than_threshold: env_or("COSINE_THRESHOLD", defaults.cosine_better_than_threshold)?,
            vector_native_tag_filters: env_or("VECTOR_NATIVE_TAG_FILTERS", defaults.vector_native_tag_filters)?,
            chunk_meta_fields: defaults.chunk_meta_fields,
            entity_meta_fields: defaults.entity_meta_fields,
            relationship_meta_fields: defaults.relationship_meta_fields,
            top_k: env_or("TOP_K", defaults.top_k)?,
            chunk_top_k: env_or("CHUNK_TOP_K", defaults.chunk_top_k)?,
            doc_lock_ttl_secs: env_or("DOC_LOCK_TTL_SECS", defaults.doc_lock_ttl_secs)?,
        })
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("Valor inválido para {key}: {e}")),
        Err(_) => Ok(default),
    }
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,

    pub graph_backend: GraphBackend,
    pub vector_backend: VectorBackend,
    pub neo4j_uri: Option<String>,
    pub neo4j_user: Option<String>,
    pub neo4j_password: Option<String>,

    pub llm_provider: LlmProvider,
    pub llm_embedding_model: String,
    pub llm_chat_model: String,

    /// Directorio que escanea `POST /documents/scan`.
    pub input_dir: PathBuf,

    pub rag: RagConfig,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:3322".to_string());

        let graph_backend = match env::var("GRAPH_STORAGE")
            .unwrap_or_else(|_| "memory".to_string())
            .to_lowercase()
            .as_str()
        {
            "memory" | "networkx" => GraphBackend::Memory,
            "neo4j" => GraphBackend::Neo4j,
            other => return Err(anyhow!("Backend de grafo no soportado: {other}")),
        };
        let vector_backend = match env::var("VECTOR_STORAGE")
            .unwrap_or_else(|_| "nano".to_string())
            .to_lowercase()
            .as_str()
        {
            "nano" | "memory" => VectorBackend::Nano,
            "neo4j" => VectorBackend::Neo4j,
            other => return Err(anyhow!("Backend vectorial no soportado: {other}")),
        };

        let neo4j_uri = env::var("NEO4J_URI").ok();
        let neo4j_user = env::var("NEO4J_USER").ok();
        let neo4j_password = env::var("NEO4J_PASSWORD").ok();
        let needs_neo4j =
            graph_backend == GraphBackend::Neo4j || vector_backend == VectorBackend::Neo4j;
        if needs_neo4j && (neo4j_uri.is_none() || neo4j_user.is_none() || neo4j_password.is_none()) {
            return Err(anyhow!(
                "Faltan NEO4J_URI / NEO4J_USER / NEO4J_PASSWORD en el entorno"
            ));
        }

        let llm_provider_str =
            env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let llm_provider = LlmProvider::from_str(&llm_provider_str)?;

        let llm_embedding_model = env::var("LLM_EMBEDDING_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());
        let llm_chat_model =
            env::var("LLM_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let rag = RagConfig::from_env().context("Configuración del motor RAG")?;
        let input_dir = env::var("INPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| rag.working_dir.join("inputs"));

        Ok(Self {
            server_addr,
            graph_backend,
            vector_backend,
            neo4j_uri,
            neo4j_user,
            neo4j_password,
            llm_provider,
            llm_embedding_model,
            llm_chat_model,
            input_dir,
            rag,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parsing() {
        assert!(matches!(LlmProvider::from_str("OpenAI").unwrap(), LlmProvider::OpenAI));
        assert!(LlmProvider::from_str("nope").is_err());
    }

    #[test]
    fn defaults_are_consistent() {
        let cfg = RagConfig::with_working_dir("/tmp/x");
        assert!(cfg.chunk_overlap_token_size < cfg.chunk_token_size);
        assert!(cfg.chunk_meta_fields.iter().any(|f| f == "full_doc_id"));
        assert_eq!(cfg.working_dir, PathBuf::from("/tmp/x"));
    }
}
