//! Modelos de dominio: documentos y su estado, chunks, nodos/aristas del
//! grafo y parámetros de consulta.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RagError;
use crate::tags::{TagEquals, TagFilters, TagIn, Tags};

/// Estados del pipeline. `Processed` y `Failed` son terminales.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl DocStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DocStatus::Processed | DocStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DocStatus::Pending => "pending",
            DocStatus::Processing => "processing",
            DocStatus::Processed => "processed",
            DocStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DocStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocStatus {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            other => Err(RagError::Validation(format!("unknown document status: {other}"))),
        }
    }
}

/// Registro de estado de un documento (namespace `doc_status`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocProcessingStatus {
    pub content_summary: String,
    pub content_length: usize,
    pub file_path: String,
    pub status: DocStatus,
    pub created_at: String,
    pub updated_at: String,
    pub track_id: String,
    #[serde(default)]
    pub chunks_count: Option<usize>,
    #[serde(default)]
    pub chunks_list: Vec<String>,
    #[serde(default)]
    pub error_msg: Option<String>,
    /// Incluye `tags` y, en documentos fallidos, `error_type`.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl DocProcessingStatus {
    /// Etiquetas del documento guardadas en `metadata.tags`.
    pub fn tags(&self) -> crate::error::RagResult<Tags> {
        match self.metadata.get("tags") {
            Some(value) => crate::tags::tags_from_value(value),
            None => Ok(Tags::new()),
        }
    }
}

/// Contenido íntegro de un documento (namespace `full_docs`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullDoc {
    pub content: String,
    pub file_path: String,
}

/// Un trozo de documento (namespace `text_chunks`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextChunk {
    pub content: String,
    pub tokens: usize,
    pub chunk_order_index: usize,
    pub full_doc_id: String,
    pub file_path: String,
    #[serde(default)]
    pub tags: Tags,
    pub created_at: i64,
}

/// Nodo (:Entity) del grafo de conocimiento.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    pub entity_id: String,
    pub entity_type: String,
    pub description: String,
    pub source_id: String,
    pub file_path: String,
    pub created_at: i64,
    /// Cadena JSON o mapa nativo, según el backend.
    #[serde(default)]
    pub tags_json: Option<Value>,
}

/// Arista no dirigida entre dos entidades.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeData {
    pub description: String,
    pub keywords: String,
    pub weight: f64,
    pub source_id: String,
    pub file_path: String,
    pub created_at: i64,
    #[serde(default)]
    pub tags_json: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KgNode {
    pub id: String,
    pub labels: Vec<String>,
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KgEdge {
    pub id: String,
    #[serde(rename = "type")]
    pub edge_type: Option<String>,
    pub source: String,
    pub target: String,
    pub properties: Map<String, Value>,
}

/// Subgrafo devuelto para visualización.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeGraph {
    pub nodes: Vec<KgNode>,
    pub edges: Vec<KgEdge>,
    pub is_truncated: bool,
}

impl NodeData {
    pub fn to_properties(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

impl EdgeData {
    pub fn to_properties(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// Fichero que no se pudo extraer y se registra directamente como FAILED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFile {
    pub file_path: String,
    pub error_description: String,
    pub original_error: String,
    pub file_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

// --- Consultas ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    Naive,
    Local,
    Global,
    Hybrid,
    #[default]
    Mix,
}

impl QueryMode {
    pub fn uses_entities(self) -> bool {
        matches!(self, QueryMode::Local | QueryMode::Hybrid | QueryMode::Mix)
    }

    pub fn uses_relationships(self) -> bool {
        matches!(self, QueryMode::Global | QueryMode::Hybrid | QueryMode::Mix)
    }
}

impl FromStr for QueryMode {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "naive" => Ok(Self::Naive),
            "local" => Ok(Self::Local),
            "global" => Ok(Self::Global),
            "hybrid" => Ok(Self::Hybrid),
            "mix" => Ok(Self::Mix),
            other => Err(RagError::Validation(format!("unknown query mode: {other}"))),
        }
    }
}

/// Parámetros de una consulta RAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryParam {
    pub mode: QueryMode,
    /// Entidades (local) o relaciones (global) a recuperar.
    pub top_k: usize,
    /// Chunks a recuperar de la búsqueda vectorial y a conservar al final.
    pub chunk_top_k: usize,
    pub max_entity_tokens: usize,
    pub max_relation_tokens: usize,
    pub max_total_tokens: usize,
    pub only_need_context: bool,
    pub response_type: String,
    /// Palabras clave de alto nivel (global); si están vacías se extraen con el LLM.
    pub hl_keywords: Vec<String>,
    /// Palabras clave de bajo nivel (local).
    pub ll_keywords: Vec<String>,
    pub conversation_history: Vec<ChatMessage>,
    pub tag_equals: TagEquals,
    pub tag_in: TagIn,
}

impl Default for QueryParam {
    fn default() -> Self {
        Self {
            mode: QueryMode::default(),
            top_k: 40,
            chunk_top_k: 20,
            max_entity_tokens: 6000,
            max_relation_tokens: 8000,
            max_total_tokens: 30000,
            only_need_context: false,
            response_type: "Multiple Paragraphs".to_string(),
            hl_keywords: Vec::new(),
            ll_keywords: Vec::new(),
            conversation_history: Vec::new(),
            tag_equals: TagEquals::new(),
            tag_in: TagIn::new(),
        }
    }
}

impl QueryParam {
    pub fn with_mode(mode: QueryMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn tag_filters(&self) -> TagFilters {
        TagFilters::new(self.tag_equals.clone(), self.tag_in.clone())
    }
}

// --- Grafo a medida ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomChunk {
    pub content: String,
    pub source_id: String,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub tags: Tags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomEntity {
    pub entity_name: String,
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub source_id: String,
    #[serde(default)]
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomRelationship {
    pub src_id: String,
    pub tgt_id: String,
    pub description: String,
    pub keywords: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    pub source_id: String,
    #[serde(default)]
    pub file_path: Option<String>,
}

fn default_weight() -> f64 {
    1.0
}

/// Grafo suministrado por el llamante (`insert_custom_kg`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomKg {
    #[serde(default)]
    pub chunks: Vec<CustomChunk>,
    #[serde(default)]
    pub entities: Vec<CustomEntity>,
    #[serde(default)]
    pub relationships: Vec<CustomRelationship>,
}
