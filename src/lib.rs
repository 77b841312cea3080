//! Motor Graph-RAG con etiquetas: ingesta de documentos, extracción de
//! entidades y relaciones, grafo de conocimiento e índices vectoriales
//! filtrables por etiquetas de metadatos.

pub mod api;
pub mod app_state;
pub mod chunking;
pub mod config;
pub mod engine;
pub mod error;
pub mod extraction;
pub mod ingest;
pub mod llm;
pub mod merge;
pub mod models;
pub mod neo4j_client;
pub mod pipeline;
pub mod query;
pub mod shared;
pub mod storage;
pub mod tags;
pub mod utils;

pub use engine::{RagEngine, RagEngineBuilder};
pub use error::{RagError, RagResult};
pub use models::{DocStatus, QueryMode, QueryParam};
pub use tags::{matches_tag_filters, TagFilters, TagValue, Tags};
