//! Errores del núcleo RAG.
//!
//! Los bordes de la aplicación (arranque, configuración, proveedores LLM)
//! siguen usando `anyhow`; todo lo que cruza hacia el núcleo se traduce a
//! [`RagError`].

use thiserror::Error;

pub type RagResult<T> = Result<T, RagError>;

#[derive(Debug, Error)]
pub enum RagError {
    /// Entrada mal formada; se rechaza antes de persistir nada.
    #[error("validation error: {0}")]
    Validation(String),

    /// Registro de extracción mal formado. Se recupera localmente.
    #[error("extraction parse error: {0}")]
    ExtractionParse(String),

    /// Fallo de troceado, embedding o merge de un documento.
    #[error("pipeline failure: {0}")]
    Pipeline(String),

    /// Valor de etiqueta que no es ni escalar ni lista de cadenas.
    #[error("tag filter type error: {0}")]
    TagFilterType(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("llm error: {0}")]
    Llm(String),

    #[error("lock timeout: {0}")]
    LockTimeout(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RagError {
    /// Etiqueta corta que se guarda como `error_type` en los metadatos del
    /// documento fallido.
    pub fn kind(&self) -> &'static str {
        match self {
            RagError::Validation(_) => "validation_error",
            RagError::ExtractionParse(_) => "extraction_parse_error",
            RagError::Pipeline(_) => "processing_error",
            RagError::TagFilterType(_) => "tag_filter_type_error",
            RagError::Storage(_) => "storage_error",
            RagError::Llm(_) => "llm_error",
            RagError::LockTimeout(_) => "lock_timeout",
            RagError::Io(_) => "io_error",
            RagError::Json(_) => "json_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_contains_message() {
        let e = RagError::Validation("file_paths length mismatch".into());
        assert!(e.to_string().contains("file_paths length mismatch"));
        assert_eq!(e.kind(), "validation_error");
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let e: RagError = io_err.into();
        assert!(e.to_string().starts_with("io error"));
        assert_eq!(e.kind(), "io_error");
    }
}
