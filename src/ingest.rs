//! Escaneo de un directorio de entrada: extrae el texto de cada fichero
//! soportado, encola los documentos y registra como fallidos los ficheros
//! que no se pudieron leer.

use std::path::{Path, PathBuf};

use mime_guess::MimeGuess;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::engine::RagEngine;
use crate::error::{RagError, RagResult};
use crate::models::ErrorFile;

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "rs", "toml", "log", "html", "css", "js", "json", "csv", "py", "yaml", "yml",
];

/// Resumen de un escaneo.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    pub files_scanned: usize,
    pub files_enqueued: usize,
    pub files_failed: usize,
    pub files_skipped: usize,
}

impl std::fmt::Display for ScanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ficheros escaneados, {} encolados, {} fallidos, {} omitidos",
            self.files_scanned, self.files_enqueued, self.files_failed, self.files_skipped
        )
    }
}

enum Extracted {
    Text(String),
    Unsupported,
    Failed(ErrorFile),
}

fn is_supported(path: &Path) -> bool {
    let extension = path
        .extension()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or("")
        .to_lowercase();
    if extension == "pdf" || TEXT_EXTENSIONS.contains(&extension.as_str()) {
        return true;
    }
    MimeGuess::from_path(path)
        .first()
        .is_some_and(|m| m.type_() == mime_guess::mime::TEXT)
}

fn error_file(path: &Path, size: usize, description: &str, original: String) -> ErrorFile {
    ErrorFile {
        file_path: path.to_string_lossy().to_string(),
        error_description: description.to_string(),
        original_error: original,
        file_size: size,
    }
}

async fn extract_file(path: PathBuf) -> Extracted {
    if !is_supported(&path) {
        info!("Saltando fichero con extensión no soportada: {}", path.display());
        return Extracted::Unsupported;
    }
    let size = tokio::fs::metadata(&path)
        .await
        .map(|m| m.len() as usize)
        .unwrap_or(0);
    let is_pdf = path
        .extension()
        .and_then(std::ffi::OsStr::to_str)
        .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));

    let text = if is_pdf {
        let p = path.clone();
        match tokio::task::spawn_blocking(move || pdf_extract::extract_text(&p)).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                return Extracted::Failed(error_file(&path, size, "PDF text extraction failed", e.to_string()))
            }
            Err(e) => {
                return Extracted::Failed(error_file(&path, size, "PDF extraction task failed", e.to_string()))
            }
        }
    } else {
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) => {
                return Extracted::Failed(error_file(&path, size, "File is not valid UTF-8 text", e.to_string()))
            }
        }
    };

    if text.trim().is_empty() {
        return Extracted::Failed(error_file(
            &path,
            size,
            "File contains no extractable text",
            "empty content".to_string(),
        ));
    }
    Extracted::Text(text)
}

/// Recorre `root`, encola bajo `track_id` los ficheros con texto y procesa
/// la cola.
pub async fn scan_directory(engine: &RagEngine, root: &Path, track_id: &str) -> RagResult<ScanSummary> {
    if !root.is_dir() {
        return Err(RagError::Validation(format!(
            "input path is not a directory: {}",
            root.display()
        )));
    }

    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files.sort();

    let mut summary = ScanSummary {
        files_scanned: files.len(),
        ..ScanSummary::default()
    };
    let mut contents = Vec::new();
    let mut paths = Vec::new();
    let mut errors = Vec::new();
    for path in files {
        match extract_file(path.clone()).await {
            Extracted::Text(text) => {
                contents.push(text);
                paths.push(path.to_string_lossy().to_string());
            }
            Extracted::Unsupported => summary.files_skipped += 1,
            Extracted::Failed(err) => {
                warn!("No se pudo extraer {}: {}", err.file_path, err.original_error);
                errors.push(err);
            }
        }
    }

    summary.files_enqueued = contents.len();
    summary.files_failed = errors.len();
    engine.enqueue_error(errors, track_id).await?;
    if !contents.is_empty() {
        engine
            .enqueue(contents, Some(paths), None, Some(track_id.to_string()))
            .await?;
        engine.process_enqueued().await?;
    }
    info!("Escaneo de {}: {summary}", root.display());
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_files_by_extension_or_mime() {
        assert!(is_supported(Path::new("notes.md")));
        assert!(is_supported(Path::new("paper.PDF")));
        assert!(is_supported(Path::new("page.htm")));
        assert!(!is_supported(Path::new("photo.png")));
    }

    #[test]
    fn unsupported_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.png");
        std::fs::write(&path, [0u8, 1, 2]).unwrap();
        let extracted = tokio_test::block_on(extract_file(path));
        assert!(matches!(extracted, Extracted::Unsupported));
    }

    #[tokio::test]
    async fn empty_file_is_reported_as_failed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.txt");
        std::fs::write(&path, "   \n").unwrap();
        match extract_file(path).await {
            Extracted::Failed(err) => {
                assert_eq!(err.original_error, "empty content");
                assert_eq!(err.file_size, 4);
            }
            _ => panic!("empty file must fail"),
        }
    }
}
