//! Utilidades compartidas: identificadores por hash, marcas de tiempo y
//! manejo de campos multivalor del grafo.

use std::collections::BTreeSet;

use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Separador de los campos multivalor (`source_id`, `file_path`,
/// `description`) en nodos y aristas.
pub const GRAPH_FIELD_SEP: &str = "<SEP>";

pub const UNKNOWN_SOURCE: &str = "unknown_source";

/// Id estable: prefijo + 32 caracteres hex del SHA-256 del contenido.
pub fn compute_mdhash_id(content: &str, prefix: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let hex: String = digest[..16].iter().map(|b| format!("{b:02x}")).collect();
    format!("{prefix}{hex}")
}

/// Id del registro vectorial de una entidad.
pub fn entity_vector_id(name: &str) -> String {
    compute_mdhash_id(name, "ent-")
}

/// Id del registro vectorial de una relación; el par se ordena antes.
/// Los nombres se separan con `<|>`, que no puede aparecer en un nombre
/// extraído.
pub fn relation_vector_id(src: &str, tgt: &str) -> String {
    let (a, b) = sorted_pair(src, tgt);
    compute_mdhash_id(&format!("{a}<|>{b}"), "rel-")
}

pub fn sorted_pair(src: &str, tgt: &str) -> (String, String) {
    if src <= tgt {
        (src.to_string(), tgt.to_string())
    } else {
        (tgt.to_string(), src.to_string())
    }
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

pub fn generate_track_id(prefix: &str) -> String {
    let short = Uuid::new_v4().simple().to_string();
    format!(
        "{prefix}_{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        &short[..8]
    )
}

/// Resumen corto del contenido que se guarda en el registro de estado.
pub fn content_summary(content: &str, max_chars: usize) -> String {
    let content = content.trim();
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let truncated: String = content.chars().take(max_chars).collect();
    format!("{truncated}...")
}

pub fn split_field(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(GRAPH_FIELD_SEP)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Une fragmentos en un campo multivalor ordenado y sin duplicados.
pub fn join_field<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let set: BTreeSet<&str> = parts
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    set.into_iter().collect::<Vec<_>>().join(GRAPH_FIELD_SEP)
}

/// Limpia un campo de un registro de extracción: espacios y comillas.
pub fn clean_str(raw: &str) -> String {
    raw.trim()
        .trim_matches('"')
        .trim_matches('\'')
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_ids_are_stable_and_prefixed() {
        let a = compute_mdhash_id("Alice", "ent-");
        assert_eq!(a, compute_mdhash_id("Alice", "ent-"));
        assert!(a.starts_with("ent-"));
        assert_eq!(a.len(), 4 + 32);
        assert_ne!(a, compute_mdhash_id("Bob", "ent-"));
    }

    #[test]
    fn relation_id_ignores_direction() {
        assert_eq!(relation_vector_id("Alice", "Bob"), relation_vector_id("Bob", "Alice"));
        assert_eq!(
            relation_vector_id("Bob", "Alice"),
            compute_mdhash_id("Alice<|>Bob", "rel-")
        );
    }

    #[test]
    fn relation_id_keeps_name_boundaries() {
        assert_ne!(relation_vector_id("ab", "c"), relation_vector_id("a", "bc"));
    }

    #[test]
    fn join_field_dedups_and_sorts() {
        let joined = join_field(["chunk-b", "chunk-a", "chunk-b", " "]);
        assert_eq!(joined, format!("chunk-a{GRAPH_FIELD_SEP}chunk-b"));
        assert_eq!(split_field(&joined).count(), 2);
    }

    #[test]
    fn summary_truncates_on_char_boundary() {
        assert_eq!(content_summary("  hola  ", 10), "hola");
        assert_eq!(content_summary("áéíóú", 3), "áéí...");
    }
}
