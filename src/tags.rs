//! Etiquetas de metadatos y predicado de filtrado.
//!
//! Una etiqueta es un par clave → valor donde el valor es un escalar o una
//! lista de cadenas. Los documentos las reciben en la ingesta, los chunks las
//! heredan tal cual y entidades/relaciones las agregan a partir de todos los
//! chunks que las mencionan.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RagError, RagResult};

/// Valor de una etiqueta: escalar o lista.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Scalar(String),
    List(Vec<String>),
}

impl TagValue {
    /// Forma normalizada como lista (sólo para comparaciones `tag_in`).
    pub fn as_list(&self) -> Vec<&str> {
        match self {
            TagValue::Scalar(s) => vec![s.as_str()],
            TagValue::List(items) => items.iter().map(String::as_str).collect(),
        }
    }

    fn satisfies_equals(&self, expected: &str) -> bool {
        match self {
            TagValue::Scalar(s) => s == expected,
            TagValue::List(items) => items.iter().any(|i| i == expected),
        }
    }

    fn intersects(&self, allowed: &[String]) -> bool {
        self.as_list()
            .into_iter()
            .any(|v| allowed.iter().any(|a| a == v))
    }

    /// Convierte un valor JSON sin tipar. Todo lo que no sea cadena o lista
    /// de cadenas es un error de tipo; no se coerciona.
    pub fn from_json(key: &str, value: &Value) -> RagResult<Self> {
        match value {
            Value::String(s) => Ok(TagValue::Scalar(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    other => Err(RagError::TagFilterType(format!(
                        "tag '{key}' contains a non-string list item: {other}"
                    ))),
                })
                .collect::<RagResult<Vec<_>>>()
                .map(TagValue::List),
            other => Err(RagError::TagFilterType(format!(
                "tag '{key}' must be a string or a list of strings, got {other}"
            ))),
        }
    }
}

pub type Tags = BTreeMap<String, TagValue>;
pub type TagEquals = BTreeMap<String, String>;
pub type TagIn = BTreeMap<String, Vec<String>>;

/// Filtros de consulta agrupados. Vacíos por defecto (sin filtrado).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagFilters {
    #[serde(default)]
    pub tag_equals: TagEquals,
    #[serde(default)]
    pub tag_in: TagIn,
}

impl TagFilters {
    pub fn new(tag_equals: TagEquals, tag_in: TagIn) -> Self {
        Self { tag_equals, tag_in }
    }

    pub fn is_empty(&self) -> bool {
        self.tag_equals.is_empty() && self.tag_in.is_empty()
    }

    pub fn matches(&self, tags: &Tags) -> bool {
        matches_tag_filters(tags, &self.tag_equals, &self.tag_in)
    }
}

/// Predicado de filtrado.
///
/// - AND entre las claves de `tag_equals` (igualdad exacta; una etiqueta
///   lista cumple si contiene el valor).
/// - AND entre las claves de `tag_in` (la etiqueta, como lista, debe
///   intersecar la lista dada).
/// - Una clave en ambos grupos debe cumplir los dos.
/// - Clave requerida ausente ⇒ no hay match.
/// - Sin filtros ⇒ siempre `true`.
pub fn matches_tag_filters(tags: &Tags, tag_equals: &TagEquals, tag_in: &TagIn) -> bool {
    // El valor exigido por igualdad también tiene que estar entre los permitidos.
    let consistent = tag_equals.iter().all(|(key, expected)| {
        tag_in
            .get(key)
            .map_or(true, |allowed| allowed.iter().any(|v| v == expected))
    });
    if !consistent {
        return false;
    }
    let equals_ok = tag_equals.iter().all(|(key, expected)| {
        tags.get(key)
            .is_some_and(|value| value.satisfies_equals(expected))
    });
    if !equals_ok {
        return false;
    }
    tag_in
        .iter()
        .all(|(key, allowed)| tags.get(key).is_some_and(|value| value.intersects(allowed)))
}

/// Decodifica un mapa de etiquetas a partir de JSON sin tipar.
pub fn tags_from_value(value: &Value) -> RagResult<Tags> {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| TagValue::from_json(k, v).map(|tv| (k.clone(), tv)))
            .collect(),
        Value::Null => Ok(Tags::new()),
        other => Err(RagError::TagFilterType(format!(
            "tags must be an object, got {other}"
        ))),
    }
}

/// Lee la propiedad `tags_json` de un nodo o arista del grafo. Acepta tanto
/// la forma codificada como cadena como un mapa nativo; `None` si no hay.
pub fn decode_tags_json(value: &Value) -> RagResult<Option<Tags>> {
    match value {
        Value::Null => Ok(None),
        Value::String(raw) if raw.trim().is_empty() => Ok(None),
        Value::String(raw) => {
            let parsed: Value = serde_json::from_str(raw).map_err(|e| {
                RagError::TagFilterType(format!("tags_json is not valid JSON: {e}"))
            })?;
            tags_from_value(&parsed).map(Some)
        }
        Value::Object(_) => tags_from_value(value).map(Some),
        other => Err(RagError::TagFilterType(format!(
            "tags_json must be a string or an object, got {other}"
        ))),
    }
}

pub fn encode_tags_json(tags: &Tags) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "{}".to_string())
}

pub fn tags_to_value(tags: &Tags) -> Value {
    serde_json::to_value(tags).unwrap_or(Value::Object(Default::default()))
}

/// Funde `incoming` sobre `acc`:
/// - entrada lista ⇒ unión de conjuntos con lo existente (ordenada);
/// - entrada escalar ⇒ gana el último valor fundido.
pub fn merge_tags(acc: &mut Tags, incoming: &Tags) {
    for (key, value) in incoming {
        match value {
            TagValue::Scalar(s) => {
                acc.insert(key.clone(), TagValue::Scalar(s.clone()));
            }
            TagValue::List(items) => {
                let mut union: BTreeSet<String> = acc
                    .get(key)
                    .map(|existing| existing.as_list().into_iter().map(String::from).collect())
                    .unwrap_or_default();
                union.extend(items.iter().cloned());
                acc.insert(key.clone(), TagValue::List(union.into_iter().collect()));
            }
        }
    }
}

pub fn aggregate_tags<'a>(sources: impl IntoIterator<Item = &'a Tags>) -> Tags {
    let mut acc = Tags::new();
    for tags in sources {
        merge_tags(&mut acc, tags);
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Tags {
        tags_from_value(&json!({"project": "alpha", "region": ["us", "eu"], "team": "ml"}))
            .unwrap()
    }

    fn eq(pairs: &[(&str, &str)]) -> TagEquals {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn any_of(pairs: &[(&str, &[&str])]) -> TagIn {
        pairs
            .iter()
            .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
            .collect()
    }

    #[test]
    fn filter_semantics() {
        let tags = sample();
        assert!(matches_tag_filters(&tags, &eq(&[("project", "alpha")]), &TagIn::new()));
        assert!(!matches_tag_filters(&tags, &eq(&[("project", "beta")]), &TagIn::new()));
        assert!(matches_tag_filters(&tags, &TagEquals::new(), &any_of(&[("region", &["us"])])));
        assert!(!matches_tag_filters(&tags, &TagEquals::new(), &any_of(&[("region", &["apac"])])));
        assert!(matches_tag_filters(
            &tags,
            &eq(&[("project", "alpha")]),
            &any_of(&[("region", &["eu"])])
        ));
        assert!(matches_tag_filters(
            &tags,
            &eq(&[("region", "us")]),
            &any_of(&[("region", &["us", "eu"])])
        ));
        assert!(!matches_tag_filters(
            &tags,
            &eq(&[("region", "us")]),
            &any_of(&[("region", &["eu"])])
        ));
        assert!(!matches_tag_filters(&tags, &eq(&[("missing", "x")]), &TagIn::new()));
    }

    #[test]
    fn key_in_both_groups_needs_a_consistent_value() {
        let tags = sample();
        assert!(!matches_tag_filters(
            &tags,
            &eq(&[("project", "alpha")]),
            &any_of(&[("project", &["beta"])])
        ));
        assert!(matches_tag_filters(
            &tags,
            &eq(&[("project", "alpha")]),
            &any_of(&[("project", &["alpha", "beta"])])
        ));
    }

    #[test]
    fn empty_filters_always_match() {
        assert!(matches_tag_filters(&Tags::new(), &TagEquals::new(), &TagIn::new()));
        assert!(matches_tag_filters(&sample(), &TagEquals::new(), &TagIn::new()));
    }

    #[test]
    fn combined_filter_is_conjunction_of_groups() {
        let tags = sample();
        let cases = [
            (eq(&[("project", "alpha")]), any_of(&[("region", &["us"])])),
            (eq(&[("project", "beta")]), any_of(&[("region", &["us"])])),
            (eq(&[("team", "ml")]), any_of(&[("region", &["apac"])])),
            (eq(&[("team", "ops")]), any_of(&[("project", &["alpha"])])),
        ];
        for (e, i) in cases {
            let combined = matches_tag_filters(&tags, &e, &i);
            let split = matches_tag_filters(&tags, &e, &TagIn::new())
                && matches_tag_filters(&tags, &TagEquals::new(), &i);
            assert_eq!(combined, split);
        }
    }

    #[test]
    fn scalar_tag_in_is_normalized_to_list() {
        let tags = sample();
        assert!(matches_tag_filters(&tags, &TagEquals::new(), &any_of(&[("team", &["ml", "x"])])));
        assert!(!matches_tag_filters(&tags, &TagEquals::new(), &any_of(&[("team", &["ops"])])));
    }

    #[test]
    fn malformed_values_raise_type_error() {
        let err = tags_from_value(&json!({"priority": 3})).unwrap_err();
        assert!(matches!(err, RagError::TagFilterType(_)));
        let err = tags_from_value(&json!({"region": ["us", 1]})).unwrap_err();
        assert!(matches!(err, RagError::TagFilterType(_)));
        assert!(tags_from_value(&json!("nope")).is_err());
    }

    #[test]
    fn tags_json_accepts_string_and_native_forms() {
        let encoded = json!(encode_tags_json(&sample()));
        let native = json!({"project": "alpha", "region": ["us", "eu"], "team": "ml"});
        assert_eq!(decode_tags_json(&encoded).unwrap(), Some(sample()));
        assert_eq!(decode_tags_json(&native).unwrap(), Some(sample()));
        assert_eq!(decode_tags_json(&Value::Null).unwrap(), None);
        assert!(decode_tags_json(&json!(12)).is_err());
    }

    #[test]
    fn merge_unions_lists_and_keeps_last_scalar() {
        let a = tags_from_value(&json!({"project": "alpha", "region": ["us"]})).unwrap();
        let b = tags_from_value(&json!({"project": "beta", "region": ["eu", "us"]})).unwrap();
        let merged = aggregate_tags([&a, &b]);
        assert_eq!(merged.get("project"), Some(&TagValue::Scalar("beta".into())));
        assert_eq!(
            merged.get("region"),
            Some(&TagValue::List(vec!["eu".into(), "us".into()]))
        );
    }

    #[test]
    fn merge_is_idempotent() {
        let a = tags_from_value(&json!({"project": "alpha", "region": ["us", "eu"]})).unwrap();
        let once = aggregate_tags([&a]);
        let twice = aggregate_tags([&a, &a]);
        assert_eq!(once, twice);
    }
}
