#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use nexus_tagrag::config::RagConfig;
use nexus_tagrag::llm::{CompletionFunc, EmbeddingFunc};
use nexus_tagrag::models::ChatMessage;
use nexus_tagrag::tags::{tags_from_value, Tags};
use nexus_tagrag::{RagEngine, RagResult};

pub const DIM: usize = 8;

/// Embedding determinista: histograma de bytes en 8 cubos.
pub struct ByteEmbedding;

#[async_trait]
impl EmbeddingFunc for ByteEmbedding {
    fn embedding_dim(&self) -> usize {
        DIM
    }

    async fn embed(&self, texts: &[String]) -> RagResult<Vec<Vec<f64>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![0.0; DIM];
                v[0] = 1.0;
                for b in t.bytes() {
                    v[(b as usize) % DIM] += 1.0;
                }
                v
            })
            .collect())
    }
}

/// Palabras con mayúscula inicial, sin repetir y en orden de aparición.
pub fn capitalized_words(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for word in text.split_whitespace() {
        let word: String = word.chars().filter(|c| c.is_alphanumeric()).collect();
        let starts_upper = word.chars().next().is_some_and(char::is_uppercase);
        if starts_upper && word.chars().count() > 1 && !out.contains(&word) {
            out.push(word);
        }
    }
    out
}

/// LLM guionizado: extrae como entidades las palabras con mayúscula y
/// relaciona las consecutivas.
#[derive(Default)]
pub struct ScriptedLlm {
    pub calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn extraction(text: &str) -> String {
        let names = capitalized_words(text);
        let mut out = String::new();
        for name in &names {
            out.push_str(&format!(
                "(\"entity\"<|>\"{name}\"<|>\"person\"<|>\"{name} appears in the text\")##\n"
            ));
        }
        for pair in names.windows(2) {
            out.push_str(&format!(
                "(\"relationship\"<|>\"{a}\"<|>\"{b}\"<|>\"{a} is mentioned with {b}\"<|>\"co-occurrence\"<|>1.0)##\n",
                a = pair[0],
                b = pair[1]
            ));
        }
        out.push_str("<|COMPLETE|>");
        out
    }
}

#[async_trait]
impl CompletionFunc for ScriptedLlm {
    async fn complete(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        _history: &[ChatMessage],
    ) -> RagResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if prompt.contains("high_level_keywords") {
            let query = prompt
                .split_once("Query: ")
                .map(|(_, rest)| rest.split("\n\nOutput:").next().unwrap_or(rest))
                .unwrap_or_default();
            let low = capitalized_words(query);
            let high: Vec<String> = query
                .split_whitespace()
                .filter(|w| w.chars().next().is_some_and(char::is_lowercase))
                .map(String::from)
                .collect();
            return Ok(json!({"high_level_keywords": high, "low_level_keywords": low}).to_string());
        }
        if prompt.contains("Entity_types:") {
            let text = prompt
                .split_once("\nText:\n")
                .and_then(|(_, rest)| rest.rsplit_once("\n\nOutput:"))
                .map(|(text, _)| text)
                .unwrap_or_default();
            return Ok(Self::extraction(text));
        }
        if prompt.starts_with("MANY entities") {
            return Ok("<|COMPLETE|>".to_string());
        }
        if prompt.contains("Answer only `YES` or `NO`") {
            return Ok("NO".to_string());
        }
        Ok(format!("ANSWER\n{}", system_prompt.unwrap_or_default()))
    }
}

pub fn config(dir: &Path, native_tag_filters: bool) -> RagConfig {
    let mut cfg = RagConfig::with_working_dir(dir);
    cfg.embedding_dim = DIM;
    cfg.cosine_better_than_threshold = 0.0;
    cfg.vector_native_tag_filters = native_tag_filters;
    cfg
}

pub async fn engine_with(dir: &Path, native_tag_filters: bool) -> (RagEngine, Arc<ScriptedLlm>) {
    let llm = Arc::new(ScriptedLlm::default());
    let engine = RagEngine::builder(
        config(dir, native_tag_filters),
        llm.clone(),
        Arc::new(ByteEmbedding),
    )
    .build()
    .await
    .unwrap();
    (engine, llm)
}

pub async fn engine(dir: &Path) -> RagEngine {
    engine_with(dir, true).await.0
}

pub fn tags(value: serde_json::Value) -> Tags {
    tags_from_value(&value).unwrap()
}
