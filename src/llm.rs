//! Contratos de LLM y embeddings, su implementación sobre Rig y la caché de
//! respuestas del LLM.
//! Sólo el proveedor OpenAI tiene implementación.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rig::completion::Prompt;
use rig::embeddings::EmbeddingModel;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{AppConfig, LlmProvider};
use crate::error::{RagError, RagResult};
use crate::models::ChatMessage;
use crate::storage::KvStorage;
use crate::utils::{compute_mdhash_id, now_ts};

/// Llamada de completado. El núcleo no reintenta ni aplica timeouts propios.
#[async_trait]
pub trait CompletionFunc: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        history: &[ChatMessage],
    ) -> RagResult<String>;
}

/// Llamada de embeddings sobre un lote de textos.
#[async_trait]
pub trait EmbeddingFunc: Send + Sync {
    fn embedding_dim(&self) -> usize;

    async fn embed(&self, texts: &[String]) -> RagResult<Vec<Vec<f64>>>;
}

/// Entrada de la caché de respuestas del LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    pub cache_type: String,
    pub prompt: String,
    pub response: String,
    pub created_at: i64,
}

/// Llama al LLM pasando por la caché (si está habilitada). La clave es el
/// hash del prompt completo, así que reintentar la misma extracción no vuelve
/// a llamar al modelo.
pub async fn complete_with_cache(
    llm: &dyn CompletionFunc,
    cache: Option<&Arc<dyn KvStorage<CachedResponse>>>,
    cache_type: &str,
    prompt: &str,
    system_prompt: Option<&str>,
    history: &[ChatMessage],
) -> RagResult<String> {
    let Some(cache) = cache else {
        return llm.complete(prompt, system_prompt, history).await;
    };
    let history_key: String = history
        .iter()
        .map(|m| format!("{}:{}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n");
    let key = compute_mdhash_id(
        &format!("{cache_type}\n{}\n{history_key}\n{prompt}", system_prompt.unwrap_or("")),
        "cache-",
    );
    if let Some(hit) = cache.get_by_id(&key).await? {
        debug!("Caché LLM: acierto ({cache_type})");
        return Ok(hit.response);
    }
    let response = llm.complete(prompt, system_prompt, history).await?;
    cache
        .upsert(HashMap::from([(
            key,
            CachedResponse {
                cache_type: cache_type.to_string(),
                prompt: prompt.to_string(),
                response: response.clone(),
                created_at: now_ts(),
            },
        )]))
        .await?;
    Ok(response)
}

/// Gestor de LLMs y embeddings.
#[derive(Debug, Clone)]
pub struct LlmManager {
    pub provider: LlmProvider,
    pub embedding_model: String,
    pub chat_model: String,
    pub embedding_dim: usize,
}

impl LlmManager {
    /// Construye el manager a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        Ok(Self {
            provider: cfg.llm_provider.clone(),
            embedding_model: cfg.llm_embedding_model.clone(),
            chat_model: cfg.llm_chat_model.clone(),
            embedding_dim: cfg.rag.embedding_dim,
        })
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        match self.provider {
            LlmProvider::OpenAI => self.embed_with_openai(texts).await,
            ref other => Err(anyhow!("embeddings no disponibles para el proveedor {other:?}")),
        }
    }

    async fn embed_with_openai(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        use rig::providers::openai::{self, TEXT_EMBEDDING_3_SMALL};
        use rig::client::EmbeddingsClient as _;

        let client = openai::Client::from_env();

        let model_name = if self.embedding_model.is_empty() {
            TEXT_EMBEDDING_3_SMALL
        } else {
            self.embedding_model.as_str()
        };

        let embedding_model = client.embedding_model(model_name);
        let embeddings = embedding_model.embed_texts(texts.to_vec()).await?;

        if embeddings.len() != texts.len() {
            return Err(anyhow!(
                "Número de embeddings ({}) distinto al número de textos ({})",
                embeddings.len(),
                texts.len()
            ));
        }

        Ok(embeddings.into_iter().map(|e| e.vec).collect())
    }

    async fn complete_text(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        history: &[ChatMessage],
    ) -> Result<String> {
        match self.provider {
            LlmProvider::OpenAI => self.complete_with_openai(prompt, system_prompt, history).await,
            ref other => Err(anyhow!("chat no disponible para el proveedor {other:?}")),
        }
    }

    async fn complete_with_openai(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        history: &[ChatMessage],
    ) -> Result<String> {
        use rig::providers::openai;
        use rig::client::CompletionClient as _;

        let client = openai::Client::from_env();

        let model_name = if self.chat_model.is_empty() {
            "gpt-4o-mini"
        } else {
            self.chat_model.as_str()
        };

        // El historial se entrega como contexto previo de la conversación.
        let transcript = history
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let mut builder = client.agent(model_name);
        if let Some(system) = system_prompt {
            builder = builder.preamble(system);
        }
        if !transcript.is_empty() {
            builder = builder.context(&transcript);
        }
        let agent = builder.build();

        let answer = agent.prompt(prompt).await?;
        Ok(answer)
    }
}

#[async_trait]
impl CompletionFunc for LlmManager {
    async fn complete(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        history: &[ChatMessage],
    ) -> RagResult<String> {
        self.complete_text(prompt, system_prompt, history)
            .await
            .map_err(|e| RagError::Llm(e.to_string()))
    }
}

#[async_trait]
impl EmbeddingFunc for LlmManager {
    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    async fn embed(&self, texts: &[String]) -> RagResult<Vec<Vec<f64>>> {
        self.embed_texts(texts)
            .await
            .map_err(|e| RagError::Llm(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::SharedStorage;
    use crate::storage::JsonKvStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLlm {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CompletionFunc for CountingLlm {
        async fn complete(
            &self,
            prompt: &str,
            _system_prompt: Option<&str>,
            _history: &[ChatMessage],
        ) -> RagResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("echo: {prompt}"))
        }
    }

    #[tokio::test]
    async fn cache_avoids_second_call() {
        let dir = tempfile::tempdir().unwrap();
        let shared = SharedStorage::initialize(1);
        let cache: Arc<dyn KvStorage<CachedResponse>> = Arc::new(
            JsonKvStorage::open(&shared, dir.path(), "llm_response_cache")
                .await
                .unwrap(),
        );
        let llm = CountingLlm {
            calls: AtomicUsize::new(0),
        };
        let first = complete_with_cache(&llm, Some(&cache), "extract", "hola", None, &[])
            .await
            .unwrap();
        let second = complete_with_cache(&llm, Some(&cache), "extract", "hola", None, &[])
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);

        complete_with_cache(&llm, None, "extract", "hola", None, &[])
            .await
            .unwrap();
        assert_eq!(llm.calls.load(Ordering::SeqCst), 2);
    }
}
