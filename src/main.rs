use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

use nexus_tagrag::{
    api,
    app_state::AppState,
    config::{self, GraphBackend, VectorBackend},
    engine::{vector_store_config, RagEngine},
    llm::{CompletionFunc, EmbeddingFunc, LlmManager},
    neo4j_client,
    storage::{
        Neo4jGraphStorage, Neo4jVectorStorage, VectorStorage, NS_CHUNKS_VDB, NS_ENTITIES_VDB,
        NS_RELATIONSHIPS_VDB,
    },
};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Configuración y LLM
    let cfg = config::AppConfig::from_env().context("Error al cargar la configuración")?;
    let llm_manager = Arc::new(LlmManager::from_config(&cfg).context("Error inicializando LLM Manager")?);
    let llm: Arc<dyn CompletionFunc> = llm_manager.clone();
    let embedding: Arc<dyn EmbeddingFunc> = llm_manager;

    // 3. Motor con los backends elegidos
    let mut builder = RagEngine::builder(cfg.rag.clone(), llm, embedding.clone());
    let needs_neo4j =
        cfg.graph_backend == GraphBackend::Neo4j || cfg.vector_backend == VectorBackend::Neo4j;
    if needs_neo4j {
        let graph = Arc::new(
            neo4j_client::connect_from_config(&cfg)
                .await
                .context("Error conectando a Neo4j")?,
        );
        neo4j_client::ensure_schema(&graph)
            .await
            .context("Error asegurando el esquema de Neo4j")?;
        if cfg.graph_backend == GraphBackend::Neo4j {
            builder = builder.graph(Arc::new(Neo4jGraphStorage::new(graph.clone())));
        }
        if cfg.vector_backend == VectorBackend::Neo4j {
            let open = |ns: &'static str| {
                Neo4jVectorStorage::open(
                    graph.clone(),
                    ns,
                    embedding.clone(),
                    vector_store_config(&cfg.rag, ns),
                )
            };
            let (chunks, entities, relationships) = tokio::try_join!(
                open(NS_CHUNKS_VDB),
                open(NS_ENTITIES_VDB),
                open(NS_RELATIONSHIPS_VDB),
            )
            .context("Error asegurando los índices vectoriales")?;
            builder = builder.vector_storages(
                Arc::new(chunks) as Arc<dyn VectorStorage>,
                Arc::new(entities) as Arc<dyn VectorStorage>,
                Arc::new(relationships) as Arc<dyn VectorStorage>,
            );
        }
    }
    let engine = Arc::new(builder.build().await.context("Error inicializando el motor RAG")?);

    // Canal para la señal de apagado.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let app_state = AppState::new(cfg.clone(), engine.clone(), shutdown_tx);

    // 4. Router de la API
    let app = Router::new().merge(api::create_router(app_state)).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );

    // 5. Servidor
    let listener = tokio::net::TcpListener::bind(&cfg.server_addr)
        .await
        .with_context(|| format!("No se pudo escuchar en {}", cfg.server_addr))?;
    info!("🚀 Servidor escuchando en http://{}", cfg.server_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await?;

    engine.finalize().await?;
    info!("✅ Servidor cerrado correctamente.");
    Ok(())
}
