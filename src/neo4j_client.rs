use anyhow::{anyhow, Result};
use neo4rs::{query, Graph};
use tracing::info;
use url::Url;

use crate::config::AppConfig;

pub async fn connect_from_config(cfg: &AppConfig) -> Result<Graph> {
    let (Some(uri), Some(user), Some(password)) =
        (&cfg.neo4j_uri, &cfg.neo4j_user, &cfg.neo4j_password)
    else {
        return Err(anyhow!("Configuración de Neo4j incompleta"));
    };
    let url = Url::parse(uri)?;
    let host = url.host_str().unwrap_or("localhost");
    let port = url.port().unwrap_or(7687);
    let addr = format!("{host}:{port}");

    info!("Conectando a Neo4j en {addr}...");
    let graph = Graph::new(&addr, user, password).await?;
    info!("Conexión a Neo4j OK");
    Ok(graph)
}

/// Crea el constraint de unicidad de :Entity.
pub async fn ensure_schema(graph: &Graph) -> Result<()> {
    let statements = [
        // Entity.id único
        "CREATE CONSTRAINT entity_id IF NOT EXISTS
         FOR (e:Entity)
         REQUIRE e.id IS UNIQUE",
    ];

    for stmt in statements {
        graph.run(query(stmt)).await?;
    }

    info!("Esquema de Neo4j asegurado.");
    Ok(())
}

/// Garantiza que exista el índice vectorial `index_name` sobre `label(embedding)`
/// junto con el constraint de unicidad de `label.id`.
pub async fn ensure_vector_index(
    graph: &Graph,
    index_name: &str,
    label: &str,
    dimensions: usize,
) -> Result<()> {
    let constraint = format!(
        "CREATE CONSTRAINT {label}_id IF NOT EXISTS FOR (n:{label}) REQUIRE n.id IS UNIQUE"
    );
    graph.run(query(&constraint)).await?;

    // ¿Ya existe el índice?
    let mut cursor = graph
        .execute(
            query("SHOW VECTOR INDEXES YIELD name WHERE name = $name RETURN name")
                .param("name", index_name),
        )
        .await?;

    if cursor.next().await?.is_some() {
        info!("Índice vectorial '{index_name}' ya existe.");
        return Ok(());
    }

    let cypher = format!(
        "\
CREATE VECTOR INDEX {index_name}
FOR (n:{label})
ON (n.embedding)
OPTIONS {{
  indexConfig: {{
    `vector.dimensions`: {dimensions},
    `vector.similarity_function`: 'cosine'
  }}
}}"
    );

    graph.run(query(&cypher)).await?;
    info!("Índice vectorial '{index_name}' creado.");

    Ok(())
}
