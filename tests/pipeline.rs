mod common;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::json;

use nexus_tagrag::models::{CustomChunk, CustomEntity, CustomKg, CustomRelationship, ErrorFile};
use nexus_tagrag::tags::TagValue;
use nexus_tagrag::utils::{entity_vector_id, relation_vector_id};
use nexus_tagrag::{DocStatus, RagError};

use common::{engine, tags};

#[tokio::test]
async fn identical_contents_become_distinct_pending_documents() {
    let dir = tempfile::tempdir().unwrap();
    let rag = engine(dir.path()).await;

    let track_id = rag
        .enqueue(
            vec!["same text".into(), "same text".into(), "other text".into()],
            None,
            None,
            Some("track-1".into()),
        )
        .await
        .unwrap();
    assert_eq!(track_id, "track-1");

    let docs = rag.get_docs_by_track_id("track-1").await.unwrap();
    assert_eq!(docs.len(), 3);
    for doc in docs.values() {
        assert_eq!(doc.status, DocStatus::Pending);
        assert_eq!(doc.file_path, "unknown_source");
        assert_eq!(doc.metadata.get("tags"), Some(&json!({})));
    }
    assert_eq!(rag.get_docs_by_status(DocStatus::Pending).await.unwrap().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_enqueues_of_the_same_content_keep_every_document() {
    let dir = tempfile::tempdir().unwrap();
    let rag = Arc::new(engine(dir.path()).await);

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let rag = rag.clone();
            tokio::spawn(async move {
                rag.enqueue(vec!["Same content".into()], None, None, None)
                    .await
            })
        })
        .collect();
    let mut track_ids = HashSet::new();
    for handle in handles {
        track_ids.insert(handle.await.unwrap().unwrap());
    }
    assert_eq!(track_ids.len(), 16);

    assert_eq!(rag.get_docs_by_status(DocStatus::Pending).await.unwrap().len(), 16);
    for track_id in &track_ids {
        assert_eq!(rag.get_docs_by_track_id(track_id).await.unwrap().len(), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn processing_runs_on_a_spawned_task() {
    let dir = tempfile::tempdir().unwrap();
    let rag = Arc::new(engine(dir.path()).await);
    rag.enqueue(vec!["Grace meets Heidi in Paris.".into()], None, None, None)
        .await
        .unwrap();

    let worker = rag.clone();
    let report = tokio::spawn(async move { worker.process_enqueued().await })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.processed.len(), 1);
    assert!(rag.graph().has_node("Grace").await.unwrap());
}

#[tokio::test]
async fn generated_track_id_has_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let rag = engine(dir.path()).await;
    let track_id = rag.enqueue(vec!["hello".into()], None, None, None).await.unwrap();
    assert!(track_id.starts_with("insert_"));
}

#[tokio::test]
async fn invalid_input_is_rejected_before_anything_is_stored() {
    let dir = tempfile::tempdir().unwrap();
    let rag = engine(dir.path()).await;

    let err = rag.enqueue(vec![], None, None, None).await.unwrap_err();
    assert!(matches!(err, RagError::Validation(_)));

    let err = rag
        .enqueue(
            vec!["a".into(), "b".into()],
            Some(vec!["only-one.txt".into()]),
            None,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::Validation(_)));

    let err = rag
        .enqueue(vec!["fine".into(), "   ".into()], None, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::Validation(_)));

    let counts = rag.get_status_counts().await.unwrap();
    assert_eq!(counts.values().sum::<usize>(), 0);
}

#[tokio::test]
async fn extraction_errors_are_recorded_as_failed() {
    let dir = tempfile::tempdir().unwrap();
    let rag = engine(dir.path()).await;
    rag.enqueue_error(
        vec![ErrorFile {
            file_path: "broken.pdf".into(),
            error_description: "PDF text extraction failed".into(),
            original_error: "invalid xref".into(),
            file_size: 2048,
        }],
        "scan-1",
    )
    .await
    .unwrap();

    let failed = rag.get_docs_by_status(DocStatus::Failed).await.unwrap();
    assert_eq!(failed.len(), 1);
    let doc = failed.values().next().unwrap();
    assert_eq!(doc.content_length, 2048);
    assert_eq!(doc.track_id, "scan-1");
    assert_eq!(doc.error_msg.as_deref(), Some("invalid xref"));
    assert_eq!(
        doc.metadata.get("error_type"),
        Some(&json!("file_extraction_error"))
    );
}

#[tokio::test]
async fn processing_propagates_tags_to_chunks_graph_and_vectors() {
    let dir = tempfile::tempdir().unwrap();
    let rag = engine(dir.path()).await;
    let doc_tags = tags(json!({"project": "alpha", "region": ["eu"]}));

    let track_id = rag
        .insert(
            vec!["Alice met Bob in Paris.".into()],
            Some(vec!["notes.txt".into()]),
            Some(doc_tags.clone()),
        )
        .await
        .unwrap();

    let docs = rag.get_docs_by_track_id(&track_id).await.unwrap();
    let (doc_id, doc) = docs.iter().next().unwrap();
    assert_eq!(doc.status, DocStatus::Processed);
    assert_eq!(doc.chunks_count, Some(1));

    let chunk_id = &doc.chunks_list[0];
    let chunk = rag.text_chunks().get_by_id(chunk_id).await.unwrap().unwrap();
    assert_eq!(&chunk.full_doc_id, doc_id);
    assert_eq!(chunk.file_path, "notes.txt");
    assert_eq!(chunk.tags, doc_tags);

    let chunk_vec = rag.chunks_vdb().get_by_id(chunk_id).await.unwrap().unwrap();
    assert_eq!(chunk_vec.tags.as_ref(), Some(&doc_tags));

    let node = rag.graph().get_node("Alice").await.unwrap().unwrap();
    assert_eq!(node.source_id, *chunk_id);
    assert!(node.tags_json.is_some());

    let entity = rag
        .entities_vdb()
        .get_by_id(&entity_vector_id("Alice"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entity.tags.as_ref(), Some(&doc_tags));

    let relation = rag
        .relationships_vdb()
        .get_by_id(&relation_vector_id("Alice", "Bob"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(relation.tags.as_ref(), Some(&doc_tags));
    assert!(rag.graph().has_edge("Bob", "Alice").await.unwrap());

    let status = rag.pipeline_status().await.unwrap();
    assert!(!status.is_busy);
}

#[tokio::test]
async fn entity_tags_union_across_documents() {
    let dir = tempfile::tempdir().unwrap();
    let rag = engine(dir.path()).await;
    rag.insert(
        vec!["Alice visited Berlin.".into()],
        None,
        Some(tags(json!({"region": ["eu"], "owner": "first"}))),
    )
    .await
    .unwrap();
    rag.insert(
        vec!["Alice visited Boston.".into()],
        None,
        Some(tags(json!({"region": ["us"], "owner": "second"}))),
    )
    .await
    .unwrap();

    let alice = rag
        .entities_vdb()
        .get_by_id(&entity_vector_id("Alice"))
        .await
        .unwrap()
        .unwrap();
    let alice_tags = alice.tags.unwrap();
    assert_eq!(
        alice_tags.get("region"),
        Some(&TagValue::List(vec!["eu".into(), "us".into()]))
    );
    assert!(alice_tags.contains_key("owner"));

    let node = rag.graph().get_node("Alice").await.unwrap().unwrap();
    assert_eq!(node.source_id.split("<SEP>").count(), 2);

    let berlin = rag
        .entities_vdb()
        .get_by_id(&entity_vector_id("Berlin"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        berlin.tags.unwrap().get("region"),
        Some(&TagValue::List(vec!["eu".into()]))
    );
}

#[tokio::test]
async fn busy_pipeline_defers_the_request() {
    let dir = tempfile::tempdir().unwrap();
    let rag = engine(dir.path()).await;
    rag.enqueue(vec!["Carol writes code.".into()], None, None, None)
        .await
        .unwrap();

    let status = rag.shared().pipeline_status().unwrap();
    status.lock().await.is_busy = true;

    let report = rag.process_enqueued().await.unwrap();
    assert!(report.deferred);
    assert!(status.lock().await.request_pending);
    assert_eq!(rag.get_docs_by_status(DocStatus::Pending).await.unwrap().len(), 1);

    status.lock().await.is_busy = false;
    let report = rag.process_enqueued().await.unwrap();
    assert_eq!(report.processed.len(), 1);
}

#[tokio::test]
async fn abandoned_processing_document_is_reclaimed() {
    let dir = tempfile::tempdir().unwrap();
    let rag = engine(dir.path()).await;
    let track_id = rag
        .enqueue(vec!["Dave lost power.".into()], None, None, None)
        .await
        .unwrap();
    let (id, mut doc) = rag
        .get_docs_by_track_id(&track_id)
        .await
        .unwrap()
        .into_iter()
        .next()
        .unwrap();
    doc.status = DocStatus::Processing;
    rag.doc_status()
        .upsert(HashMap::from([(id.clone(), doc)]))
        .await
        .unwrap();

    let report = rag.process_enqueued().await.unwrap();
    assert_eq!(report.processed, vec![id.clone()]);
    let doc = rag.doc_status().get_by_id(&id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocStatus::Processed);
}

#[tokio::test]
async fn terminal_documents_are_not_reprocessed() {
    let dir = tempfile::tempdir().unwrap();
    let (rag, llm) = common::engine_with(dir.path(), true).await;
    rag.insert(vec!["Erin likes Rust.".into()], None, None)
        .await
        .unwrap();
    let calls = llm.calls();

    let report = rag.process_enqueued().await.unwrap();
    assert!(report.processed.is_empty());
    assert_eq!(llm.calls(), calls);
}

#[tokio::test]
async fn custom_kg_merge_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let rag = engine(dir.path()).await;
    let kg = CustomKg {
        chunks: vec![CustomChunk {
            content: "Frank founded Acme.".into(),
            source_id: "src-1".into(),
            file_path: Some("kg.json".into()),
            tags: tags(json!({"project": "alpha"})),
        }],
        entities: vec![
            CustomEntity {
                entity_name: "Frank".into(),
                entity_type: Some("person".into()),
                description: Some("Founder".into()),
                source_id: "src-1".into(),
                file_path: None,
            },
            CustomEntity {
                entity_name: "Acme".into(),
                entity_type: Some("organization".into()),
                description: Some("A company".into()),
                source_id: "src-1".into(),
                file_path: None,
            },
        ],
        relationships: vec![CustomRelationship {
            src_id: "Frank".into(),
            tgt_id: "Acme".into(),
            description: "Frank founded Acme".into(),
            keywords: "founder".into(),
            weight: 2.0,
            source_id: "src-1".into(),
            file_path: None,
        }],
    };

    rag.insert_custom_kg(kg.clone()).await.unwrap();
    let node = rag.graph().get_node("Frank").await.unwrap().unwrap();
    let edge = rag.graph().get_edge("Acme", "Frank").await.unwrap().unwrap();
    assert!((edge.weight - 2.0).abs() < 1e-9);

    rag.insert_custom_kg(kg).await.unwrap();
    let node_again = rag.graph().get_node("Frank").await.unwrap().unwrap();
    let edge_again = rag.graph().get_edge("Frank", "Acme").await.unwrap().unwrap();
    assert_eq!(node.description, node_again.description);
    assert_eq!(node.source_id, node_again.source_id);
    assert_eq!(node.tags_json, node_again.tags_json);
    assert!((edge_again.weight - edge.weight).abs() < 1e-9);

    let entity = rag
        .entities_vdb()
        .get_by_id(&entity_vector_id("Acme"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entity.tags.unwrap(), tags(json!({"project": "alpha"})));
}

#[tokio::test]
async fn custom_chunks_are_indexed_without_tags() {
    let dir = tempfile::tempdir().unwrap();
    let rag = engine(dir.path()).await;
    let doc_id = rag
        .insert_custom_chunks(
            "Grace builds compilers. Heidi tests them.",
            vec!["Grace builds compilers.".into(), "Heidi tests them.".into()],
            Some("doc-custom".into()),
        )
        .await
        .unwrap();
    assert_eq!(doc_id, "doc-custom");

    assert!(rag.full_docs().get_by_id("doc-custom").await.unwrap().is_some());
    assert!(rag.graph().has_node("Grace").await.unwrap());
    assert!(rag.graph().has_node("Heidi").await.unwrap());
    let grace = rag
        .entities_vdb()
        .get_by_id(&entity_vector_id("Grace"))
        .await
        .unwrap()
        .unwrap();
    assert!(grace.tags.is_none());
}

#[tokio::test]
async fn directory_scan_enqueues_text_and_records_failures() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("inputs");
    std::fs::create_dir_all(input.join("nested")).unwrap();
    std::fs::write(input.join("a.txt"), "Judy audits ledgers.").unwrap();
    std::fs::write(input.join("nested").join("b.md"), "Karl ships builds.").unwrap();
    std::fs::write(input.join("empty.txt"), "").unwrap();
    std::fs::write(input.join("logo.png"), [0u8, 1, 2]).unwrap();

    let rag = engine(&dir.path().join("store")).await;
    let summary = nexus_tagrag::ingest::scan_directory(&rag, &input, "scan-7")
        .await
        .unwrap();
    assert_eq!(summary.files_scanned, 4);
    assert_eq!(summary.files_enqueued, 2);
    assert_eq!(summary.files_failed, 1);
    assert_eq!(summary.files_skipped, 1);

    let docs = rag.get_docs_by_track_id("scan-7").await.unwrap();
    assert_eq!(docs.len(), 3);
    let processed = docs
        .values()
        .filter(|d| d.status == DocStatus::Processed)
        .count();
    assert_eq!(processed, 2);
    assert!(rag.graph().has_node("Judy").await.unwrap());
}
