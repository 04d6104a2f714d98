//! Retrieval-mode turns against a synthetic on-disk index.

mod common;

use std::path::Path;
use std::sync::Arc;

use common::{write_index, StubGenerator, TableEmbedder};
use docent::config::{Config, ContextMode, DistanceMetric};
use docent::embedding::EmbeddingProvider;
use docent::error::DocentError;
use docent::extract::DocumentSource;
use docent::models::PromptContext;
use docent::session::{ChatServices, ChatSession};

fn embedder(model: &str) -> Arc<dyn EmbeddingProvider> {
    Arc::new(TableEmbedder {
        model: model.to_string(),
        dims: 2,
        table: vec![
            ("기초연금".to_string(), vec![1.0, 0.0]),
            ("장애인 복지".to_string(), vec![0.0, 1.0]),
        ],
    })
}

fn retrieval_services(
    index_dir: &Path,
    model: &str,
    metric: DistanceMetric,
    generator: Arc<StubGenerator>,
) -> Arc<ChatServices> {
    let mut config = Config::default();
    config.context.mode = ContextMode::Retrieval;
    config.index.dir = index_dir.to_path_buf();
    config.index.metric = metric;
    let services = ChatServices::new(config, generator, Some(embedder(model))).unwrap();
    Arc::new(services)
}

fn six_chunks() -> Vec<(&'static str, Vec<f32>)> {
    vec![
        ("장애인 활동지원", vec![0.0, 1.0]),
        ("기초연금 신청", vec![1.0, 0.1]),
        ("주거급여", vec![-1.0, 0.0]),
        ("기초연금 금액", vec![1.0, 0.5]),
        ("노인 일자리", vec![0.7, 0.7]),
        ("기초연금 대상", vec![1.0, 0.0]),
    ]
}

fn chunk_texts(context: &PromptContext) -> Vec<String> {
    match context {
        PromptContext::Retrieved(chunks) => chunks.iter().map(|c| c.chunk.text.clone()).collect(),
        PromptContext::FullText(_) => panic!("expected retrieved chunks"),
    }
}

#[tokio::test]
async fn returns_the_four_most_similar_chunks() {
    let tmp = tempfile::tempdir().unwrap();
    let index_dir = tmp.path().join("faiss_index");
    write_index(&index_dir, "table", "cosine", &six_chunks()).await;
    let services = retrieval_services(
        &index_dir,
        "table",
        DistanceMetric::Cosine,
        StubGenerator::answering(&["네"]),
    );

    let context = services
        .build_context(&services.default_document(), "기초연금")
        .await
        .unwrap();

    assert_eq!(
        chunk_texts(&context),
        vec!["기초연금 대상", "기초연금 신청", "기초연금 금액", "노인 일자리"]
    );
}

#[tokio::test]
async fn small_index_returns_every_chunk() {
    let tmp = tempfile::tempdir().unwrap();
    let index_dir = tmp.path().join("faiss_index");
    write_index(
        &index_dir,
        "table",
        "cosine",
        &[("하나", vec![1.0, 0.0]), ("둘", vec![0.0, 1.0])],
    )
    .await;
    let services = retrieval_services(
        &index_dir,
        "table",
        DistanceMetric::Cosine,
        StubGenerator::answering(&["네"]),
    );

    let context = services
        .build_context(&services.default_document(), "장애인 복지")
        .await
        .unwrap();
    assert_eq!(chunk_texts(&context), vec!["둘", "하나"]);
}

#[tokio::test]
async fn retrieved_chunks_reach_the_prompt_without_reading_the_pdf() {
    let tmp = tempfile::tempdir().unwrap();
    let index_dir = tmp.path().join("faiss_index");
    write_index(&index_dir, "table", "cosine", &six_chunks()).await;
    let generator = StubGenerator::answering(&["기초연금은 ..."]);
    let services =
        retrieval_services(&index_dir, "table", DistanceMetric::Cosine, generator.clone());

    // The configured manual.pdf does not exist; retrieval mode never reads it.
    let mut session = ChatSession::new(services);
    session.ask("기초연금").await.unwrap();

    let prompt = generator.last_request().unwrap().system_instruction;
    let best = prompt.find("기초연금 대상").unwrap();
    let second = prompt.find("기초연금 신청").unwrap();
    assert!(best < second);
    assert!(!prompt.contains("주거급여"));
}

#[tokio::test]
async fn missing_index_is_reported_without_fallback() {
    let tmp = tempfile::tempdir().unwrap();
    let generator = StubGenerator::answering(&["unused"]);
    let services = retrieval_services(
        &tmp.path().join("faiss_index"),
        "table",
        DistanceMetric::Cosine,
        generator.clone(),
    );

    let mut session = ChatSession::new(services);
    let err = session.ask("기초연금").await.unwrap_err();

    assert!(matches!(err, DocentError::MissingResource { .. }));
    assert!(err.to_string().starts_with("index not found"));
    assert_eq!(generator.calls(), 0);
    assert_eq!(session.messages().len(), 1);
}

#[tokio::test]
async fn index_built_with_another_model_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let index_dir = tmp.path().join("faiss_index");
    write_index(&index_dir, "text-embedding-004", "cosine", &six_chunks()).await;
    let services = retrieval_services(
        &index_dir,
        "table",
        DistanceMetric::Cosine,
        StubGenerator::answering(&["unused"]),
    );

    let err = services
        .build_context(&DocumentSource::File("manual.pdf".into()), "기초연금")
        .await
        .unwrap_err();
    assert!(matches!(err, DocentError::Index(_)));
    assert!(err.to_string().contains("text-embedding-004"));
}

#[tokio::test]
async fn index_built_for_another_metric_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let index_dir = tmp.path().join("faiss_index");
    write_index(&index_dir, "table", "l2", &six_chunks()).await;
    let services = retrieval_services(
        &index_dir,
        "table",
        DistanceMetric::Cosine,
        StubGenerator::answering(&["unused"]),
    );

    let err = services
        .build_context(&services.default_document(), "기초연금")
        .await
        .unwrap_err();
    assert!(matches!(err, DocentError::Index(_)));
    assert!(err.to_string().contains("metric"));
}

#[tokio::test]
async fn dot_metric_index_ranks_by_inner_product() {
    let tmp = tempfile::tempdir().unwrap();
    let index_dir = tmp.path().join("faiss_index");
    write_index(
        &index_dir,
        "table",
        "dot",
        &[
            ("짧은", vec![1.0, 0.0]),
            ("긴", vec![3.0, 0.0]),
            ("직교", vec![0.0, 5.0]),
        ],
    )
    .await;
    let services = retrieval_services(
        &index_dir,
        "table",
        DistanceMetric::Dot,
        StubGenerator::answering(&["네"]),
    );

    let context = services
        .build_context(&services.default_document(), "기초연금")
        .await
        .unwrap();
    assert_eq!(chunk_texts(&context), vec!["긴", "짧은", "직교"]);
}
