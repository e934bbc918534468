use bank_sql_agent::config::{EmbeddingConfig, LlmConfig};
use bank_sql_agent::embedding::{Embedder, EmbeddingError, EmbeddingManager};
use bank_sql_agent::llm::{LlmError, LlmManager};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn ollama_llm(server: &MockServer) -> LlmConfig {
    LlmConfig {
        backend: "ollama".to_string(),
        model: "sqlcoder".to_string(),
        api_url: Some(format!("{}/api/generate", server.uri())),
        timeout_secs: 5,
        ..LlmConfig::default()
    }
}

#[tokio::test]
async fn ollama_generate_returns_the_response_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({"model": "sqlcoder", "stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "sqlcoder",
            "response": "```sql\nSELECT COUNT(*) FROM loan_types;\n```",
            "done": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    let manager = LlmManager::new(&ollama_llm(&server)).unwrap();
    let answer = manager.complete("How many loan types?").await.unwrap();
    assert!(answer.contains("SELECT COUNT(*) FROM loan_types;"));
}

#[tokio::test]
async fn ollama_error_status_is_a_response_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(500).set_body_string("model not loaded"))
        .mount(&server)
        .await;

    let manager = LlmManager::new(&ollama_llm(&server)).unwrap();
    let err = manager.complete("anything").await.unwrap_err();
    assert!(matches!(err, LlmError::Response(ref m) if m.contains("model not loaded")));
}

#[tokio::test]
async fn slow_ollama_hits_the_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"response": "SELECT 1;"}))
                .set_delay(std::time::Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let config = LlmConfig {
        timeout_secs: 1,
        ..ollama_llm(&server)
    };
    let manager = LlmManager::new(&config).unwrap();
    assert!(matches!(
        manager.complete("anything").await,
        Err(LlmError::Timeout(1))
    ));
}

#[tokio::test]
async fn remote_chat_completion_sends_the_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "ask_question"}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = LlmConfig {
        backend: "remote".to_string(),
        model: "gpt-4o-mini".to_string(),
        api_key: Some("test-key".to_string()),
        api_url: Some(format!("{}/v1/chat/completions", server.uri())),
        timeout_secs: 5,
        ..LlmConfig::default()
    };
    let manager = LlmManager::new(&config).unwrap();
    assert_eq!(manager.complete("Hello").await.unwrap(), "ask_question");
}

#[tokio::test]
async fn ollama_embeddings_come_back_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_partial_json(json!({"model": "nomic-embed-text"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "embeddings": [[0.1, 0.2, 0.3], [0.4, 0.5, 0.6]]
        })))
        .mount(&server)
        .await;

    let config = EmbeddingConfig {
        backend: "ollama".to_string(),
        model: "nomic-embed-text".to_string(),
        api_url: Some(format!("{}/api/embed", server.uri())),
        timeout_secs: 5,
        ..EmbeddingConfig::default()
    };
    let embedder = EmbeddingManager::new(&config).unwrap();
    let vectors = embedder
        .embed_batch(&["customers".to_string(), "loans".to_string()])
        .await
        .unwrap();
    assert_eq!(vectors, vec![vec![0.1, 0.2, 0.3], vec![0.4, 0.5, 0.6]]);
}

#[tokio::test]
async fn remote_embeddings_are_sorted_by_index() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .and(header("authorization", "Bearer test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"embedding": [0.0, 1.0], "index": 1},
                {"embedding": [1.0, 0.0], "index": 0}
            ]
        })))
        .mount(&server)
        .await;

    let config = EmbeddingConfig {
        backend: "remote".to_string(),
        model: "text-embedding-3-small".to_string(),
        api_key: Some("test-key".to_string()),
        api_url: Some(format!("{}/v1/embeddings", server.uri())),
        timeout_secs: 5,
        ..EmbeddingConfig::default()
    };
    let embedder = EmbeddingManager::new(&config).unwrap();
    let vectors = embedder
        .embed_batch(&["a".to_string(), "b".to_string()])
        .await
        .unwrap();
    assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    assert_eq!(embedder.model_id(), "remote:text-embedding-3-small");
}

#[tokio::test]
async fn embedding_count_mismatch_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .mount(&server)
        .await;

    let config = EmbeddingConfig {
        backend: "remote".to_string(),
        api_key: Some("k".to_string()),
        api_url: Some(format!("{}/v1/embeddings", server.uri())),
        ..EmbeddingConfig::default()
    };
    let embedder = EmbeddingManager::new(&config).unwrap();
    assert!(matches!(
        embedder.embed("customers").await,
        Err(EmbeddingError::Response(_))
    ));
}
