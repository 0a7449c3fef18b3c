//! Integration tests for the HTTP backend using wiremock.

use std::sync::Arc;
use std::time::Duration;

use ollachat_llm::{
    BackendConfig, BackendError, BodyEvent, ChatBackend, ChatRequest, DocumentUploadReply,
    FileUpload, Frame, HttpBackend, ImageUploadReply, ModelCache, ModelCatalogSource,
    NdjsonDecoder,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use wiremock::matchers::{body_partial_json, body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn backend_for(server: &MockServer) -> HttpBackend {
    HttpBackend::new(BackendConfig {
        backend_url: server.uri(),
        ollama_url: server.uri(),
        request_timeout: Duration::from_secs(5),
    })
    .expect("client builds")
}

async fn collect_body(backend: &HttpBackend, request: ChatRequest) -> Vec<BodyEvent> {
    let handle = backend.open_chat(request).expect("stream opens");
    let mut stream = handle.stream;
    tokio::spawn(handle.worker);

    let mut events = Vec::new();
    while let Some(event) = stream.recv().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn chat_posts_request_and_forwards_ndjson_body() {
    let server = MockServer::start().await;
    let body = concat!(
        "{\"thinking\":\"Thinking...\"}\n",
        "{\"clear_thinking\":true}\n",
        "{\"response\":\"Hi\"}\n",
        "{\"response\":\"Hi there\"}\n",
    );

    Mock::given(method("POST"))
        .and(path("/chat"))
        .and(body_partial_json(serde_json::json!({
            "message": "Hello",
            "model": "deepseek-r1:7b",
            "isPdfChat": false,
            "chat_id": "chat-1",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend_for(&server);
    let events = collect_body(&backend, ChatRequest::new("chat-1", "deepseek-r1:7b", "Hello")).await;

    let mut decoder = NdjsonDecoder::new();
    let mut frames = Vec::new();
    for event in events {
        match event {
            BodyEvent::Chunk(chunk) => {
                frames.extend(decoder.push(&chunk).into_iter().map(Result::unwrap))
            }
            BodyEvent::Failed(reason) => panic!("unexpected failure: {reason}"),
        }
    }

    assert_eq!(
        frames,
        vec![
            Frame::Thinking("Thinking...".to_string()),
            Frame::ClearThinking,
            Frame::Response("Hi".to_string()),
            Frame::Response("Hi there".to_string()),
        ]
    );
}

#[tokio::test]
async fn chat_error_status_becomes_failure_event() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal server error"))
        .mount(&server)
        .await;

    let backend = backend_for(&server);
    let events = collect_body(&backend, ChatRequest::new("chat-1", "m", "Hello")).await;

    assert_eq!(events.len(), 1);
    match &events[0] {
        BodyEvent::Failed(reason) => assert!(reason.contains("500"), "got: {reason}"),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn chat_connection_refused_becomes_failure_event() {
    let backend = HttpBackend::new(BackendConfig {
        backend_url: "http://127.0.0.1:1".to_string(),
        ollama_url: "http://127.0.0.1:1".to_string(),
        request_timeout: Duration::from_secs(2),
    })
    .expect("client builds");

    let events = collect_body(&backend, ChatRequest::new("chat-1", "m", "Hello")).await;
    assert!(matches!(events.as_slice(), [BodyEvent::Failed(_)]));
}

#[tokio::test]
async fn chat_cancel_before_response_stops_worker() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("{\"response\":\"too late\"}\n")
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let backend = backend_for(&server);
    let handle = backend
        .open_chat(ChatRequest::new("chat-1", "m", "Hello"))
        .expect("stream opens");
    let mut stream = handle.stream;
    let worker = tokio::spawn(handle.worker);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(stream.cancel());

    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("worker stops after cancel")
        .expect("worker does not panic");
    assert_eq!(stream.recv().await, None);
}

/// Serves one chunked `/chat` response that sends a single line and then
/// keeps the body open. Reports when the client closes the connection.
async fn held_open_chat_server() -> (String, oneshot::Receiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("local addr");
    let (closed_tx, closed_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut request = vec![0_u8; 4096];
        let _ = socket.read(&mut request).await.expect("read request");

        let line = "{\"response\":\"Hi\"}\n";
        let head = "HTTP/1.1 200 OK\r\n\
            Content-Type: application/x-ndjson\r\n\
            Transfer-Encoding: chunked\r\n\r\n";
        let chunk = format!("{:x}\r\n{line}\r\n", line.len());
        socket.write_all(head.as_bytes()).await.expect("write head");
        socket.write_all(chunk.as_bytes()).await.expect("write chunk");
        socket.flush().await.expect("flush");

        let mut rest = [0_u8; 1024];
        loop {
            match socket.read(&mut rest).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
        let _ = closed_tx.send(());
    });

    (format!("http://{address}"), closed_rx)
}

#[tokio::test]
async fn chat_cancel_mid_body_stops_reading() {
    let (url, closed_rx) = held_open_chat_server().await;
    let backend = HttpBackend::new(BackendConfig {
        backend_url: url.clone(),
        ollama_url: url,
        request_timeout: Duration::from_secs(5),
    })
    .expect("client builds");

    let handle = backend
        .open_chat(ChatRequest::new("chat-1", "m", "Hello"))
        .expect("stream opens");
    let mut stream = handle.stream;
    let worker = tokio::spawn(handle.worker);

    let first = tokio::time::timeout(Duration::from_secs(5), stream.recv())
        .await
        .expect("first chunk arrives");
    match first {
        Some(BodyEvent::Chunk(chunk)) => assert_eq!(&chunk[..], b"{\"response\":\"Hi\"}\n"),
        other => panic!("expected a body chunk, got {other:?}"),
    }

    assert!(stream.cancel());
    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("worker stops after cancel")
        .expect("worker does not panic");
    assert_eq!(stream.recv().await, None);

    tokio::time::timeout(Duration::from_secs(5), closed_rx)
        .await
        .expect("connection is dropped after cancel")
        .expect("server reports closure");
}

#[tokio::test]
async fn document_upload_reads_chunk_count() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/upload"))
        .and(body_string_contains("name=\"file\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true,
            "message": "PDF procesado exitosamente",
            "filename": "paper.pdf",
            "num_chunks": 5,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend_for(&server);
    let reply = backend
        .upload_document(FileUpload::new("paper.pdf", "application/pdf", b"%PDF-1.4".to_vec()))
        .await
        .expect("upload succeeds");

    assert_eq!(
        reply,
        DocumentUploadReply::Accepted {
            filename: "paper.pdf".to_string(),
            num_chunks: 5,
        }
    );
}

#[tokio::test]
async fn document_rejection_is_read_from_error_status_body() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/upload"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "success": false,
            "error": "Tipo de archivo no permitido",
        })))
        .mount(&server)
        .await;

    let backend = backend_for(&server);
    let reply = backend
        .upload_document(FileUpload::new("notes.txt", "text/plain", b"hi".to_vec()))
        .await
        .expect("rejection is a reply, not an error");

    assert_eq!(
        reply,
        DocumentUploadReply::Rejected {
            error: "Tipo de archivo no permitido".to_string(),
        }
    );
}

#[tokio::test]
async fn image_upload_sends_chat_id() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/upload_image"))
        .and(body_string_contains("name=\"chat_id\""))
        .and(body_string_contains("chat-7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true,
            "message": "Image processed",
            "filename": "scan.png",
            "image_url": "/static/uploads/scan.png",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend_for(&server);
    let reply = backend
        .upload_image(
            FileUpload::new("scan.png", "image/png", vec![0x89, b'P', b'N', b'G']),
            "chat-7".to_string(),
        )
        .await
        .expect("upload succeeds");

    assert_eq!(
        reply,
        ImageUploadReply::Accepted {
            image_url: "/static/uploads/scan.png".to_string(),
            message: "Image processed".to_string(),
            filename: "scan.png".to_string(),
        }
    );
}

#[tokio::test]
async fn non_json_upload_failure_keeps_status() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/upload"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;

    let backend = backend_for(&server);
    let error = backend
        .upload_document(FileUpload::new("paper.pdf", "application/pdf", b"%PDF".to_vec()))
        .await
        .unwrap_err();

    assert!(matches!(error, BackendError::HttpStatus { status: 502, .. }));
}

#[tokio::test]
async fn model_listing_caches_and_falls_back() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "models": [
                {"name": "deepseek-r1:7b", "size": 4683087332_u64},
                {"name": "llama3:8b", "size": 4661224676_u64},
            ]
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let backend = HttpBackend::with_model_cache(
        BackendConfig {
            backend_url: server.uri(),
            ollama_url: server.uri(),
            request_timeout: Duration::from_secs(5),
        },
        Arc::new(ModelCache::new(Duration::ZERO)),
    )
    .expect("client builds");

    let first = backend.list_models().await.expect("listing succeeds");
    assert_eq!(first.source, ModelCatalogSource::Ollama);
    assert_eq!(first.models.len(), 2);
    assert_eq!(first.models[0].display_size(), "4 GB");

    let second = backend.list_models().await.expect("stale cache serves");
    assert_eq!(second.source, ModelCatalogSource::CacheStaleFallback);
    assert!(second.contains("llama3:8b"));
    assert!(second.warning.is_some());
}

#[tokio::test]
async fn model_listing_without_cache_uses_static_defaults() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(503).set_body_string("service unavailable"))
        .mount(&server)
        .await;

    let backend = backend_for(&server);
    let catalog = backend.list_models().await.expect("fallback serves");

    assert_eq!(catalog.source, ModelCatalogSource::StaticFallback);
    assert!(catalog.contains("deepseek-r1:7b"));
}

#[tokio::test]
async fn health_probe_reads_status() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "healthy",
            "message": "Servidor en funcionamiento",
            "timestamp": 1_700_000_000.5,
        })))
        .mount(&server)
        .await;

    let backend = backend_for(&server);
    let health = backend.health().await.expect("probe succeeds");
    assert!(health.is_healthy());
}
