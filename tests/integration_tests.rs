use accesslog::{
    fields::FieldRegistry, DiagnosticStream, FieldValue, LogRecord, RecordLevel, RecordSink,
    RemoteAddr, RequestInfo, RequestLoggerConfig, RequestLoggerLayer, ResponseObserver,
};
use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    http::{header::USER_AGENT, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use futures::stream;
use http_body_util::BodyExt;
use std::{
    convert::Infallible,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::{sleep, Instant};
use tower::{service_fn, Layer, ServiceExt};

/// Test sink that collects all records for verification
#[derive(Debug, Clone, Default)]
struct TestSink {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl TestSink {
    fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap().clone()
    }

    fn access_records(&self) -> Vec<LogRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.level == RecordLevel::Info)
            .collect()
    }

    async fn wait_for_records(&self, expected_count: usize, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.records.lock().unwrap().len() >= expected_count {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

impl RecordSink for TestSink {
    fn emit(&self, record: LogRecord) {
        self.records.lock().unwrap().push(record);
    }
}

/// Diagnostic stream that keeps what was written
#[derive(Clone, Default)]
struct CapturedStream(Arc<Mutex<Vec<u8>>>);

impl io::Write for CapturedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CapturedStream {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

// Test server handlers
async fn hello_handler() -> impl IntoResponse {
    "Hello, World!"
}

async fn echo_handler(body: Bytes) -> impl IntoResponse {
    format!("Echo: {}", String::from_utf8_lossy(&body))
}

async fn created_handler() -> impl IntoResponse {
    (StatusCode::CREATED, "created")
}

async fn empty_handler() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

async fn streaming_handler() -> impl IntoResponse {
    let stream = stream::iter(vec![
        Ok::<_, Infallible>(Bytes::from("chunk1")),
        Ok(Bytes::from("chunk22")),
        Ok(Bytes::from("chunk333")),
    ]);

    Response::builder()
        .header("content-type", "text/plain")
        .body(Body::from_stream(stream))
        .unwrap()
}

async fn panic_handler() -> &'static str {
    panic!("handler exploded")
}

#[inline(never)]
fn reserve_inventory(quantity: u32) -> u32 {
    if quantity > 0 {
        panic!("inventory exhausted");
    }
    quantity
}

async fn reserve_handler() -> String {
    format!("reserved {}", reserve_inventory(std::hint::black_box(3)))
}

fn quiet_config() -> (RequestLoggerConfig, CapturedStream) {
    let stream = CapturedStream::default();
    let config = RequestLoggerConfig {
        diagnostics: DiagnosticStream::new(stream.clone()),
        ..Default::default()
    };
    (config, stream)
}

fn create_test_app(sink: TestSink, config: RequestLoggerConfig) -> Router {
    Router::new()
        .route("/hello", get(hello_handler))
        .route("/echo", post(echo_handler))
        .route("/created", get(created_handler))
        .route("/empty", get(empty_handler))
        .route("/streaming", get(streaming_handler))
        .route("/panic", get(panic_handler))
        .route("/reserve", get(reserve_handler))
        .layer(RequestLoggerLayer::new(config, sink))
}

fn field<'a>(record: &'a LogRecord, name: &str) -> &'a FieldValue {
    record
        .field(name)
        .unwrap_or_else(|| panic!("record has no {name} field: {record:?}"))
}

#[tokio::test]
async fn test_basic_request_response() {
    let sink = TestSink::default();
    let (config, _) = quiet_config();
    let server = axum_test::TestServer::new(create_test_app(sink.clone(), config)).unwrap();

    let response = server
        .get("/hello")
        .add_header(USER_AGENT, HeaderValue::from_static("integration-test/1.0"))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.text(), "Hello, World!");

    assert!(sink.wait_for_records(1, Duration::from_secs(1)).await);
    sleep(Duration::from_millis(50)).await;

    let records = sink.records();
    assert_eq!(records.len(), 1);

    let record = &records[0];
    assert_eq!(record.level, RecordLevel::Info);
    assert_eq!(record.message, "incoming_request");
    assert_eq!(field(record, "type"), &FieldValue::from("access"));
    assert_eq!(field(record, "url"), &FieldValue::from("/hello"));
    assert_eq!(field(record, "method"), &FieldValue::from("GET"));
    assert_eq!(field(record, "proto"), &FieldValue::from("HTTP/1.1"));
    assert_eq!(
        field(record, "user_agent"),
        &FieldValue::from("integration-test/1.0")
    );
    assert_eq!(field(record, "status"), &FieldValue::Int(200));
    assert_eq!(field(record, "bytes_out"), &FieldValue::Int(13));
    assert!(field(record, "latency").as_str().unwrap().ends_with('s'));
}

#[tokio::test]
async fn test_custom_field_on_every_record() {
    let sink = TestSink::default();
    let (config, _) = quiet_config();
    let config = RequestLoggerConfig {
        fields: FieldRegistry::default()
            .with("shard_id", |_: &ResponseObserver, _: &RequestInfo| "A"),
        ..config
    };
    let server = axum_test::TestServer::new(create_test_app(sink.clone(), config)).unwrap();

    server.get("/hello").await;
    server.get("/created").await;
    server.get("/panic").await;

    assert!(sink.wait_for_records(3, Duration::from_secs(1)).await);
    let records = sink.access_records();
    assert_eq!(records.len(), 3);
    for record in &records {
        assert_eq!(field(record, "shard_id"), &FieldValue::from("A"));
    }
}

#[tokio::test]
async fn test_handler_panic_prints_stack_to_diagnostics() {
    let sink = TestSink::default();
    let (config, stream) = quiet_config();
    let server = axum_test::TestServer::new(create_test_app(sink.clone(), config)).unwrap();

    let response = server.get("/panic").await;
    assert_eq!(response.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.text(), "Internal Server Error");

    assert!(sink.wait_for_records(1, Duration::from_secs(1)).await);
    sleep(Duration::from_millis(50)).await;

    // The stack trace goes to the side channel, not through the sink.
    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(field(&records[0], "status"), &FieldValue::Int(500));
    assert_eq!(
        field(&records[0], "bytes_out"),
        &FieldValue::Int("Internal Server Error".len() as i64)
    );
    assert!(stream.contents().starts_with("panic: handler exploded\n"));

    // The server keeps serving after a panic.
    let response = server.get("/hello").await;
    assert_eq!(response.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn test_handler_panic_emits_error_record() {
    let sink = TestSink::default();
    let (config, stream) = quiet_config();
    let config = RequestLoggerConfig {
        print_stack_trace_on_panic: false,
        ..config
    };
    let server = axum_test::TestServer::new(create_test_app(sink.clone(), config)).unwrap();

    let response = server.get("/panic").await;
    assert_eq!(response.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.text(), "Internal Server Error");

    assert!(sink.wait_for_records(2, Duration::from_secs(1)).await);
    let records = sink.records();
    assert_eq!(records.len(), 2);

    let diagnostic = &records[0];
    assert_eq!(diagnostic.level, RecordLevel::Error);
    assert_eq!(diagnostic.message, "log system error");
    assert_eq!(field(diagnostic, "type"), &FieldValue::from("error"));
    assert_eq!(
        field(diagnostic, "recover_info"),
        &FieldValue::from("handler exploded")
    );
    assert!(!field(diagnostic, "debug_stack").as_str().unwrap().is_empty());

    let access = &records[1];
    assert_eq!(access.level, RecordLevel::Info);
    assert_eq!(field(access, "type"), &FieldValue::from("access"));
    assert_eq!(field(access, "status"), &FieldValue::Int(500));

    assert!(stream.contents().is_empty());
}

#[tokio::test]
async fn test_panic_stack_names_the_failing_function() {
    let sink = TestSink::default();
    let (config, _) = quiet_config();
    let config = RequestLoggerConfig {
        print_stack_trace_on_panic: false,
        ..config
    };
    let server = axum_test::TestServer::new(create_test_app(sink.clone(), config)).unwrap();

    let response = server.get("/reserve").await;
    assert_eq!(response.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

    assert!(sink.wait_for_records(2, Duration::from_secs(1)).await);
    let diagnostic = &sink.records()[0];
    assert_eq!(
        field(diagnostic, "recover_info"),
        &FieldValue::from("inventory exhausted")
    );
    let stack = field(diagnostic, "debug_stack").as_str().unwrap();
    assert!(stack.contains("reserve_inventory"), "{stack}");
    let location = field(diagnostic, "panic_location").as_str().unwrap();
    assert!(location.contains("integration_tests.rs"), "{location}");
}

#[tokio::test]
async fn test_panic_location_is_written_to_diagnostics() {
    let sink = TestSink::default();
    let (config, stream) = quiet_config();
    let server = axum_test::TestServer::new(create_test_app(sink.clone(), config)).unwrap();

    server.get("/reserve").await;
    assert!(sink.wait_for_records(1, Duration::from_secs(1)).await);

    let written = stream.contents();
    assert!(written.starts_with("panic: inventory exhausted\nat "), "{written}");
    assert!(written.contains("reserve_inventory"));
}

#[tokio::test]
async fn test_registered_latency_does_not_replace_measured_latency() {
    let sink = TestSink::default();
    let (config, _) = quiet_config();
    let config = RequestLoggerConfig {
        fields: FieldRegistry::default()
            .with("latency", |_: &ResponseObserver, _: &RequestInfo| true),
        ..config
    };
    let server = axum_test::TestServer::new(create_test_app(sink.clone(), config)).unwrap();

    server.get("/hello").await;
    assert!(sink.wait_for_records(1, Duration::from_secs(1)).await);

    let record = &sink.access_records()[0];
    match field(record, "latency") {
        FieldValue::Str(latency) => assert!(latency.ends_with('s'), "{latency}"),
        other => panic!("latency was replaced by {other:?}"),
    }
}

#[tokio::test]
async fn test_streaming_bytes_out_is_exact() {
    let sink = TestSink::default();
    let (config, _) = quiet_config();
    let server = axum_test::TestServer::new(create_test_app(sink.clone(), config)).unwrap();

    let response = server.get("/streaming").await;
    assert_eq!(response.text(), "chunk1chunk22chunk333");

    assert!(sink.wait_for_records(1, Duration::from_secs(1)).await);
    let records = sink.records();
    assert_eq!(field(&records[0], "bytes_out"), &FieldValue::Int(6 + 7 + 8));
}

#[tokio::test]
async fn test_status_is_reported() {
    let sink = TestSink::default();
    let (config, _) = quiet_config();
    let server = axum_test::TestServer::new(create_test_app(sink.clone(), config)).unwrap();

    server.get("/created").await;
    assert!(sink.wait_for_records(1, Duration::from_secs(1)).await);
    server.get("/empty").await;
    assert!(sink.wait_for_records(2, Duration::from_secs(1)).await);

    let records = sink.records();
    assert_eq!(field(&records[0], "status"), &FieldValue::Int(201));
    assert_eq!(field(&records[0], "bytes_out"), &FieldValue::Int(7));
    assert_eq!(field(&records[1], "status"), &FieldValue::Int(204));
    assert_eq!(field(&records[1], "bytes_out"), &FieldValue::Int(0));
}

#[tokio::test]
async fn test_remote_ip_and_bytes_in() {
    let sink = TestSink::default();
    let (config, _) = quiet_config();
    let app = create_test_app(sink.clone(), config);

    let mut request = axum::http::Request::builder()
        .method("POST")
        .uri("/echo")
        .header("content-length", "11")
        .body(Body::from("hello there"))
        .unwrap();
    request
        .extensions_mut()
        .insert(RemoteAddr("203.0.113.5:54321".to_string()));

    let response = app.clone().oneshot(request).await.unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, "Echo: hello there");

    let mut request = axum::http::Request::builder().uri("/hello").body(Body::empty()).unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([198, 51, 100, 20], 443))));
    let response = app.clone().oneshot(request).await.unwrap();
    drop(response);

    let mut request = axum::http::Request::builder().uri("/hello").body(Body::empty()).unwrap();
    request
        .extensions_mut()
        .insert(RemoteAddr("not:a:valid:address".to_string()));
    let response = app.oneshot(request).await.unwrap();
    drop(response);

    let records = sink.records();
    assert_eq!(records.len(), 3);
    assert_eq!(field(&records[0], "remote_ip"), &FieldValue::from("203.0.113.5"));
    assert_eq!(field(&records[0], "bytes_in"), &FieldValue::from("11"));
    assert_eq!(field(&records[0], "method"), &FieldValue::from("POST"));
    assert_eq!(field(&records[1], "remote_ip"), &FieldValue::from("198.51.100.20"));
    assert_eq!(field(&records[1], "bytes_in"), &FieldValue::from(""));
    assert_eq!(
        field(&records[2], "remote_ip"),
        &FieldValue::from("not:a:valid:address")
    );
}

#[tokio::test]
async fn test_identical_requests_give_identical_records() {
    let (config, _) = quiet_config();
    let first = TestSink::default();
    let second = TestSink::default();

    for sink in [&first, &second] {
        let app = create_test_app(sink.clone(), config.clone());
        let mut request = axum::http::Request::builder()
            .uri("/created")
            .header("user-agent", "twin")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(RemoteAddr("192.0.2.1:1000".to_string()));
        let response = app.oneshot(request).await.unwrap();
        response.into_body().collect().await.unwrap();
    }

    let mut a = first.records().remove(0);
    let mut b = second.records().remove(0);
    assert!(a.fields.remove("latency").is_some());
    assert!(b.fields.remove("latency").is_some());
    assert_eq!(a.fields, b.fields);
    assert_eq!(a.message, b.message);
    assert_eq!(a.level, b.level);
}

#[tokio::test]
async fn test_request_id_correlates_panic_and_access_records() {
    let sink = TestSink::default();
    let (config, _) = quiet_config();
    let config = RequestLoggerConfig {
        print_stack_trace_on_panic: false,
        include_request_id: true,
        ..config
    };
    let server = axum_test::TestServer::new(create_test_app(sink.clone(), config)).unwrap();

    server.get("/panic").await;
    assert!(sink.wait_for_records(2, Duration::from_secs(1)).await);
    server.get("/hello").await;
    assert!(sink.wait_for_records(3, Duration::from_secs(1)).await);

    let records = sink.records();
    let panic_id = field(&records[0], "request_id");
    assert_eq!(field(&records[1], "request_id"), panic_id);
    assert_ne!(field(&records[2], "request_id"), panic_id);
}

#[tokio::test]
async fn test_multiple_concurrent_requests() {
    let sink = TestSink::default();
    let (config, _) = quiet_config();
    let server = Arc::new(axum_test::TestServer::new(create_test_app(sink.clone(), config)).unwrap());

    use futures::future::join_all;

    let futures: Vec<_> = (0..5)
        .map(|i| {
            let server = server.clone();
            async move { server.post("/echo").text(format!("Request {i}")).await }
        })
        .collect();

    let responses = join_all(futures).await;
    for (i, response) in responses.iter().enumerate() {
        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.text(), format!("Echo: Request {i}"));
    }

    assert!(sink.wait_for_records(5, Duration::from_secs(2)).await);
    sleep(Duration::from_millis(50)).await;

    let records = sink.records();
    assert_eq!(records.len(), 5);
    for record in &records {
        assert_eq!(field(record, "url"), &FieldValue::from("/echo"));
        assert_eq!(field(record, "status"), &FieldValue::Int(200));
        assert_eq!(field(record, "bytes_out"), &FieldValue::Int(15));
    }
}

#[tokio::test]
async fn test_inner_service_error_passes_through() {
    let sink = TestSink::default();
    let (config, _) = quiet_config();
    let layer = RequestLoggerLayer::new(config, sink.clone());

    let failing = service_fn(|_request: Request| async {
        Err::<Response, _>(io::Error::other("upstream unavailable"))
    });
    let result = layer
        .layer(failing)
        .oneshot(axum::http::Request::builder().uri("/proxy").body(Body::empty()).unwrap())
        .await;

    assert_eq!(result.unwrap_err().to_string(), "upstream unavailable");
    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(field(&records[0], "status"), &FieldValue::Int(0));
    assert_eq!(field(&records[0], "url"), &FieldValue::from("/proxy"));
}

#[tokio::test]
async fn test_panic_while_building_future_is_recovered() {
    let sink = TestSink::default();
    let (config, stream) = quiet_config();
    let layer = RequestLoggerLayer::new(config, sink.clone());

    let exploding = service_fn(
        |_request: Request| -> std::future::Ready<Result<Response, Infallible>> {
            panic!("refused to build future")
        },
    );
    let response = layer
        .layer(exploding)
        .oneshot(axum::http::Request::builder().uri("/sync").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, "Internal Server Error");

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(field(&records[0], "status"), &FieldValue::Int(500));
    assert!(stream.contents().contains("refused to build future"));
}
