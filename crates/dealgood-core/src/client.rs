use crate::config::{Backend, Experiment};
use crate::outcome::{Outcome, OutcomeClass, TransportErrorKind};
use crate::request::Request;
use chrono::Utc;
use reqwest::header::{HeaderValue, HOST};
use reqwest::redirect::Policy;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{field, info_span, Instrument};

/// What a backend call produced, before timing and cancellation are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallResult {
    pub class: OutcomeClass,
    pub bytes: Option<u64>,
}

pub type CallFuture<'a> = Pin<Box<dyn Future<Output = CallResult> + Send + 'a>>;

/// Adapter that performs one request against one backend.
pub trait BackendClient: Send + Sync {
    fn name(&self) -> &'static str;

    fn call<'a>(&'a self, backend: &'a Backend, request: &'a Request) -> CallFuture<'a>;
}

/// Run one call to completion and turn it into exactly one [`Outcome`].
///
/// The call is raced against `call_timeout` and `cancel`; losing either race
/// drops the in-flight request.
pub async fn invoke(
    client: &dyn BackendClient,
    backend: &Backend,
    request: &Request,
    call_timeout: Duration,
    cancel: &CancellationToken,
) -> Outcome {
    let span = info_span!(
        "backend_call",
        backend = %backend.name,
        method = %request.method,
        uri = %request.uri,
        outcome = field::Empty,
        status = field::Empty,
    );

    let started_at = Utc::now();
    let start = Instant::now();

    let result = async {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => CallResult { class: OutcomeClass::Cancelled, bytes: None },
            res = timeout(call_timeout, client.call(backend, request)) => match res {
                Ok(res) => res,
                Err(_) => CallResult {
                    class: OutcomeClass::Transport { kind: TransportErrorKind::Timeout },
                    bytes: None,
                },
            },
        }
    }
    .instrument(span.clone())
    .await;

    span.record("outcome", result.class.label());
    if let Some(status) = result.class.status() {
        span.record("status", status);
    }

    Outcome {
        backend: Arc::from(backend.name.as_str()),
        method: Arc::from(request.method.as_str()),
        uri: Arc::from(request.path_and_query().as_str()),
        started_at,
        latency: start.elapsed(),
        class: result.class,
        bytes: result.bytes,
    }
}

/// reqwest based client shared by every backend of a run.
pub struct HttpBackendClient {
    client: reqwest::Client,
}

impl HttpBackendClient {
    pub fn new(call_timeout: Duration, max_idle_per_host: usize) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .timeout(call_timeout)
            .pool_max_idle_per_host(max_idle_per_host)
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }

    pub fn for_experiment(experiment: &Experiment) -> Result<Self, reqwest::Error> {
        Self::new(experiment.timeout(), experiment.concurrency())
    }

    async fn execute(&self, backend: &Backend, request: &Request) -> CallResult {
        let url = request.target_url(&backend.base_url);
        let mut headers = request.headers.clone();
        // A forced backend host beats the one carried by the request.
        if let Some(host) = backend.host.as_deref().or(request.host.as_deref()) {
            match HeaderValue::from_str(host) {
                Ok(value) => {
                    headers.insert(HOST, value);
                }
                Err(_) => {
                    return CallResult {
                        class: OutcomeClass::Transport {
                            kind: TransportErrorKind::Other,
                        },
                        bytes: None,
                    }
                }
            }
        }

        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .headers(headers);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => return transport_failure(&e),
        };

        let status = response.status().as_u16();
        match response.bytes().await {
            Ok(body) => CallResult {
                class: OutcomeClass::from_status(status),
                bytes: Some(body.len() as u64),
            },
            Err(e) => transport_failure(&e),
        }
    }
}

fn transport_failure(e: &reqwest::Error) -> CallResult {
    let kind = if e.is_timeout() {
        TransportErrorKind::Timeout
    } else if e.is_connect() {
        TransportErrorKind::Connect
    } else {
        TransportErrorKind::Other
    };
    CallResult {
        class: OutcomeClass::Transport { kind },
        bytes: None,
    }
}

impl BackendClient for HttpBackendClient {
    fn name(&self) -> &'static str {
        "http"
    }

    fn call<'a>(&'a self, backend: &'a Backend, request: &'a Request) -> CallFuture<'a> {
        Box::pin(self.execute(backend, request))
    }
}

/// Scripted response of a simulated backend.
#[derive(Debug, Clone, Copy)]
pub struct MockBehavior {
    pub latency: Duration,
    pub class: OutcomeClass,
    pub bytes: Option<u64>,
}

impl MockBehavior {
    pub fn ok(latency: Duration) -> Self {
        Self {
            latency,
            class: OutcomeClass::Success { status: 200 },
            bytes: Some(0),
        }
    }

    pub fn status(latency: Duration, status: u16) -> Self {
        Self {
            latency,
            class: OutcomeClass::from_status(status),
            bytes: Some(0),
        }
    }

    pub fn refused() -> Self {
        Self {
            latency: Duration::ZERO,
            class: OutcomeClass::Transport {
                kind: TransportErrorKind::Connect,
            },
            bytes: None,
        }
    }
}

#[derive(Default)]
struct MockState {
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
    calls: HashMap<String, u64>,
}

/// Simulated backends: sleeps for the configured latency and answers with the
/// configured class. Tracks per-backend concurrency for inspection.
pub struct MockBackendClient {
    default: MockBehavior,
    per_backend: HashMap<String, MockBehavior>,
    state: Arc<Mutex<MockState>>,
}

impl MockBackendClient {
    pub fn new(default: MockBehavior) -> Self {
        Self {
            default,
            per_backend: HashMap::new(),
            state: Arc::default(),
        }
    }

    pub fn with_backend(mut self, name: impl Into<String>, behavior: MockBehavior) -> Self {
        self.per_backend.insert(name.into(), behavior);
        self
    }

    /// Calls started against `backend`, including ones still in flight.
    pub fn calls(&self, backend: &str) -> u64 {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.calls.get(backend).copied().unwrap_or(0)
    }

    /// Highest number of simultaneous calls seen against `backend`.
    pub fn max_in_flight(&self, backend: &str) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.max_in_flight.get(backend).copied().unwrap_or(0)
    }

    async fn simulate(&self, backend: &Backend) -> CallResult {
        let behavior = self
            .per_backend
            .get(&backend.name)
            .copied()
            .unwrap_or(self.default);

        let _guard = InFlightGuard::enter(self.state.clone(), &backend.name);
        if !behavior.latency.is_zero() {
            sleep(behavior.latency).await;
        }
        CallResult {
            class: behavior.class,
            bytes: behavior.bytes,
        }
    }
}

impl BackendClient for MockBackendClient {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn call<'a>(&'a self, backend: &'a Backend, _request: &'a Request) -> CallFuture<'a> {
        Box::pin(self.simulate(backend))
    }
}

/// Keeps the in-flight count right when a call is dropped by timeout or cancellation.
struct InFlightGuard {
    state: Arc<Mutex<MockState>>,
    backend: String,
}

impl InFlightGuard {
    fn enter(state: Arc<Mutex<MockState>>, backend: &str) -> Self {
        {
            let mut s = state.lock().unwrap_or_else(PoisonError::into_inner);
            *s.calls.entry(backend.to_string()).or_insert(0) += 1;
            let current = s.in_flight.entry(backend.to_string()).or_insert(0);
            *current += 1;
            let current = *current;
            let max = s.max_in_flight.entry(backend.to_string()).or_insert(0);
            *max = (*max).max(current);
        }
        Self {
            state,
            backend: backend.to_string(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut s = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(n) = s.in_flight.get_mut(&self.backend) {
            *n = n.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use reqwest::Method;
    use std::fmt;
    use tracing::field::{Field, Visit};
    use tracing::span::{Attributes, Id, Record};
    use tracing::Subscriber;
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
    use url::Url;

    fn backend(name: &str, url: &str) -> Backend {
        Backend::new(name, Url::parse(url).unwrap())
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn test_router() -> Router {
        Router::new()
            .route("/ok", get(|| async { "hello" }))
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
            .route("/boom", get(|| async { StatusCode::BAD_GATEWAY }))
            .route(
                "/redirect",
                get(|| async { (StatusCode::FOUND, [("location", "/ok")]) }),
            )
            .route(
                "/host",
                get(|headers: HeaderMap| async move {
                    headers
                        .get_all("host")
                        .iter()
                        .filter_map(|h| h.to_str().ok())
                        .collect::<Vec<_>>()
                        .join(",")
                }),
            )
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            )
    }

    async fn call_once(
        client: &HttpBackendClient,
        be: &Backend,
        req: &Request,
        call_timeout: Duration,
    ) -> Outcome {
        invoke(client, be, req, call_timeout, &CancellationToken::new()).await
    }

    #[tokio::test]
    async fn test_http_classification() {
        let base = serve(test_router()).await;
        let be = backend("local", &base);
        let client = HttpBackendClient::new(Duration::from_secs(2), 4).unwrap();
        let t = Duration::from_secs(2);

        let ok = call_once(&client, &be, &Request::get("/ok"), t).await;
        assert_eq!(ok.class, OutcomeClass::Success { status: 200 });
        assert_eq!(ok.bytes, Some(5));
        assert_eq!(&*ok.backend, "local");
        assert_eq!(&*ok.method, "GET");
        assert_eq!(&*ok.uri, "/ok");

        let redirect = call_once(&client, &be, &Request::get("/redirect"), t).await;
        assert_eq!(redirect.class, OutcomeClass::Success { status: 302 });

        let missing = call_once(&client, &be, &Request::get("/missing"), t).await;
        assert_eq!(missing.class, OutcomeClass::HttpError { status: 404 });

        let boom = call_once(&client, &be, &Request::get("/boom"), t).await;
        assert_eq!(boom.class, OutcomeClass::HttpError { status: 502 });

        let head = call_once(&client, &be, &Request::new(Method::HEAD, "/ok"), t).await;
        assert_eq!(head.class, OutcomeClass::Success { status: 200 });
        assert_eq!(head.bytes, Some(0));
    }

    #[tokio::test]
    async fn test_forced_backend_host_wins() {
        let base = serve(test_router()).await;
        let client = HttpBackendClient::new(Duration::from_secs(2), 4).unwrap();
        let t = Duration::from_secs(2);

        let mut be = backend("local", &base);
        be.host = Some("forced.example".into());

        let out = call_once(&client, &be, &Request::get("/host"), t).await;
        assert!(out.class.is_success());
        // "forced.example" is 14 bytes
        assert_eq!(out.bytes, Some(14));

        let req = Request::get("/host").with_host("req.example");
        let out = call_once(&client, &be, &req, t).await;
        assert_eq!(out.bytes, Some(14));

        // Without a forced host the request's own host is used.
        let plain = backend("plain", &base);
        let out = call_once(&client, &plain, &req, t).await;
        // "req.example" is 11 bytes
        assert_eq!(out.bytes, Some(11));
    }

    #[tokio::test]
    async fn test_host_header_is_replaced_not_duplicated() {
        let base = serve(test_router()).await;
        let client = HttpBackendClient::new(Duration::from_secs(2), 4).unwrap();
        let t = Duration::from_secs(2);

        let mut be = backend("local", &base);
        be.host = Some("forced.example".into());
        let req = Request::get("/host").with_header(
            HOST,
            HeaderValue::from_static("from-header.example"),
        );

        // A second Host value would come back as "from-header.example,forced.example".
        let out = call_once(&client, &be, &req, t).await;
        assert!(out.class.is_success());
        assert_eq!(out.bytes, Some(14));

        // With nothing forced, the header the request carries goes out alone.
        let plain = backend("plain", &base);
        let out = call_once(&client, &plain, &req, t).await;
        // "from-header.example" is 19 bytes
        assert_eq!(out.bytes, Some(19));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let be = backend("dead", &format!("http://{addr}"));
        let client = HttpBackendClient::new(Duration::from_secs(2), 4).unwrap();
        let out = call_once(&client, &be, &Request::get("/"), Duration::from_secs(2)).await;
        assert_eq!(
            out.class,
            OutcomeClass::Transport {
                kind: TransportErrorKind::Connect
            }
        );
        assert_eq!(out.bytes, None);
    }

    #[tokio::test]
    async fn test_timeout_is_transport_timeout() {
        let base = serve(test_router()).await;
        let be = backend("local", &base);
        let client = HttpBackendClient::new(Duration::from_secs(10), 4).unwrap();

        let start = Instant::now();
        let out = call_once(&client, &be, &Request::get("/slow"), Duration::from_millis(200)).await;
        assert_eq!(
            out.class,
            OutcomeClass::Transport {
                kind: TransportErrorKind::Timeout
            }
        );
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_cancel_during_send() {
        let base = serve(test_router()).await;
        let be = backend("local", &base);
        let client = HttpBackendClient::new(Duration::from_secs(10), 4).unwrap();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let req = Request::get("/slow");
        let out = invoke(&client, &be, &req, Duration::from_secs(10), &cancel).await;
        assert_eq!(out.class, OutcomeClass::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_tracks_concurrency() {
        let client = Arc::new(
            MockBackendClient::new(MockBehavior::ok(Duration::from_millis(50)))
                .with_backend("bad", MockBehavior::status(Duration::ZERO, 503)),
        );
        let good = backend("good", "http://good");
        let bad = backend("bad", "http://bad");
        let req = Request::get("/");
        let cancel = CancellationToken::new();
        let t = Duration::from_secs(1);

        let (a, b, c) = tokio::join!(
            invoke(client.as_ref(), &good, &req, t, &cancel),
            invoke(client.as_ref(), &good, &req, t, &cancel),
            invoke(client.as_ref(), &bad, &req, t, &cancel),
        );
        assert!(a.class.is_success());
        assert!(a.latency >= Duration::from_millis(50) && a.latency < Duration::from_millis(60));
        assert!(b.class.is_success());
        assert_eq!(c.class, OutcomeClass::HttpError { status: 503 });

        assert_eq!(client.calls("good"), 2);
        assert_eq!(client.max_in_flight("good"), 2);
        assert_eq!(client.calls("bad"), 1);
    }

    /// Collects every field recorded on `backend_call` spans.
    #[derive(Clone, Default)]
    struct SpanFields(Arc<Mutex<HashMap<String, String>>>);

    struct FieldVisitor<'a>(&'a mut HashMap<String, String>);

    impl Visit for FieldVisitor<'_> {
        fn record_str(&mut self, field: &Field, value: &str) {
            self.0.insert(field.name().to_string(), value.to_string());
        }

        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            self.0.insert(field.name().to_string(), format!("{value:?}"));
        }
    }

    impl<S: Subscriber> Layer<S> for SpanFields {
        fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
            if attrs.metadata().name() == "backend_call" {
                attrs.record(&mut FieldVisitor(&mut self.0.lock().unwrap()));
            }
        }

        fn on_record(&self, _id: &Id, values: &Record<'_>, _ctx: Context<'_, S>) {
            values.record(&mut FieldVisitor(&mut self.0.lock().unwrap()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_call_span_records_outcome() {
        let fields = SpanFields::default();
        let _guard = tracing::subscriber::set_default(
            tracing_subscriber::registry().with(fields.clone()),
        );

        let client = MockBackendClient::new(MockBehavior::status(Duration::from_millis(5), 503));
        let be = backend("gw-a", "http://gw-a");
        let out = invoke(
            &client,
            &be,
            &Request::get("/ipfs/bafkqaaa"),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(out.class, OutcomeClass::HttpError { status: 503 });

        let recorded = fields.0.lock().unwrap().clone();
        assert_eq!(recorded.get("backend").map(String::as_str), Some("gw-a"));
        assert_eq!(recorded.get("method").map(String::as_str), Some("GET"));
        assert_eq!(recorded.get("uri").map(String::as_str), Some("/ipfs/bafkqaaa"));
        assert_eq!(recorded.get("outcome").map(String::as_str), Some("http_error"));
        assert_eq!(recorded.get("status").map(String::as_str), Some("503"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_timeout_releases_in_flight() {
        let client = MockBackendClient::new(MockBehavior::ok(Duration::from_secs(60)));
        let be = backend("slow", "http://slow");
        let out = invoke(
            &client,
            &be,
            &Request::get("/"),
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .await;
        assert!(out.latency >= Duration::from_millis(100) && out.latency < Duration::from_millis(110));
        assert_eq!(
            out.class,
            OutcomeClass::Transport {
                kind: TransportErrorKind::Timeout
            }
        );
        // A second call may start: the timed-out one no longer counts as in flight.
        let _ = invoke(
            &client,
            &be,
            &Request::get("/"),
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(client.max_in_flight("slow"), 1);
    }
}
