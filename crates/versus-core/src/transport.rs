use futures_util::{SinkExt, StreamExt};
use reqwest::header::CONTENT_TYPE;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid endpoint {endpoint}: {source}")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported transport: {0}")]
    UnsupportedScheme(String),

    #[error("transport is not modal: {0}")]
    NotModal(String),

    #[error("invalid mode for {transport} transport: {mode}")]
    InvalidMode {
        transport: &'static str,
        mode: String,
    },

    #[error("failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error(transparent)]
    Http(reqwest::Error),

    #[error("bad status code: {code}")]
    Status { code: u16, body: Vec<u8> },

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connection closed by peer")]
    Closed,
}

impl TransportError {
    /// Diagnostic body that came back alongside the error, if any.
    pub fn body(&self) -> Option<&[u8]> {
        match self {
            TransportError::Status { body, .. } => Some(body),
            _ => None,
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            return TransportError::Timeout(timeout);
        }
        // The URL differs per endpoint and would make equal failures compare unequal.
        TransportError::Http(err.without_url())
    }
}

pub type SendFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<u8>, TransportError>> + Send + 'a>>;

pub type ConnectFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Box<dyn Transport>, TransportError>> + Send + 'a>>;

/// One request/response exchange of opaque bytes.
///
/// Every worker owns its own instance, so implementations need not be
/// re-entrant. Implementations enforce their own per-exchange timeout.
pub trait Transport: Send {
    fn name(&self) -> &'static str;

    fn send<'a>(&'a mut self, payload: &'a [u8]) -> SendFuture<'a>;

    /// Lowest latency observed so far, when the transport tracks it.
    fn min_latency(&self) -> Option<Duration> {
        None
    }
}

/// A transport that can interpret payloads in more than one way, selected by
/// a `scheme+mode` endpoint such as `https+get://host/path`.
pub trait Modal {
    fn set_mode(&mut self, mode: &str) -> Result<(), TransportError>;
}

/// Builds the per-worker transports of a pool.
pub trait TransportFactory: Send + Sync {
    fn connect<'a>(&'a self, endpoint: &'a str, timeout: Duration) -> ConnectFuture<'a>;
}

/// Factory that dispatches on the endpoint's URI scheme.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFactory;

impl TransportFactory for DefaultFactory {
    fn connect<'a>(&'a self, endpoint: &'a str, timeout: Duration) -> ConnectFuture<'a> {
        Box::pin(connect(endpoint, timeout))
    }
}

/// Split `scheme+mode://rest` into a URL carrying the bare scheme and the mode.
pub fn parse_endpoint(endpoint: &str) -> Result<(Url, Option<String>), TransportError> {
    let invalid = |source| TransportError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        source,
    };

    let raw = Url::parse(endpoint).map_err(invalid)?;
    let Some((scheme, mode)) = raw.scheme().split_once('+') else {
        return Ok((raw, None));
    };

    // Url::set_scheme refuses to switch between special and non-special
    // schemes, so rebuild from the string instead.
    let rest = &endpoint[raw.scheme().len()..];
    let url = Url::parse(&format!("{scheme}{rest}")).map_err(invalid)?;
    Ok((url, Some(mode.to_string())))
}

/// Check that a transport exists for the endpoint without connecting.
pub fn validate_endpoint(endpoint: &str) -> Result<(), TransportError> {
    let (url, mode) = parse_endpoint(endpoint)?;
    match url.scheme() {
        "http" | "https" => {
            if let Some(mode) = mode {
                HttpTransport::new(url, Duration::from_secs(1))?.set_mode(&mode)?;
            }
            Ok(())
        }
        "ws" | "wss" | "noop" => match mode {
            Some(_) => Err(TransportError::NotModal(url.scheme().to_string())),
            None => Ok(()),
        },
        other => Err(TransportError::UnsupportedScheme(other.to_string())),
    }
}

/// Create a transport for `endpoint`, e.g. `http://host/rpc`,
/// `https+get://host/base/`, `wss://host/ws` or `noop://name`.
pub async fn connect(
    endpoint: &str,
    timeout: Duration,
) -> Result<Box<dyn Transport>, TransportError> {
    let (url, mode) = parse_endpoint(endpoint)?;
    match url.scheme() {
        "http" | "https" => {
            let mut t = HttpTransport::new(url, timeout)?;
            if let Some(mode) = mode {
                t.set_mode(&mode)?;
            }
            Ok(Box::new(t))
        }
        "ws" | "wss" => {
            if mode.is_some() {
                return Err(TransportError::NotModal(url.scheme().to_string()));
            }
            Ok(Box::new(WebSocketTransport::connect(url, timeout).await?))
        }
        "noop" => {
            if mode.is_some() {
                return Err(TransportError::NotModal(url.scheme().to_string()));
            }
            Ok(Box::new(NoopTransport))
        }
        other => Err(TransportError::UnsupportedScheme(other.to_string())),
    }
}

/// Join a payload onto a base path and clean the result the way GET mode
/// builds its URL: empty and `.` segments are dropped, `..` removes the
/// previous segment and never climbs above the root.
fn join_path(base: &str, tail: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in base.split('/').chain(tail.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }
    format!("/{}", segments.join("/"))
}

fn track_min(current: &mut Option<Duration>, elapsed: Duration) {
    match current {
        Some(min) if *min <= elapsed => {}
        _ => *current = Some(elapsed),
    }
}

#[derive(Debug, Clone)]
struct GetTarget {
    host: String,
    path: String,
}

/// HTTP transport: POSTs the payload as a JSON body, or in `get` mode appends
/// the payload to the endpoint path.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: Url,
    get: Option<GetTarget>,
    timeout: Duration,
    min_latency: Option<Duration>,
}

impl HttpTransport {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Connect {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            endpoint,
            get: None,
            timeout,
            min_latency: None,
        })
    }

    fn request_for(&self, payload: &[u8]) -> reqwest::RequestBuilder {
        match &self.get {
            Some(get) => {
                let tail = String::from_utf8_lossy(payload);
                let url = format!("{}{}", get.host, join_path(&get.path, &tail));
                self.client.get(url)
            }
            None => self
                .client
                .post(self.endpoint.clone())
                .header(CONTENT_TYPE, "application/json")
                .body(payload.to_vec()),
        }
    }
}

impl Modal for HttpTransport {
    fn set_mode(&mut self, mode: &str) -> Result<(), TransportError> {
        match mode.to_ascii_lowercase().as_str() {
            "post" => self.get = None,
            "get" => {
                let path = match self.endpoint.path() {
                    "" => "/".to_string(),
                    p => p.to_string(),
                };
                let host = self.endpoint[..url::Position::BeforePath].to_string();
                self.get = Some(GetTarget { host, path });
            }
            _ => {
                return Err(TransportError::InvalidMode {
                    transport: "http",
                    mode: mode.to_string(),
                })
            }
        }
        Ok(())
    }
}

impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    fn send<'a>(&'a mut self, payload: &'a [u8]) -> SendFuture<'a> {
        Box::pin(async move {
            let request = self.request_for(payload);
            let timeout = self.timeout;

            let start = Instant::now();
            let response = request
                .send()
                .await
                .map_err(|e| TransportError::from_reqwest(e, timeout))?;
            track_min(&mut self.min_latency, start.elapsed());

            let status = response.status();
            let body = response
                .bytes()
                .await
                .map_err(|e| TransportError::from_reqwest(e, timeout))?;

            if status.as_u16() >= 400 {
                return Err(TransportError::Status {
                    code: status.as_u16(),
                    body: body.to_vec(),
                });
            }
            Ok(body.to_vec())
        })
    }

    fn min_latency(&self) -> Option<Duration> {
        self.min_latency
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn open_ws(endpoint: &Url, timeout: Duration) -> Result<WsStream, TransportError> {
    let (stream, _) = tokio::time::timeout(timeout, connect_async(endpoint.as_str()))
        .await
        .map_err(|_| TransportError::Timeout(timeout))?
        .map_err(|e| TransportError::Connect {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;
    Ok(stream)
}

/// WebSocket transport: one message out, the next data frame back.
///
/// A failed or timed out exchange drops the connection, so a late reply can
/// never be read as the answer to the next payload. The next `send` dials
/// again.
pub struct WebSocketTransport {
    endpoint: Url,
    stream: Option<WsStream>,
    timeout: Duration,
    min_latency: Option<Duration>,
}

impl WebSocketTransport {
    pub async fn connect(endpoint: Url, timeout: Duration) -> Result<Self, TransportError> {
        let stream = open_ws(&endpoint, timeout).await?;
        Ok(Self {
            endpoint,
            stream: Some(stream),
            timeout,
            min_latency: None,
        })
    }

    async fn exchange(&mut self, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        if self.stream.is_none() {
            debug!(endpoint = %self.endpoint, "Reconnecting websocket");
            self.stream = Some(open_ws(&self.endpoint, self.timeout).await?);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(TransportError::Closed);
        };

        let msg = match std::str::from_utf8(payload) {
            Ok(text) => Message::Text(text.to_string()),
            Err(_) => Message::Binary(payload.to_vec()),
        };
        stream.send(msg).await?;

        while let Some(msg) = stream.next().await {
            match msg? {
                Message::Text(text) => return Ok(text.into_bytes()),
                Message::Binary(data) => return Ok(data),
                Message::Close(_) => return Err(TransportError::Closed),
                // Pongs to incoming pings are queued by tungstenite itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
        Err(TransportError::Closed)
    }
}

impl Transport for WebSocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn send<'a>(&'a mut self, payload: &'a [u8]) -> SendFuture<'a> {
        Box::pin(async move {
            let timeout = self.timeout;
            let start = Instant::now();
            let result = match tokio::time::timeout(timeout, self.exchange(payload)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(timeout)),
            };
            match result {
                Ok(body) => {
                    track_min(&mut self.min_latency, start.elapsed());
                    Ok(body)
                }
                Err(e) => {
                    self.stream = None;
                    Err(e)
                }
            }
        })
    }

    fn min_latency(&self) -> Option<Duration> {
        self.min_latency
    }
}

/// Answers every payload immediately with an empty body.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTransport;

impl Transport for NoopTransport {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn send<'a>(&'a mut self, _payload: &'a [u8]) -> SendFuture<'a> {
        Box::pin(async { Ok(Vec::new()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response per connection after `delay`.
    async fn spawn_http_server(delay: Duration, response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut tcp, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        match tcp.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => head.extend_from_slice(&buf[..n]),
                        }
                    }
                    tokio::time::sleep(delay).await;
                    let _ = tcp.write_all(response.as_bytes()).await;
                    let _ = tcp.shutdown().await;
                });
            }
        });
        format!("http+get://{addr}/api/")
    }

    /// Answer every text message with `reply-to-<text>`. The first connection
    /// waits `first_delay` before each reply, later connections answer at once.
    async fn spawn_ws_server(first_delay: Duration) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut delay = first_delay;
            while let Ok((tcp, _)) = listener.accept().await {
                let conn_delay = std::mem::take(&mut delay);
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
                        return;
                    };
                    while let Some(Ok(msg)) = ws.next().await {
                        if let Message::Text(text) = msg {
                            tokio::time::sleep(conn_delay).await;
                            let reply = Message::Text(format!("reply-to-{text}"));
                            if ws.send(reply).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });
        Url::parse(&format!("ws://{addr}/")).unwrap()
    }

    #[test]
    fn test_parse_endpoint_with_mode() {
        let (url, mode) = parse_endpoint("https+get://example.com/api/").unwrap();
        assert_eq!(url.scheme(), "https");
        assert_eq!(url.as_str(), "https://example.com/api/");
        assert_eq!(mode.as_deref(), Some("get"));

        let (url, mode) = parse_endpoint("http://localhost:8545").unwrap();
        assert_eq!(url.scheme(), "http");
        assert_eq!(mode, None);
    }

    #[test]
    fn test_parse_endpoint_invalid() {
        assert!(matches!(
            parse_endpoint("not a uri"),
            Err(TransportError::InvalidEndpoint { .. })
        ));
    }

    #[test]
    fn test_validate_endpoint() {
        assert!(validate_endpoint("noop://a").is_ok());
        assert!(validate_endpoint("http+post://localhost/").is_ok());
        assert!(matches!(
            validate_endpoint("ftp://example.com"),
            Err(TransportError::UnsupportedScheme(s)) if s == "ftp"
        ));
        assert!(matches!(
            validate_endpoint("noop+get://a"),
            Err(TransportError::NotModal(_))
        ));
        assert!(matches!(
            validate_endpoint("http+put://localhost/"),
            Err(TransportError::InvalidMode { .. })
        ));
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/", "eth_blockNumber"), "/eth_blockNumber");
        assert_eq!(join_path("/api/", "/v1/x"), "/api/v1/x");
        assert_eq!(join_path("/api", ""), "/api");
        assert_eq!(join_path("/", ""), "/");
    }

    #[test]
    fn test_join_path_cleans_segments() {
        assert_eq!(join_path("/", "a//b/"), "/a/b");
        assert_eq!(join_path("/base/", "./x/../y"), "/base/y");
        assert_eq!(join_path("/api/", "../x"), "/x");
        assert_eq!(join_path("/", "../../x"), "/x");
        assert_eq!(join_path("/api/v1/", ".."), "/api");
    }

    #[test]
    fn test_http_get_mode_builds_url() {
        let url = Url::parse("http://localhost:8080/base/").unwrap();
        let mut t = HttpTransport::new(url, Duration::from_secs(1)).unwrap();
        t.set_mode("GET").unwrap();

        let req = t.request_for(b"status?x=1").build().unwrap();
        assert_eq!(req.method(), reqwest::Method::GET);
        assert_eq!(req.url().as_str(), "http://localhost:8080/base/status?x=1");
    }

    #[test]
    fn test_http_post_mode_sends_body() {
        let url = Url::parse("http://localhost:8080/rpc").unwrap();
        let mut t = HttpTransport::new(url, Duration::from_secs(1)).unwrap();
        t.set_mode("post").unwrap();

        let req = t.request_for(br#"{"id":1}"#).build().unwrap();
        assert_eq!(req.method(), reqwest::Method::POST);
        assert_eq!(req.url().as_str(), "http://localhost:8080/rpc");
        assert_eq!(req.headers()[CONTENT_TYPE], "application/json");
    }

    #[test]
    fn test_status_error_carries_body() {
        let err = TransportError::Status {
            code: 503,
            body: b"busy".to_vec(),
        };
        assert_eq!(err.to_string(), "bad status code: 503");
        assert_eq!(err.body(), Some(&b"busy"[..]));
        assert_eq!(TransportError::Closed.body(), None);
    }

    #[tokio::test]
    async fn test_noop_transport() {
        let mut t = connect("noop://anything", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(t.name(), "noop");
        assert_eq!(t.send(b"payload").await.unwrap(), Vec::<u8>::new());
        assert_eq!(t.min_latency(), None);
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_scheme() {
        let err = connect("gopher://example.com", Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "unsupported transport: gopher");
    }

    #[tokio::test]
    async fn test_http_success_returns_body() {
        let endpoint = spawn_http_server(
            Duration::ZERO,
            "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
        )
        .await;
        let mut t = connect(&endpoint, Duration::from_secs(5)).await.unwrap();

        assert_eq!(t.name(), "http");
        assert_eq!(t.send(b"status").await.unwrap(), b"ok".to_vec());
        assert!(t.min_latency().is_some());
    }

    #[tokio::test]
    async fn test_http_error_status_keeps_body() {
        let endpoint = spawn_http_server(
            Duration::ZERO,
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 4\r\nConnection: close\r\n\r\nbusy",
        )
        .await;
        let mut t = connect(&endpoint, Duration::from_secs(5)).await.unwrap();

        let err = t.send(b"status").await.unwrap_err();
        assert!(matches!(err, TransportError::Status { code: 503, .. }));
        assert_eq!(err.body(), Some(&b"busy"[..]));
        assert_eq!(err.to_string(), "bad status code: 503");
    }

    #[tokio::test]
    async fn test_http_slow_response_times_out() {
        let endpoint = spawn_http_server(
            Duration::from_secs(2),
            "HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let timeout = Duration::from_millis(200);
        let mut t = connect(&endpoint, timeout).await.unwrap();

        let err = t.send(b"status").await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(d) if d == timeout));
        assert_eq!(err.to_string(), "timeout after 200ms");
        assert_eq!(t.min_latency(), None);
    }

    #[tokio::test]
    async fn test_websocket_echo() {
        let url = spawn_ws_server(Duration::ZERO).await;
        let mut t = connect(url.as_str(), Duration::from_secs(5)).await.unwrap();

        assert_eq!(t.name(), "websocket");
        assert_eq!(t.send(b"a").await.unwrap(), b"reply-to-a".to_vec());
        assert_eq!(t.send(b"b").await.unwrap(), b"reply-to-b".to_vec());
        assert!(t.min_latency().is_some());
    }

    #[tokio::test]
    async fn test_websocket_late_reply_not_matched_to_next_payload() {
        let url = spawn_ws_server(Duration::from_millis(300)).await;
        let timeout = Duration::from_millis(100);
        let mut t = WebSocketTransport::connect(url, timeout).await.unwrap();

        let err = t.send(b"a").await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(d) if d == timeout));
        assert!(t.stream.is_none());

        // Wait out the first connection's delayed reply.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(t.send(b"b").await.unwrap(), b"reply-to-b".to_vec());
    }

    #[tokio::test]
    async fn test_websocket_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = connect(&format!("ws://{addr}/"), Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
