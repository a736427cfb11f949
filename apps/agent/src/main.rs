use anyhow::Result;
use clap::Parser;
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use reqwest::{Client, redirect};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tunnel_common::{
    HttpRequest, HttpResponse, Message, SessionInfo, TunnelCodec, TunnelError,
    constants::{
        MAX_FRAME_SIZE_BYTES, OUTBOUND_QUEUE_CAPACITY, RECONNECT_MAX_DELAY_MS,
        RECONNECT_MIN_DELAY_MS, RECONNECT_MULTIPLIER,
    },
    current_timestamp_secs, headers_to_map,
};

type Tunnel = Framed<TcpStream, TunnelCodec>;

/// Request headers that describe the hop to the broker rather than the request
const HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// CLI arguments for the tunnel agent
#[derive(Parser, Debug)]
#[command(name = "tunnel-agent")]
#[command(about = "Expose a local HTTP service through a tunnel broker", long_about = None)]
#[command(version)]
struct Args {
    /// Local port to forward requests to
    #[arg(short, long, default_value = "8000")]
    port: u16,

    /// Local host address
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Broker tunnel address (host:port)
    #[arg(short, long, env = "TUNNEL_BROKER", default_value = "127.0.0.1:8080")]
    broker: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Connection timeout in seconds
    #[arg(long, default_value = "10")]
    connect_timeout: u64,

    /// Request timeout in seconds
    #[arg(long, default_value = "25")]
    request_timeout: u64,
}

/// Configuration for the agent
#[derive(Debug, Clone)]
pub struct Config {
    /// Local service address (e.g., "http://127.0.0.1:8000")
    pub local_address: String,

    /// Broker tunnel address
    pub broker_addr: String,

    /// Connection timeout, covering both the TCP connect and the session announcement
    pub connect_timeout: Duration,

    /// Request timeout when calling local service
    pub request_timeout: Duration,

    /// Largest tunnel frame accepted or produced
    pub max_frame_bytes: usize,

    /// Reconnection strategy
    pub reconnect_config: ReconnectConfig,
}

/// Reconnection configuration with exponential backoff
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl ReconnectConfig {
    /// Delay to use after `current`, capped at `max_delay`
    pub fn next_delay(&self, current: Duration) -> Duration {
        Duration::from_millis(
            ((current.as_millis() as f64 * self.multiplier).min(self.max_delay.as_millis() as f64))
                as u64,
        )
    }
}

impl Config {
    fn from_args(args: Args) -> Self {
        Self {
            local_address: format!("http://{}:{}", args.host, args.port),
            broker_addr: args.broker,
            connect_timeout: Duration::from_secs(args.connect_timeout),
            request_timeout: Duration::from_secs(args.request_timeout),
            max_frame_bytes: MAX_FRAME_SIZE_BYTES,
            reconnect_config: ReconnectConfig {
                min_delay: Duration::from_millis(RECONNECT_MIN_DELAY_MS),
                max_delay: Duration::from_millis(RECONNECT_MAX_DELAY_MS),
                multiplier: RECONNECT_MULTIPLIER,
            },
        }
    }
}

/// Connection manager handles the tunnel lifecycle and reconnection
pub struct ConnectionManager {
    config: Config,
    client: Client,
}

impl ConnectionManager {
    pub fn new(config: Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| TunnelError::HttpError(e.to_string()))?;

        Ok(Self { config, client })
    }

    /// Main run loop with automatic reconnection
    pub async fn run(&self) -> Result<()> {
        let mut reconnect_delay = self.config.reconnect_config.min_delay;
        let mut attempt = 0;

        loop {
            match self.establish_connection().await {
                Ok((tunnel, session)) => {
                    info!("Tunnel established: {}", session.public_url);
                    info!("  Session ID: {}", session.session_id);
                    info!(
                        "  Expires in: {}s",
                        session.remaining_secs(current_timestamp_secs())
                    );
                    reconnect_delay = self.config.reconnect_config.min_delay;
                    attempt = 0;

                    // Handle the connection until it drops
                    if let Err(e) = self.handle_connection(tunnel).await {
                        error!("Connection error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Failed to connect: {}", e);
                }
            }

            // Reconnection backoff
            attempt += 1;
            info!(
                "Reconnecting in {:?} (attempt {})",
                reconnect_delay, attempt
            );
            tokio::time::sleep(reconnect_delay).await;

            reconnect_delay = self.config.reconnect_config.next_delay(reconnect_delay);
        }
    }

    /// Open the tunnel and wait for the broker's session announcement
    async fn establish_connection(&self) -> Result<(Tunnel, SessionInfo)> {
        debug!("Connecting to {}", self.config.broker_addr);

        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(&self.config.broker_addr),
        )
        .await
        .map_err(|_| TunnelError::ConnectionError("Connection timeout".to_string()))??;
        stream.set_nodelay(true)?;

        let mut tunnel = Framed::new(stream, TunnelCodec::new(self.config.max_frame_bytes));
        debug!("TCP connection established, waiting for session announcement");

        let announcement = wait_for_session(&mut tunnel);
        let session = tokio::time::timeout(self.config.connect_timeout, announcement)
            .await
            .map_err(|_| {
                TunnelError::ConnectionError("Session announcement timeout".to_string())
            })??;

        Ok((tunnel, session))
    }

    /// Handle an active tunnel with split read/write tasks
    async fn handle_connection(&self, tunnel: Tunnel) -> Result<()> {
        let (write, read) = tunnel.split();

        // Single writer so concurrent responses never interleave on the socket
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);

        let mut write_handle = tokio::spawn(spawn_write_task(write, outgoing_rx));
        let mut read_handle = tokio::spawn(spawn_read_task(
            read,
            outgoing_tx,
            self.client.clone(),
            self.config.local_address.clone(),
            self.config.max_frame_bytes,
        ));

        // Wait for either task to complete (usually means connection dropped)
        tokio::select! {
            result = &mut write_handle => {
                warn!("Write task ended: {:?}", result);
                read_handle.abort();
            }
            result = &mut read_handle => {
                debug!("Read task ended: {:?}", result);
                write_handle.abort();
            }
        }

        Ok(())
    }
}

/// Wait for the `SessionEstablished` frame that opens every tunnel
async fn wait_for_session<S>(
    tunnel: &mut Framed<S, TunnelCodec>,
) -> std::result::Result<SessionInfo, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = tunnel.next().await {
        match Message::try_from(frame?)? {
            Message::SessionEstablished(session) => return Ok(session),
            other => {
                warn!("Ignoring {:?} frame received before session announcement", other.kind());
            }
        }
    }

    Err(TunnelError::ConnectionError(
        "Connection closed before handshake".to_string(),
    ))
}

/// Write task sends outgoing messages through the tunnel
async fn spawn_write_task<S>(
    mut write: SplitSink<Framed<S, TunnelCodec>, Message>,
    mut outgoing_rx: mpsc::Receiver<Message>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = outgoing_rx.recv().await {
        match write.send(message).await {
            Ok(()) => {}
            Err(e @ (TunnelError::FrameTooLarge(..) | TunnelError::SerializationError(_))) => {
                warn!("Dropping outbound message: {}", e);
            }
            Err(e) => {
                error!("Failed to send message: {}", e);
                break;
            }
        }
    }

    debug!("Write task exiting");
    Ok(())
}

/// Read task receives frames from the broker and dispatches them
async fn spawn_read_task<S>(
    mut read: SplitStream<Framed<S, TunnelCodec>>,
    outgoing_tx: mpsc::Sender<Message>,
    client: Client,
    local_address: String,
    max_frame_bytes: usize,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = read.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                error!("Tunnel protocol error: {}", e);
                return Err(e.into());
            }
        };

        match Message::try_from(frame) {
            Ok(Message::HttpRequest(request)) => {
                debug!("Received HTTP request: {} {}", request.method, request.uri);

                // Spawn a new task to handle this request concurrently
                let client = client.clone();
                let local_address = local_address.clone();
                let outgoing_tx = outgoing_tx.clone();

                tokio::spawn(async move {
                    if let Err(e) = handle_http_request(
                        request,
                        &client,
                        &local_address,
                        max_frame_bytes,
                        outgoing_tx,
                    )
                    .await
                    {
                        error!("Failed to handle request: {}", e);
                    }
                });
            }
            Ok(other) => {
                warn!("Received unexpected {:?} frame", other.kind());
            }
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
            }
        }
    }

    info!("Broker closed the tunnel");
    Ok(())
}

/// Handle HTTP request by forwarding to local service
async fn handle_http_request(
    request: HttpRequest,
    client: &Client,
    local_address: &str,
    max_frame_bytes: usize,
    outgoing_tx: mpsc::Sender<Message>,
) -> Result<()> {
    let start_time = Instant::now();
    let request_id = request.request_id.clone();

    let mut response = match forward_to_local(client, local_address, request).await {
        Ok(response) => response,
        Err(e) => {
            error!("Local service error: {}", e);
            local_error_response(&e)
        }
    };

    // Frame = kind byte + payload; an oversized answer becomes a 502 instead
    if response.encode_payload(&request_id)?.len() + 1 > max_frame_bytes {
        warn!("Response for {} exceeds the tunnel frame limit", request_id);
        response = HttpResponse::new(502).with_text_body("Response too large for tunnel");
    }

    debug!(
        "Response: {} ({}ms)",
        response.status_code,
        start_time.elapsed().as_millis()
    );

    outgoing_tx
        .send(Message::HttpResponse {
            request_id,
            response,
        })
        .await
        .map_err(|e| TunnelError::ConnectionError(e.to_string()))?;

    Ok(())
}

/// Replay a tunnelled request against the local service
async fn forward_to_local(
    client: &Client,
    local_address: &str,
    request: HttpRequest,
) -> std::result::Result<HttpResponse, TunnelError> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|_| {
        TunnelError::InvalidMessage(format!("Unsupported HTTP method: {}", request.method))
    })?;
    let url = format!("{}{}", local_address, request.uri);

    debug!("Forwarding: {} {}", method, url);

    let mut req_builder = client.request(method, &url);

    // Add headers
    for (name, value) in forwardable_headers(&request.headers) {
        req_builder = req_builder.header(name, value);
    }

    // Add body if present
    if request.has_body() {
        req_builder = req_builder.body(request.body);
    }

    let response = req_builder.send().await.map_err(|e| {
        if e.is_timeout() {
            TunnelError::Timeout
        } else {
            TunnelError::LocalServiceUnavailable(e.to_string())
        }
    })?;

    let status_code = response.status().as_u16();
    let headers = headers_to_map(response.headers());
    let body_bytes = response
        .bytes()
        .await
        .map_err(|e| TunnelError::HttpError(e.to_string()))?;

    let mut http_response = HttpResponse::new(status_code).with_body(&body_bytes);
    http_response.headers = headers;
    Ok(http_response)
}

/// Headers worth replaying locally; hop-by-hop headers are dropped
fn forwardable_headers(headers: &[(String, String)]) -> impl Iterator<Item = (&str, &str)> {
    headers
        .iter()
        .filter(|(name, _)| {
            !HOP_HEADERS
                .iter()
                .any(|hop| name.eq_ignore_ascii_case(hop))
        })
        .map(|(name, value)| (name.as_str(), value.as_str()))
}

/// Response sent back when the local service could not answer
fn local_error_response(e: &TunnelError) -> HttpResponse {
    let status_code = match e {
        TunnelError::InvalidMessage(_) => 400,
        TunnelError::Timeout => 504,
        TunnelError::LocalServiceUnavailable(_) => 503,
        _ => 502,
    };
    let mut response = HttpResponse::new(status_code).with_text_body(e.to_string());
    response
        .headers
        .insert("Content-Type".to_string(), vec!["text/plain".to_string()]);
    response
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    info!("Tunnel Agent v{}", env!("CARGO_PKG_VERSION"));
    info!("Local service: {}:{}", args.host, args.port);
    info!("Broker: {}", args.broker);

    // Build configuration
    let config = Config::from_args(args);

    // Create and run connection manager
    let manager = ConnectionManager::new(config)?;

    // Run until interrupted
    tokio::select! {
        result = manager.run() => {
            error!("Connection manager exited: {:?}", result);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down gracefully...");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_args() -> Args {
        Args::parse_from(["tunnel-agent"])
    }

    #[test]
    fn test_config_from_default_args() {
        let config = Config::from_args(default_args());
        assert_eq!(config.local_address, "http://127.0.0.1:8000");
        assert_eq!(config.broker_addr, "127.0.0.1:8080");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(25));
        assert_eq!(config.max_frame_bytes, MAX_FRAME_SIZE_BYTES);
    }

    #[test]
    fn test_config_from_args_overrides() {
        let args = Args::parse_from([
            "tunnel-agent",
            "--port",
            "9000",
            "--host",
            "localhost",
            "--broker",
            "broker.internal:7000",
            "--connect-timeout",
            "3",
            "--request-timeout",
            "12",
            "--verbose",
        ]);
        assert!(args.verbose);

        let config = Config::from_args(args);
        assert_eq!(config.local_address, "http://localhost:9000");
        assert_eq!(config.broker_addr, "broker.internal:7000");
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.request_timeout, Duration::from_secs(12));
    }

    #[test]
    fn test_reconnect_backoff_doubles_and_caps() {
        let reconnect = Config::from_args(default_args()).reconnect_config;
        assert_eq!(reconnect.min_delay, Duration::from_secs(1));

        let mut delay = reconnect.min_delay;
        let mut observed = vec![delay.as_secs()];
        for _ in 0..7 {
            delay = reconnect.next_delay(delay);
            observed.push(delay.as_secs());
        }
        assert_eq!(observed, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_forwardable_headers_drop_hop_headers() {
        let headers = vec![
            ("Host".to_string(), "broker:3000".to_string()),
            ("Content-Type".to_string(), "application/json".to_string()),
            ("Connection".to_string(), "keep-alive".to_string()),
            ("Content-Length".to_string(), "7".to_string()),
            ("X-Custom".to_string(), "1".to_string()),
        ];

        let kept: Vec<_> = forwardable_headers(&headers).collect();
        assert_eq!(
            kept,
            vec![("Content-Type", "application/json"), ("X-Custom", "1")]
        );
    }

    #[test]
    fn test_local_error_response_status() {
        let cases = vec![
            (TunnelError::InvalidMessage("bad".into()), 400),
            (TunnelError::Timeout, 504),
            (TunnelError::LocalServiceUnavailable("refused".into()), 503),
            (TunnelError::HttpError("reset".into()), 502),
        ];

        for (error, expected_status) in cases {
            let response = local_error_response(&error);
            assert_eq!(response.status_code, expected_status);
            assert!(!response.is_base64_encoded);
            assert_eq!(response.headers["Content-Type"], vec!["text/plain"]);
        }
    }

    #[tokio::test]
    async fn test_forward_to_unreachable_local_service() {
        let client = Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        let request = HttpRequest::new(
            "req1".to_string(),
            "GET".to_string(),
            "/health".to_string(),
        );

        // Bind then drop a listener to get a port nobody is serving
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = forward_to_local(&client, &format!("http://{}", addr), request).await;
        assert!(matches!(result, Err(TunnelError::LocalServiceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_wait_for_session() {
        let (client, server) = tokio::io::duplex(4096);
        let mut broker_side = Framed::new(server, TunnelCodec::default());
        let mut agent_side = Framed::new(client, TunnelCodec::default());

        let info = SessionInfo::new(
            "session".to_string(),
            "V1StGXR8_Z5jdHi6B-myT".to_string(),
            "http://localhost:3000/V1StGXR8_Z5jdHi6B-myT".to_string(),
            100,
            160,
        );
        broker_side
            .send(Message::SessionEstablished(info.clone()))
            .await
            .unwrap();

        let received = wait_for_session(&mut agent_side).await.unwrap();
        assert_eq!(received, info);
    }

    #[tokio::test]
    async fn test_wait_for_session_connection_closed() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let mut agent_side = Framed::new(client, TunnelCodec::default());

        let result = wait_for_session(&mut agent_side).await;
        assert!(matches!(result, Err(TunnelError::ConnectionError(_))));
    }
}
