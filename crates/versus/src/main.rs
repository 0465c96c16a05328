use anyhow::{Context, Result};
use clap::Parser;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use versus_core::{
    probe_http, validate_endpoint, Clients, CompareMode, Config, DispatchError, Report, Response,
    Responses,
};

/// Lines read ahead of the dispatcher.
const INPUT_BUFFER: usize = 64;

#[derive(Parser, Debug)]
#[command(name = "versus", version)]
#[command(
    about = "Replay request payloads from stdin against several endpoints, benchmark them and compare their responses"
)]
struct Args {
    /// Endpoint URIs: http, https, ws, wss or noop. HTTP schemes take a mode
    /// suffix, e.g. https+get://host/path/
    endpoints: Vec<String>,

    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Per-request timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Stop after sending this many requests
    #[arg(short = 'n', long)]
    requests: Option<u64>,

    /// Stop reading input after this many milliseconds
    #[arg(long)]
    duration_ms: Option<u64>,

    /// Concurrent requests per endpoint
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// Body comparison: strict, json-object or json
    #[arg(long)]
    compare: Option<CompareMode>,

    /// Estimate each HTTP endpoint's network latency before starting
    #[arg(long)]
    probe_latency: bool,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = load_config(&args)?;
    config.validate()?;
    for endpoint in &config.endpoints {
        validate_endpoint(endpoint).with_context(|| format!("Invalid endpoint: {endpoint}"))?;
    }

    info!(
        "Comparing {} endpoints with concurrency {}",
        config.endpoints.len(),
        config.concurrency
    );

    if args.probe_latency {
        print_latencies(&config.endpoints).await;
    }

    run(config).await
}

fn default_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn init_tracing(verbose: u8) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level(verbose))),
        )
        .init();
}

/// Logged at warn so the default filter shows every mismatch diff.
fn log_mismatch(group: &[Response]) {
    let id = group.first().map_or(0, |r| r.request_id);
    warn!("Mismatched responses for request {}:\n{}", id, Responses(group));
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => Config::default(),
    };

    config.endpoints.extend(args.endpoints.iter().cloned());
    if let Some(timeout_ms) = args.timeout_ms {
        config.timeout_ms = timeout_ms;
    }
    if let Some(requests) = args.requests {
        config.requests = requests;
    }
    if let Some(duration_ms) = args.duration_ms {
        config.duration_ms = duration_ms;
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(compare) = args.compare {
        config.compare = compare;
    }
    Ok(config)
}

async fn run(config: Config) -> Result<()> {
    let cancel = CancellationToken::new();
    let mut clients = Clients::new(&config.endpoints, config.concurrency, config.timeout());
    let (tx, rx) = mpsc::channel(config.response_buffer);

    let mut report = Report::new(&clients, config.compare)
        .with_max_incomplete(config.max_incomplete)
        .with_mismatch_handler(log_mismatch);

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, shutting down");
                cancel.cancel();
            }
        }
    });

    let serving = tokio::spawn({
        let cancel = cancel.clone();
        let serve = clients.serve(&cancel, tx);
        async move {
            let result = serve.await;
            if result.is_err() {
                cancel.cancel();
            }
            result
        }
    });

    let reporting = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let result = report.serve(rx, &cancel).await;
            (report, result)
        }
    });

    let sent = pump(&mut clients, &config, &cancel).await;
    match &sent {
        Ok(n) => info!("Input finished after {} requests", n),
        Err(e) => warn!("Input failed: {:#}", e),
    }

    if !cancel.is_cancelled() {
        if let Err(DispatchError::Cancelled) = clients.finalize(&cancel).await {
            debug!("Finalize interrupted by cancellation");
        }
    }

    let served = serving.await.context("client task panicked")?;
    let (mut report, reported) = reporting.await.context("report task panicked")?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    report.render(&mut out)?;
    out.flush()?;

    served.context("Serving endpoints failed")?;
    reported.context("Collecting responses failed")?;
    sent?;
    Ok(())
}

/// Feed stdin lines to the dispatcher until end of input, an empty line, a
/// configured limit, or cancellation. Returns the number of requests sent.
async fn pump(clients: &mut Clients, config: &Config, cancel: &CancellationToken) -> Result<u64> {
    let mut lines = spawn_stdin_reader();
    let deadline = config
        .duration()
        .map(|d| tokio::time::Instant::now() + d);
    let limit = config.request_limit();
    let mut sent = 0u64;

    loop {
        if limit.is_some_and(|limit| sent >= limit) {
            debug!("Request limit reached");
            break;
        }

        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = sleep_until(deadline) => {
                debug!("Duration limit reached");
                break;
            }
            line = lines.recv() => match line {
                Some(line) => line.context("Failed to read input")?,
                None => break,
            },
        };

        if line.is_empty() {
            break;
        }

        match clients.send(cancel, &line).await {
            Ok(_) => sent += 1,
            Err(DispatchError::Cancelled) => break,
        }
    }

    Ok(sent)
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Read stdin on a plain thread: a blocking read cannot be cancelled, and a
/// detached thread does not hold up runtime shutdown.
fn spawn_stdin_reader() -> mpsc::Receiver<std::io::Result<Vec<u8>>> {
    let (tx, rx) = mpsc::channel(INPUT_BUFFER);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut input = stdin.lock();
        loop {
            let mut line = Vec::new();
            let item = match input.read_until(b'\n', &mut line) {
                Ok(0) => return,
                Ok(_) => Ok(trim_newline(line)),
                Err(e) => Err(e),
            };
            let failed = item.is_err();
            if tx.blocking_send(item).is_err() || failed {
                return;
            }
        }
    });
    rx
}

fn trim_newline(mut line: Vec<u8>) -> Vec<u8> {
    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    }
    line
}

async fn print_latencies(endpoints: &[String]) {
    println!("\n=== Endpoint latency ===");
    for endpoint in endpoints {
        if !endpoint.starts_with("http") {
            continue;
        }
        match probe_http(endpoint).await {
            Ok(latency) => println!("{}: {:0.4}s", endpoint, latency.as_secs_f64()),
            Err(e) => warn!("Latency probe failed for {}: {}", endpoint, e),
        }
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<Mutex<Vec<u8>>>);

    impl Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn response(endpoint: usize, body: &[u8]) -> Response {
        Response {
            endpoint,
            endpoint_uri: Arc::from(format!("noop://{endpoint}").as_str()),
            request_id: 7,
            body: Some(body.to_vec()),
            error: None,
            elapsed: Duration::from_millis(3),
        }
    }

    #[test]
    fn test_trim_newline() {
        assert_eq!(trim_newline(b"{\"id\":1}\n".to_vec()), b"{\"id\":1}".to_vec());
        assert_eq!(trim_newline(b"abc\r\n".to_vec()), b"abc".to_vec());
        assert_eq!(trim_newline(b"abc".to_vec()), b"abc".to_vec());
        assert!(trim_newline(b"\n".to_vec()).is_empty());
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::parse_from([
            "versus",
            "noop://a",
            "noop://b",
            "-c",
            "8",
            "-n",
            "100",
            "--compare",
            "strict",
            "-vv",
        ]);
        assert_eq!(args.verbose, 2);

        let config = load_config(&args).unwrap();
        assert_eq!(config.endpoints, vec!["noop://a", "noop://b"]);
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.request_limit(), Some(100));
        assert_eq!(config.compare, CompareMode::Strict);
        assert_eq!(config.timeout_ms, Config::default().timeout_ms);
    }

    #[test]
    fn test_invalid_compare_flag_rejected() {
        assert!(Args::try_parse_from(["versus", "noop://a", "--compare", "loose"]).is_err());
    }

    #[test]
    fn test_mismatch_logged_at_default_level() {
        let log = CapturedLog::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer({
                let log = log.clone();
                move || log.clone()
            })
            .with_ansi(false)
            .with_env_filter(tracing_subscriber::EnvFilter::new(default_level(0)))
            .finish();

        let group = [response(0, br#"{"a":1}"#), response(1, br#"{"a":2}"#)];
        tracing::subscriber::with_default(subscriber, || log_mismatch(&group));

        let output = String::from_utf8(log.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("Mismatched responses for request 7"));
        assert!(output.contains(r#"{"a":2}"#));
    }
}
