use crate::request::{Request, RequestId};
use crate::response::Response;
use crate::stats::EndpointStats;
use crate::transport::{DefaultFactory, Transport, TransportFactory};
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Input queue capacity per worker.
const QUEUE_PER_WORKER: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatch cancelled")]
    Cancelled,
}

/// Hands responses to the report, counting every time the channel was full.
#[derive(Clone)]
pub struct ResponseSink {
    tx: mpsc::Sender<Response>,
    overloaded: Arc<AtomicU64>,
}

impl ResponseSink {
    pub fn new(tx: mpsc::Sender<Response>, overloaded: Arc<AtomicU64>) -> Self {
        Self { tx, overloaded }
    }

    /// Try a non-blocking hand-off first; when the channel is full, count an
    /// overload and block until there is room. Returns false when the response
    /// could not be delivered because the run is shutting down.
    pub async fn deliver(&self, resp: Response, cancel: &CancellationToken) -> Result<bool> {
        let resp = match self.tx.try_send(resp) {
            Ok(()) => return Ok(true),
            Err(TrySendError::Full(resp)) => resp,
            Err(TrySendError::Closed(_)) => return closed(cancel),
        };

        self.overloaded.fetch_add(1, Ordering::Relaxed);
        warn!("response channel is overloaded, blocking worker");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(false),
            sent = self.tx.send(resp) => match sent {
                Ok(()) => Ok(true),
                Err(_) => closed(cancel),
            },
        }
    }
}

fn closed(cancel: &CancellationToken) -> Result<bool> {
    if cancel.is_cancelled() {
        return Ok(false);
    }
    anyhow::bail!("response channel closed while workers were running")
}

/// Worker pool for one endpoint: `concurrency` workers share one bounded queue.
pub struct Client {
    pub index: usize,
    pub endpoint: Arc<str>,
    concurrency: usize,
    timeout: Duration,
    tx: async_channel::Sender<Request>,
    rx: async_channel::Receiver<Request>,
    stats: Mutex<EndpointStats>,
    factory: Arc<dyn TransportFactory>,
}

impl Client {
    pub fn new(index: usize, endpoint: &str, concurrency: usize, timeout: Duration) -> Self {
        Self::with_factory(index, endpoint, concurrency, timeout, Arc::new(DefaultFactory))
    }

    /// Concurrency below 1 is clamped to 1.
    pub fn with_factory(
        index: usize,
        endpoint: &str,
        concurrency: usize,
        timeout: Duration,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let concurrency = concurrency.max(1);
        let (tx, rx) = async_channel::bounded(QUEUE_PER_WORKER * concurrency);
        Self {
            index,
            endpoint: Arc::from(endpoint),
            concurrency,
            timeout,
            tx,
            rx,
            stats: Mutex::new(EndpointStats::new(concurrency)),
            factory,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Requests waiting in the input queue.
    pub fn queued(&self) -> usize {
        self.rx.len()
    }

    pub fn stats(&self) -> MutexGuard<'_, EndpointStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn enqueue(&self, req: Request, cancel: &CancellationToken) -> Result<(), DispatchError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DispatchError::Cancelled),
            // The pool keeps its own receiver, so the queue never closes.
            sent = self.tx.send(req) => sent.map_err(|_| DispatchError::Cancelled),
        }
    }

    /// Run the pool's workers until each has seen a sentinel, the token is
    /// cancelled, or one of them fails. The first failure cancels the rest.
    pub async fn serve(self: &Arc<Self>, cancel: &CancellationToken, out: ResponseSink) -> Result<()> {
        let cancel = cancel.child_token();

        debug!(
            endpoint = %self.endpoint,
            concurrency = self.concurrency,
            "starting client"
        );

        let mut workers = JoinSet::new();
        for worker in 0..self.concurrency {
            let client = Arc::clone(self);
            let cancel = cancel.clone();
            let out = out.clone();
            workers.spawn(async move { client.work(worker, &cancel, &out).await });
        }
        drop(out);

        let mut result = Ok(());
        while let Some(joined) = workers.join_next().await {
            let outcome = joined
                .map_err(anyhow::Error::from)
                .and_then(|r| r);
            if let Err(e) = outcome {
                if result.is_ok() {
                    error!(endpoint = %self.endpoint, error = %e, "client failed");
                    cancel.cancel();
                    result = Err(e);
                }
            }
        }
        result
    }

    async fn work(&self, worker: usize, cancel: &CancellationToken, out: &ResponseSink) -> Result<()> {
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            t = self.factory.connect(&self.endpoint, self.timeout) => t,
        };
        let mut transport = connected
            .with_context(|| format!("failed to create transport for {}", self.endpoint))?;

        let result = self.consume(worker, transport.as_mut(), cancel, out).await;
        self.stats().observe_min_latency(transport.min_latency());
        result
    }

    async fn consume(
        &self,
        worker: usize,
        transport: &mut dyn Transport,
        cancel: &CancellationToken,
        out: &ResponseSink,
    ) -> Result<()> {
        loop {
            let req = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(endpoint = %self.endpoint, worker, "aborting client");
                    return Ok(());
                }
                req = self.rx.recv() => match req {
                    Ok(req) => req,
                    Err(_) => return Ok(()),
                },
            };

            if req.is_sentinel() {
                debug!(
                    endpoint = %self.endpoint,
                    worker,
                    "received final request, shutting down"
                );
                return Ok(());
            }

            let resp = self.exchange(transport, req).await;
            self.stats().count(resp.error.as_deref(), resp.elapsed);
            if !out.deliver(resp, cancel).await? {
                return Ok(());
            }
        }
    }

    async fn exchange(&self, transport: &mut dyn Transport, req: Request) -> Response {
        let start = Instant::now();
        let result = transport.send(&req.payload).await;
        let elapsed = start.elapsed();

        let (body, error) = match result {
            Ok(body) => (Some(body), None),
            Err(e) => (e.body().map(<[u8]>::to_vec), Some(e.to_string())),
        };

        Response {
            endpoint: self.index,
            endpoint_uri: Arc::clone(&self.endpoint),
            request_id: req.id,
            body,
            error,
            elapsed,
        }
    }
}

/// Every endpoint's pool, fed in lockstep under shared request ids.
pub struct Clients {
    clients: Vec<Arc<Client>>,
    last_id: RequestId,
    overloaded: Arc<AtomicU64>,
}

impl Clients {
    pub fn new(endpoints: &[String], concurrency: usize, timeout: Duration) -> Self {
        Self::with_factory(endpoints, concurrency, timeout, Arc::new(DefaultFactory))
    }

    pub fn with_factory(
        endpoints: &[String],
        concurrency: usize,
        timeout: Duration,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let clients = endpoints
            .iter()
            .enumerate()
            .map(|(i, endpoint)| {
                Arc::new(Client::with_factory(
                    i,
                    endpoint,
                    concurrency,
                    timeout,
                    Arc::clone(&factory),
                ))
            })
            .collect();

        Self {
            clients,
            last_id: 0,
            overloaded: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn clients(&self) -> &[Arc<Client>] {
        &self.clients
    }

    /// Overload events shared by every pool's response sink.
    pub fn overloaded(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.overloaded)
    }

    /// Assign the next request id and enqueue a copy of `payload` on every
    /// pool. Taking `&mut self` keeps id assignment single-producer.
    ///
    /// A cancelled send stops before the remaining pools, leaving that id
    /// permanently incomplete.
    pub async fn send(
        &mut self,
        cancel: &CancellationToken,
        payload: &[u8],
    ) -> Result<RequestId, DispatchError> {
        self.last_id += 1;
        let id = self.last_id;
        for client in &self.clients {
            client
                .enqueue(Request::new(id, payload.to_vec()), cancel)
                .await?;
        }
        Ok(id)
    }

    /// Enqueue one sentinel per worker so every worker exits once the work
    /// already queued ahead of it is done. Nothing may be sent afterwards.
    pub async fn finalize(&self, cancel: &CancellationToken) -> Result<(), DispatchError> {
        for client in &self.clients {
            for _ in 0..client.concurrency {
                client.enqueue(Request::sentinel(), cancel).await?;
            }
        }
        Ok(())
    }

    /// Serve every pool concurrently. The returned future owns its pools, so
    /// it can be spawned while the caller keeps sending.
    pub fn serve(
        &self,
        cancel: &CancellationToken,
        out: mpsc::Sender<Response>,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let clients = self.clients.clone();
        let sink = ResponseSink::new(out, self.overloaded());
        let cancel = cancel.child_token();

        async move {
            let mut pools = JoinSet::new();
            for client in clients {
                let cancel = cancel.clone();
                let sink = sink.clone();
                pools.spawn(async move { client.serve(&cancel, sink).await });
            }
            drop(sink);

            let mut result = Ok(());
            while let Some(joined) = pools.join_next().await {
                let outcome = joined
                    .map_err(anyhow::Error::from)
                    .and_then(|r| r);
                if let Err(e) = outcome {
                    if result.is_ok() {
                        cancel.cancel();
                        result = Err(e);
                    }
                }
            }
            result
        }
    }
}
