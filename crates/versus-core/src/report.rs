use crate::client::{Client, Clients};
use crate::request::RequestId;
use crate::response::{CompareMode, Response};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Pending ids listed individually by `render` unless configured otherwise.
pub const DEFAULT_MAX_INCOMPLETE: usize = 20;

pub type MismatchHandler = Box<dyn FnMut(&[Response]) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportState {
    /// No response seen yet.
    Empty,
    Running,
    /// The response stream closed; whatever is still pending stays incomplete.
    Draining,
    Rendered,
}

/// Correlates responses from every endpoint by request id and compares them.
///
/// The pending map is only ever touched from the single task that owns the
/// report, so it needs no lock. Nothing else may hold a `&mut Report` while
/// `serve` runs.
pub struct Report {
    clients: Vec<Arc<Client>>,
    pending: HashMap<RequestId, Vec<Response>>,
    compare: CompareMode,
    max_incomplete: usize,
    on_mismatch: Option<MismatchHandler>,
    overloaded: Arc<AtomicU64>,

    pub requests: u64,
    pub errors: u64,
    pub completed: u64,
    pub mismatched: u64,
    /// Summed latency of every response.
    pub elapsed: Duration,

    started_at: DateTime<Utc>,
    started: Instant,
    state: ReportState,
    cancelled: bool,
}

impl Report {
    pub fn new(clients: &Clients, compare: CompareMode) -> Self {
        Self {
            clients: clients.clients().to_vec(),
            pending: HashMap::new(),
            compare,
            max_incomplete: DEFAULT_MAX_INCOMPLETE,
            on_mismatch: None,
            overloaded: clients.overloaded(),
            requests: 0,
            errors: 0,
            completed: 0,
            mismatched: 0,
            elapsed: Duration::ZERO,
            started_at: Utc::now(),
            started: Instant::now(),
            state: ReportState::Empty,
            cancelled: false,
        }
    }

    /// Called with the whole group (prior responses plus the final one)
    /// whenever a completed group does not agree.
    pub fn with_mismatch_handler(mut self, handler: impl FnMut(&[Response]) + Send + 'static) -> Self {
        self.on_mismatch = Some(Box::new(handler));
        self
    }

    pub fn with_max_incomplete(mut self, max: usize) -> Self {
        self.max_incomplete = max;
        self
    }

    pub fn state(&self) -> ReportState {
        self.state
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn overloaded(&self) -> u64 {
        self.overloaded.load(Ordering::Relaxed)
    }

    /// Number of ids still waiting on at least one endpoint.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_ids(&self) -> Vec<RequestId> {
        let mut ids: Vec<_> = self.pending.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn num_endpoints(&self) -> usize {
        self.clients.len()
    }

    fn count(&mut self, resp: &Response) {
        self.requests += 1;
        if resp.is_error() {
            self.errors += 1;
        }
        self.elapsed += resp.elapsed;
    }

    /// Account for one response and compare its group once every endpoint
    /// has answered.
    pub fn handle(&mut self, resp: Response) {
        match self.state {
            ReportState::Rendered => {
                warn!(request_id = resp.request_id, "response arrived after render, ignoring");
                return;
            }
            ReportState::Empty => self.state = ReportState::Running,
            ReportState::Running | ReportState::Draining => {}
        }

        self.count(&resp);

        let id = resp.request_id;
        let waiting = self.pending.get(&id).map_or(0, Vec::len);
        if waiting + 1 < self.num_endpoints() {
            self.pending.entry(id).or_default().push(resp);
            return;
        }

        // Final response for this id.
        let mut group = self.pending.remove(&id).unwrap_or_default();
        self.completed += 1;

        let mismatch = group
            .iter()
            .any(|other| !other.equivalent(&resp, self.compare));
        group.push(resp);

        if mismatch {
            self.mismatched += 1;
            if let Some(handler) = self.on_mismatch.as_mut() {
                handler(&group);
            }
        }
    }

    /// Consume the merged response stream until it closes or `cancel` fires.
    pub async fn serve(
        &mut self,
        mut rx: mpsc::Receiver<Response>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(pending = self.pending.len(), "report cancelled");
                    self.cancelled = true;
                    return Ok(());
                }
                resp = rx.recv() => match resp {
                    Some(resp) => self.handle(resp),
                    None => {
                        debug!(pending = self.pending.len(), "response stream closed");
                        if self.state != ReportState::Rendered {
                            self.state = ReportState::Draining;
                        }
                        return Ok(());
                    }
                },
            }
        }
    }

    pub fn render(&mut self, w: &mut impl Write) -> io::Result<()> {
        self.state = ReportState::Rendered;

        writeln!(w, "Endpoints:")?;
        for client in &self.clients {
            writeln!(w, "\n{}. {:?}", client.index, client.endpoint)?;
            client.stats().render(w)?;
        }

        let error_rate = if self.requests > 0 {
            (self.errors * 100) as f64 / self.requests as f64
        } else {
            0.0
        };

        writeln!(w, "\n** Summary for {} endpoints:", self.num_endpoints())?;
        writeln!(w, "   Started:    {}", self.started_at.to_rfc3339())?;
        writeln!(w, "   Elapsed:    {:0.4}s", self.started.elapsed().as_secs_f64())?;
        writeln!(
            w,
            "   Completed:  {} results with {} total requests",
            self.completed, self.requests
        )?;
        writeln!(
            w,
            "   Timing:     {:0.4}s total request time",
            self.elapsed.as_secs_f64()
        )?;
        writeln!(w, "   Errors:     {} ({:0.2}%)", self.errors, error_rate)?;
        writeln!(w, "   Mismatched: {}", self.mismatched)?;

        let overloaded = self.overloaded();
        if overloaded > 0 {
            writeln!(
                w,
                "\n   Warning: response channel was overloaded {} times, workers were stalled waiting on the report.",
                overloaded
            )?;
        }

        if !self.pending.is_empty() {
            self.render_incomplete(w)?;
        }

        if self.cancelled {
            writeln!(w, "\n   Run was cancelled; counters are partial.")?;
        }

        Ok(())
    }

    fn render_incomplete(&self, w: &mut impl Write) -> io::Result<()> {
        let ids = self.pending_ids();
        writeln!(
            w,
            "\n   Incomplete: {} requests never received a response from every endpoint",
            ids.len()
        )?;

        for id in ids.iter().take(self.max_incomplete) {
            let group = &self.pending[id];
            let missing: Vec<&str> = self
                .clients
                .iter()
                .filter(|c| !group.iter().any(|r| r.endpoint == c.index))
                .map(|c| &*c.endpoint)
                .collect();
            writeln!(
                w,
                "     #{}: {}/{} responses, missing {}",
                id,
                group.len(),
                self.num_endpoints(),
                missing.join(", ")
            )?;
        }
        if ids.len() > self.max_incomplete {
            writeln!(w, "     ... and {} more", ids.len() - self.max_incomplete)?;
        }
        Ok(())
    }
}
