use std::time::Instant;

/// Identifier shared by every endpoint's copy of one input payload.
pub type RequestId = i64;

/// Reserved identifier that tells a worker to shut down.
pub const SENTINEL_ID: RequestId = -1;

/// One payload bound for one endpoint. Each pool receives its own copy.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub payload: Vec<u8>,
    pub enqueued_at: Instant,
}

impl Request {
    pub fn new(id: RequestId, payload: Vec<u8>) -> Self {
        Self {
            id,
            payload,
            enqueued_at: Instant::now(),
        }
    }

    /// The shutdown marker; carries no payload.
    pub fn sentinel() -> Self {
        Self::new(SENTINEL_ID, Vec::new())
    }

    pub fn is_sentinel(&self) -> bool {
        self.id == SENTINEL_ID
    }
}
