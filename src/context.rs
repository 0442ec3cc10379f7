//! Per-query context carried through the plugin pipeline
//!
//! A `QueryContext` owns the decoded query, the eventual response and its
//! status, plus a LIFO stack of deferred actions that plugins register while
//! the query is being processed. The pipeline drains that stack exactly once
//! after processing has finished.

use crate::cancel::CancelToken;
use crate::types::{format_questions, DnsMessage};
use anyhow::Result;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const CONCURRENT_DEFER: &str = "query context: concurrent drain_defers or defer_exec";

/// Source of context ids. Wraps around at `u32::MAX`.
static LAST_ID: AtomicU32 = AtomicU32::new(0);

/// Outcome of a query as seen by the pipeline.
///
/// Kept as a raw code rather than a closed enum so that a corrupted or
/// unknown value can still be carried and logged.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ContextStatus(pub u8);

impl ContextStatus {
    pub const WAITING_RESPONSE: Self = Self(0);
    pub const RESPONDED: Self = Self(1);
    pub const SERVER_FAILED: Self = Self(2);
    pub const DROPPED: Self = Self(3);
    pub const REJECTED: Self = Self(4);

    pub fn as_str(self) -> Option<&'static str> {
        match self.0 {
            0 => Some("waiting response"),
            1 => Some("responded"),
            2 => Some("server failed"),
            3 => Some("dropped"),
            4 => Some("rejected"),
            _ => None,
        }
    }

    pub fn is_waiting(self) -> bool {
        self == Self::WAITING_RESPONSE
    }
}

impl fmt::Display for ContextStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(s) => f.write_str(s),
            None => write!(f, "invalid status {}", self.0),
        }
    }
}

impl fmt::Debug for ContextStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextStatus({})", self)
    }
}

/// Work registered by a plugin to run after the response has been decided.
#[async_trait::async_trait]
pub trait Executable: Send + Sync {
    async fn exec(&self, cancel: &CancelToken, ctx: &mut QueryContext) -> Result<()>;
}

pub struct QueryContext {
    query: DnsMessage,
    client: Option<SocketAddr>,
    summary: Arc<str>,
    id: u32,
    created_at: Instant,

    status: ContextStatus,
    response: Option<DnsMessage>,

    deferred: Vec<Arc<dyn Executable>>,
    draining: Arc<AtomicBool>,
}

/// Releases the drain flag on every exit path, including unwinding and a
/// dropped drain future.
struct DrainGuard(Arc<AtomicBool>);

impl DrainGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Self {
        if flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            panic!("{}", CONCURRENT_DEFER);
        }
        Self(flag.clone())
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl QueryContext {
    /// Create the context for a freshly received query.
    ///
    /// `client` may be absent, e.g. for internally generated queries.
    pub fn new(query: DnsMessage, client: Option<SocketAddr>) -> Self {
        let id = LAST_ID.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let summary = summarize(&query, id);

        Self {
            query,
            client,
            summary: summary.into(),
            id,
            created_at: Instant::now(),
            status: ContextStatus::WAITING_RESPONSE,
            response: None,
            deferred: Vec::new(),
            draining: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn query(&self) -> &DnsMessage {
        &self.query
    }

    pub fn query_mut(&mut self) -> &mut DnsMessage {
        &mut self.query
    }

    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client
    }

    pub fn response(&self) -> Option<&DnsMessage> {
        self.response.as_ref()
    }

    pub fn status(&self) -> ContextStatus {
        self.status
    }

    /// Overwrites both the response and the status. No transition checks are
    /// made; one terminal write per query is the caller's responsibility.
    pub fn set_response(&mut self, response: Option<DnsMessage>, status: ContextStatus) {
        self.response = response;
        self.status = status;
    }

    /// Context id. Unrelated to the DNS message id; grows by one per query.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn start_time(&self) -> Instant {
        self.created_at
    }

    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Short description computed when the context was created.
    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// Span carrying the summary as the `query` field.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!("query", query = %self.summary)
    }

    pub fn pending_defers(&self) -> usize {
        self.deferred.len()
    }

    /// Register a deferred action.
    ///
    /// # Panics
    ///
    /// Panics if called while `drain_defers` is running on this context.
    pub fn defer_exec(&mut self, exec: Arc<dyn Executable>) {
        self.assert_not_draining();
        self.deferred.push(exec);
    }

    /// Run the deferred actions, most recently registered first.
    ///
    /// Each action is removed from the stack before it runs. The first error
    /// stops the drain and is returned; older actions stay registered.
    ///
    /// # Panics
    ///
    /// Panics if another drain is already running on this context.
    pub async fn drain_defers(&mut self, cancel: &CancelToken) -> Result<()> {
        let _guard = DrainGuard::acquire(&self.draining);

        while let Some(exec) = self.deferred.pop() {
            exec.exec(cancel, self).await?;
        }
        Ok(())
    }

    /// Copy of this context for an independent branch of the pipeline.
    ///
    /// Query and response are deep copies; identity fields are shared. The
    /// copy starts with no deferred actions, see `adopt_defers_from`.
    pub fn fork(&self) -> Self {
        Self {
            query: self.query.clone(),
            client: self.client,
            summary: self.summary.clone(),
            id: self.id,
            created_at: self.created_at,
            status: self.status,
            response: self.response.clone(),
            deferred: Vec::new(),
            draining: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace this context's deferred actions with a copy of `src`'s.
    ///
    /// `src` must not be draining concurrently; that is not checked.
    ///
    /// # Panics
    ///
    /// Panics if this context is draining.
    pub fn adopt_defers_from(&mut self, src: &QueryContext) {
        self.assert_not_draining();
        self.deferred = src.deferred.clone();
    }

    fn assert_not_draining(&self) {
        if self.draining.load(Ordering::Acquire) {
            panic!("{}", CONCURRENT_DEFER);
        }
    }
}

impl fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryContext")
            .field("id", &self.id)
            .field("summary", &self.summary)
            .field("client", &self.client)
            .field("status", &self.status)
            .field("has_response", &self.response.is_some())
            .field("pending_defers", &self.deferred.len())
            .finish()
    }
}

fn summarize(query: &DnsMessage, id: u32) -> String {
    match query.questions.as_slice() {
        [q] => format!("{} {} {} {} {}", q.name, q.qtype.code(), q.qclass.code(), query.id(), id),
        questions => format!("{} {} {}", format_questions(questions), id, query.id()),
    }
}
