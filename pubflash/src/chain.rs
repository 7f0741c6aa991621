//! Ordered interceptor registry sitting between the demultiplexer and the sink.
//!
//! Every classified line is offered to the registered interceptors,
//! newest first. The first interceptor that claims the line consumes it and
//! propagation stops; unclaimed lines are written to the [`LogSink`]. Exactly
//! one consumer observes each line.
//!
//! Dispatch iterates over a snapshot of the registry, so interceptors may
//! register or unregister (including themselves) while a line is in flight.

use crate::sink::{LogSink, Severity, lock};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A log observer that may claim lines.
pub trait Interceptor: Send + Sync {
    /// Inspect a line. Return `true` to claim it and stop propagation.
    fn offer(&self, line: &str, severity: Severity) -> bool;
}

impl<F> Interceptor for F
where
    F: Fn(&str, Severity) -> bool + Send + Sync,
{
    fn offer(&self, line: &str, severity: Severity) -> bool {
        self(line, severity)
    }
}

/// Identity of a registered interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterceptorId(u64);

type Entry = (InterceptorId, Arc<dyn Interceptor>);

struct ChainState {
    // Most recently registered first.
    interceptors: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
    sink: LogSink,
}

/// Shared listener chain. Clones refer to the same registry.
#[derive(Clone)]
pub struct ListenerChain {
    state: Arc<ChainState>,
}

impl fmt::Debug for ListenerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerChain")
            .field("interceptors", &self.len())
            .field("sink", &self.state.sink)
            .finish()
    }
}

impl ListenerChain {
    /// Create a chain whose unclaimed lines land in `sink`.
    pub fn new(sink: LogSink) -> Self {
        Self {
            state: Arc::new(ChainState {
                interceptors: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                sink,
            }),
        }
    }

    /// The terminal sink.
    pub fn sink(&self) -> &LogSink {
        &self.state.sink
    }

    /// Register an interceptor ahead of all existing ones.
    pub fn register<I>(&self, interceptor: I) -> InterceptorId
    where
        I: Interceptor + 'static,
    {
        self.register_arc(Arc::new(interceptor))
    }

    /// Register a shared interceptor ahead of all existing ones.
    pub fn register_arc(&self, interceptor: Arc<dyn Interceptor>) -> InterceptorId {
        let id = InterceptorId(self.state.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.state.interceptors).insert(0, (id, interceptor));
        id
    }

    /// Remove an interceptor by identity. Unknown ids are a no-op.
    pub fn unregister(&self, id: InterceptorId) {
        lock(&self.state.interceptors).retain(|(entry, _)| *entry != id);
    }

    /// Whether `id` is currently registered.
    pub fn contains(&self, id: InterceptorId) -> bool {
        lock(&self.state.interceptors)
            .iter()
            .any(|(entry, _)| *entry == id)
    }

    /// Number of registered interceptors.
    pub fn len(&self) -> usize {
        lock(&self.state.interceptors).len()
    }

    /// Whether no interceptor is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offer a line to the interceptors, falling through to the sink.
    ///
    /// Returns `true` if an interceptor claimed the line.
    pub fn dispatch(&self, line: &str, severity: Severity) -> bool {
        let snapshot: Vec<Arc<dyn Interceptor>> = lock(&self.state.interceptors)
            .iter()
            .map(|(_, interceptor)| Arc::clone(interceptor))
            .collect();

        for interceptor in snapshot {
            if interceptor.offer(line, severity) {
                return true;
            }
        }

        self.state.sink.write(line, severity);
        false
    }
}
