use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::correlation::CorrelationId;
use crate::ids::{PlanId, RunId, TenantId, WorkspaceId};

/// How a run treats its side effects. Plugins read it from the context.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    #[default]
    Live,
    DryRun,
    Replay,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Live => "live",
            RunMode::DryRun => "dry-run",
            RunMode::Replay => "replay",
        }
    }
}

/// Cancellation signal shared by every plugin invocation of one run.
///
/// Clones observe the same state. Cancelling is sticky: once fired the
/// signal never resets, so a new run needs a new signal.
#[derive(Clone, Debug)]
pub struct CancelSignal {
    inner: Arc<CancelSignalInner>,
}

#[derive(Debug)]
struct CancelSignalInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelSignalInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
            if self.is_cancelled() {
                return;
            }
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only context handed to every plugin invocation of a run.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub tenant_id: TenantId,
    pub workspace_id: WorkspaceId,
    pub run_id: RunId,
    pub plan_id: PlanId,
    pub actor: String,
    pub correlation_id: CorrelationId,
    pub template_id: String,
    pub mode: RunMode,
    pub trace_tags: BTreeMap<String, String>,
    pub cancel: CancelSignal,
}

impl ExecutionContext {
    /// Tag lookup helper for plugins.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.trace_tags.get(key).map(String::as_str)
    }
}
