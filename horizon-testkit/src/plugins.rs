use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use horizon::{ExecutionContext, Plugin, PluginOutput, RunId};
use parking_lot::Mutex;
use serde_json::Value;

/// One observed plugin invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct Invocation {
    pub run_id: RunId,
    pub input: Value,
}

/// Shared invocation log. Clones see the same entries.
#[derive(Clone, Debug, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<Invocation>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, input: &Value, context: &ExecutionContext) {
        self.calls.lock().push(Invocation {
            run_id: context.run_id,
            input: input.clone(),
        });
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn assert_call_count_eq(&self, expected: usize) {
        let actual = self.count();
        assert_eq!(actual, expected, "Expected {expected} calls, got {actual}");
    }
}

/// Returns its input unchanged.
#[derive(Clone, Debug, Default)]
pub struct EchoPlugin {
    log: CallLog,
}

impl EchoPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(log: CallLog) -> Self {
        Self { log }
    }

    pub fn log(&self) -> &CallLog {
        &self.log
    }
}

#[async_trait]
impl Plugin for EchoPlugin {
    async fn execute(
        &self,
        input: &Value,
        context: &ExecutionContext,
        _config: &Value,
    ) -> anyhow::Result<PluginOutput> {
        self.log.push(input, context);
        Ok(PluginOutput::new(input.clone()))
    }
}

/// Always returns an error.
#[derive(Clone, Debug)]
pub struct FailingPlugin {
    message: String,
    log: CallLog,
}

impl FailingPlugin {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            log: CallLog::new(),
        }
    }

    pub fn log(&self) -> &CallLog {
        &self.log
    }
}

#[async_trait]
impl Plugin for FailingPlugin {
    async fn execute(
        &self,
        input: &Value,
        context: &ExecutionContext,
        _config: &Value,
    ) -> anyhow::Result<PluginOutput> {
        self.log.push(input, context);
        anyhow::bail!("{}", self.message)
    }
}

/// Sleeps, then echoes its input. Does not watch the cancel signal, so
/// only the executor's timeout or cancellation can cut it short.
#[derive(Clone, Debug)]
pub struct SlowPlugin {
    delay: Duration,
}

impl SlowPlugin {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Plugin for SlowPlugin {
    async fn execute(
        &self,
        input: &Value,
        _context: &ExecutionContext,
        _config: &Value,
    ) -> anyhow::Result<PluginOutput> {
        tokio::time::sleep(self.delay).await;
        Ok(PluginOutput::new(input.clone()))
    }
}

/// Echoes its input with a warning attached.
#[derive(Clone, Debug)]
pub struct WarningPlugin {
    warning: String,
}

impl WarningPlugin {
    pub fn new(warning: impl Into<String>) -> Self {
        Self {
            warning: warning.into(),
        }
    }
}

#[async_trait]
impl Plugin for WarningPlugin {
    async fn execute(
        &self,
        input: &Value,
        _context: &ExecutionContext,
        _config: &Value,
    ) -> anyhow::Result<PluginOutput> {
        Ok(PluginOutput::new(input.clone()).with_warning(self.warning.clone()))
    }
}

/// Succeeds without producing any output.
#[derive(Clone, Copy, Debug, Default)]
pub struct SilentPlugin;

#[async_trait]
impl Plugin for SilentPlugin {
    async fn execute(
        &self,
        _input: &Value,
        _context: &ExecutionContext,
        _config: &Value,
    ) -> anyhow::Result<PluginOutput> {
        Ok(PluginOutput::empty())
    }
}

/// Blocks until the run is cancelled.
#[derive(Clone, Debug, Default)]
pub struct CancelAwarePlugin {
    started: Arc<AtomicBool>,
}

impl CancelAwarePlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once `execute` has been entered.
    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Plugin for CancelAwarePlugin {
    async fn execute(
        &self,
        _input: &Value,
        context: &ExecutionContext,
        _config: &Value,
    ) -> anyhow::Result<PluginOutput> {
        self.started.store(true, Ordering::SeqCst);
        context.cancel.cancelled().await;
        anyhow::bail!("cancelled")
    }
}
