use anyhow::Result;
use async_trait::async_trait;

/// Runs a task's content to completion and returns the conclusion text.
/// When no executor is configured the Coordination Engine's own LLM
/// produces the conclusion directly instead of calling through this
/// trait.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(&self, task_content: &str) -> Result<String>;
}

/// Runs the task content through the caller-supplied closure in-process.
/// The default executor for local tool functions that don't need
/// sandboxing.
pub struct NativeExecutor<F> {
    run_fn: F,
}

impl<F> NativeExecutor<F>
where
    F: Fn(&str) -> Result<String> + Send + Sync,
{
    pub fn new(run_fn: F) -> Self {
        Self { run_fn }
    }
}

#[async_trait]
impl<F> Executor for NativeExecutor<F>
where
    F: Fn(&str) -> Result<String> + Send + Sync,
{
    async fn run(&self, task_content: &str) -> Result<String> {
        (self.run_fn)(task_content)
    }
}

/// Sandboxed executor for untrusted task content. Not yet implemented.
pub struct WasmExecutor;

#[async_trait]
impl Executor for WasmExecutor {
    async fn run(&self, _task_content: &str) -> Result<String> {
        tracing::warn!("WasmExecutor invoked but not implemented");
        anyhow::bail!("WASM executor not implemented yet")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn native_executor_runs_closure() {
        let exec = NativeExecutor::new(|content: &str| Ok(format!("ran: {content}")));
        let result = exec.run("do the thing").await.unwrap();
        assert_eq!(result, "ran: do the thing");
    }

    #[tokio::test]
    async fn native_executor_propagates_closure_error() {
        let exec = NativeExecutor::new(|_: &str| anyhow::bail!("task failed"));
        let result = exec.run("do the thing").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn wasm_executor_not_implemented() {
        let exec = WasmExecutor;
        let result = exec.run("test").await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("not implemented"));
    }
}
