//! Tools for limiting the number of concurrent CPU-bound tasks.

use std::sync::LazyLock;

use tokio::sync::Semaphore;

use crate::prelude::*;

/// Semaphore used to limit the number of concurrent `pdftocairo` processes.
static CPU_SEMAPHORE: LazyLock<Semaphore> =
    LazyLock::new(|| Semaphore::new(num_cpus::get()));

/// Call an async function while holding a permit from the CPU semaphore.
///
/// We do this to limit the number of external processes that are each trying
/// to use 100% of a CPU core.
///
/// In-process image work runs on the blocking pool via
/// [`crate::async_utils::spawn_blocking_propagating_panics`] and doesn't need
/// this. `tesseract` runs inside that work, so it is already bounded by the
/// page concurrency.
#[instrument(level = "trace", skip_all)]
pub async fn with_cpu_semaphore<Func, Fut, R>(f: Func) -> Result<R>
where
    Func: FnOnce() -> Fut,
    Fut: Future<Output = Result<R>>,
{
    // Acquire a permit from the semaphore.
    let permit = CPU_SEMAPHORE
        .acquire()
        .await
        .context("Could not acquire CPU permit")?;
    // Run the function while holding the permit.
    let result = f().await;
    // Release the permit.
    drop(permit);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_the_wrapped_result() -> Result<()> {
        let value = with_cpu_semaphore(|| async { Ok(42) }).await?;
        assert_eq!(value, 42);
        let err = with_cpu_semaphore(|| async { Err::<(), _>(anyhow::anyhow!("boom")) }).await;
        assert!(err.is_err());
        Ok(())
    }
}
