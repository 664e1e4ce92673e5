use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Handle to a task started by [`spawn_ticker`].
///
/// The task stops on [`stop`](Self::stop) or when the handle is dropped.
#[derive(Debug)]
pub struct TickHandle {
    cancel: CancellationToken,
}

impl TickHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for TickHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Calls `on_tick` every `period` on a background tokio task.
///
/// The first call happens one full period after spawning. Must be called
/// from within a tokio runtime.
pub fn spawn_ticker<F>(period: Duration, mut on_tick: F) -> TickHandle
where
    F: FnMut() + Send + 'static,
{
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let period = period.max(Duration::from_millis(1));

    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => on_tick(),
            }
        }
    });

    TickHandle { cancel }
}
