//! Background worker for queued asynchronous work.
//!
//! A [`BackgroundWorker`] owns one [`BackgroundRunnable`] on its own task and
//! feeds it tasks in submission order through a bounded queue, with a
//! periodic tick. Stopping is itself a queued command, so everything
//! submitted before [`stop`](BackgroundWorker::stop) still runs. The host
//! uses one for fire-and-forget replication.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Handler driven by a [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    async fn run(&mut self, task: Self::Task);

    /// Periodic housekeeping. Default: nothing.
    async fn on_tick(&mut self) {}

    /// Runs once after the last task. Default: nothing.
    async fn shutdown(&mut self) {}
}

enum Command<T> {
    Run(T),
    Stop,
}

pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: mpsc::Sender<Command<R::Task>>,
    handle: Option<JoinHandle<R>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker task.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime or if `capacity` is zero.
    pub fn start(runnable: R, tick_interval_ms: u64, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = tokio::spawn(drive(
            runnable,
            rx,
            Duration::from_millis(tick_interval_ms.max(1)),
        ));
        Self {
            tx,
            handle: Some(handle),
        }
    }

    /// Queues `task`, waiting for capacity.
    ///
    /// # Errors
    ///
    /// Returns an error once the worker has stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        if self.handle.is_none() {
            anyhow::bail!("worker stopped");
        }
        self.tx
            .send(Command::Run(task))
            .await
            .map_err(|_| anyhow::anyhow!("worker task ended"))
    }

    /// Runs everything already queued, then the runnable's shutdown, and
    /// hands the runnable back. `None` if already stopped or the task panicked.
    pub async fn stop(&mut self) -> Option<R> {
        let handle = self.handle.take()?;
        // A closed queue means the task already ended; joining still works.
        let _ = self.tx.send(Command::Stop).await;
        match handle.await {
            Ok(runnable) => Some(runnable),
            Err(e) => {
                tracing::warn!(error = %e, "background worker panicked");
                None
            }
        }
    }
}

async fn drive<R: BackgroundRunnable>(
    mut runnable: R,
    mut rx: mpsc::Receiver<Command<R::Task>>,
    period: Duration,
) -> R {
    let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Run(task)) => runnable.run(task).await,
                Some(Command::Stop) | None => break,
            },
            _ = ticks.tick() => runnable.on_tick().await,
        }
    }

    runnable.shutdown().await;
    runnable
}
