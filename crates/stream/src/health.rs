use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use super::transport::SearchTransport;

pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_PROBE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    /// Delay between probes while the backend is reachable.
    pub interval: Duration,
    /// First retry delay after a failed probe; doubles up to `interval`.
    pub initial_backoff: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_PROBE_INTERVAL,
            initial_backoff: DEFAULT_PROBE_BACKOFF,
        }
    }
}

impl HealthConfig {
    fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.interval)
    }
}

/// Background liveness probe for the search backend.
///
/// Independent from any search stream: a failed probe flips the published
/// flag and nothing else. The probe task stops on `shutdown` or drop.
pub struct HealthMonitor {
    connected: watch::Receiver<bool>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    /// Starts probing immediately. Must be called inside a tokio runtime.
    pub fn spawn(transport: Arc<dyn SearchTransport>, config: HealthConfig) -> Self {
        let (connected_tx, connected) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_probe_loop(transport, config, connected_tx, shutdown_rx));

        Self {
            connected,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    /// Last probe result; `false` until the first probe completes.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    /// Stops the probe timer and waits for the task to exit.
    pub async fn shutdown(mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take()
            && let Err(error) = task.await
        {
            tracing::warn!(error = %error, "health probe task ended abnormally");
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_probe_loop(
    transport: Arc<dyn SearchTransport>,
    config: HealthConfig,
    connected_tx: watch::Sender<bool>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut backoff = config.initial_backoff;

    loop {
        let healthy = tokio::select! {
            biased;
            _ = &mut shutdown_rx => break,
            probed = transport.probe() => match probed {
                Ok(healthy) => healthy,
                Err(error) => {
                    tracing::debug!(transport = transport.name(), error = %error, "health probe failed");
                    false
                }
            },
        };

        let previous = connected_tx.send_replace(healthy);
        if previous != healthy {
            if healthy {
                tracing::info!(transport = transport.name(), "search backend reachable");
            } else {
                tracing::warn!(
                    transport = transport.name(),
                    retry_in_ms = backoff.as_millis() as u64,
                    "search backend unreachable"
                );
            }
        }

        let delay = if healthy {
            backoff = config.initial_backoff;
            config.interval
        } else {
            let delay = backoff;
            backoff = config.next_backoff(backoff);
            delay
        };

        tokio::select! {
            biased;
            _ = &mut shutdown_rx => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    tracing::debug!(transport = transport.name(), "health probe stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::transport::{BoxFuture, ByteStream, SearchRequest};
    use crate::{ReplayTransport, StreamResult};

    /// Answers probes from a fixed script, then repeats the last answer.
    struct ScriptedProbe {
        answers: Mutex<Vec<bool>>,
        probes: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(answers: Vec<bool>) -> Self {
            Self {
                answers: Mutex::new(answers),
                probes: AtomicUsize::new(0),
            }
        }
    }

    impl SearchTransport for ScriptedProbe {
        fn name(&self) -> &str {
            "scripted-probe"
        }

        fn open<'a>(
            &'a self,
            _request: &'a SearchRequest,
        ) -> BoxFuture<'a, StreamResult<ByteStream>> {
            unreachable!("health probes never open search streams")
        }

        fn probe<'a>(&'a self) -> BoxFuture<'a, StreamResult<bool>> {
            Box::pin(async move {
                self.probes.fetch_add(1, Ordering::SeqCst);
                let mut answers = self.answers.lock().expect("probe script lock");
                let answer = if answers.len() > 1 {
                    answers.remove(0)
                } else {
                    answers.first().copied().unwrap_or(false)
                };
                Ok(answer)
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failures_flip_flag_and_recover() {
        let transport = Arc::new(ScriptedProbe::new(vec![true, false, false, true]));
        let monitor = HealthMonitor::spawn(transport.clone(), HealthConfig::default());
        let mut connected = monitor.subscribe();

        connected
            .wait_for(|connected| *connected)
            .await
            .expect("first probe succeeds");
        connected
            .wait_for(|connected| !*connected)
            .await
            .expect("second probe fails");
        connected
            .wait_for(|connected| *connected)
            .await
            .expect("backoff retries until recovery");

        assert!(monitor.is_connected());
        assert!(transport.probes.load(Ordering::SeqCst) >= 4);
        monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_probe_timer() {
        let transport = Arc::new(ReplayTransport::new());
        let monitor = HealthMonitor::spawn(transport.clone(), HealthConfig::default());
        let mut connected = monitor.subscribe();
        connected
            .wait_for(|connected| *connected)
            .await
            .expect("replay transport is healthy");

        monitor.shutdown().await;
        transport.set_healthy(false);
        tokio::time::sleep(DEFAULT_PROBE_INTERVAL * 3).await;

        assert!(
            *connected.borrow(),
            "no probe may run after shutdown"
        );
    }

    #[test]
    fn backoff_doubles_up_to_interval() {
        let config = HealthConfig {
            interval: Duration::from_secs(5),
            initial_backoff: Duration::from_secs(1),
        };
        assert_eq!(config.next_backoff(Duration::from_secs(1)), Duration::from_secs(2));
        assert_eq!(config.next_backoff(Duration::from_secs(4)), Duration::from_secs(5));
    }
}
