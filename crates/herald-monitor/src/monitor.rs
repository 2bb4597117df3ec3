use herald_types::NetworkStatus;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

use crate::probe::{ProbeError, Prober};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub probe_interval: Duration,
    /// Round trips slower than this report `Slow`
    pub rtt_budget: Duration,
    /// A probe still running after this long counts as failed
    pub probe_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            rtt_budget: Duration::from_millis(1500),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl MonitorConfig {
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn with_rtt_budget(mut self, budget: Duration) -> Self {
        self.rtt_budget = budget;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ProbeResult {
    Fast,
    Slow,
    Failed,
}

#[derive(Debug)]
struct Observed {
    host_online: bool,
    last_probe: Option<ProbeResult>,
    // Bumped on every host transition; a probe started in an older epoch is stale
    epoch: u64,
}

struct Shared {
    observed: Mutex<Observed>,
    status: watch::Sender<NetworkStatus>,
    wake: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Observed> {
        self.observed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Recompute the status and publish it if it changed
    fn refresh(&self) -> NetworkStatus {
        let observed = self.lock();
        let next = classify(&observed);
        let changed = self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            tracing::info!(status = %next, "Network status changed");
        }
        next
    }
}

fn classify(observed: &Observed) -> NetworkStatus {
    if !observed.host_online {
        return NetworkStatus::Offline;
    }
    match observed.last_probe {
        None | Some(ProbeResult::Fast) => NetworkStatus::Online,
        Some(ProbeResult::Slow) => NetworkStatus::Slow,
        Some(ProbeResult::Failed) => NetworkStatus::Offline,
    }
}

/// Publishes [`NetworkStatus`] for the whole process.
///
/// Construct one and hand clones of its receivers to whoever renders status.
pub struct ConnectionMonitor {
    prober: Arc<dyn Prober>,
    config: MonitorConfig,
    shared: Arc<Shared>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ConnectionMonitor {
    pub fn new(prober: Arc<dyn Prober>, config: MonitorConfig) -> Self {
        let (status, _) = watch::channel(NetworkStatus::Online);
        Self {
            prober,
            config,
            shared: Arc::new(Shared {
                observed: Mutex::new(Observed {
                    host_online: true,
                    last_probe: None,
                    epoch: 0,
                }),
                status,
                wake: Notify::new(),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn status(&self) -> NetworkStatus {
        *self.shared.status.borrow()
    }

    /// Receiver whose current value is the latest status
    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.shared.status.subscribe()
    }

    /// The current status first, then every change
    pub fn stream(&self) -> WatchStream<NetworkStatus> {
        WatchStream::new(self.subscribe())
    }

    /// Feed the host's own connectivity signal.
    ///
    /// Going offline publishes `Offline` at once. Coming back online discards
    /// the previous probe result and asks the running probe loop for a fresh one.
    pub fn set_host_online(&self, online: bool) -> NetworkStatus {
        {
            let mut observed = self.shared.lock();
            if observed.host_online == online {
                drop(observed);
                return self.status();
            }
            observed.host_online = online;
            observed.epoch += 1;
            if online {
                observed.last_probe = None;
            }
        }
        tracing::debug!(online, "Host connectivity changed");
        if online {
            self.shared.wake.notify_one();
        }
        self.shared.refresh()
    }

    /// Probe once right now and return the resulting status
    pub async fn check_now(&self) -> NetworkStatus {
        probe_once(&self.shared, self.prober.as_ref(), &self.config).await
    }

    /// Start periodic probing. Returns `false` if already running.
    pub fn start(&self) -> bool {
        let mut task = self.lock_task();
        if task.is_some() {
            return false;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            Arc::clone(&self.shared),
            Arc::clone(&self.prober),
            self.config.clone(),
            cancel.clone(),
        ));
        *task = Some((cancel, handle));
        tracing::info!(
            interval_ms = self.config.probe_interval.as_millis() as u64,
            budget_ms = self.config.rtt_budget.as_millis() as u64,
            "Connection monitor started"
        );
        true
    }

    pub fn stop(&self) {
        if let Some((cancel, handle)) = self.lock_task().take() {
            cancel.cancel();
            handle.abort();
            tracing::info!("Connection monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_task().is_some()
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<(CancellationToken, JoinHandle<()>)>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(shared: Arc<Shared>, prober: Arc<dyn Prober>, config: MonitorConfig, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(config.probe_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
            _ = shared.wake.notified() => {}
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = probe_once(&shared, prober.as_ref(), &config) => {}
        }
    }
}

async fn probe_once(shared: &Shared, prober: &dyn Prober, config: &MonitorConfig) -> NetworkStatus {
    let epoch = {
        let observed = shared.lock();
        if !observed.host_online {
            drop(observed);
            return shared.refresh();
        }
        observed.epoch
    };

    let outcome = match tokio::time::timeout(config.probe_timeout, prober.probe()).await {
        Ok(outcome) => outcome,
        Err(_) => Err(ProbeError::Timeout(config.probe_timeout)),
    };

    let result = match outcome {
        Ok(rtt) if rtt <= config.rtt_budget => {
            tracing::trace!(rtt_ms = rtt.as_millis() as u64, "Probe ok");
            ProbeResult::Fast
        }
        Ok(rtt) => {
            tracing::debug!(rtt_ms = rtt.as_millis() as u64, "Probe over budget");
            ProbeResult::Slow
        }
        Err(err) => {
            tracing::warn!("Probe failed: {}", err);
            ProbeResult::Failed
        }
    };

    {
        let mut observed = shared.lock();
        if observed.epoch == epoch {
            observed.last_probe = Some(result);
        } else {
            tracing::debug!("Host connectivity changed during probe, result discarded");
        }
    }
    shared.refresh()
}
