// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource admission control for running queries.
//!
//! One [`Throttler`] per process samples host load on a fixed interval and
//! keeps a rolling average. Each flow obtains a [`Throttle`] carrying the
//! limits from its request; queries call [`Throttle::wait_for_capacity`] and
//! [`Throttle::charge_op`] at their progress points and are parked until the
//! average drops below the flow's limits.
//!
//! Waiters park on a [`Notify`] that the sampler signals after every sample,
//! so nobody polls. Cancelling a waiting query releases it immediately and
//! the waiter count is always restored.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleetflow_protocol::FlowRequest;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{FlowError, Result};

/// One reading of host load.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadSample {
    /// Percent of total host CPU used by this process (0-100).
    pub cpu_percent: f64,
    /// I/O operations per second.
    pub iops: f64,
}

/// Source of load samples. Sampling may block; it runs on the blocking pool.
pub trait LoadSampler: Send + 'static {
    fn sample(&mut self) -> LoadSample;
}

/// Samples this process through `sysinfo`.
///
/// Disk activity is reported by the OS in bytes; it is converted to
/// operations assuming 4 KiB per operation.
pub struct SysinfoSampler {
    system: System,
    pid: Option<Pid>,
    last: Option<Instant>,
}

const BYTES_PER_OP: f64 = 4096.0;

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
            last: None,
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSampler for SysinfoSampler {
    fn sample(&mut self) -> LoadSample {
        let Some(pid) = self.pid else {
            return LoadSample::default();
        };
        // Only this process: a full refresh walks every process on the host.
        self.system.refresh_cpu_usage();
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new().with_cpu().with_disk_usage(),
        );
        let now = Instant::now();
        let elapsed = self
            .last
            .replace(now)
            .map(|last| now.duration_since(last).as_secs_f64())
            .unwrap_or(0.0);

        let Some(process) = self.system.process(pid) else {
            return LoadSample::default();
        };

        let cpus = self.system.cpus().len().max(1) as f64;
        let cpu_percent = f64::from(process.cpu_usage()) / cpus;

        let disk = process.disk_usage();
        let iops = if elapsed > 0.0 {
            (disk.read_bytes + disk.written_bytes) as f64 / BYTES_PER_OP / elapsed
        } else {
            0.0
        };

        LoadSample { cpu_percent, iops }
    }
}

/// Per-flow limits. A value of 0 disables that limit.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ThrottleLimits {
    pub cpu_limit: f64,
    pub iops_limit: f64,
    pub ops_per_sec: f64,
}

impl ThrottleLimits {
    pub fn is_unlimited(&self) -> bool {
        self.cpu_limit <= 0.0 && self.iops_limit <= 0.0 && self.ops_per_sec <= 0.0
    }
}

impl From<&FlowRequest> for ThrottleLimits {
    fn from(request: &FlowRequest) -> Self {
        Self {
            cpu_limit: request.cpu_limit,
            iops_limit: request.iops_limit,
            ops_per_sec: request.ops_per_sec,
        }
    }
}

struct RollingAverage {
    window: usize,
    samples: VecDeque<LoadSample>,
    average: LoadSample,
}

impl RollingAverage {
    fn push(&mut self, sample: LoadSample) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);

        let n = self.samples.len() as f64;
        self.average = LoadSample {
            cpu_percent: self.samples.iter().map(|s| s.cpu_percent).sum::<f64>() / n,
            iops: self.samples.iter().map(|s| s.iops).sum::<f64>() / n,
        };
    }
}

/// Process-wide load sampler and waiter registry.
pub struct Throttler {
    load: Mutex<RollingAverage>,
    changed: Notify,
    waiters: AtomicUsize,
    shutdown: CancellationToken,
}

impl Throttler {
    /// Create a throttler averaging over `window` samples.
    pub fn new(window: usize) -> Arc<Self> {
        Arc::new(Self {
            load: Mutex::new(RollingAverage {
                window: window.max(1),
                samples: VecDeque::new(),
                average: LoadSample::default(),
            }),
            changed: Notify::new(),
            waiters: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    /// Start sampling in the background until [`shutdown`](Self::shutdown).
    pub fn spawn_sampler<S: LoadSampler>(
        self: &Arc<Self>,
        sampler: S,
        interval: Duration,
    ) -> JoinHandle<()> {
        let throttler = Arc::clone(self);
        tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "Load sampler started");
            let mut sampler = Some(sampler);
            while let Some(mut current) = sampler.take() {
                tokio::select! {
                    biased;

                    _ = throttler.shutdown.cancelled() => break,

                    _ = tokio::time::sleep(interval) => {
                        let taken = tokio::task::spawn_blocking(move || {
                            let sample = current.sample();
                            (current, sample)
                        })
                        .await;
                        match taken {
                            Ok((current, sample)) => {
                                throttler.record(sample);
                                sampler = Some(current);
                            }
                            Err(e) => warn!(error = %e, "Load sampler failed"),
                        }
                    }
                }
            }
            info!("Load sampler stopped");
        })
    }

    /// Add a sample to the rolling average and wake every waiter.
    pub fn record(&self, sample: LoadSample) {
        {
            let mut load = self.load.lock().unwrap_or_else(|e| e.into_inner());
            load.push(sample);
            trace!(
                cpu = load.average.cpu_percent,
                iops = load.average.iops,
                "Load average updated"
            );
        }
        self.changed.notify_waiters();
    }

    /// Current rolling average.
    pub fn average(&self) -> LoadSample {
        self.load.lock().unwrap_or_else(|e| e.into_inner()).average
    }

    /// Number of queries currently parked waiting for capacity.
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    /// Stop the background sampler.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Handle enforcing `limits` against this throttler.
    pub fn throttle(self: &Arc<Self>, limits: ThrottleLimits) -> Throttle {
        Throttle {
            throttler: Arc::clone(self),
            limits,
            next_op: tokio::sync::Mutex::new(None),
        }
    }

    fn over_limit(&self, limits: &ThrottleLimits) -> bool {
        let average = self.average();
        (limits.cpu_limit > 0.0 && average.cpu_percent > limits.cpu_limit)
            || (limits.iops_limit > 0.0 && average.iops > limits.iops_limit)
    }
}

/// Decrements the waiter count on every exit path.
struct WaiterGuard<'a>(&'a AtomicUsize);

impl<'a> WaiterGuard<'a> {
    fn register(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Limits of one flow applied against the shared [`Throttler`].
pub struct Throttle {
    throttler: Arc<Throttler>,
    limits: ThrottleLimits,
    next_op: tokio::sync::Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn limits(&self) -> ThrottleLimits {
        self.limits
    }

    /// Block until host load is under this flow's limits.
    ///
    /// Returns [`FlowError::Cancelled`] if `scope` is cancelled first.
    pub async fn wait_for_capacity(&self, scope: &CancellationToken) -> Result<()> {
        if !self.throttler.over_limit(&self.limits) {
            return Ok(());
        }

        let _waiter = WaiterGuard::register(&self.throttler.waiters);
        debug!(
            cpu_limit = self.limits.cpu_limit,
            iops_limit = self.limits.iops_limit,
            "Query waiting for load to drop"
        );

        loop {
            let notified = self.throttler.changed.notified();
            tokio::pin!(notified);
            // Register interest before re-checking so a sample landing in
            // between is not missed.
            notified.as_mut().enable();

            if !self.throttler.over_limit(&self.limits) {
                return Ok(());
            }

            tokio::select! {
                biased;

                _ = scope.cancelled() => return Err(FlowError::Cancelled),

                _ = &mut notified => {}
            }
        }
    }

    /// Account for one operation, pacing callers to `ops_per_sec`.
    pub async fn charge_op(&self, scope: &CancellationToken) -> Result<()> {
        self.wait_for_capacity(scope).await?;

        if self.limits.ops_per_sec <= 0.0 {
            return Ok(());
        }

        let spacing = Duration::from_secs_f64(1.0 / self.limits.ops_per_sec);
        let mut next_op = self.next_op.lock().await;
        let now = Instant::now();
        let slot = match *next_op {
            Some(next) if next > now => next,
            _ => now,
        };
        *next_op = Some(slot + spacing);
        drop(next_op);

        if slot > now {
            tokio::select! {
                biased;

                _ = scope.cancelled() => return Err(FlowError::Cancelled),

                _ = tokio::time::sleep_until(slot) => {}
            }
        }
        Ok(())
    }
}
