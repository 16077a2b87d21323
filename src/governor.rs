//! Execution admission, deadlines and pressure reporting

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::config::ResourceLimits;
use crate::errors::{SandboxError, SandboxResult};

/// Fraction of a limit above which the governor reports pressure
pub const NEAR_LIMIT_RATIO: f64 = 0.8;

/// How long a timed-out worker gets to observe cancellation before the
/// caller is answered
pub const CANCEL_GRACE: Duration = Duration::from_millis(500);

/// Returns resident memory of the process in bytes, if known
pub type MemorySource = Arc<dyn Fn() -> Option<u64> + Send + Sync>;

/// How one governed execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

/// Running totals over every governed execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub timed_out_executions: u64,
    pub average_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
    pub last_execution: Option<DateTime<Utc>>,
}

impl ExecutionStats {
    pub fn record(&mut self, outcome: ExecutionOutcome, duration: Duration) {
        self.total_executions += 1;
        match outcome {
            ExecutionOutcome::Succeeded => self.successful_executions += 1,
            ExecutionOutcome::Failed => self.failed_executions += 1,
            ExecutionOutcome::TimedOut => self.timed_out_executions += 1,
        }
        self.last_execution = Some(Utc::now());

        let average = match self.average_duration {
            Some(avg) => {
                let total = avg.as_nanos() * (self.total_executions - 1) as u128 + duration.as_nanos();
                Duration::from_nanos((total / self.total_executions as u128) as u64)
            }
            None => duration,
        };
        self.average_duration = Some(average);
        self.max_duration = Some(self.max_duration.map_or(duration, |max| max.max(duration)));
    }
}

/// Point-in-time view of governor state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorStatus {
    pub active_executions: usize,
    pub max_concurrent_executions: usize,
    pub memory_used_mb: Option<u64>,
    pub max_memory_mb: u64,
    pub near_limit: bool,
    /// Elapsed milliseconds of the longest-running execution
    pub longest_running_ms: Option<u64>,
    /// Executions still holding a slot past their deadline
    pub overdue_executions: usize,
    pub stats: ExecutionStats,
}

#[derive(Debug)]
struct ActiveExecution {
    started: Instant,
    timeout: Duration,
}

/// Tracks running executions and enforces their deadlines
pub struct ResourceGovernor {
    active: DashMap<Uuid, ActiveExecution>,
    active_count: AtomicUsize,
    base_limits: RwLock<ResourceLimits>,
    stats: Mutex<ExecutionStats>,
    memory_source: MemorySource,
}

/// Registration of one execution; dropping it deregisters
pub struct ExecutionGuard {
    governor: Arc<ResourceGovernor>,
    request_id: Uuid,
    timeout: Duration,
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.governor.active.remove(&self.request_id);
        self.governor.active_count.fetch_sub(1, Ordering::SeqCst);
        debug!("Execution {} deregistered", self.request_id);
    }
}

impl ExecutionGuard {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Run `task` on a blocking worker under the admitted deadline.
    ///
    /// On timeout `cancel` is fired and the worker is given [`CANCEL_GRACE`]
    /// to reach its next cancellation check. The registration travels with
    /// the worker, so a worker that outlives the grace period keeps its slot
    /// (and shows up in [`ResourceGovernor::overdue`]) until it returns.
    pub async fn run<T, F>(self, cancel: CancelToken, task: F) -> SandboxResult<T>
    where
        F: FnOnce(CancelToken) -> SandboxResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let governor = self.governor.clone();
        let request_id = self.request_id;
        let limit = self.timeout;
        let start = Instant::now();

        let worker_cancel = cancel.clone();
        let mut handle = tokio::task::spawn_blocking(move || {
            let _registration = self;
            task(worker_cancel)
        });

        let result = match tokio::time::timeout(limit, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(SandboxError::runtime(format!("execution worker failed: {}", e))),
            Err(_) => {
                cancel.cancel();
                warn!("Execution {} timed out after {:?}", request_id, limit);
                if tokio::time::timeout(CANCEL_GRACE, &mut handle).await.is_err() {
                    warn!(
                        "Execution {} is still running after cancellation; its slot stays held",
                        request_id
                    );
                }
                Err(SandboxError::Timeout { duration: limit })
            }
        };

        let outcome = match &result {
            Ok(_) => ExecutionOutcome::Succeeded,
            Err(SandboxError::Timeout { .. }) => ExecutionOutcome::TimedOut,
            Err(_) => ExecutionOutcome::Failed,
        };
        let elapsed = start.elapsed();
        governor.record(outcome, elapsed);
        info!(request_id = %request_id, outcome = ?outcome, duration_ms = elapsed.as_millis() as u64, "Execution finished");

        result
    }
}

impl ResourceGovernor {
    pub fn new(limits: ResourceLimits) -> Self {
        Self::with_memory_source(limits, Arc::new(resident_memory_bytes))
    }

    pub fn with_memory_source(limits: ResourceLimits, memory_source: MemorySource) -> Self {
        Self {
            active: DashMap::new(),
            active_count: AtomicUsize::new(0),
            base_limits: RwLock::new(limits),
            stats: Mutex::new(ExecutionStats::default()),
            memory_source,
        }
    }

    /// Base limits every execution starts from
    pub fn limits(&self) -> ResourceLimits {
        match self.base_limits.read() {
            Ok(limits) => *limits,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Replace the base limits; running executions keep the values they started with
    pub fn set_limits(&self, limits: ResourceLimits) {
        match self.base_limits.write() {
            Ok(mut current) => *current = limits,
            Err(poisoned) => *poisoned.into_inner() = limits,
        }
    }

    pub fn active_executions(&self) -> usize {
        self.active_count.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ExecutionStats {
        match self.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn record(&self, outcome: ExecutionOutcome, duration: Duration) {
        match self.stats.lock() {
            Ok(mut stats) => stats.record(outcome, duration),
            Err(poisoned) => poisoned.into_inner().record(outcome, duration),
        }
    }

    /// Memory in use relative to `max_memory_mb`, when the source can tell
    pub fn memory_usage_ratio(&self, limits: &ResourceLimits) -> Option<f64> {
        let used = (self.memory_source)()?;
        if limits.max_memory_mb == 0 {
            return None;
        }
        Some(used as f64 / (limits.max_memory_mb as f64 * 1024.0 * 1024.0))
    }

    /// Memory or concurrency above 80% of the given limits
    pub fn is_near_limit_for(&self, limits: &ResourceLimits) -> bool {
        let concurrency =
            self.active_executions() as f64 / limits.max_concurrent_executions.max(1) as f64;
        let memory = self.memory_usage_ratio(limits).unwrap_or(0.0);
        concurrency > NEAR_LIMIT_RATIO || memory > NEAR_LIMIT_RATIO
    }

    pub fn is_near_limit(&self) -> bool {
        self.is_near_limit_for(&self.limits())
    }

    /// Admit an execution or fail with `ResourceExhausted`
    pub fn register(
        self: &Arc<Self>,
        request_id: Uuid,
        limits: &ResourceLimits,
    ) -> SandboxResult<ExecutionGuard> {
        if let Some(ratio) = self.memory_usage_ratio(limits) {
            if ratio >= 1.0 {
                warn!("Rejecting execution {}: memory limit reached", request_id);
                return Err(SandboxError::ResourceExhausted(format!(
                    "memory usage is at {:.0}% of {} MB",
                    ratio * 100.0,
                    limits.max_memory_mb
                )));
            }
        }

        let max = limits.max_concurrent_executions;
        let admitted = self
            .active_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (active < max).then_some(active + 1)
            });
        if admitted.is_err() {
            warn!("Rejecting execution {}: {} executions already running", request_id, max);
            return Err(SandboxError::ResourceExhausted(format!(
                "{} concurrent executions already running",
                max
            )));
        }

        self.active.insert(
            request_id,
            ActiveExecution {
                started: Instant::now(),
                timeout: Duration::from_secs(limits.max_execution_seconds),
            },
        );
        if self.is_near_limit_for(limits) {
            warn!("Resource usage is near its configured limits");
        }
        debug!("Execution {} registered", request_id);

        Ok(ExecutionGuard {
            governor: self.clone(),
            request_id,
            timeout: Duration::from_secs(limits.max_execution_seconds),
        })
    }

    /// Admit an execution and run `task` under `limits`; see [`ExecutionGuard::run`]
    pub async fn execute_with_limit<T, F>(
        self: &Arc<Self>,
        request_id: Uuid,
        limits: ResourceLimits,
        cancel: CancelToken,
        task: F,
    ) -> SandboxResult<T>
    where
        F: FnOnce(CancelToken) -> SandboxResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.register(request_id, &limits)?.run(cancel, task).await
    }

    pub fn status(&self) -> GovernorStatus {
        let limits = self.limits();
        GovernorStatus {
            active_executions: self.active_executions(),
            max_concurrent_executions: limits.max_concurrent_executions,
            memory_used_mb: (self.memory_source)().map(|bytes| bytes / (1024 * 1024)),
            max_memory_mb: limits.max_memory_mb,
            near_limit: self.is_near_limit_for(&limits),
            longest_running_ms: self
                .active
                .iter()
                .map(|entry| entry.started.elapsed().as_millis() as u64)
                .max(),
            overdue_executions: self.overdue().len(),
            stats: self.stats(),
        }
    }

    /// Executions that have outlived their deadline
    pub fn overdue(&self) -> Vec<Uuid> {
        self.active
            .iter()
            .filter(|entry| entry.started.elapsed() > entry.timeout)
            .map(|entry| *entry.key())
            .collect()
    }
}

impl std::fmt::Debug for ResourceGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGovernor")
            .field("active", &self.active_executions())
            .field("limits", &self.limits())
            .finish_non_exhaustive()
    }
}

/// Resident set size from `/proc/self/status`
#[cfg(target_os = "linux")]
pub fn resident_memory_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

#[cfg(not(target_os = "linux"))]
pub fn resident_memory_bytes() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(limits: ResourceLimits) -> Arc<ResourceGovernor> {
        Arc::new(ResourceGovernor::with_memory_source(limits, Arc::new(|| None)))
    }

    #[test]
    fn test_stats_average_and_max() {
        let mut stats = ExecutionStats::default();
        stats.record(ExecutionOutcome::Succeeded, Duration::from_millis(100));
        stats.record(ExecutionOutcome::Failed, Duration::from_millis(200));
        stats.record(ExecutionOutcome::TimedOut, Duration::from_millis(300));

        assert_eq!(stats.total_executions, 3);
        assert_eq!(stats.successful_executions, 1);
        assert_eq!(stats.failed_executions, 1);
        assert_eq!(stats.timed_out_executions, 1);
        assert_eq!(stats.average_duration, Some(Duration::from_millis(200)));
        assert_eq!(stats.max_duration, Some(Duration::from_millis(300)));
    }

    #[test]
    fn test_guard_deregisters_and_caps_concurrency() {
        let limits = ResourceLimits {
            max_concurrent_executions: 2,
            ..ResourceLimits::default()
        };
        let governor = governor(limits);

        let first = governor.register(Uuid::new_v4(), &limits).unwrap();
        let _second = governor.register(Uuid::new_v4(), &limits).unwrap();
        assert!(matches!(
            governor.register(Uuid::new_v4(), &limits),
            Err(SandboxError::ResourceExhausted(_))
        ));
        assert!(governor.is_near_limit());

        drop(first);
        assert_eq!(governor.active_executions(), 1);
        assert!(governor.register(Uuid::new_v4(), &limits).is_ok());
    }

    #[test]
    fn test_memory_pressure() {
        let limits = ResourceLimits {
            max_memory_mb: 100,
            ..ResourceLimits::default()
        };
        let used = Arc::new(AtomicUsize::new(50 * 1024 * 1024));
        let reported = used.clone();
        let governor = Arc::new(ResourceGovernor::with_memory_source(
            limits,
            Arc::new(move || Some(reported.load(Ordering::SeqCst) as u64)),
        ));

        assert!(!governor.is_near_limit());
        used.store(90 * 1024 * 1024, Ordering::SeqCst);
        assert!(governor.is_near_limit());
        assert_eq!(governor.status().memory_used_mb, Some(90));

        used.store(120 * 1024 * 1024, Ordering::SeqCst);
        assert!(matches!(
            governor.register(Uuid::new_v4(), &limits),
            Err(SandboxError::ResourceExhausted(_))
        ));
    }

    #[tokio::test]
    async fn test_execute_with_limit_returns_value() {
        let governor = governor(ResourceLimits::default());
        let value = governor
            .execute_with_limit(Uuid::new_v4(), governor.limits(), CancelToken::new(), |_| Ok(42))
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(governor.active_executions(), 0);
        assert_eq!(governor.stats().successful_executions, 1);
    }

    #[tokio::test]
    async fn test_timeout_cancels_worker_and_deregisters() {
        let limits = ResourceLimits {
            max_execution_seconds: 1,
            ..ResourceLimits::default()
        };
        let governor = governor(limits);
        let cancel = CancelToken::new();
        let observed = cancel.clone();

        let result: SandboxResult<()> = governor
            .execute_with_limit(Uuid::new_v4(), limits, cancel, |token| loop {
                token.check()?;
                std::thread::sleep(Duration::from_millis(5));
            })
            .await;

        assert!(matches!(result, Err(SandboxError::Timeout { .. })));
        assert!(observed.is_cancelled());
        assert_eq!(governor.active_executions(), 0);
        assert_eq!(governor.stats().timed_out_executions, 1);
    }

    #[tokio::test]
    async fn test_stuck_worker_keeps_its_slot() {
        let limits = ResourceLimits {
            max_execution_seconds: 1,
            max_concurrent_executions: 1,
            ..ResourceLimits::default()
        };
        let governor = governor(limits);
        let request_id = Uuid::new_v4();

        let result: SandboxResult<()> = governor
            .execute_with_limit(request_id, limits, CancelToken::new(), |_| {
                std::thread::sleep(Duration::from_millis(2500));
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(SandboxError::Timeout { .. })));
        assert_eq!(governor.active_executions(), 1);
        assert_eq!(governor.overdue(), vec![request_id]);
        assert_eq!(governor.status().overdue_executions, 1);
        assert!(matches!(
            governor.register(Uuid::new_v4(), &limits),
            Err(SandboxError::ResourceExhausted(_))
        ));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(governor.active_executions(), 0);
        assert!(governor.overdue().is_empty());
    }

    #[tokio::test]
    async fn test_failed_task_is_counted() {
        let governor = governor(ResourceLimits::default());
        let result: SandboxResult<()> = governor
            .execute_with_limit(Uuid::new_v4(), governor.limits(), CancelToken::new(), |_| {
                Err(SandboxError::runtime("boom"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(governor.stats().failed_executions, 1);
        assert_eq!(governor.active_executions(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_resident_memory_is_readable() {
        assert!(resident_memory_bytes().unwrap_or(0) > 0);
    }
}
