//! 调度器模块
//! Scheduler module
//!
//! 组装并驱动全部组件的门面：注册作业与函数、启动心跳/回收器/派发器、
//! 取消执行中的作业、优雅关闭。
//! The facade that assembles and drives all components: registering jobs
//! and functions, starting the heartbeat / reclaimer / dispatcher,
//! cancelling executing jobs, and graceful shutdown.

use crate::components::dispatcher::{Dispatcher, DispatcherConfig};
use crate::components::heartbeat::NodeHeartbeat;
use crate::components::reclaimer::LockReclaimer;
use crate::config::TickerConfig;
use crate::cron::CronOccurrenceCalculator;
use crate::error::{Error, Result};
use crate::execution::ExecutionHandler;
use crate::job::{CronJob, TimeJob};
use crate::registry::FunctionRegistry;
use crate::store::{HeartbeatStore, TickerStore};
use crate::worker::WorkerPool;
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// 调度器生命周期状态
/// Scheduler lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchedulerState {
  /// 已创建，尚未启动
  /// Created, not yet started
  New,
  /// 正在运行
  /// Running
  Running,
  /// 已关闭，不可重新启动
  /// Closed, cannot be restarted
  Closed,
}

/// 集群感知的作业调度器
/// Cluster-aware job scheduler
///
/// 多个进程可各自持有一个调度器实例指向同一存储；
/// 每次到期执行恰好被其中一个节点认领。
/// Multiple processes may each hold a scheduler instance pointing at the
/// same store; every due execution is claimed by exactly one of them.
pub struct Scheduler {
  config: TickerConfig,
  store: Arc<dyn TickerStore>,
  registry: Arc<FunctionRegistry>,
  calculator: Arc<CronOccurrenceCalculator>,
  pool: Arc<WorkerPool>,
  dispatcher: Arc<Dispatcher>,
  heartbeat: Arc<NodeHeartbeat>,
  reclaimer: Arc<LockReclaimer>,
  state: SchedulerState,
  handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
  /// 创建新的调度器
  /// Create a new scheduler
  pub fn new(
    config: TickerConfig,
    store: Arc<dyn TickerStore>,
    heartbeat_store: Arc<dyn HeartbeatStore>,
    registry: Arc<FunctionRegistry>,
  ) -> Result<Self> {
    config.validate()?;

    let calculator = Arc::new(CronOccurrenceCalculator::new(config.time_zone));
    let pool = Arc::new(WorkerPool::new(
      config.worker_pool_size,
      config.queue_capacity,
    ));
    let handler = Arc::new(ExecutionHandler::new(
      Arc::clone(&store),
      Arc::clone(&registry),
      Arc::clone(&calculator),
      config.default_retry_intervals.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
      Arc::clone(&store),
      Arc::clone(&pool),
      handler,
      DispatcherConfig {
        node_id: config.node_id.clone(),
        poll_interval: config.poll_interval,
        batch_size: config.batch_size,
        time_job_priority: config.time_job_priority,
        cron_priority: config.cron_priority,
      },
    ));
    let heartbeat = Arc::new(NodeHeartbeat::new(
      Arc::clone(&heartbeat_store),
      config.node_id.clone(),
      config.heartbeat_interval,
      config.heartbeat_ttl,
      pool.active_workers_handle(),
    ));
    let reclaimer = Arc::new(LockReclaimer::new(
      Arc::clone(&store),
      heartbeat_store,
      config.node_id.clone(),
      config.reclaim_interval,
    ));

    Ok(Self {
      config,
      store,
      registry,
      calculator,
      pool,
      dispatcher,
      heartbeat,
      reclaimer,
      state: SchedulerState::New,
      handles: Vec::new(),
    })
  }

  /// 本节点 id
  /// This node's id
  pub fn node_id(&self) -> &str {
    &self.config.node_id
  }

  /// 函数注册表
  /// The function registry
  pub fn registry(&self) -> &Arc<FunctionRegistry> {
    &self.registry
  }

  /// 是否正在运行
  /// Whether the scheduler is running
  pub fn is_running(&self) -> bool {
    self.state == SchedulerState::Running
  }

  /// 注册一次性作业，返回其 id
  /// Register a time job, returning its id
  pub async fn register_time_job(&self, job: TimeJob) -> Result<Uuid> {
    if self.state == SchedulerState::Closed {
      return Err(Error::SchedulerClosed);
    }
    let id = job.id;
    self.store.create_time_job(&job).await?;
    tracing::debug!(job_id = %id, function = %job.function_name, "time job registered");
    Ok(id)
  }

  /// 注册循环作业定义并物化其第一次发生，返回定义 id
  /// Register a recurring definition and materialize its first occurrence,
  /// returning the definition id
  ///
  /// 表达式在写入前校验，非法表达式立即报错而不是静默沉默。
  /// The expression is validated before the write; an invalid expression
  /// errors immediately instead of failing silently later.
  pub async fn register_cron_job(&self, job: CronJob) -> Result<Uuid> {
    if self.state == SchedulerState::Closed {
      return Err(Error::SchedulerClosed);
    }
    let first = self.calculator.next_occurrence(&job.expression, Utc::now())?;

    let id = job.id;
    self.store.upsert_cron_job(&job).await?;
    match first {
      Some(at) => {
        self.store.materialize_next_occurrence(id, at).await?;
        tracing::debug!(cron_job_id = %id, first = %at, "recurring job registered");
      }
      None => {
        tracing::warn!(cron_job_id = %id, "recurring job has no future occurrence");
      }
    }
    Ok(id)
  }

  /// 取消一个正在本节点执行的作业
  /// Cancel a job currently executing on this node
  ///
  /// 取消是协作式的；不在执行中的作业返回 `false`。
  /// Cancellation is cooperative; returns `false` for a job not executing.
  pub fn cancel(&self, job_id: Uuid) -> bool {
    self.dispatcher.cancellations().cancel(job_id)
  }

  /// 启动调度器
  /// Start the scheduler
  pub fn start(&mut self) -> Result<()> {
    match self.state {
      SchedulerState::New => {}
      SchedulerState::Running => return Err(Error::SchedulerRunning),
      SchedulerState::Closed => return Err(Error::SchedulerClosed),
    }

    self.pool.start();
    self.handles.push(Arc::clone(&self.heartbeat).start());
    self.handles.push(Arc::clone(&self.reclaimer).start());
    self.handles.push(Arc::clone(&self.dispatcher).start());
    self.state = SchedulerState::Running;

    tracing::info!(
      node_id = %self.config.node_id,
      worker_pool_size = self.config.worker_pool_size,
      "scheduler started"
    );
    Ok(())
  }

  /// 优雅关闭：停止认领新作业，排空工作池，最后停下心跳
  /// Graceful shutdown: stop claiming new work, drain the pool, then stop
  /// the heartbeat last
  ///
  /// 心跳保持到最后，执行中的作业在排空期间不会被其他节点回收。
  /// The heartbeat outlives the drain so in-flight jobs are not reclaimed
  /// by other nodes meanwhile.
  pub async fn shutdown(&mut self) {
    if self.state != SchedulerState::Running {
      self.state = SchedulerState::Closed;
      return;
    }
    tracing::info!(node_id = %self.config.node_id, "scheduler shutting down");

    self.dispatcher.shutdown();
    self.pool.shutdown().await;
    self.reclaimer.shutdown();
    self.heartbeat.shutdown();

    for handle in self.handles.drain(..) {
      if tokio::time::timeout(self.config.shutdown_timeout, handle)
        .await
        .is_err()
      {
        tracing::warn!("component did not stop within the shutdown timeout");
      }
    }

    self.state = SchedulerState::Closed;
    tracing::info!(node_id = %self.config.node_id, "scheduler stopped");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::job::JobStatus;
  use crate::store::{MemoryHeartbeatStore, MemoryTickerStore};
  use std::time::Duration;

  fn test_scheduler(store: Arc<MemoryTickerStore>, registry: Arc<FunctionRegistry>) -> Scheduler {
    let config = TickerConfig::new("node-a")
      .poll_interval(Duration::from_millis(20))
      .worker_pool_size(2)
      .heartbeat_interval(Duration::from_millis(50))
      .heartbeat_ttl(Duration::from_secs(5))
      .reclaim_interval(Duration::from_millis(100));
    Scheduler::new(
      config,
      store,
      Arc::new(MemoryHeartbeatStore::new()),
      registry,
    )
    .unwrap()
  }

  #[tokio::test]
  async fn test_lifecycle_states() {
    let mut scheduler = test_scheduler(
      Arc::new(MemoryTickerStore::new()),
      Arc::new(FunctionRegistry::new()),
    );

    assert!(!scheduler.is_running());
    scheduler.start().unwrap();
    assert!(scheduler.is_running());
    assert!(matches!(scheduler.start(), Err(Error::SchedulerRunning)));

    scheduler.shutdown().await;
    assert!(!scheduler.is_running());
    assert!(matches!(scheduler.start(), Err(Error::SchedulerClosed)));
  }

  #[tokio::test]
  async fn test_invalid_config_rejected() {
    let result = Scheduler::new(
      TickerConfig::default(),
      Arc::new(MemoryTickerStore::new()),
      Arc::new(MemoryHeartbeatStore::new()),
      Arc::new(FunctionRegistry::new()),
    );
    assert!(matches!(result, Err(Error::Config { .. })));
  }

  #[tokio::test]
  async fn test_time_job_runs_to_done() {
    let store = Arc::new(MemoryTickerStore::new());
    let registry = Arc::new(FunctionRegistry::new());
    registry.register_fn("email:send", |_ctx| Ok(()));

    let mut scheduler = test_scheduler(store.clone(), registry);
    scheduler.start().unwrap();

    let id = scheduler
      .register_time_job(TimeJob::new("email:send", Utc::now()))
      .await
      .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    scheduler.shutdown().await;

    let stored = store.get_time_job(id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Done);
  }

  #[tokio::test]
  async fn test_register_cron_job_validates_and_materializes() {
    let store = Arc::new(MemoryTickerStore::new());
    let scheduler = test_scheduler(store.clone(), Arc::new(FunctionRegistry::new()));

    let err = scheduler
      .register_cron_job(CronJob::new("bad", "not a cron"))
      .await
      .expect_err("must reject");
    assert!(matches!(err, Error::CronExpression { .. }));

    let id = scheduler
      .register_cron_job(CronJob::new("report:hourly", "0 0 * * * *"))
      .await
      .unwrap();

    // 第一次发生已物化
    // The first occurrence is materialized
    let claimed = store
      .claim_due_cron_occurrences("node-a", Utc::now() + chrono::Duration::hours(2), 10)
      .await
      .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].cron_job_id, id);
  }
}
