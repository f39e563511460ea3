//! 派发器模块
//! Dispatcher module
//!
//! 周期性认领到期的一次性作业与循环作业发生，包装为执行信封派发到
//! 工作池；工作池满时释放认领，让其他节点接手。
//! Periodically claims due time jobs and cron occurrences, wraps them into
//! execution envelopes and dispatches them to the worker pool; when the
//! pool is full the claim is released so another node can take over.

use crate::components::ComponentLifecycle;
use crate::error::{Error, Result};
use crate::execution::{ExecutionHandler, JobEnvelope};
use crate::job::{JobRef, JobStatus};
use crate::store::TickerStore;
use crate::worker::WorkerPool;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 正在执行作业的取消令牌追踪
/// Cancellation-token tracking for executing jobs
#[derive(Clone, Default)]
pub struct CancellationMap {
  jobs: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl CancellationMap {
  /// 创建空的追踪表
  /// Create an empty tracking map
  pub fn new() -> Self {
    Self::default()
  }

  /// 登记作业的取消令牌
  /// Register a job's cancellation token
  pub fn add(&self, job_id: Uuid, token: CancellationToken) {
    self.jobs.lock().unwrap().insert(job_id, token);
  }

  /// 移除作业的取消令牌
  /// Remove a job's cancellation token
  pub fn remove(&self, job_id: Uuid) {
    self.jobs.lock().unwrap().remove(&job_id);
  }

  /// 取消指定作业，返回其是否在执行中
  /// Cancel the given job, returning whether it was executing
  pub fn cancel(&self, job_id: Uuid) -> bool {
    if let Some(token) = self.jobs.lock().unwrap().get(&job_id) {
      tracing::info!(%job_id, "cancelling job");
      token.cancel();
      true
    } else {
      false
    }
  }

  /// 当前追踪的作业数量
  /// Number of jobs currently tracked
  pub fn len(&self) -> usize {
    self.jobs.lock().unwrap().len()
  }

  /// 是否为空
  /// Check if empty
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// 派发器配置
/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
  pub node_id: String,
  pub poll_interval: Duration,
  pub batch_size: usize,
  pub time_job_priority: i32,
  pub cron_priority: i32,
}

/// 单轮派发的统计
/// Statistics for one dispatch round
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
  pub claimed_time_jobs: usize,
  pub claimed_cron_occurrences: usize,
  pub dispatched: usize,
  pub released: usize,
}

/// 派发器
/// Dispatcher
pub struct Dispatcher {
  store: Arc<dyn TickerStore>,
  pool: Arc<WorkerPool>,
  handler: Arc<ExecutionHandler>,
  config: DispatcherConfig,
  cancellations: CancellationMap,
  done: Arc<AtomicBool>,
}

impl Dispatcher {
  /// 创建新的派发器
  /// Create a new dispatcher
  pub fn new(
    store: Arc<dyn TickerStore>,
    pool: Arc<WorkerPool>,
    handler: Arc<ExecutionHandler>,
    config: DispatcherConfig,
  ) -> Self {
    Self {
      store,
      pool,
      handler,
      config,
      cancellations: CancellationMap::new(),
      done: Arc::new(AtomicBool::new(false)),
    }
  }

  /// 取消令牌追踪表的克隆
  /// A clone of the cancellation tracking map
  pub fn cancellations(&self) -> CancellationMap {
    self.cancellations.clone()
  }

  /// 启动轮询循环
  /// Start the polling loop
  ///
  /// 单轮失败（如存储暂时不可达）只告警，下一轮继续；
  /// 失败绝不被当作“没有到期的作业”。
  /// A failed round (e.g. the store briefly unreachable) is only warned
  /// about and the next round proceeds; failure is never treated as "no
  /// due work".
  pub fn start(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(self.config.poll_interval);
      loop {
        interval.tick().await;

        if self.done.load(Ordering::Relaxed) {
          tracing::debug!("dispatcher shutting down");
          break;
        }

        match self.tick(Utc::now()).await {
          Ok(stats) if stats.dispatched > 0 || stats.released > 0 => {
            tracing::debug!(?stats, "dispatch round");
          }
          Ok(_) => {}
          Err(e) => {
            tracing::warn!("dispatch round failed: {}", e);
          }
        }
      }
    })
  }

  /// 执行一轮认领与派发
  /// Run one claim-and-dispatch round
  pub async fn tick(&self, now: DateTime<Utc>) -> Result<DispatchStats> {
    let mut stats = DispatchStats::default();

    let time_jobs = self
      .store
      .claim_due_time_jobs(&self.config.node_id, now, self.config.batch_size)
      .await?;
    stats.claimed_time_jobs = time_jobs.len();
    for job in &time_jobs {
      self
        .dispatch(
          JobEnvelope::from_time_job(job),
          self.config.time_job_priority,
          &mut stats,
        )
        .await?;
    }

    let occurrences = self
      .store
      .claim_due_cron_occurrences(&self.config.node_id, now, self.config.batch_size)
      .await?;
    stats.claimed_cron_occurrences = occurrences.len();
    for occurrence in &occurrences {
      let Some(cron_job) = self.store.get_cron_job(occurrence.cron_job_id).await? else {
        // 定义已消失的发生无法执行也无法推进，按失败落盘
        // An occurrence whose definition has vanished can neither run nor
        // advance the cycle, so it is persisted as failed
        tracing::error!(
          occurrence_id = %occurrence.id,
          cron_job_id = %occurrence.cron_job_id,
          "recurring definition missing"
        );
        self
          .store
          .complete_job(
            JobRef::Cron(occurrence.id),
            JobStatus::Failed,
            Some("recurring definition missing"),
            Duration::ZERO,
          )
          .await?;
        continue;
      };
      self
        .dispatch(
          JobEnvelope::from_occurrence(occurrence, &cron_job),
          self.config.cron_priority,
          &mut stats,
        )
        .await?;
    }

    Ok(stats)
  }

  /// 将信封交给工作池；池满或已关闭时释放认领
  /// Hand the envelope to the pool; release the claim when the pool is
  /// full or closed
  async fn dispatch(
    &self,
    envelope: JobEnvelope,
    priority: i32,
    stats: &mut DispatchStats,
  ) -> Result<()> {
    let job = envelope.job;
    let token = CancellationToken::new();
    self.cancellations.add(job.id(), token.clone());

    let handler = Arc::clone(&self.handler);
    let cancellations = self.cancellations.clone();
    let enqueued = self.pool.enqueue(priority, async move {
      handler.run(envelope, token).await;
      cancellations.remove(job.id());
    });

    match enqueued {
      Ok(()) => {
        stats.dispatched += 1;
        Ok(())
      }
      Err(Error::QueueFull) | Err(Error::SchedulerClosed) => {
        self.cancellations.remove(job.id());
        self.store.release_claim(job).await?;
        stats.released += 1;
        tracing::debug!(job = %job, "pool saturated, claim released");
        Ok(())
      }
      Err(e) => Err(e),
    }
  }

  /// 停止派发器
  /// Stop the dispatcher
  pub fn shutdown(&self) {
    self.done.store(true, Ordering::Relaxed);
  }

  /// 检查是否已停止
  /// Check if done
  pub fn is_done(&self) -> bool {
    self.done.load(Ordering::Relaxed)
  }
}

impl ComponentLifecycle for Dispatcher {
  fn start(self: Arc<Self>) -> JoinHandle<()> {
    Dispatcher::start(self)
  }

  fn shutdown(&self) {
    Dispatcher::shutdown(self)
  }

  fn is_done(&self) -> bool {
    Dispatcher::is_done(self)
  }
}
