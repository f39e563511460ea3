//! 执行处理模块
//! Execution handling module
//!
//! 在工作者内运行作业函数并完成全部结果簿记：成功与失败的终止写入、
//! 重试调度、取消处理，以及循环作业下一次发生的物化。
//! Runs job functions inside workers and does all result bookkeeping:
//! terminal writes for success and failure, retry scheduling, cancellation
//! handling, and materialization of a recurring job's next occurrence.

use crate::cron::CronOccurrenceCalculator;
use crate::error::{Error, Result};
use crate::job::{CronJob, CronOccurrence, JobRef, JobStatus, TimeJob};
use crate::registry::FunctionRegistry;
use crate::store::TickerStore;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 传递给作业函数的执行上下文
/// Execution context handed to a job function
#[derive(Clone)]
pub struct JobContext {
  job: JobRef,
  function_name: String,
  request: Option<Vec<u8>>,
  scheduled_time: DateTime<Utc>,
  retry_count: i32,
  token: CancellationToken,
}

impl JobContext {
  /// 创建新的执行上下文
  /// Create a new execution context
  pub fn new(
    job: JobRef,
    function_name: String,
    request: Option<Vec<u8>>,
    scheduled_time: DateTime<Utc>,
    retry_count: i32,
    token: CancellationToken,
  ) -> Self {
    Self {
      job,
      function_name,
      request,
      scheduled_time,
      retry_count,
      token,
    }
  }

  /// 作业引用
  /// Job reference
  pub fn job(&self) -> JobRef {
    self.job
  }

  /// 函数名
  /// Function name
  pub fn function_name(&self) -> &str {
    &self.function_name
  }

  /// 请求负载
  /// Request payload
  pub fn request(&self) -> Option<&[u8]> {
    self.request.as_deref()
  }

  /// 计划执行时间
  /// Scheduled execution time
  pub fn scheduled_time(&self) -> DateTime<Utc> {
    self.scheduled_time
  }

  /// 当前是第几次重试（首次执行为 0）
  /// Which retry this is (0 for the first attempt)
  pub fn retry_count(&self) -> i32 {
    self.retry_count
  }

  /// 是否已请求取消
  /// Whether cancellation has been requested
  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  /// 请求取消本次执行
  /// Request cancellation of this execution
  ///
  /// 作业函数可据此自行放弃：下一个检查点将观察到取消。
  /// A job function may abandon itself this way: the next checkpoint will
  /// observe the cancellation.
  pub fn request_cancellation(&self) {
    self.token.cancel();
  }

  /// 协作式取消检查点：已取消则返回 [`Error::Cancelled`]
  /// Cooperative cancellation checkpoint: returns [`Error::Cancelled`] once
  /// cancellation is requested
  ///
  /// 长时间运行的函数应在安全点周期性调用。
  /// Long-running functions should call this periodically at safe points.
  pub fn checkpoint(&self) -> Result<()> {
    if self.token.is_cancelled() {
      return Err(Error::Cancelled);
    }
    Ok(())
  }
}

/// 循环作业发生携带的附加信息
/// Extra details carried by a cron occurrence
#[derive(Debug, Clone)]
pub struct CronDetails {
  /// 所属循环作业定义
  /// Owning recurring job definition
  pub cron_job_id: Uuid,
  /// 物化下一次发生所用的表达式
  /// Expression used to materialize the next occurrence
  pub expression: String,
}

/// 派发到工作者的作业快照
/// Snapshot of a job dispatched to a worker
///
/// 两类作业在此汇合为同一种执行单元；`cron` 仅在发生上存在。
/// Both job kinds converge here into one unit of execution; `cron` is only
/// present for occurrences.
#[derive(Debug, Clone)]
pub struct JobEnvelope {
  pub job: JobRef,
  pub function_name: String,
  pub request: Option<Vec<u8>>,
  pub execution_time: DateTime<Utc>,
  pub retry_count: i32,
  pub retry_intervals: Vec<Duration>,
  pub cron: Option<CronDetails>,
}

impl JobEnvelope {
  /// 从认领到的一次性作业构造
  /// Build from a claimed time job
  pub fn from_time_job(job: &TimeJob) -> Self {
    Self {
      job: JobRef::Time(job.id),
      function_name: job.function_name.clone(),
      request: job.request.clone(),
      execution_time: job.execution_time,
      retry_count: job.retries,
      retry_intervals: job.retry_intervals.clone(),
      cron: None,
    }
  }

  /// 从认领到的发生及其定义构造
  /// Build from a claimed occurrence and its definition
  pub fn from_occurrence(occurrence: &CronOccurrence, cron_job: &CronJob) -> Self {
    Self {
      job: JobRef::Cron(occurrence.id),
      function_name: cron_job.function_name.clone(),
      request: cron_job.request.clone(),
      execution_time: occurrence.execution_time,
      retry_count: occurrence.retry_count,
      retry_intervals: cron_job.retry_intervals.clone(),
      cron: Some(CronDetails {
        cron_job_id: cron_job.id,
        expression: cron_job.expression.clone(),
      }),
    }
  }
}

/// 提取恐慌负载中的人可读消息
/// Extract the human-readable message from a panic payload
fn panic_message(payload: &(dyn Any + Send)) -> &str {
  if let Some(message) = payload.downcast_ref::<&str>() {
    message
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message
  } else {
    "non-string panic payload"
  }
}

/// 同一循环作业在本进程内的重入护栏
/// Re-entrancy guard for one recurring job within this process
///
/// Drop 时释放占位，保证异常路径也能释放。
/// Releases the slot on drop so every exit path releases it.
struct RunningCronGuard<'a> {
  running: &'a Mutex<HashSet<Uuid>>,
  cron_job_id: Uuid,
}

impl<'a> RunningCronGuard<'a> {
  fn acquire(running: &'a Mutex<HashSet<Uuid>>, cron_job_id: Uuid) -> Option<Self> {
    if running.lock().unwrap().insert(cron_job_id) {
      Some(Self {
        running,
        cron_job_id,
      })
    } else {
      None
    }
  }
}

impl Drop for RunningCronGuard<'_> {
  fn drop(&mut self) {
    self.running.lock().unwrap().remove(&self.cron_job_id);
  }
}

/// 执行处理器
/// Execution handler
pub struct ExecutionHandler {
  store: Arc<dyn TickerStore>,
  registry: Arc<FunctionRegistry>,
  calculator: Arc<CronOccurrenceCalculator>,
  default_retry_intervals: Vec<Duration>,
  // 本节点当前正在执行发生的循环作业定义 id
  // Recurring definition ids whose occurrence is currently executing on
  // this node
  running_cron_jobs: Mutex<HashSet<Uuid>>,
}

impl ExecutionHandler {
  /// 创建新的执行处理器
  /// Create a new execution handler
  pub fn new(
    store: Arc<dyn TickerStore>,
    registry: Arc<FunctionRegistry>,
    calculator: Arc<CronOccurrenceCalculator>,
    default_retry_intervals: Vec<Duration>,
  ) -> Self {
    Self {
      store,
      registry,
      calculator,
      default_retry_intervals,
      running_cron_jobs: Mutex::new(HashSet::new()),
    }
  }

  /// 运行一个作业到结果落盘为止
  /// Run one job through to its persisted outcome
  ///
  /// 簿记写入失败只能记录：作业本身的结果已经确定，锁会由
  /// 心跳回收兜底。
  /// A failed bookkeeping write can only be logged: the job's own outcome
  /// is already decided and the lock is backstopped by heartbeat
  /// reclamation.
  pub async fn run(&self, envelope: JobEnvelope, token: CancellationToken) {
    let job = envelope.job;
    if let Err(e) = self.execute(envelope, token).await {
      tracing::error!(job = %job, "result bookkeeping failed: {}", e);
    }
  }

  async fn execute(&self, envelope: JobEnvelope, token: CancellationToken) -> Result<()> {
    self.store.mark_in_progress(envelope.job).await?;

    let function = match self.registry.resolve(&envelope.function_name) {
      Ok(function) => function,
      Err(e) => {
        // 未注册的函数是作业自身的配置缺陷，不重试
        // An unregistered function is a defect of the job itself, never
        // retried
        tracing::error!(job = %envelope.job, "{}", e);
        self
          .store
          .complete_job(
            envelope.job,
            JobStatus::Failed,
            Some(&e.to_string()),
            Duration::ZERO,
          )
          .await?;
        self.materialize_followup(&envelope).await;
        return Ok(());
      }
    };

    // 同一循环作业的上一次发生还在本节点执行时跳过本次
    // Skip this firing while the previous occurrence of the same recurring
    // job is still executing on this node
    let _guard = match &envelope.cron {
      Some(cron) => {
        match RunningCronGuard::acquire(&self.running_cron_jobs, cron.cron_job_id) {
          Some(guard) => Some(guard),
          None => {
            tracing::info!(job = %envelope.job, "previous occurrence still running, skipping");
            self
              .store
              .complete_job(
                envelope.job,
                JobStatus::Skipped,
                Some("previous occurrence still running"),
                Duration::ZERO,
              )
              .await?;
            self.materialize_followup(&envelope).await;
            return Ok(());
          }
        }
      }
      None => None,
    };

    let ctx = JobContext::new(
      envelope.job,
      envelope.function_name.clone(),
      envelope.request.clone(),
      envelope.execution_time,
      envelope.retry_count,
      token.clone(),
    );

    let started = Instant::now();
    // 函数恐慌与返回错误同等处理：结果必须落盘，锁必须释放
    // A panicking function resolves like a returned error: the outcome must
    // be persisted and the lock released
    let result = tokio::select! {
      outcome = AssertUnwindSafe(function.invoke(ctx)).catch_unwind() => match outcome {
        Ok(result) => result,
        Err(payload) => Err(Error::other(format!(
          "function panicked: {}",
          panic_message(payload.as_ref())
        ))),
      },
      _ = token.cancelled() => Err(Error::Cancelled),
    };
    let elapsed = started.elapsed();

    match result {
      Ok(()) => {
        tracing::debug!(job = %envelope.job, ?elapsed, "job done");
        self
          .store
          .complete_job(envelope.job, JobStatus::Done, None, elapsed)
          .await?;
      }
      Err(Error::Terminated { status, reason }) => {
        tracing::info!(job = %envelope.job, status = status.as_str(), "job terminated by function");
        self
          .store
          .complete_job(envelope.job, status, reason.as_deref(), elapsed)
          .await?;
      }
      Err(Error::Cancelled) => {
        tracing::info!(job = %envelope.job, "job cancelled");
        self
          .store
          .complete_job(envelope.job, JobStatus::Skipped, Some("cancelled"), elapsed)
          .await?;
      }
      Err(e) => {
        let intervals = if envelope.retry_intervals.is_empty() {
          &self.default_retry_intervals
        } else {
          &envelope.retry_intervals
        };
        if let Some(delay) = intervals.get(envelope.retry_count as usize) {
          // 超出表示范围的间隔取饱和值，不得变成立即重试
          // An out-of-range interval saturates rather than becoming an
          // immediate retry
          let delay = chrono::Duration::from_std(*delay).unwrap_or(chrono::Duration::MAX);
          let next = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
          tracing::warn!(
            job = %envelope.job,
            attempt = envelope.retry_count,
            next_attempt_at = %next,
            "job failed, retry scheduled: {}", e
          );
          self.store.schedule_retry(envelope.job, next).await?;
          // 重试重置当前作业，下一次发生等终止后再物化
          // The retry re-arms this job; the next occurrence is materialized
          // only after a terminal outcome
          return Ok(());
        }
        tracing::error!(job = %envelope.job, "job failed, retries exhausted: {}", e);
        self
          .store
          .complete_job(
            envelope.job,
            JobStatus::Failed,
            Some(&e.to_string()),
            elapsed,
          )
          .await?;
      }
    }

    self.materialize_followup(&envelope).await;
    Ok(())
  }

  /// 终止后物化所属循环作业的下一次发生
  /// After a terminal outcome, materialize the owning recurring job's next
  /// occurrence
  ///
  /// 发生失败也不中断循环：调度必须继续走下去。
  /// Even a failed occurrence does not break the cycle: the schedule must
  /// keep advancing.
  async fn materialize_followup(&self, envelope: &JobEnvelope) {
    let Some(cron) = &envelope.cron else {
      return;
    };

    match self
      .calculator
      .next_occurrence(&cron.expression, envelope.execution_time)
    {
      Ok(Some(next)) => {
        match self
          .store
          .materialize_next_occurrence(cron.cron_job_id, next)
          .await
        {
          Ok(true) => {
            tracing::debug!(cron_job_id = %cron.cron_job_id, next = %next, "next occurrence materialized");
          }
          Ok(false) => {
            // 另一节点已抢先物化
            // Another node materialized it first
            tracing::trace!(cron_job_id = %cron.cron_job_id, next = %next, "next occurrence already present");
          }
          Err(e) => {
            tracing::warn!(cron_job_id = %cron.cron_job_id, "materialization failed: {}", e);
          }
        }
      }
      Ok(None) => {
        tracing::debug!(cron_job_id = %cron.cron_job_id, "schedule has no future occurrence");
      }
      Err(e) => {
        tracing::error!(cron_job_id = %cron.cron_job_id, "{}", e);
      }
    }
  }
}
