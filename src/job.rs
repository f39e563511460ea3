//! 作业模块
//! Job module
//!
//! 定义了作业相关的数据结构：一次性作业、循环作业定义及其具体发生
//! Defines job-related data structures: one-off jobs, recurring job
//! definitions and their concrete occurrences

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// 作业状态
/// Job status
///
/// 生命周期：`Idle → Queued`（被认领）`→ InProgress`（派发给工作者）
/// `→ Done | Failed | Skipped`（终止状态）。
/// 重试策略允许再次尝试的作业会回到 `Idle`。
/// Lifecycle: `Idle → Queued` (claimed) `→ InProgress` (dispatched to a worker)
/// `→ Done | Failed | Skipped` (terminal). A job whose retry policy permits
/// another attempt returns to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
  /// 空闲，可被任意节点认领
  /// Idle, claimable by any node
  Idle,
  /// 已被某节点认领
  /// Claimed by a node
  Queued,
  /// 正在工作者上执行
  /// Executing on a worker
  InProgress,
  /// 成功完成
  /// Completed successfully
  Done,
  /// 失败（重试已耗尽或不可重试）
  /// Failed (retries exhausted or not retriable)
  Failed,
  /// 已跳过（取消或显式终止，不是失败）
  /// Skipped (cancellation or explicit termination, not a failure)
  Skipped,
}

impl JobStatus {
  /// 转换为字符串
  /// Convert to string
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Idle => "idle",
      Self::Queued => "queued",
      Self::InProgress => "in_progress",
      Self::Done => "done",
      Self::Failed => "failed",
      Self::Skipped => "skipped",
    }
  }

  /// 是否为终止状态：除显式重试重置外不再发生自动转换
  /// Whether this is a terminal status: no further automatic transition
  /// occurs except explicit retry re-arming
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Done | Self::Failed | Self::Skipped)
  }
}

impl FromStr for JobStatus {
  type Err = ();

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s {
      "idle" => Ok(Self::Idle),
      "queued" => Ok(Self::Queued),
      "in_progress" => Ok(Self::InProgress),
      "done" => Ok(Self::Done),
      "failed" => Ok(Self::Failed),
      "skipped" => Ok(Self::Skipped),
      _ => Err(()),
    }
  }
}

/// 具有唯一标识的实体
/// Entity with a unique identifier
pub trait HasId {
  /// 实体 id
  /// Entity id
  fn id(&self) -> Uuid;
}

/// 具有认领锁状态的实体
/// Entity carrying claim-lock state
///
/// 锁的不变量：`lock_holder` 与 `locked_at` 要么同时存在要么同时为空。
/// 所有锁变更都经由 [`lock`](HasLockState::lock) / [`unlock`](HasLockState::unlock)，
/// 以保证该不变量。
/// Lock invariant: `lock_holder` and `locked_at` are both set or both null.
/// All lock mutations go through [`lock`](HasLockState::lock) /
/// [`unlock`](HasLockState::unlock) to preserve it.
pub trait HasLockState {
  /// 当前状态
  /// Current status
  fn status(&self) -> JobStatus;

  /// 设置状态
  /// Set the status
  fn set_status(&mut self, status: JobStatus);

  /// 持锁节点
  /// Lock-holding node
  fn lock_holder(&self) -> Option<&str>;

  /// 加锁时间
  /// Lock timestamp
  fn locked_at(&self) -> Option<DateTime<Utc>>;

  /// 计划执行时间
  /// Scheduled execution time
  fn execution_time(&self) -> DateTime<Utc>;

  /// 将锁授予指定节点
  /// Grant the lock to the given node
  fn lock(&mut self, node_id: &str, at: DateTime<Utc>);

  /// 同时清除持锁节点与加锁时间
  /// Clear lock holder and lock timestamp together
  fn unlock(&mut self);

  /// 判断指定节点当前是否可认领该实体
  /// Whether the given node may currently claim this entity
  ///
  /// `Idle`/`Queued` 且无锁的实体对任意节点可认领；
  /// 有锁的实体仅对持锁节点可认领（幂等重新认领）。
  /// An entity in `Idle`/`Queued` with no lock is claimable by any node;
  /// a locked entity only by its holder (idempotent re-claim).
  fn is_claimable_by(&self, node_id: &str) -> bool {
    matches!(self.status(), JobStatus::Idle | JobStatus::Queued)
      && self.lock_holder().map_or(true, |holder| holder == node_id)
  }
}

/// 一次性作业：单次定时执行
/// Time job: a single scheduled execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeJob {
  /// 作业 id
  /// Job id
  pub id: Uuid,
  /// 注册函数名
  /// Registered function name
  pub function_name: String,
  /// 请求负载（不透明字节）
  /// Request payload (opaque bytes)
  pub request: Option<Vec<u8>>,
  /// 计划执行时间（UTC）
  /// Scheduled execution time (UTC)
  pub execution_time: DateTime<Utc>,
  /// 状态
  /// Status
  pub status: JobStatus,
  /// 持锁节点 id
  /// Lock-holding node id
  pub lock_holder: Option<String>,
  /// 加锁时间
  /// Lock timestamp
  pub locked_at: Option<DateTime<Utc>>,
  /// 已重试次数
  /// Number of retries performed
  pub retries: i32,
  /// 有序的重试间隔列表
  /// Ordered list of retry intervals
  pub retry_intervals: Vec<Duration>,
  /// 链式作业的父作业 id
  /// Parent job id for chained jobs
  pub parent_id: Option<Uuid>,
  /// 执行耗时
  /// Elapsed execution time
  pub elapsed: Option<Duration>,
  /// 异常消息
  /// Exception message
  pub exception_message: Option<String>,
}

impl TimeJob {
  /// 创建新的一次性作业，初始状态为 `Idle`
  /// Create a new time job, initially `Idle`
  pub fn new<S: Into<String>>(function_name: S, execution_time: DateTime<Utc>) -> Self {
    Self {
      id: Uuid::new_v4(),
      function_name: function_name.into(),
      request: None,
      execution_time,
      status: JobStatus::Idle,
      lock_holder: None,
      locked_at: None,
      retries: 0,
      retry_intervals: Vec::new(),
      parent_id: None,
      elapsed: None,
      exception_message: None,
    }
  }

  /// 设置请求负载
  /// Set the request payload
  pub fn with_request(mut self, request: Vec<u8>) -> Self {
    self.request = Some(request);
    self
  }

  /// 设置重试间隔列表
  /// Set the retry interval list
  pub fn with_retry_intervals(mut self, intervals: Vec<Duration>) -> Self {
    self.retry_intervals = intervals;
    self
  }

  /// 设置父作业
  /// Set the parent job
  pub fn with_parent(mut self, parent_id: Uuid) -> Self {
    self.parent_id = Some(parent_id);
    self
  }
}

impl HasId for TimeJob {
  fn id(&self) -> Uuid {
    self.id
  }
}

impl HasLockState for TimeJob {
  fn status(&self) -> JobStatus {
    self.status
  }

  fn set_status(&mut self, status: JobStatus) {
    self.status = status;
  }

  fn lock_holder(&self) -> Option<&str> {
    self.lock_holder.as_deref()
  }

  fn locked_at(&self) -> Option<DateTime<Utc>> {
    self.locked_at
  }

  fn execution_time(&self) -> DateTime<Utc> {
    self.execution_time
  }

  fn lock(&mut self, node_id: &str, at: DateTime<Utc>) {
    self.lock_holder = Some(node_id.to_string());
    self.locked_at = Some(at);
  }

  fn unlock(&mut self) {
    self.lock_holder = None;
    self.locked_at = None;
  }
}

/// 循环作业定义（本身不直接执行）
/// Recurring job definition (never executed directly)
///
/// 它是物化 [`CronOccurrence`] 行的模板：创建一次，表达式变更时更新，
/// 被引用期间不删除。
/// It is the template from which [`CronOccurrence`] rows are materialized:
/// created once, updated if the expression changes, never deleted while
/// referenced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
  /// 定义 id
  /// Definition id
  pub id: Uuid,
  /// 注册函数名
  /// Registered function name
  pub function_name: String,
  /// cron 表达式
  /// Cron expression
  pub expression: String,
  /// 请求负载
  /// Request payload
  pub request: Option<Vec<u8>>,
  /// 有序的重试间隔列表
  /// Ordered list of retry intervals
  pub retry_intervals: Vec<Duration>,
}

impl CronJob {
  /// 创建新的循环作业定义
  /// Create a new recurring job definition
  pub fn new<S: Into<String>, E: Into<String>>(function_name: S, expression: E) -> Self {
    Self {
      id: Uuid::new_v4(),
      function_name: function_name.into(),
      expression: expression.into(),
      request: None,
      retry_intervals: Vec::new(),
    }
  }

  /// 设置请求负载
  /// Set the request payload
  pub fn with_request(mut self, request: Vec<u8>) -> Self {
    self.request = Some(request);
    self
  }

  /// 设置重试间隔列表
  /// Set the retry interval list
  pub fn with_retry_intervals(mut self, intervals: Vec<Duration>) -> Self {
    self.retry_intervals = intervals;
    self
  }
}

impl HasId for CronJob {
  fn id(&self) -> Uuid {
    self.id
  }
}

/// 循环作业的一次具体发生
/// One concrete firing of a recurring job
///
/// 每个 `(cron_job_id, execution_time)` 组合至多物化一行。
/// At most one row is ever materialized per `(cron_job_id, execution_time)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronOccurrence {
  /// 发生 id
  /// Occurrence id
  pub id: Uuid,
  /// 所属循环作业定义
  /// Owning recurring job definition
  pub cron_job_id: Uuid,
  /// 计划执行时间（UTC）
  /// Scheduled execution time (UTC)
  pub execution_time: DateTime<Utc>,
  /// 状态
  /// Status
  pub status: JobStatus,
  /// 持锁节点 id
  /// Lock-holding node id
  pub lock_holder: Option<String>,
  /// 加锁时间
  /// Lock timestamp
  pub locked_at: Option<DateTime<Utc>>,
  /// 实际执行时间
  /// Actual execution time
  pub executed_at: Option<DateTime<Utc>>,
  /// 已重试次数
  /// Number of retries performed
  pub retry_count: i32,
  /// 执行耗时
  /// Elapsed execution time
  pub elapsed: Option<Duration>,
  /// 异常消息
  /// Exception message
  pub exception_message: Option<String>,
  /// 跳过原因
  /// Skip reason
  pub skipped_reason: Option<String>,
}

impl CronOccurrence {
  /// 创建新的发生，初始状态为 `Idle`
  /// Create a new occurrence, initially `Idle`
  pub fn new(cron_job_id: Uuid, execution_time: DateTime<Utc>) -> Self {
    Self {
      id: Uuid::new_v4(),
      cron_job_id,
      execution_time,
      status: JobStatus::Idle,
      lock_holder: None,
      locked_at: None,
      executed_at: None,
      retry_count: 0,
      elapsed: None,
      exception_message: None,
      skipped_reason: None,
    }
  }
}

impl HasId for CronOccurrence {
  fn id(&self) -> Uuid {
    self.id
  }
}

impl HasLockState for CronOccurrence {
  fn status(&self) -> JobStatus {
    self.status
  }

  fn set_status(&mut self, status: JobStatus) {
    self.status = status;
  }

  fn lock_holder(&self) -> Option<&str> {
    self.lock_holder.as_deref()
  }

  fn locked_at(&self) -> Option<DateTime<Utc>> {
    self.locked_at
  }

  fn execution_time(&self) -> DateTime<Utc> {
    self.execution_time
  }

  fn lock(&mut self, node_id: &str, at: DateTime<Utc>) {
    self.lock_holder = Some(node_id.to_string());
    self.locked_at = Some(at);
  }

  fn unlock(&mut self) {
    self.lock_holder = None;
    self.locked_at = None;
  }
}

/// 按种类引用一个作业或发生，统一两类状态转换操作
/// References a job or occurrence by kind, unifying status-transition
/// operations over both
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobRef {
  /// 一次性作业
  /// Time job
  Time(Uuid),
  /// 循环作业发生
  /// Cron occurrence
  Cron(Uuid),
}

impl JobRef {
  /// 被引用实体的 id
  /// Id of the referenced entity
  pub fn id(&self) -> Uuid {
    match self {
      Self::Time(id) | Self::Cron(id) => *id,
    }
  }
}

impl std::fmt::Display for JobRef {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Time(id) => write!(f, "time:{id}"),
      Self::Cron(id) => write!(f, "cron:{id}"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_status_conversion() {
    assert_eq!(JobStatus::InProgress.as_str(), "in_progress");
    assert_eq!("queued".parse::<JobStatus>(), Ok(JobStatus::Queued));
    assert!("unknown".parse::<JobStatus>().is_err());
  }

  #[test]
  fn test_status_terminal() {
    assert!(JobStatus::Done.is_terminal());
    assert!(JobStatus::Failed.is_terminal());
    assert!(JobStatus::Skipped.is_terminal());
    assert!(!JobStatus::Idle.is_terminal());
    assert!(!JobStatus::Queued.is_terminal());
    assert!(!JobStatus::InProgress.is_terminal());
  }

  #[test]
  fn test_lock_invariant() {
    let mut job = TimeJob::new("email:send", Utc::now());
    assert!(job.lock_holder.is_none() && job.locked_at.is_none());

    job.lock("node-a", Utc::now());
    assert!(job.lock_holder.is_some() && job.locked_at.is_some());

    job.unlock();
    assert!(job.lock_holder.is_none() && job.locked_at.is_none());
  }

  #[test]
  fn test_claimable_by() {
    let now = Utc::now();
    let mut job = TimeJob::new("email:send", now);

    // 无锁的 Idle 作业任意节点可认领
    // An unlocked Idle job is claimable by any node
    assert!(job.is_claimable_by("node-a"));
    assert!(job.is_claimable_by("node-b"));

    // 有锁的作业仅持锁节点可认领（幂等重新认领）
    // A locked job is claimable only by its holder (idempotent re-claim)
    job.set_status(JobStatus::Queued);
    job.lock("node-a", now);
    assert!(job.is_claimable_by("node-a"));
    assert!(!job.is_claimable_by("node-b"));

    // 终止状态不可认领
    // Terminal statuses are not claimable
    job.set_status(JobStatus::Done);
    assert!(!job.is_claimable_by("node-a"));
  }

  #[test]
  fn test_job_ref_display() {
    let id = Uuid::new_v4();
    assert_eq!(JobRef::Time(id).to_string(), format!("time:{id}"));
    assert_eq!(JobRef::Cron(id).id(), id);
  }
}
