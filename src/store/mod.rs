//! 存储模块
//! Store module
//!
//! 定义了与作业存储后端及心跳存储交互的抽象层。
//! 存储是认领状态的唯一事实来源：工作者从不直接变更共享状态，
//! 所有状态转换都经由这里的条件更新操作。
//! Defines the abstraction layer for interacting with the job storage
//! backend and the heartbeat store. The store is the single source of
//! truth for claim state: workers never mutate shared state directly and
//! every status transition goes through the conditional-update operations
//! declared here.

use crate::error::Result;
use crate::job::{CronJob, CronOccurrence, JobRef, JobStatus, TimeJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

mod memory;

pub use memory::{MemoryHeartbeatStore, MemoryTickerStore};

/// 作业存储特性
/// Job store trait
///
/// 所有操作在多进程并发调用下必须安全；任何无法完成的操作
/// （如连接丢失）以可重试的基础设施错误上报，绝不能被解读为
/// “没有到期的作业”。
/// Every operation must be safe under concurrent callers from multiple
/// processes; an operation that cannot complete (e.g. connectivity loss)
/// is reported as a retryable infrastructure error and must never be
/// interpreted as "no due work".
#[async_trait]
pub trait TickerStore: Send + Sync {
  /// 创建一次性作业
  /// Create a time job
  async fn create_time_job(&self, job: &TimeJob) -> Result<()>;

  /// 创建或更新循环作业定义
  /// Create or update a recurring job definition
  async fn upsert_cron_job(&self, job: &CronJob) -> Result<()>;

  /// 按 id 读取一次性作业
  /// Read a time job by id
  async fn get_time_job(&self, id: Uuid) -> Result<Option<TimeJob>>;

  /// 按 id 读取循环作业定义
  /// Read a recurring job definition by id
  async fn get_cron_job(&self, id: Uuid) -> Result<Option<CronJob>>;

  /// 按 id 读取发生
  /// Read an occurrence by id
  async fn get_cron_occurrence(&self, id: Uuid) -> Result<Option<CronOccurrence>>;

  /// 原子认领到期的一次性作业
  /// Atomically claim due time jobs
  ///
  /// 选择 `execution_time <= now` 且对该节点可认领的作业，仅对写入时仍
  /// 满足谓词的行设置 `status=Queued, lock_holder=node_id, locked_at=now`
  /// （乐观并发：两个节点争抢同一行恰有一个胜者）。
  /// 输给并发认领的行被静默跳过。
  /// Selects jobs with `execution_time <= now` claimable by this node and
  /// sets `status=Queued, lock_holder=node_id, locked_at=now` only for rows
  /// still matching the predicate at write time (optimistic concurrency:
  /// two racing nodes produce exactly one winner). Rows lost to a
  /// concurrent claim are silently skipped.
  async fn claim_due_time_jobs(
    &self,
    node_id: &str,
    now: DateTime<Utc>,
    batch_size: usize,
  ) -> Result<Vec<TimeJob>>;

  /// 原子认领到期的循环作业发生，认领语义与一次性作业相同
  /// Atomically claim due cron occurrences with identical claim semantics
  async fn claim_due_cron_occurrences(
    &self,
    node_id: &str,
    now: DateTime<Utc>,
    batch_size: usize,
  ) -> Result<Vec<CronOccurrence>>;

  /// 释放死亡节点持有的全部锁，返回释放数量
  /// Release all locks held by dead nodes, returning the released count
  ///
  /// 这是崩溃节点的认领被回收的唯一路径；它依赖心跳 TTL 判定，
  /// 而非锁的年龄，因此绝不会作用于仅仅缓慢的节点。
  /// This is the only path by which a crashed node's claim is recovered;
  /// it depends on the heartbeat TTL verdict, not lock age, so it never
  /// fires for a node that is merely slow.
  async fn release_stale_locks(&self, dead_node_ids: &[String]) -> Result<u64>;

  /// 释放本节点的认领（背压路径）：作业回到 `Idle` 且解锁
  /// Release this node's claim (backpressure path): back to `Idle`, unlocked
  async fn release_claim(&self, job: JobRef) -> Result<()>;

  /// 作业被派发到工作者时标记 `InProgress`
  /// Mark `InProgress` when the job is dispatched to a worker
  async fn mark_in_progress(&self, job: JobRef) -> Result<()>;

  /// 终止写入：记录最终状态、异常消息与耗时
  /// Terminal write: record final status, exception message and elapsed time
  ///
  /// 进入终止状态后不再可认领，重试重置除外。
  /// No further claim is possible once terminal, except retry re-arming.
  async fn complete_job(
    &self,
    job: JobRef,
    final_status: JobStatus,
    exception_message: Option<&str>,
    elapsed: Duration,
  ) -> Result<()>;

  /// 重试重置：`status=Idle`，解锁，推进执行时间，重试计数加一
  /// Retry re-arm: `status=Idle`, unlocked, execution time advanced, retry
  /// counter incremented
  async fn schedule_retry(&self, job: JobRef, next_execution_time: DateTime<Utc>) -> Result<()>;

  /// 物化下一次发生；在 `(cron_job_id, execution_time)` 唯一性约束下幂等
  /// Materialize the next occurrence; idempotent under the
  /// `(cron_job_id, execution_time)` uniqueness invariant
  ///
  /// 重复插入按无操作处理（返回 `false`），不是错误。
  /// A duplicate insert is treated as a no-op (returns `false`), not an error.
  async fn materialize_next_occurrence(
    &self,
    cron_job_id: Uuid,
    execution_time: DateTime<Utc>,
  ) -> Result<bool>;

  /// 当前持有任意认领的去重节点列表，供僵锁回收查询死亡节点
  /// Distinct nodes currently holding any claim, feeding the reclaimer's
  /// dead-node query
  async fn lock_holders(&self) -> Result<Vec<String>>;
}

/// 心跳存储特性（外部协作者，如分布式缓存）
/// Heartbeat store trait (external collaborator, e.g. a distributed cache)
#[async_trait]
pub trait HeartbeatStore: Send + Sync {
  /// 写入本节点的存活信号，超过 `ttl` 未续期即视为死亡
  /// Write this node's liveness signal; unseen past `ttl` means dead
  async fn set_alive(&self, node_id: &str, ttl: Duration) -> Result<()>;

  /// 返回给定节点中已死亡的子集
  /// Return the dead subset of the given nodes
  async fn dead_nodes(&self, known_node_ids: &[String]) -> Result<Vec<String>>;

  /// 清除本节点的心跳记录（关闭时调用）
  /// Clear this node's heartbeat record (called on shutdown)
  async fn clear(&self, node_id: &str) -> Result<()>;
}
