//! 内存存储实现
//! Memory store implementation
//!
//! 使用内存数据结构实现作业存储与心跳存储，不依赖任何外部服务；
//! 用于测试与单进程嵌入场景。
//! Implements the job store and heartbeat store with in-memory data
//! structures, without any external service dependencies; used for tests
//! and single-process embedding.

use crate::error::{Error, Result};
use crate::job::{CronJob, CronOccurrence, HasId, HasLockState, JobRef, JobStatus, TimeJob};
use crate::store::{HeartbeatStore, TickerStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

/// 内存存储数据
/// In-memory storage data
#[derive(Default)]
struct MemoryStorage {
  time_jobs: HashMap<Uuid, TimeJob>,
  cron_jobs: HashMap<Uuid, CronJob>,
  occurrences: HashMap<Uuid, CronOccurrence>,
  // 已物化的 (cron_job_id, execution_time) 组合，保证唯一性
  // Materialized (cron_job_id, execution_time) pairs, enforcing uniqueness
  materialized: HashSet<(Uuid, DateTime<Utc>)>,
}

/// 内存作业存储
/// In-memory job store
///
/// 整个认领批次在一把写锁下完成：认领谓词在锁内重新求值后才写入，
/// 因此并发认领者恰有一个胜者。
/// Each claim batch runs under one write lock: the claim predicate is
/// re-evaluated under the lock before writing, so concurrent claimants
/// produce exactly one winner.
pub struct MemoryTickerStore {
  storage: Arc<RwLock<MemoryStorage>>,
}

impl Default for MemoryTickerStore {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryTickerStore {
  /// 创建新的内存存储实例
  /// Create a new in-memory store instance
  pub fn new() -> Self {
    Self {
      storage: Arc::new(RwLock::new(MemoryStorage::default())),
    }
  }
}

/// 在一类实体上执行认领：到期、可认领、按执行时间排序、截取批量
/// Claim over one entity kind: due, claimable, ordered by execution time,
/// truncated to the batch size
fn claim_due<T>(
  items: &mut HashMap<Uuid, T>,
  node_id: &str,
  now: DateTime<Utc>,
  batch_size: usize,
) -> Vec<T>
where
  T: HasId + HasLockState + Clone,
{
  let mut due: Vec<(DateTime<Utc>, Uuid)> = items
    .values()
    .filter(|item| item.execution_time() <= now && item.is_claimable_by(node_id))
    .map(|item| (item.execution_time(), item.id()))
    .collect();
  due.sort();
  due.truncate(batch_size);

  let mut claimed = Vec::with_capacity(due.len());
  for (_, id) in due {
    if let Some(item) = items.get_mut(&id) {
      item.set_status(JobStatus::Queued);
      item.lock(node_id, now);
      claimed.push(item.clone());
    }
  }
  claimed
}

/// 清除死亡节点持有的锁并复位为 `Idle`
/// Clear locks held by dead nodes and reset to `Idle`
fn release_stale<T>(items: &mut HashMap<Uuid, T>, dead_node_ids: &[String]) -> u64
where
  T: HasLockState,
{
  let mut released = 0;
  for item in items.values_mut() {
    if item.status().is_terminal() {
      continue;
    }
    if let Some(holder) = item.lock_holder() {
      if dead_node_ids.iter().any(|dead| dead == holder) {
        item.unlock();
        item.set_status(JobStatus::Idle);
        released += 1;
      }
    }
  }
  released
}

#[async_trait]
impl TickerStore for MemoryTickerStore {
  async fn create_time_job(&self, job: &TimeJob) -> Result<()> {
    let mut storage = self.storage.write().await;
    storage.time_jobs.insert(job.id, job.clone());
    Ok(())
  }

  async fn upsert_cron_job(&self, job: &CronJob) -> Result<()> {
    let mut storage = self.storage.write().await;
    storage.cron_jobs.insert(job.id, job.clone());
    Ok(())
  }

  async fn get_time_job(&self, id: Uuid) -> Result<Option<TimeJob>> {
    Ok(self.storage.read().await.time_jobs.get(&id).cloned())
  }

  async fn get_cron_job(&self, id: Uuid) -> Result<Option<CronJob>> {
    Ok(self.storage.read().await.cron_jobs.get(&id).cloned())
  }

  async fn get_cron_occurrence(&self, id: Uuid) -> Result<Option<CronOccurrence>> {
    Ok(self.storage.read().await.occurrences.get(&id).cloned())
  }

  async fn claim_due_time_jobs(
    &self,
    node_id: &str,
    now: DateTime<Utc>,
    batch_size: usize,
  ) -> Result<Vec<TimeJob>> {
    let mut storage = self.storage.write().await;
    Ok(claim_due(&mut storage.time_jobs, node_id, now, batch_size))
  }

  async fn claim_due_cron_occurrences(
    &self,
    node_id: &str,
    now: DateTime<Utc>,
    batch_size: usize,
  ) -> Result<Vec<CronOccurrence>> {
    let mut storage = self.storage.write().await;
    Ok(claim_due(&mut storage.occurrences, node_id, now, batch_size))
  }

  async fn release_stale_locks(&self, dead_node_ids: &[String]) -> Result<u64> {
    if dead_node_ids.is_empty() {
      return Ok(0);
    }
    let mut storage = self.storage.write().await;
    let mut released = release_stale(&mut storage.time_jobs, dead_node_ids);
    released += release_stale(&mut storage.occurrences, dead_node_ids);
    Ok(released)
  }

  async fn release_claim(&self, job: JobRef) -> Result<()> {
    let mut storage = self.storage.write().await;
    match job {
      JobRef::Time(id) => {
        let item = storage
          .time_jobs
          .get_mut(&id)
          .ok_or(Error::JobNotFound { id })?;
        if !item.status.is_terminal() {
          item.unlock();
          item.set_status(JobStatus::Idle);
        }
      }
      JobRef::Cron(id) => {
        let item = storage
          .occurrences
          .get_mut(&id)
          .ok_or(Error::JobNotFound { id })?;
        if !item.status.is_terminal() {
          item.unlock();
          item.set_status(JobStatus::Idle);
        }
      }
    }
    Ok(())
  }

  async fn mark_in_progress(&self, job: JobRef) -> Result<()> {
    let mut storage = self.storage.write().await;
    match job {
      JobRef::Time(id) => {
        storage
          .time_jobs
          .get_mut(&id)
          .ok_or(Error::JobNotFound { id })?
          .set_status(JobStatus::InProgress);
      }
      JobRef::Cron(id) => {
        let item = storage
          .occurrences
          .get_mut(&id)
          .ok_or(Error::JobNotFound { id })?;
        item.set_status(JobStatus::InProgress);
        item.executed_at = Some(Utc::now());
      }
    }
    Ok(())
  }

  async fn complete_job(
    &self,
    job: JobRef,
    final_status: JobStatus,
    exception_message: Option<&str>,
    elapsed: Duration,
  ) -> Result<()> {
    let mut storage = self.storage.write().await;
    match job {
      JobRef::Time(id) => {
        let item = storage
          .time_jobs
          .get_mut(&id)
          .ok_or(Error::JobNotFound { id })?;
        item.set_status(final_status);
        item.exception_message = exception_message.map(str::to_string);
        item.elapsed = Some(elapsed);
        item.unlock();
      }
      JobRef::Cron(id) => {
        let item = storage
          .occurrences
          .get_mut(&id)
          .ok_or(Error::JobNotFound { id })?;
        item.set_status(final_status);
        if final_status == JobStatus::Skipped {
          item.skipped_reason = exception_message.map(str::to_string);
        } else {
          item.exception_message = exception_message.map(str::to_string);
        }
        item.elapsed = Some(elapsed);
        item.unlock();
      }
    }
    Ok(())
  }

  async fn schedule_retry(&self, job: JobRef, next_execution_time: DateTime<Utc>) -> Result<()> {
    let mut storage = self.storage.write().await;
    match job {
      JobRef::Time(id) => {
        let item = storage
          .time_jobs
          .get_mut(&id)
          .ok_or(Error::JobNotFound { id })?;
        item.set_status(JobStatus::Idle);
        item.unlock();
        item.execution_time = next_execution_time;
        item.retries += 1;
      }
      JobRef::Cron(id) => {
        let item = storage
          .occurrences
          .get_mut(&id)
          .ok_or(Error::JobNotFound { id })?;
        item.set_status(JobStatus::Idle);
        item.unlock();
        item.execution_time = next_execution_time;
        item.retry_count += 1;
      }
    }
    Ok(())
  }

  async fn materialize_next_occurrence(
    &self,
    cron_job_id: Uuid,
    execution_time: DateTime<Utc>,
  ) -> Result<bool> {
    let mut storage = self.storage.write().await;
    if !storage.cron_jobs.contains_key(&cron_job_id) {
      return Err(Error::JobNotFound { id: cron_job_id });
    }
    if !storage.materialized.insert((cron_job_id, execution_time)) {
      // 重复插入按无操作处理
      // Duplicate insert treated as a no-op
      return Ok(false);
    }
    let occurrence = CronOccurrence::new(cron_job_id, execution_time);
    storage.occurrences.insert(occurrence.id, occurrence);
    Ok(true)
  }

  async fn lock_holders(&self) -> Result<Vec<String>> {
    let storage = self.storage.read().await;
    let mut holders = HashSet::new();
    for job in storage.time_jobs.values() {
      if !job.status.is_terminal() {
        if let Some(holder) = job.lock_holder.as_deref() {
          holders.insert(holder.to_string());
        }
      }
    }
    for occurrence in storage.occurrences.values() {
      if !occurrence.status.is_terminal() {
        if let Some(holder) = occurrence.lock_holder.as_deref() {
          holders.insert(holder.to_string());
        }
      }
    }
    Ok(holders.into_iter().collect())
  }
}

/// 内存心跳存储
/// In-memory heartbeat store
///
/// 记录每个节点的心跳过期时刻；记录缺失或已过期即为死亡。
/// Tracks each node's heartbeat expiry instant; a missing or expired
/// record means dead.
#[derive(Default)]
pub struct MemoryHeartbeatStore {
  expirations: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl MemoryHeartbeatStore {
  /// 创建新的内存心跳存储
  /// Create a new in-memory heartbeat store
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl HeartbeatStore for MemoryHeartbeatStore {
  async fn set_alive(&self, node_id: &str, ttl: Duration) -> Result<()> {
    // 超出表示范围的 TTL 取饱和值，绝不能反向坍缩成立刻过期
    // An out-of-range TTL saturates; it must never collapse into an
    // immediate expiry
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    let expires_at = Utc::now()
      .checked_add_signed(ttl)
      .unwrap_or(DateTime::<Utc>::MAX_UTC);
    self
      .expirations
      .write()
      .await
      .insert(node_id.to_string(), expires_at);
    Ok(())
  }

  async fn dead_nodes(&self, known_node_ids: &[String]) -> Result<Vec<String>> {
    let now = Utc::now();
    let expirations = self.expirations.read().await;
    Ok(
      known_node_ids
        .iter()
        .filter(|node_id| {
          expirations
            .get(*node_id)
            .map_or(true, |expires_at| *expires_at <= now)
        })
        .cloned()
        .collect(),
    )
  }

  async fn clear(&self, node_id: &str) -> Result<()> {
    self.expirations.write().await.remove(node_id);
    Ok(())
  }
}
