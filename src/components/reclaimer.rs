//! 僵锁回收模块
//! Stale-lock reclamation module
//!
//! 定期查询当前持锁节点中已死亡（心跳超过 TTL 未续租）的节点，
//! 释放它们持有的全部锁，使对应作业重新可被认领。
//! Periodically queries which current lock holders are dead (heartbeat
//! unrenewed past the TTL) and releases every lock they hold, making the
//! affected jobs claimable again.

use crate::components::ComponentLifecycle;
use crate::error::Result;
use crate::store::{HeartbeatStore, TickerStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// 僵锁回收器
/// Stale-lock reclaimer
///
/// 死亡判定只看心跳 TTL，从不看锁的年龄：长时间执行的作业
/// 只要其节点还在心跳就不会被误收。
/// The dead verdict looks only at the heartbeat TTL, never at lock age: a
/// long-running job is never reclaimed while its node keeps heartbeating.
pub struct LockReclaimer {
  store: Arc<dyn TickerStore>,
  heartbeat_store: Arc<dyn HeartbeatStore>,
  node_id: String,
  interval: Duration,
  done: Arc<AtomicBool>,
}

impl LockReclaimer {
  /// 创建新的回收器
  /// Create a new reclaimer
  pub fn new(
    store: Arc<dyn TickerStore>,
    heartbeat_store: Arc<dyn HeartbeatStore>,
    node_id: String,
    interval: Duration,
  ) -> Self {
    Self {
      store,
      heartbeat_store,
      node_id,
      interval,
      done: Arc::new(AtomicBool::new(false)),
    }
  }

  /// 启动回收循环
  /// Start the reclamation loop
  pub fn start(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(self.interval);
      loop {
        interval.tick().await;

        if self.done.load(Ordering::Relaxed) {
          tracing::debug!("lock reclaimer shutting down");
          break;
        }

        match self.reclaim().await {
          Ok(0) => {}
          Ok(released) => {
            tracing::info!(released, "reclaimed locks from dead nodes");
          }
          Err(e) => {
            tracing::warn!("lock reclamation failed: {}", e);
          }
        }
      }
    })
  }

  /// 执行一轮回收，返回释放的锁数量
  /// Run one reclamation round, returning the number of released locks
  ///
  /// 本节点自身从候选中排除：它的存活由它自己的心跳保证。
  /// This node itself is excluded from the candidates: its liveness is
  /// vouched for by its own heartbeat.
  pub async fn reclaim(&self) -> Result<u64> {
    let holders: Vec<String> = self
      .store
      .lock_holders()
      .await?
      .into_iter()
      .filter(|holder| holder != &self.node_id)
      .collect();
    if holders.is_empty() {
      return Ok(0);
    }

    let dead = self.heartbeat_store.dead_nodes(&holders).await?;
    if dead.is_empty() {
      return Ok(0);
    }

    tracing::warn!(dead_nodes = ?dead, "dead nodes detected");
    self.store.release_stale_locks(&dead).await
  }

  /// 停止回收器
  /// Stop the reclaimer
  pub fn shutdown(&self) {
    self.done.store(true, Ordering::Relaxed);
  }

  /// 检查是否已完成
  /// Check if done
  pub fn is_done(&self) -> bool {
    self.done.load(Ordering::Relaxed)
  }
}

impl ComponentLifecycle for LockReclaimer {
  fn start(self: Arc<Self>) -> JoinHandle<()> {
    LockReclaimer::start(self)
  }

  fn shutdown(&self) {
    LockReclaimer::shutdown(self)
  }

  fn is_done(&self) -> bool {
    LockReclaimer::is_done(self)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::job::{JobStatus, TimeJob};
  use crate::store::{MemoryHeartbeatStore, MemoryTickerStore};
  use chrono::Utc;

  async fn claimed_job(store: &MemoryTickerStore, node_id: &str) -> TimeJob {
    let job = TimeJob::new("report:nightly", Utc::now());
    store.create_time_job(&job).await.unwrap();
    let claimed = store.claim_due_time_jobs(node_id, Utc::now(), 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    claimed.into_iter().next().unwrap()
  }

  #[tokio::test]
  async fn test_reclaim_releases_dead_node_locks() {
    let store = Arc::new(MemoryTickerStore::new());
    let heartbeat_store = Arc::new(MemoryHeartbeatStore::new());

    // node-b 认领后死亡（从未写入心跳）
    // node-b claims and dies (it never writes a heartbeat)
    let job = claimed_job(&store, "node-b").await;

    let reclaimer = LockReclaimer::new(
      store.clone(),
      heartbeat_store,
      "node-a".to_string(),
      Duration::from_secs(8),
    );

    assert_eq!(reclaimer.reclaim().await.unwrap(), 1);
    let job = store.get_time_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Idle);
    assert!(job.lock_holder.is_none());
  }

  #[tokio::test]
  async fn test_reclaim_spares_live_and_self() {
    let store = Arc::new(MemoryTickerStore::new());
    let heartbeat_store = Arc::new(MemoryHeartbeatStore::new());

    // node-b 存活；node-a 是回收器自身
    // node-b is alive; node-a is the reclaimer itself
    heartbeat_store
      .set_alive("node-b", Duration::from_secs(30))
      .await
      .unwrap();
    claimed_job(&store, "node-b").await;
    claimed_job(&store, "node-a").await;

    let reclaimer = LockReclaimer::new(
      store,
      heartbeat_store,
      "node-a".to_string(),
      Duration::from_secs(8),
    );

    assert_eq!(reclaimer.reclaim().await.unwrap(), 0);
  }

  #[test]
  fn test_reclaimer_shutdown_flag() {
    let reclaimer = LockReclaimer::new(
      Arc::new(MemoryTickerStore::new()),
      Arc::new(MemoryHeartbeatStore::new()),
      "node-a".to_string(),
      Duration::from_secs(8),
    );

    assert!(!reclaimer.is_done());
    reclaimer.shutdown();
    assert!(reclaimer.is_done());
  }
}
