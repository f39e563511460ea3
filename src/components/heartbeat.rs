//! 节点心跳模块
//! Node heartbeat module
//!
//! 周期性写入本节点的存活信号以续租；节点超过 TTL 未续租即被集群
//! 判定为死亡，其持有的锁可被回收。关闭时清除心跳记录。
//! Periodically writes this node's liveness signal to renew the lease; a
//! node unseen past the TTL is judged dead by the cluster and its locks
//! become reclaimable. The heartbeat record is cleared on shutdown.

use crate::components::ComponentLifecycle;
use crate::store::HeartbeatStore;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// 节点心跳器
/// Node heartbeat
pub struct NodeHeartbeat {
  heartbeat_store: Arc<dyn HeartbeatStore>,
  node_id: String,
  interval: Duration,
  ttl: Duration,
  active_workers: Arc<AtomicUsize>,
  shutting_down: Arc<AtomicBool>,
}

impl NodeHeartbeat {
  pub fn new(
    heartbeat_store: Arc<dyn HeartbeatStore>,
    node_id: String,
    interval: Duration,
    ttl: Duration,
    active_workers: Arc<AtomicUsize>,
  ) -> Self {
    Self {
      heartbeat_store,
      node_id,
      interval,
      ttl,
      active_workers,
      shutting_down: Arc::new(AtomicBool::new(false)),
    }
  }

  /// 启动心跳循环
  /// Start the heartbeat loop
  ///
  /// 写入失败仅告警，下个周期重试；持续失败最终导致本节点被
  /// 判死、锁被回收，因此不在此处中断执行。
  /// A write failure is only warned about and retried next cycle;
  /// persistent failure eventually gets this node judged dead and its
  /// locks reclaimed, so execution is not interrupted here.
  pub fn start(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.interval);
      loop {
        ticker.tick().await;
        if self.shutting_down.load(Ordering::Relaxed) {
          break;
        }
        tracing::trace!(
          node_id = %self.node_id,
          active_workers = self.active_workers.load(Ordering::Relaxed),
          "heartbeat"
        );
        if let Err(e) = self.heartbeat_store.set_alive(&self.node_id, self.ttl).await {
          tracing::warn!("heartbeat write failed: {}", e);
        }
      }
      // 退出时清理心跳记录，让锁回收立即生效
      // Clear the heartbeat record on exit so lock reclamation takes
      // effect immediately
      if let Err(e) = self.heartbeat_store.clear(&self.node_id).await {
        tracing::warn!("heartbeat clear failed: {}", e);
      }
    })
  }

  /// 请求心跳循环终止
  /// Request the termination of the heartbeat loop
  pub fn shutdown(&self) {
    self.shutting_down.store(true, Ordering::Relaxed);
  }

  /// 检查是否已停止
  /// Check if it has stopped
  pub fn is_done(&self) -> bool {
    self.shutting_down.load(Ordering::Relaxed)
  }
}

impl ComponentLifecycle for NodeHeartbeat {
  fn start(self: Arc<Self>) -> JoinHandle<()> {
    NodeHeartbeat::start(self)
  }

  fn shutdown(&self) {
    NodeHeartbeat::shutdown(self)
  }

  fn is_done(&self) -> bool {
    NodeHeartbeat::is_done(self)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::MemoryHeartbeatStore;

  #[tokio::test]
  async fn test_heartbeat_keeps_node_alive_then_clears() {
    let store = Arc::new(MemoryHeartbeatStore::new());
    let heartbeat = Arc::new(NodeHeartbeat::new(
      store.clone(),
      "node-a".to_string(),
      Duration::from_millis(10),
      Duration::from_secs(5),
      Arc::new(AtomicUsize::new(0)),
    ));

    let handle = heartbeat.clone().start();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let known = vec!["node-a".to_string()];
    assert!(store.dead_nodes(&known).await.unwrap().is_empty());

    heartbeat.shutdown();
    handle.await.unwrap();

    // 清除后节点视为死亡
    // After clearing, the node counts as dead
    assert_eq!(store.dead_nodes(&known).await.unwrap(), known);
  }

  #[test]
  fn test_heartbeat_shutdown_flag() {
    let heartbeat = NodeHeartbeat::new(
      Arc::new(MemoryHeartbeatStore::new()),
      "node-a".to_string(),
      Duration::from_secs(5),
      Duration::from_secs(30),
      Arc::new(AtomicUsize::new(0)),
    );

    assert!(!heartbeat.is_done());
    heartbeat.shutdown();
    assert!(heartbeat.is_done());
  }
}
