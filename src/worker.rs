//! 工作池模块
//! Worker pool module
//!
//! 固定数量的工作者任务从优先级队列中取出作业工作项并轮询到完成。
//! 工作项一旦开始便始终在同一个工作者任务内执行（延续亲和性），
//! 绝不会被重新派发；队列容量有限，超出即拒绝（背压）。
//! A fixed number of worker tasks pop job work items from a priority queue
//! and poll each to completion. Once started, a work item runs inside the
//! same worker task for its whole life (continuation affinity) and is never
//! re-dispatched; the queue is bounded and enqueues beyond capacity are
//! rejected (backpressure).

use crate::error::{Error, Result};
use futures::FutureExt;
use std::collections::BinaryHeap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

type WorkFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// 队列中的工作项
/// A queued work item
///
/// 优先级高者先出队；同优先级按入队顺序（序号小者先）。
/// Higher priority dequeues first; within a priority, enqueue order wins
/// (lower sequence first).
struct WorkItem {
  priority: i32,
  seq: u64,
  work: WorkFuture,
}

impl PartialEq for WorkItem {
  fn eq(&self, other: &Self) -> bool {
    self.priority == other.priority && self.seq == other.seq
  }
}

impl Eq for WorkItem {}

impl PartialOrd for WorkItem {
  fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for WorkItem {
  fn cmp(&self, other: &Self) -> std::cmp::Ordering {
    // BinaryHeap 是最大堆：优先级正序，序号倒序
    // BinaryHeap is a max-heap: priority ascending, sequence descending
    self
      .priority
      .cmp(&other.priority)
      .then_with(|| other.seq.cmp(&self.seq))
  }
}

struct PoolShared {
  queue: Mutex<BinaryHeap<WorkItem>>,
  queue_capacity: usize,
  notify: Notify,
  shutting_down: AtomicBool,
  active_workers: Arc<AtomicUsize>,
  next_seq: AtomicU64,
}

/// 工作池
/// Worker pool
pub struct WorkerPool {
  shared: Arc<PoolShared>,
  pool_size: usize,
  workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
  /// 创建新的工作池（尚未启动工作者）
  /// Create a new pool (workers not yet started)
  pub fn new(pool_size: usize, queue_capacity: usize) -> Self {
    Self {
      shared: Arc::new(PoolShared {
        queue: Mutex::new(BinaryHeap::new()),
        queue_capacity,
        notify: Notify::new(),
        shutting_down: AtomicBool::new(false),
        active_workers: Arc::new(AtomicUsize::new(0)),
        next_seq: AtomicU64::new(0),
      }),
      pool_size,
      workers: Mutex::new(Vec::new()),
    }
  }

  /// 启动工作者任务
  /// Start the worker tasks
  pub fn start(&self) {
    let mut workers = self.workers.lock().unwrap();
    if !workers.is_empty() {
      return;
    }
    for worker_id in 0..self.pool_size {
      let shared = Arc::clone(&self.shared);
      workers.push(tokio::spawn(worker_loop(worker_id, shared)));
    }
  }

  /// 入队一个工作项
  /// Enqueue a work item
  ///
  /// 队列已满返回 [`Error::QueueFull`]，调用方应释放对应认领；
  /// 关闭后入队返回 [`Error::SchedulerClosed`]。
  /// Returns [`Error::QueueFull`] when the queue is at capacity, in which
  /// case the caller should release the matching claim; enqueuing after
  /// shutdown returns [`Error::SchedulerClosed`].
  pub fn enqueue<F>(&self, priority: i32, work: F) -> Result<()>
  where
    F: Future<Output = ()> + Send + 'static,
  {
    if self.shared.shutting_down.load(Ordering::SeqCst) {
      return Err(Error::SchedulerClosed);
    }

    {
      let mut queue = self.shared.queue.lock().unwrap();
      if queue.len() >= self.shared.queue_capacity {
        return Err(Error::QueueFull);
      }
      queue.push(WorkItem {
        priority,
        seq: self.shared.next_seq.fetch_add(1, Ordering::Relaxed),
        work: Box::pin(work),
      });
    }

    self.shared.notify.notify_one();
    Ok(())
  }

  /// 当前正在执行工作项的工作者数量
  /// Number of workers currently executing a work item
  pub fn active_workers(&self) -> usize {
    self.shared.active_workers.load(Ordering::Relaxed)
  }

  /// 活跃工作者计数器的共享句柄
  /// Shared handle to the active-worker counter
  pub fn active_workers_handle(&self) -> Arc<AtomicUsize> {
    Arc::clone(&self.shared.active_workers)
  }

  /// 当前排队等待的工作项数量
  /// Number of work items currently queued
  pub fn queued(&self) -> usize {
    self.shared.queue.lock().unwrap().len()
  }

  /// 关闭工作池：排空队列，等待所有工作者退出
  /// Shut down the pool: drain the queue and wait for every worker to exit
  pub async fn shutdown(&self) {
    self.shared.shutting_down.store(true, Ordering::SeqCst);
    self.shared.notify.notify_waiters();

    let workers = std::mem::take(&mut *self.workers.lock().unwrap());
    for handle in workers {
      let _ = handle.await;
    }
    tracing::debug!("worker pool drained and stopped");
  }
}

/// 工作者主循环
/// Worker main loop
///
/// 弹出的工作项在本任务内轮询到完成；工作项 panic 被捕获并记录，
/// 工作者本身继续存活。
/// A popped work item is polled to completion inside this task; a panicking
/// item is caught and logged, and the worker itself stays alive.
async fn worker_loop(worker_id: usize, shared: Arc<PoolShared>) {
  loop {
    let item = shared.queue.lock().unwrap().pop();

    match item {
      Some(item) => {
        shared.active_workers.fetch_add(1, Ordering::Relaxed);
        if AssertUnwindSafe(item.work).catch_unwind().await.is_err() {
          tracing::error!(worker_id, "work item panicked");
        }
        shared.active_workers.fetch_sub(1, Ordering::Relaxed);
      }
      None => {
        if shared.shutting_down.load(Ordering::SeqCst) {
          break;
        }
        // 通知可能在检查与等待之间丢失，用短超时兜底
        // A notification can be lost between the check and the wait, so
        // fall back to a short timeout
        tokio::select! {
          _ = shared.notify.notified() => {}
          _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
      }
    }
  }
  tracing::trace!(worker_id, "worker exited");
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  #[tokio::test]
  async fn test_priority_then_fifo_order() {
    let pool = WorkerPool::new(1, 16);
    let order = Arc::new(Mutex::new(Vec::new()));

    for (priority, tag) in [(0, "low-1"), (5, "high-1"), (0, "low-2"), (5, "high-2")] {
      let order = Arc::clone(&order);
      pool
        .enqueue(priority, async move {
          order.lock().unwrap().push(tag);
        })
        .unwrap();
    }

    // 启动前入队使排序可观察：单工作者按堆序依次执行
    // Enqueued before start so ordering is observable: the single worker
    // runs them in heap order
    pool.start();
    pool.shutdown().await;

    assert_eq!(
      *order.lock().unwrap(),
      vec!["high-1", "high-2", "low-1", "low-2"]
    );
  }

  #[tokio::test]
  async fn test_enqueue_rejected_at_capacity() {
    let pool = WorkerPool::new(1, 2);
    pool.enqueue(0, async {}).unwrap();
    pool.enqueue(0, async {}).unwrap();

    let err = pool.enqueue(0, async {}).expect_err("must reject");
    assert!(matches!(err, Error::QueueFull));
    assert_eq!(pool.queued(), 2);
  }

  #[tokio::test]
  async fn test_bounded_concurrency() {
    let pool = WorkerPool::new(2, 16);
    let running = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    for _ in 0..6 {
      let running = Arc::clone(&running);
      let max_seen = Arc::clone(&max_seen);
      pool
        .enqueue(0, async move {
          let now = running.fetch_add(1, Ordering::SeqCst) + 1;
          max_seen.fetch_max(now, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_millis(30)).await;
          running.fetch_sub(1, Ordering::SeqCst);
        })
        .unwrap();
    }

    pool.start();
    pool.shutdown().await;

    assert!(max_seen.load(Ordering::SeqCst) <= 2);
    assert_eq!(running.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_panic_does_not_kill_worker() {
    let pool = WorkerPool::new(1, 16);
    let ran = Arc::new(AtomicUsize::new(0));

    pool.enqueue(1, async { panic!("boom") }).unwrap();
    let counter = Arc::clone(&ran);
    pool
      .enqueue(0, async move {
        counter.fetch_add(1, Ordering::SeqCst);
      })
      .unwrap();

    pool.start();
    pool.shutdown().await;

    assert_eq!(ran.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_shutdown_drains_queue() {
    let pool = WorkerPool::new(2, 64);
    let done = Arc::new(AtomicUsize::new(0));

    pool.start();
    for _ in 0..20 {
      let done = Arc::clone(&done);
      pool
        .enqueue(0, async move {
          done.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    pool.shutdown().await;

    assert_eq!(done.load(Ordering::SeqCst), 20);
    assert_eq!(pool.queued(), 0);
  }

  #[tokio::test]
  async fn test_enqueue_after_shutdown() {
    let pool = WorkerPool::new(1, 16);
    pool.start();
    pool.shutdown().await;

    let err = pool.enqueue(0, async {}).expect_err("must be closed");
    assert!(matches!(err, Error::SchedulerClosed));
  }
}
