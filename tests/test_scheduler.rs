//! 调度器端到端集成测试
//! End-to-end integration tests for the scheduler

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ticker::config::TickerConfig;
use ticker::error::Error;
use ticker::job::{CronJob, JobStatus, TimeJob};
use ticker::registry::FunctionRegistry;
use ticker::scheduler::Scheduler;
use ticker::store::{MemoryHeartbeatStore, MemoryTickerStore, TickerStore};

fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

fn fast_config(node_id: &str) -> TickerConfig {
  init_tracing();
  TickerConfig::new(node_id)
    .poll_interval(Duration::from_millis(20))
    .heartbeat_interval(Duration::from_millis(50))
    .heartbeat_ttl(Duration::from_secs(5))
    .reclaim_interval(Duration::from_millis(100))
}

fn scheduler(
  config: TickerConfig,
  store: Arc<MemoryTickerStore>,
  registry: Arc<FunctionRegistry>,
) -> Scheduler {
  Scheduler::new(config, store, Arc::new(MemoryHeartbeatStore::new()), registry).unwrap()
}

#[tokio::test]
async fn test_time_job_executes_once() {
  let store = Arc::new(MemoryTickerStore::new());
  let registry = Arc::new(FunctionRegistry::new());
  let calls = Arc::new(AtomicUsize::new(0));
  let counter = Arc::clone(&calls);
  registry.register_async_fn("email:send", move |ctx| {
    let counter = Arc::clone(&counter);
    async move {
      assert_eq!(ctx.request(), Some(b"to:alice".as_slice()));
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
  });

  let mut scheduler = scheduler(fast_config("node-a"), store.clone(), registry);
  scheduler.start().unwrap();

  let id = scheduler
    .register_time_job(TimeJob::new("email:send", Utc::now()).with_request(b"to:alice".to_vec()))
    .await
    .unwrap();

  tokio::time::sleep(Duration::from_millis(300)).await;
  scheduler.shutdown().await;

  assert_eq!(calls.load(Ordering::SeqCst), 1);
  let stored = store.get_time_job(id).await.unwrap().unwrap();
  assert_eq!(stored.status, JobStatus::Done);
  assert!(stored.elapsed.is_some());
  assert!(stored.lock_holder.is_none());
}

#[tokio::test]
async fn test_cron_job_fires_repeatedly() {
  let store = Arc::new(MemoryTickerStore::new());
  let registry = Arc::new(FunctionRegistry::new());
  let calls = Arc::new(AtomicUsize::new(0));
  let counter = Arc::clone(&calls);
  registry.register_fn("tick", move |_ctx| {
    counter.fetch_add(1, Ordering::SeqCst);
    Ok(())
  });

  let mut scheduler = scheduler(fast_config("node-a"), store.clone(), registry);
  scheduler.start().unwrap();

  scheduler
    .register_cron_job(CronJob::new("tick", "* * * * * *"))
    .await
    .unwrap();

  // 每秒一次，2.5 秒内应至少发生两次
  // Firing every second, at least two occurrences within 2.5 seconds
  tokio::time::sleep(Duration::from_millis(2500)).await;
  scheduler.shutdown().await;

  assert!(calls.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_retry_progression_until_failed() {
  let store = Arc::new(MemoryTickerStore::new());
  let registry = Arc::new(FunctionRegistry::new());
  let attempts = Arc::new(AtomicUsize::new(0));
  let counter = Arc::clone(&attempts);
  registry.register_fn("flaky", move |_ctx| {
    counter.fetch_add(1, Ordering::SeqCst);
    Err(Error::other("still broken"))
  });

  let mut scheduler = scheduler(fast_config("node-a"), store.clone(), registry);
  scheduler.start().unwrap();

  let intervals = vec![
    Duration::from_millis(10),
    Duration::from_millis(10),
    Duration::from_millis(10),
  ];
  let id = scheduler
    .register_time_job(TimeJob::new("flaky", Utc::now()).with_retry_intervals(intervals))
    .await
    .unwrap();

  tokio::time::sleep(Duration::from_millis(1500)).await;
  scheduler.shutdown().await;

  // 首次执行加三次重试，之后间隔耗尽
  // The first attempt plus three retries, then the intervals are exhausted
  assert_eq!(attempts.load(Ordering::SeqCst), 4);
  let stored = store.get_time_job(id).await.unwrap().unwrap();
  assert_eq!(stored.status, JobStatus::Failed);
  assert_eq!(stored.retries, 3);
  assert!(stored
    .exception_message
    .as_deref()
    .unwrap()
    .contains("still broken"));
}

/// 作业函数恐慌不得卡死作业：结果照常落盘，重试策略照常生效
/// A panicking job function must not wedge its job: the outcome is still
/// persisted and the retry policy still engages
#[tokio::test]
async fn test_panicking_function_does_not_wedge_job() {
  let store = Arc::new(MemoryTickerStore::new());
  let registry = Arc::new(FunctionRegistry::new());
  registry.register_fn("buggy", |_ctx| panic!("handler bug"));

  let mut scheduler = scheduler(fast_config("node-a"), store.clone(), registry);
  scheduler.start().unwrap();

  let id = scheduler
    .register_time_job(
      TimeJob::new("buggy", Utc::now()).with_retry_intervals(vec![Duration::from_millis(10)]),
    )
    .await
    .unwrap();

  tokio::time::sleep(Duration::from_millis(500)).await;
  scheduler.shutdown().await;

  let stored = store.get_time_job(id).await.unwrap().unwrap();
  assert_eq!(stored.status, JobStatus::Failed);
  assert_eq!(stored.retries, 1);
  assert!(stored.lock_holder.is_none());
  assert!(stored
    .exception_message
    .as_deref()
    .unwrap()
    .contains("handler bug"));
}

#[tokio::test]
async fn test_worker_pool_bounds_concurrency() {
  let store = Arc::new(MemoryTickerStore::new());
  let registry = Arc::new(FunctionRegistry::new());
  let running = Arc::new(AtomicUsize::new(0));
  let max_seen = Arc::new(AtomicUsize::new(0));
  {
    let running = Arc::clone(&running);
    let max_seen = Arc::clone(&max_seen);
    registry.register_async_fn("busy", move |_ctx| {
      let running = Arc::clone(&running);
      let max_seen = Arc::clone(&max_seen);
      async move {
        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
        max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        running.fetch_sub(1, Ordering::SeqCst);
        Ok(())
      }
    });
  }

  let config = fast_config("node-a").worker_pool_size(4);
  let mut scheduler = scheduler(config, store.clone(), registry);
  scheduler.start().unwrap();

  for _ in 0..8 {
    scheduler
      .register_time_job(TimeJob::new("busy", Utc::now()))
      .await
      .unwrap();
  }

  tokio::time::sleep(Duration::from_millis(800)).await;
  scheduler.shutdown().await;

  assert!(max_seen.load(Ordering::SeqCst) <= 4);
  assert_eq!(running.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancel_marks_job_skipped() {
  let store = Arc::new(MemoryTickerStore::new());
  let registry = Arc::new(FunctionRegistry::new());
  registry.register_async_fn("endless", |ctx| async move {
    loop {
      ctx.checkpoint()?;
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  });

  let mut scheduler = scheduler(fast_config("node-a"), store.clone(), registry);
  scheduler.start().unwrap();

  let id = scheduler
    .register_time_job(TimeJob::new("endless", Utc::now()))
    .await
    .unwrap();

  // 等作业进入执行再取消
  // Cancel once the job is executing
  tokio::time::sleep(Duration::from_millis(200)).await;
  assert!(scheduler.cancel(id));
  tokio::time::sleep(Duration::from_millis(100)).await;
  scheduler.shutdown().await;

  let stored = store.get_time_job(id).await.unwrap().unwrap();
  assert_eq!(stored.status, JobStatus::Skipped);
  assert_eq!(stored.exception_message.as_deref(), Some("cancelled"));
}

/// 两个节点指向同一存储时，每个作业仍只执行一次
/// With two nodes on one store, each job still executes exactly once
#[tokio::test]
async fn test_two_nodes_single_execution() {
  let store = Arc::new(MemoryTickerStore::new());
  let heartbeat_store = Arc::new(MemoryHeartbeatStore::new());
  let calls = Arc::new(AtomicUsize::new(0));

  let mut schedulers = Vec::new();
  for node in ["node-a", "node-b"] {
    let registry = Arc::new(FunctionRegistry::new());
    let counter = Arc::clone(&calls);
    registry.register_fn("once", move |_ctx| {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(())
    });
    let mut scheduler = Scheduler::new(
      fast_config(node),
      store.clone() as Arc<dyn TickerStore>,
      heartbeat_store.clone(),
      registry,
    )
    .unwrap();
    scheduler.start().unwrap();
    schedulers.push(scheduler);
  }

  for _ in 0..10 {
    store
      .create_time_job(&TimeJob::new("once", Utc::now()))
      .await
      .unwrap();
  }

  tokio::time::sleep(Duration::from_millis(500)).await;
  for mut scheduler in schedulers {
    scheduler.shutdown().await;
  }

  assert_eq!(calls.load(Ordering::SeqCst), 10);
}
