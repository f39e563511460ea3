//! 配置模块
//! Configuration module
//!
//! 定义了调度器核心识别的配置选项
//! Defines the configuration options recognized by the scheduler core

use crate::error::{Error, Result};
use chrono_tz::Tz;
use std::time::Duration;
use uuid::Uuid;

/// 调度器配置
/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct TickerConfig {
  /// 节点 id，必填；集群内须唯一
  /// Node id, required; must be unique within the cluster
  pub node_id: String,
  /// 轮询间隔：派发器每隔多久查找到期作业
  /// Poll interval: how often the dispatcher looks for due work
  pub poll_interval: Duration,
  /// 工作池大小：单节点内的并发执行上限 `N`
  /// Worker pool size: per-node concurrent execution ceiling `N`
  pub worker_pool_size: usize,
  /// 工作池队列容量：超出后入队被拒绝（背压）
  /// Worker pool queue capacity: enqueues are rejected beyond it (backpressure)
  pub queue_capacity: usize,
  /// 心跳间隔
  /// Heartbeat interval
  pub heartbeat_interval: Duration,
  /// 心跳存活时长（TTL）
  /// Heartbeat time-to-live (TTL)
  ///
  /// 超过 TTL 未见心跳的节点视为死亡，其锁可被任意节点回收。
  /// 取舍：一个存活但停顿超过 TTL 的节点（如长 GC）会失去其认领，
  /// 对应作业可能被执行两次；TTL 越短回收越快，误判风险越大。
  /// A node unseen for longer than the TTL is judged dead and its locks
  /// become reclaimable by any node. Trade-off: a live node stalled past
  /// the TTL (e.g. a long GC pause) loses its claims and the job may run
  /// twice; a shorter TTL reclaims faster but misjudges more easily.
  pub heartbeat_ttl: Duration,
  /// 僵锁回收检查间隔
  /// Stale-lock reclamation check interval
  pub reclaim_interval: Duration,
  /// 每次认领的批量大小
  /// Claim batch size per tick
  pub batch_size: usize,
  /// 默认重试间隔：作业自身未携带间隔列表时使用
  /// Default retry intervals, used when a job carries no interval list
  pub default_retry_intervals: Vec<Duration>,
  /// 一次性作业的派发优先级
  /// Dispatch priority for time jobs
  pub time_job_priority: i32,
  /// 循环作业发生的派发优先级
  /// Dispatch priority for cron occurrences
  pub cron_priority: i32,
  /// 关闭超时时间
  /// Shutdown timeout
  pub shutdown_timeout: Duration,
  /// 发生计算所用时区（IANA），默认 UTC
  /// Time zone for occurrence math (IANA), defaults to UTC
  pub time_zone: Tz,
}

impl Default for TickerConfig {
  fn default() -> Self {
    Self {
      node_id: String::new(),
      poll_interval: Duration::from_secs(1),
      worker_pool_size: 256,
      queue_capacity: 1024,
      heartbeat_interval: Duration::from_secs(5),
      heartbeat_ttl: Duration::from_secs(30),
      reclaim_interval: Duration::from_secs(8),
      batch_size: 100,
      default_retry_intervals: Vec::new(),
      time_job_priority: 0,
      cron_priority: 0,
      shutdown_timeout: Duration::from_secs(8),
      time_zone: Tz::UTC,
    }
  }
}

impl TickerConfig {
  /// 创建新的配置，节点 id 必填
  /// Create a new configuration; the node id is required
  pub fn new<S: Into<String>>(node_id: S) -> Self {
    Self {
      node_id: node_id.into(),
      ..Self::default()
    }
  }

  /// 以 `hostname:pid:uuid` 生成节点 id 创建配置
  /// Create a configuration with a `hostname:pid:uuid` node id
  pub fn for_host() -> Self {
    let host = hostname::get()
      .unwrap_or_default()
      .to_string_lossy()
      .to_string();
    let node_id = format!("{}:{}:{}", host, std::process::id(), Uuid::new_v4());
    Self::new(node_id)
  }

  /// 设置轮询间隔
  /// Set the poll interval
  pub fn poll_interval(mut self, interval: Duration) -> Self {
    self.poll_interval = interval;
    self
  }

  /// 设置工作池大小
  /// Set the worker pool size
  pub fn worker_pool_size(mut self, size: usize) -> Self {
    self.worker_pool_size = size.max(1);
    self
  }

  /// 设置工作池队列容量
  /// Set the worker pool queue capacity
  pub fn queue_capacity(mut self, capacity: usize) -> Self {
    self.queue_capacity = capacity.max(1);
    self
  }

  /// 设置心跳间隔
  /// Set the heartbeat interval
  pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
    self.heartbeat_interval = interval;
    self
  }

  /// 设置心跳 TTL
  /// Set the heartbeat TTL
  pub fn heartbeat_ttl(mut self, ttl: Duration) -> Self {
    self.heartbeat_ttl = ttl;
    self
  }

  /// 设置僵锁回收检查间隔
  /// Set the stale-lock reclamation check interval
  pub fn reclaim_interval(mut self, interval: Duration) -> Self {
    self.reclaim_interval = interval;
    self
  }

  /// 设置认领批量大小
  /// Set the claim batch size
  pub fn batch_size(mut self, batch_size: usize) -> Self {
    self.batch_size = batch_size.max(1);
    self
  }

  /// 设置默认重试间隔
  /// Set the default retry intervals
  pub fn default_retry_intervals(mut self, intervals: Vec<Duration>) -> Self {
    self.default_retry_intervals = intervals;
    self
  }

  /// 设置派发优先级（数值越大越先出队）
  /// Set dispatch priorities (higher values dequeue first)
  pub fn priorities(mut self, time_job_priority: i32, cron_priority: i32) -> Self {
    self.time_job_priority = time_job_priority;
    self.cron_priority = cron_priority;
    self
  }

  /// 设置关闭超时时间
  /// Set the shutdown timeout
  pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
    self.shutdown_timeout = timeout;
    self
  }

  /// 设置时区
  /// Set the time zone
  pub fn time_zone(mut self, time_zone: Tz) -> Self {
    self.time_zone = time_zone;
    self
  }

  /// 以 IANA id 字符串设置时区
  /// Set the time zone from an IANA id string
  pub fn time_zone_str(mut self, time_zone: &str) -> Result<Self> {
    self.time_zone = time_zone
      .parse::<Tz>()
      .map_err(|_| Error::config(format!("unknown time zone: {time_zone:?}")))?;
    Ok(self)
  }

  /// 验证配置
  /// Validate the configuration
  pub fn validate(&self) -> Result<()> {
    if self.node_id.trim().is_empty() {
      return Err(Error::config("node_id is required"));
    }

    if self.worker_pool_size == 0 {
      return Err(Error::config("worker_pool_size must be greater than 0"));
    }

    if self.queue_capacity == 0 {
      return Err(Error::config("queue_capacity must be greater than 0"));
    }

    if self.poll_interval.is_zero() {
      return Err(Error::config("poll_interval must be greater than zero"));
    }

    if self.heartbeat_ttl <= self.heartbeat_interval {
      return Err(Error::config(
        "heartbeat_ttl must exceed heartbeat_interval, or live nodes are judged dead",
      ));
    }

    Ok(())
  }
}
