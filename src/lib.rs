//! # Ticker
//!
//! 集群感知的作业调度引擎
//! Cluster-aware job scheduling engine
//!
//! 多个节点进程指向同一存储即组成集群：到期的一次性作业与循环作业
//! 发生通过乐观并发认领分配，恰有一个节点执行每次发生；节点崩溃后
//! 其认领由心跳 TTL 判定回收。
//! Multiple node processes pointing at one store form a cluster: due time
//! jobs and cron occurrences are distributed through optimistic-concurrency
//! claims so exactly one node executes each firing; a crashed node's
//! claims are reclaimed under the heartbeat-TTL verdict.
//!
//! ## 特性 / Features
//!
//! - 一次性作业与 cron 循环作业（秒级字段，IANA 时区）
//!   One-off time jobs and cron recurring jobs (seconds field, IANA zones)
//! - 跨节点恰好一次认领；持锁节点幂等重认领
//!   At-most-one claim across nodes; idempotent re-claim by the holder
//! - 有界优先级工作池，满载时拒绝并释放认领（背压）
//!   Bounded priority worker pool that rejects and releases claims when
//!   saturated (backpressure)
//! - 按作业携带的间隔列表重试，支持显式终止状态
//!   Retries driven by the job's interval list, with explicit terminal
//!   statuses
//! - 协作式取消与优雅关闭
//!   Cooperative cancellation and graceful shutdown
//!
//! ## 快速开始 / Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ticker::config::TickerConfig;
//! use ticker::job::{CronJob, TimeJob};
//! use ticker::registry::FunctionRegistry;
//! use ticker::scheduler::Scheduler;
//! use ticker::store::{MemoryHeartbeatStore, MemoryTickerStore};
//!
//! # async fn example() -> ticker::error::Result<()> {
//! let registry = Arc::new(FunctionRegistry::new());
//! registry.register_async_fn("email:send", |ctx| async move {
//!   println!("sending, scheduled at {}", ctx.scheduled_time());
//!   Ok(())
//! });
//!
//! let mut scheduler = Scheduler::new(
//!   TickerConfig::for_host(),
//!   Arc::new(MemoryTickerStore::new()),
//!   Arc::new(MemoryHeartbeatStore::new()),
//!   registry,
//! )?;
//! scheduler.start()?;
//!
//! scheduler
//!   .register_time_job(TimeJob::new("email:send", chrono::Utc::now()))
//!   .await?;
//! scheduler
//!   .register_cron_job(CronJob::new("email:send", "0 */5 * * * *"))
//!   .await?;
//!
//! scheduler.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod components;
pub mod config;
pub mod cron;
pub mod error;
pub mod execution;
pub mod job;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use config::TickerConfig;
pub use error::{Error, Result};
pub use execution::JobContext;
pub use job::{CronJob, CronOccurrence, JobRef, JobStatus, TimeJob};
pub use registry::{FunctionRegistry, JobFunction};
pub use scheduler::Scheduler;
pub use store::{HeartbeatStore, MemoryHeartbeatStore, MemoryTickerStore, TickerStore};
