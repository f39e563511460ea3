//! 错误处理模块
//! Error handling module
//!
//! 定义了 Ticker 库中使用的各种错误类型
//! Defines various error types used in the Ticker library

use crate::job::JobStatus;
use thiserror::Error;

/// Ticker 库的结果类型
/// Result type for the Ticker library
pub type Result<T> = std::result::Result<T, Error>;

/// Ticker 错误类型
/// Ticker error type
#[derive(Error, Debug)]
pub enum Error {
  /// 存储错误（连接丢失等基础设施故障）
  /// Store error (connectivity loss and other infrastructure failures)
  #[error("Store error: {0}")]
  Store(String),

  /// 心跳存储错误
  /// Heartbeat store error
  #[error("Heartbeat store error: {0}")]
  Heartbeat(String),

  /// 无效的 cron 表达式
  /// Invalid cron expression
  #[error("Invalid cron expression {expression:?}: {message}")]
  CronExpression { expression: String, message: String },

  /// 函数未注册错误
  /// Function not registered error
  #[error("No function registered under {name:?}")]
  FunctionNotFound { name: String },

  /// 作业未找到错误
  /// Job not found error
  #[error("Job not found: {id}")]
  JobNotFound { id: uuid::Uuid },

  /// 工作池队列已满
  /// Worker pool queue is full
  #[error("Worker pool queue is full")]
  QueueFull,

  /// 调度器已在运行
  /// Scheduler is already running
  #[error("Scheduler is already running")]
  SchedulerRunning,

  /// 调度器已关闭
  /// Scheduler is closed
  #[error("Scheduler is closed")]
  SchedulerClosed,

  /// 取消错误
  /// Cancellation error
  #[error("Job execution cancelled")]
  Cancelled,

  /// 以指定终止状态结束执行的控制信号
  /// Control signal ending execution with an explicit terminal status
  ///
  /// 作业函数以返回值（而非抛出异常）携带期望的终止状态
  /// Job functions carry the desired terminal status as a returned value, not a thrown exception
  #[error("Execution terminated with status {}", status.as_str())]
  Terminated {
    status: JobStatus,
    reason: Option<String>,
  },

  /// 配置错误
  /// Configuration error
  #[error("Configuration error: {message}")]
  Config { message: String },

  /// IO 错误
  /// IO error
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  /// 其他错误
  /// Other error
  #[error("Other error: {message}")]
  Other { message: String },
}

impl Error {
  /// 创建存储错误
  /// Create a store error
  pub fn store<S: Into<String>>(message: S) -> Self {
    Self::Store(message.into())
  }

  /// 创建心跳存储错误
  /// Create a heartbeat store error
  pub fn heartbeat<S: Into<String>>(message: S) -> Self {
    Self::Heartbeat(message.into())
  }

  /// 创建配置错误
  /// Create a configuration error
  pub fn config<S: Into<String>>(message: S) -> Self {
    Self::Config {
      message: message.into(),
    }
  }

  /// 创建其他错误
  /// Create another type of error
  pub fn other<S: Into<String>>(message: S) -> Self {
    Self::Other {
      message: message.into(),
    }
  }

  /// 创建以 Skipped 终止的控制信号
  /// Create a control signal terminating with Skipped
  pub fn skip<S: Into<String>>(reason: S) -> Self {
    Self::Terminated {
      status: JobStatus::Skipped,
      reason: Some(reason.into()),
    }
  }

  /// 检查是否为可重试错误
  /// Check if the error is retriable
  ///
  /// 可重试错误指下个轮询周期重试即可的瞬时基础设施故障；
  /// 不可将其误判为“没有到期的作业”。
  /// Retriable errors are transient infrastructure failures to be retried on the
  /// next poll tick; they must never be mistaken for "no due work".
  pub fn is_retriable(&self) -> bool {
    matches!(self, Error::Store(_) | Error::Heartbeat(_) | Error::Io(_))
  }

  /// 检查是否为致命错误
  /// Check if the error is fatal
  pub fn is_fatal(&self) -> bool {
    !self.is_retriable()
  }
}
