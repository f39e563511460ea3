//! 组件模块
//! Components module
//!
//! 提供通用的组件生命周期管理 trait 与各后台组件
//! Provides a common component lifecycle trait and the background components

use std::sync::Arc;
use tokio::task::JoinHandle;

pub mod dispatcher;
pub mod heartbeat;
pub mod reclaimer;

/// 组件生命周期接口
/// Component lifecycle interface
///
/// 定义了后台组件的基本生命周期操作：启动、关闭和状态检查
/// Defines the basic lifecycle operations of a background component: start,
/// shutdown and state check
///
/// # 实现者 / Implementors
///
/// - [`Dispatcher`](dispatcher::Dispatcher) - 认领到期作业并派发到工作池
/// - [`NodeHeartbeat`](heartbeat::NodeHeartbeat) - 周期性续租本节点的存活信号
/// - [`LockReclaimer`](reclaimer::LockReclaimer) - 回收死亡节点持有的锁
pub trait ComponentLifecycle {
  /// 启动组件的后台任务，返回其 JoinHandle
  /// Start the component's background task, returning its JoinHandle
  fn start(self: Arc<Self>) -> JoinHandle<()>;

  /// 发送关闭信号；组件完成当前操作后停止
  /// Send the shutdown signal; the component stops after its current operation
  fn shutdown(&self);

  /// 组件是否已停止
  /// Whether the component has stopped
  fn is_done(&self) -> bool;
}
