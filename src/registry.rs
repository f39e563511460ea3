//! 函数注册表模块
//! Function registry module
//!
//! 按名字将作业路由到对应的执行函数。作业只持久化函数名与请求负载，
//! 函数本体在每个节点进程内注册；同一集群的所有节点应注册同一组函数。
//! Routes jobs to their execution functions by name. Jobs persist only the
//! function name and request payload; the function bodies are registered in
//! each node's process, and every node of a cluster should register the
//! same set of functions.

use crate::error::{Error, Result};
use crate::execution::JobContext;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

type BoxFuture<T> = std::pin::Pin<Box<dyn Future<Output = T> + Send>>;

/// 作业执行函数特性
/// Job execution function trait
///
/// 返回 `Ok(())` 表示成功；返回可重试错误触发重试调度；
/// 返回 [`Error::Terminated`] 以给定状态直接终止而不重试。
/// `Ok(())` means success; a retryable error triggers retry scheduling;
/// [`Error::Terminated`] finishes the job with the given status without
/// retrying.
#[async_trait]
pub trait JobFunction: Send + Sync {
  async fn run(&self, ctx: JobContext) -> Result<()>;
}

/// 注册的函数包装器，承载不同形态的函数
/// Registered function wrapper carrying the different function shapes
enum FunctionWrapper {
  Sync(Arc<dyn Fn(JobContext) -> Result<()> + Send + Sync>),
  Async(Arc<dyn Fn(JobContext) -> BoxFuture<Result<()>> + Send + Sync>),
  Object(Arc<dyn JobFunction>),
}

impl FunctionWrapper {
  async fn invoke(&self, ctx: JobContext) -> Result<()> {
    match self {
      FunctionWrapper::Sync(func) => func(ctx),
      FunctionWrapper::Async(func) => func(ctx).await,
      FunctionWrapper::Object(func) => func.run(ctx).await,
    }
  }
}

/// 已解析的函数句柄，可跨任务克隆调用
/// Resolved function handle, cloneable across tasks for invocation
#[derive(Clone)]
pub struct ResolvedFunction {
  name: String,
  inner: Arc<FunctionWrapper>,
}

impl std::fmt::Debug for ResolvedFunction {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ResolvedFunction").field("name", &self.name).finish_non_exhaustive()
  }
}

impl ResolvedFunction {
  /// 注册时使用的函数名
  /// The name the function was registered under
  pub fn name(&self) -> &str {
    &self.name
  }

  /// 调用函数
  /// Invoke the function
  pub async fn invoke(&self, ctx: JobContext) -> Result<()> {
    self.inner.invoke(ctx).await
  }
}

/// 函数注册表
/// Function registry
///
/// 名字精确匹配；重复注册同名函数时后注册者覆盖前者。
/// Names match exactly; re-registering a name replaces the previous entry.
pub struct FunctionRegistry {
  functions: RwLock<HashMap<String, Arc<FunctionWrapper>>>,
}

impl FunctionRegistry {
  /// 创建空注册表
  /// Create an empty registry
  pub fn new() -> Self {
    Self {
      functions: RwLock::new(HashMap::new()),
    }
  }

  /// 注册实现了 [`JobFunction`] 的处理器
  /// Register a [`JobFunction`] implementation
  pub fn register<F>(&self, name: &str, function: F)
  where
    F: JobFunction + 'static,
  {
    self.insert(name, FunctionWrapper::Object(Arc::new(function)));
  }

  /// 注册同步函数
  /// Register a synchronous function
  pub fn register_fn<F>(&self, name: &str, func: F)
  where
    F: Fn(JobContext) -> Result<()> + Send + Sync + 'static,
  {
    self.insert(name, FunctionWrapper::Sync(Arc::new(func)));
  }

  /// 注册异步函数
  /// Register an asynchronous function
  pub fn register_async_fn<F, Fut>(&self, name: &str, func: F)
  where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
  {
    let func = Arc::new(func);
    self.insert(
      name,
      FunctionWrapper::Async(Arc::new(move |ctx: JobContext| {
        let func = Arc::clone(&func);
        Box::pin(async move { func(ctx).await })
      })),
    );
  }

  /// 按名字解析函数
  /// Resolve a function by name
  ///
  /// 未注册的名字是作业自身的致命错误，不会被重试。
  /// An unregistered name is a fatal error of the job itself, never retried.
  pub fn resolve(&self, name: &str) -> Result<ResolvedFunction> {
    self
      .functions
      .read()
      .unwrap()
      .get(name)
      .map(|inner| ResolvedFunction {
        name: name.to_string(),
        inner: Arc::clone(inner),
      })
      .ok_or_else(|| Error::FunctionNotFound {
        name: name.to_string(),
      })
  }

  /// 是否已注册指定名字
  /// Whether the given name is registered
  pub fn contains(&self, name: &str) -> bool {
    self.functions.read().unwrap().contains_key(name)
  }

  /// 已注册的函数数量
  /// Number of registered functions
  pub fn len(&self) -> usize {
    self.functions.read().unwrap().len()
  }

  /// 注册表是否为空
  /// Whether the registry is empty
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn insert(&self, name: &str, wrapper: FunctionWrapper) {
    self
      .functions
      .write()
      .unwrap()
      .insert(name.to_string(), Arc::new(wrapper));
  }
}

impl Default for FunctionRegistry {
  fn default() -> Self {
    Self::new()
  }
}
