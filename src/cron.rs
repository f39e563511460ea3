//! cron 发生计算模块
//! Cron occurrence calculation module
//!
//! 解析 cron 表达式并计算给定时刻之后的下一次发生；
//! 按规范化后的表达式文本缓存解析结果。
//! Parses cron expressions and computes the next occurrence after a given
//! instant; parsed schedules are cached by normalized expression text.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::RwLock;

/// cron 发生计算器
/// Cron occurrence calculator
///
/// 发生计算在配置的单一时区内进行（默认 UTC）；
/// 计算结果一律转换为 UTC 存储与比较。
/// All occurrence math runs in the single configured time zone (default
/// UTC); results are converted to UTC for storage and comparison.
pub struct CronOccurrenceCalculator {
  time_zone: Tz,
  // 以规范化表达式为键的解析缓存
  // Parse cache keyed by normalized expression
  cache: RwLock<HashMap<String, Schedule>>,
}

impl Default for CronOccurrenceCalculator {
  fn default() -> Self {
    Self::new(Tz::UTC)
  }
}

impl CronOccurrenceCalculator {
  /// 创建新的计算器
  /// Create a new calculator
  pub fn new(time_zone: Tz) -> Self {
    Self {
      time_zone,
      cache: RwLock::new(HashMap::new()),
    }
  }

  /// 配置的时区
  /// Configured time zone
  pub fn time_zone(&self) -> Tz {
    self.time_zone
  }

  /// 计算 `after` 之后（严格晚于）的下一次发生
  /// Compute the next occurrence strictly after `after`
  ///
  /// 表达式解析失败返回配置错误，不会被自动重试；
  /// 调度已无未来发生时返回 `Ok(None)`。
  /// A parse failure is a configuration error, never retried automatically;
  /// `Ok(None)` means the schedule has no future occurrence.
  pub fn next_occurrence(
    &self,
    expression: &str,
    after: DateTime<Utc>,
  ) -> Result<Option<DateTime<Utc>>> {
    let schedule = self.schedule_for(expression)?;
    let next = schedule
      .after(&after.with_timezone(&self.time_zone))
      .next()
      .map(|t| t.with_timezone(&Utc));
    Ok(next)
  }

  /// 使指定表达式的缓存条目失效，返回条目是否存在
  /// Invalidate the cache entry for an expression, returning whether one existed
  pub fn invalidate(&self, expression: &str) -> bool {
    let normalized = normalize_expression(expression);
    self.cache.write().unwrap().remove(&normalized).is_some()
  }

  /// 清空全部缓存（如配置时区变更时）
  /// Clear the whole cache (e.g. when the configured time zone changes)
  pub fn clear(&self) {
    self.cache.write().unwrap().clear();
  }

  /// 当前缓存的表达式数量
  /// Number of currently cached expressions
  pub fn cached_expressions(&self) -> usize {
    self.cache.read().unwrap().len()
  }

  fn schedule_for(&self, expression: &str) -> Result<Schedule> {
    let normalized = normalize_expression(expression);

    if let Some(schedule) = self.cache.read().unwrap().get(&normalized) {
      return Ok(schedule.clone());
    }

    let schedule = Schedule::from_str(&normalized).map_err(|e| Error::CronExpression {
      expression: expression.to_string(),
      message: e.to_string(),
    })?;
    self
      .cache
      .write()
      .unwrap()
      .insert(normalized, schedule.clone());
    Ok(schedule)
  }
}

/// 规范化 cron 表达式
/// Normalize a cron expression
///
/// 折叠连续空白，使等价表达式共享同一缓存条目；
/// 经典 5 字段表达式通过前置秒字段 `0` 接受。
/// Collapses whitespace runs so equivalent expressions share one cache
/// entry; classic 5-field expressions are accepted by prepending a `0`
/// seconds field.
fn normalize_expression(expression: &str) -> String {
  let fields: Vec<&str> = expression.split_whitespace().collect();
  if fields.len() == 5 {
    format!("0 {}", fields.join(" "))
  } else {
    fields.join(" ")
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn test_normalize_collapses_whitespace() {
    assert_eq!(
      normalize_expression("*/5    *   *   *   *   *"),
      "*/5 * * * * *"
    );
    assert_eq!(normalize_expression("*/5 * * * * *"), "*/5 * * * * *");
  }

  #[test]
  fn test_normalize_five_field() {
    assert_eq!(normalize_expression("*/5 * * * *"), "0 */5 * * * *");
  }

  #[test]
  fn test_equivalent_expressions_share_cache_entry() {
    let calc = CronOccurrenceCalculator::default();
    let after = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

    let a = calc.next_occurrence("*/5 * * * * *", after).unwrap();
    let b = calc
      .next_occurrence("*/5    *   *   *   *   *", after)
      .unwrap();

    assert_eq!(a, b);
    assert_eq!(calc.cached_expressions(), 1);
  }

  #[test]
  fn test_next_occurrence_every_five_minutes() {
    let calc = CronOccurrenceCalculator::default();
    let after = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

    let next = calc.next_occurrence("*/5 * * * *", after).unwrap();
    assert_eq!(next, Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 5, 0).unwrap()));

    let next = calc.next_occurrence("*/5 * * * *", next.unwrap()).unwrap();
    assert_eq!(
      next,
      Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 10, 0).unwrap())
    );
  }

  #[test]
  fn test_invalid_expression_is_config_error() {
    let calc = CronOccurrenceCalculator::default();
    let err = calc
      .next_occurrence("not a cron", Utc::now())
      .expect_err("parse must fail");
    assert!(matches!(err, Error::CronExpression { .. }));
    assert!(err.is_fatal());
    assert_eq!(calc.cached_expressions(), 0);
  }

  #[test]
  fn test_invalidate() {
    let calc = CronOccurrenceCalculator::default();
    calc
      .next_occurrence("*/5 * * * * *", Utc::now())
      .unwrap();

    assert!(calc.invalidate("*/5    * * * * *"));
    assert!(!calc.invalidate("*/5 * * * * *"));
    assert_eq!(calc.cached_expressions(), 0);
  }

  #[test]
  fn test_occurrence_math_in_configured_zone() {
    // 上海固定 UTC+8：当地每日 08:00 即 UTC 00:00
    // Shanghai is fixed UTC+8: daily 08:00 local is 00:00 UTC
    let calc = CronOccurrenceCalculator::new(Tz::Asia__Shanghai);
    let after = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

    let next = calc.next_occurrence("0 0 8 * * *", after).unwrap().unwrap();
    assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap());
  }
}
