//! 配置（config）
//!
//! 投递器与退避参数均为可配置项，默认值：批大小 100、租约 30s、最大尝试 5 次、
//! 退避基数 1s（指数增长，带抖动）。
//!
//! 通过环境变量加载（`OUTBOX` 前缀，`__` 分隔层级）：
//!
//! ```text
//! OUTBOX__DISPATCHER__BATCH_SIZE=50        -> dispatcher.batch_size = 50
//! OUTBOX__DISPATCHER__LEASE_DURATION_MS=60000
//! OUTBOX__BACKOFF__BASE_MS=500
//! ```
//!
//! 时长一律以毫秒配置（`*_ms` 键）。
//!
use crate::error::{DomainError, DomainResult};
use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

/// 根配置
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub dispatcher: DispatcherConfig,
    pub backoff: BackoffConfig,
}

impl OutboxConfig {
    /// 从环境变量加载（先读取 `.env`），缺省项回落到默认值，并做语义校验
    pub fn from_env() -> DomainResult<Self> {
        dotenvy::dotenv().ok();

        let config: Self = ::config::Config::builder()
            .add_source(
                ::config::Environment::with_prefix("OUTBOX")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DomainResult<()> {
        self.dispatcher.validate()?;
        self.backoff.validate()?;
        Ok(())
    }
}

/// 投递器参数
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// 单次认领的最大记录数
    pub batch_size: usize,
    /// 轮询间隔（无通知时的兜底）
    pub poll_interval_ms: u64,
    /// 单次发布超时
    pub publish_timeout_ms: u64,
    /// 认领租约时长
    pub lease_duration_ms: u64,
    /// 失败达到该次数后进入死信
    pub max_attempts: u32,
    /// 过期租约回收的扫描间隔
    pub reclaim_interval_ms: u64,
    /// 同一批次内并发处理的聚合分组数
    pub group_concurrency: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval_ms: 1_000,
            publish_timeout_ms: 5_000,
            lease_duration_ms: 30_000,
            max_attempts: 5,
            reclaim_interval_ms: 10_000,
            group_concurrency: 8,
        }
    }
}

impl DispatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms)
    }

    pub fn validate(&self) -> DomainResult<()> {
        let checks = [
            (self.batch_size == 0, "dispatcher.batch_size must be > 0"),
            (self.max_attempts == 0, "dispatcher.max_attempts must be > 0"),
            (self.lease_duration_ms == 0, "dispatcher.lease_duration_ms must be > 0"),
            (self.publish_timeout_ms == 0, "dispatcher.publish_timeout_ms must be > 0"),
            (self.poll_interval_ms == 0, "dispatcher.poll_interval_ms must be > 0"),
            (self.reclaim_interval_ms == 0, "dispatcher.reclaim_interval_ms must be > 0"),
            (self.group_concurrency == 0, "dispatcher.group_concurrency must be > 0"),
        ];
        match checks.into_iter().find(|(failed, _)| *failed) {
            Some((_, reason)) => Err(DomainError::Config {
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// 指数退避参数
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    /// 抖动比例，取值 [0, 1]
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 300_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> DomainResult<()> {
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(DomainError::Config {
                reason: format!("backoff.jitter must be within [0, 1], got {}", self.jitter),
            });
        }
        if self.multiplier < 1.0 {
            return Err(DomainError::Config {
                reason: format!("backoff.multiplier must be >= 1, got {}", self.multiplier),
            });
        }
        if self.base_ms > self.max_ms {
            return Err(DomainError::Config {
                reason: format!(
                    "backoff.base_ms ({}) exceeds backoff.max_ms ({})",
                    self.base_ms, self.max_ms
                ),
            });
        }
        Ok(())
    }

    /// 不含抖动的退避时长：`min(base * multiplier^(attempt-1), max)`，`attempt` 从 1 开始
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = (self.base_ms as f64) * self.multiplier.powi(exp);
        let capped = millis.min(self.max_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// 第 `attempt` 次失败后的退避时长（含 ±jitter 抖动，不小于 0）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter <= 0.0 {
            return nominal;
        }

        let factor = 1.0 + rand::rng().random_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((nominal.as_secs_f64() * factor).max(0.0))
    }
}
