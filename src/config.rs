//! 配置模块
//!
//! 定义限流器的构造配置结构。配置由嵌入方提供（文件解析不在本库职责内），
//! 全部结构实现 `Deserialize`，可从任意格式加载。

use ahash::AHashMap;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use std::time::Duration;

use crate::bucket::BucketSpec;
use crate::constants::{
    DEFAULT_BREAKER_COOLDOWN_MS, DEFAULT_BREAKER_MAX_COOLDOWN_MS, DEFAULT_BREAKER_MAX_FAILURES,
    DEFAULT_BREAKER_WINDOW_MS, DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_GLOBAL_TTL_SECS,
    DEFAULT_PING_INTERVAL_MS, DEFAULT_PING_MAX_FAILED_ATTEMPTS, DEFAULT_RETRY_COUNT,
    DEFAULT_RETRY_MAX_BACKOFF_MS, DEFAULT_RETRY_MIN_BACKOFF_MS,
};
use crate::error::BucketronError;

/// 限流器构造配置
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct LimiterOptions {
    /// 单机模式连接URI（`redis://` 或 `rediss://`）
    pub uri: Option<String>,
    /// 集群模式节点列表（与 `uri` 二选一，同时缺失为致命配置错误）
    pub nodes: Vec<String>,
    /// 桶类型定义，键为类型名
    pub buckets: AHashMap<String, BucketSpec>,
    /// 全局键前缀
    pub prefix: Option<String>,
    /// 用户名
    pub username: Option<String>,
    /// 密码（使用 Secret 包装以防止意外泄露）
    pub password: Option<Secret<String>>,
    /// 是否启用TLS（要求URI使用 `rediss://`）
    pub tls: bool,
    /// 桶实例TTL的全局上限（秒）
    pub global_ttl_secs: u64,
    /// Ping监控配置（仅单机模式生效）
    pub ping: Option<PingOptions>,
    /// 重试配置
    pub retry: RetryOptions,
    /// 熔断器配置
    pub breaker: BreakerOptions,
    /// 单次命令超时（毫秒）
    pub command_timeout_ms: u64,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            uri: None,
            nodes: Vec::new(),
            buckets: AHashMap::new(),
            prefix: None,
            username: None,
            password: None,
            tls: false,
            global_ttl_secs: DEFAULT_GLOBAL_TTL_SECS,
            ping: None,
            retry: RetryOptions::default(),
            breaker: BreakerOptions::default(),
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
        }
    }
}

impl std::fmt::Debug for LimiterOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterOptions")
            .field("uri", &self.uri)
            .field("nodes", &self.nodes)
            .field("buckets", &self.buckets.keys().collect::<Vec<_>>())
            .field("prefix", &self.prefix)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("tls", &self.tls)
            .field("global_ttl_secs", &self.global_ttl_secs)
            .field("ping", &self.ping)
            .field("retry", &self.retry)
            .field("breaker", &self.breaker)
            .field("command_timeout_ms", &self.command_timeout_ms)
            .finish()
    }
}

impl LimiterOptions {
    /// 创建单机模式配置
    pub fn single(uri: impl Into<String>) -> Self {
        Self {
            uri: Some(uri.into()),
            ..Default::default()
        }
    }

    /// 创建集群模式配置
    pub fn cluster(nodes: Vec<String>) -> Self {
        Self {
            nodes,
            ..Default::default()
        }
    }

    /// 注册一个桶类型
    pub fn bucket(mut self, name: impl Into<String>, spec: BucketSpec) -> Self {
        self.buckets.insert(name.into(), spec);
        self
    }

    /// 设置全局键前缀
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// 设置密码
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Secret::new(password.into()));
        self
    }

    /// 设置Ping监控配置
    pub fn ping(mut self, ping: PingOptions) -> Self {
        self.ping = Some(ping);
        self
    }

    /// 设置重试配置
    pub fn retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    /// 设置熔断器配置
    pub fn breaker(mut self, breaker: BreakerOptions) -> Self {
        self.breaker = breaker;
        self
    }

    /// 设置单次命令超时
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// 是否为集群模式
    pub fn is_cluster(&self) -> bool {
        self.uri.is_none() && !self.nodes.is_empty()
    }

    /// 校验配置
    ///
    /// 连接目标与桶定义任一缺失都是致命配置错误。
    pub fn validate(&self) -> Result<(), BucketronError> {
        if self.uri.is_none() && self.nodes.is_empty() {
            return Err(BucketronError::ConfigError(
                "必须提供 uri（单机）或 nodes（集群）".to_string(),
            ));
        }

        if let Some(uri) = &self.uri {
            if !uri.starts_with("redis://") && !uri.starts_with("rediss://") {
                return Err(BucketronError::ConfigError(format!(
                    "无效的连接URI: {}",
                    uri
                )));
            }
            if self.tls && !uri.starts_with("rediss://") {
                return Err(BucketronError::ConfigError(
                    "启用TLS时URI必须使用 rediss://".to_string(),
                ));
            }
        }

        if self.buckets.is_empty() {
            return Err(BucketronError::ConfigError(
                "必须至少定义一个桶类型".to_string(),
            ));
        }

        if self.command_timeout_ms == 0 {
            return Err(BucketronError::ConfigError(
                "命令超时必须大于0".to_string(),
            ));
        }

        Ok(())
    }

    /// 获取明文密码（仅供驱动连接时使用）
    pub(crate) fn password_plain(&self) -> Option<String> {
        self.password.as_ref().map(|p| p.expose_secret().clone())
    }
}

/// Ping监控配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PingOptions {
    /// Ping间隔（毫秒）
    pub interval_ms: u64,
    /// 连续失败多少次后升级处理
    pub max_failed_attempts: u32,
    /// 升级时是否强制驱动重连（false 时仅发出 dry-run 事件）
    pub reconnect_if_failed: bool,
}

impl Default for PingOptions {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_PING_INTERVAL_MS,
            max_failed_attempts: DEFAULT_PING_MAX_FAILED_ATTEMPTS,
            reconnect_if_failed: false,
        }
    }
}

impl PingOptions {
    /// 设置Ping间隔
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval_ms = interval.as_millis() as u64;
        self
    }

    /// 设置失败阈值
    pub fn max_failed_attempts(mut self, attempts: u32) -> Self {
        self.max_failed_attempts = attempts;
        self
    }

    /// 设置是否强制重连
    pub fn reconnect_if_failed(mut self, reconnect: bool) -> Self {
        self.reconnect_if_failed = reconnect;
        self
    }
}

/// 重试配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// 首次失败后的重试次数
    pub retries: u32,
    /// 最小退避（毫秒）
    pub min_backoff_ms: u64,
    /// 最大退避（毫秒）
    pub max_backoff_ms: u64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRY_COUNT,
            min_backoff_ms: DEFAULT_RETRY_MIN_BACKOFF_MS,
            max_backoff_ms: DEFAULT_RETRY_MAX_BACKOFF_MS,
        }
    }
}

/// 熔断器配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerOptions {
    /// 连续失败多少次后熔断
    pub max_failures: u32,
    /// 失败计为连续的滚动窗口（毫秒）
    pub window_ms: u64,
    /// 初始冷却时间（毫秒）
    pub cooldown_ms: u64,
    /// 冷却时间指数升级的上限（毫秒）
    pub max_cooldown_ms: u64,
}

impl Default for BreakerOptions {
    fn default() -> Self {
        Self {
            max_failures: DEFAULT_BREAKER_MAX_FAILURES,
            window_ms: DEFAULT_BREAKER_WINDOW_MS,
            cooldown_ms: DEFAULT_BREAKER_COOLDOWN_MS,
            max_cooldown_ms: DEFAULT_BREAKER_MAX_COOLDOWN_MS,
        }
    }
}
