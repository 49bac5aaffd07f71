//! 限流引擎
//!
//! 公开操作 take/wait/put/get/reset_all/keys 的核心实现：
//! 参数校验、无限桶短路、机会主义跳过缓存、重置时间换算，
//! 以及 `wait` 的定时重试循环。每一次存储往返都经过弹性执行器。

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::bucket::{BucketParams, BucketSpec, BucketType};
use crate::constants::MAX_KEY_LENGTH;
use crate::error::{BucketronError, ValidationCode};
use crate::resilience::ResilientExecutor;
use crate::resolver::BucketRegistry;
use crate::store::BucketStore;

/// take 的令牌数量参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeCount {
    /// 扣减 n 个令牌（0 表示只滴灌不扣减）
    N(u64),
    /// 扣减全部容量
    All,
}

impl TakeCount {
    /// 从JSON值解析
    ///
    /// 只接受非负整数和字符串 `"all"`；小数、负数、布尔等一律拒绝。
    pub fn from_json(value: &Value) -> Result<Self, BucketronError> {
        match value {
            Value::String(s) if s == "all" => Ok(TakeCount::All),
            Value::Number(n) => n.as_u64().map(TakeCount::N).ok_or_else(|| {
                BucketronError::validation(
                    ValidationCode::InvalidCount,
                    format!("count 必须是非负整数或 \"all\": {}", n),
                )
            }),
            other => Err(BucketronError::validation(
                ValidationCode::InvalidCount,
                format!("count 必须是非负整数或 \"all\": {}", other),
            )),
        }
    }

    fn effective(&self, size: u64) -> u64 {
        match self {
            TakeCount::N(n) => *n,
            TakeCount::All => size,
        }
    }
}

/// put 的令牌数量参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutCount {
    /// 归还 n 个令牌（可为负，允许把桶压到零以下）
    N(i64),
    /// 归还到满
    All,
}

impl PutCount {
    /// 从JSON值解析
    pub fn from_json(value: &Value) -> Result<Self, BucketronError> {
        match value {
            Value::String(s) if s == "all" => Ok(PutCount::All),
            Value::Number(n) => n.as_i64().map(PutCount::N).ok_or_else(|| {
                BucketronError::validation(
                    ValidationCode::InvalidCount,
                    format!("count 必须是整数或 \"all\": {}", n),
                )
            }),
            other => Err(BucketronError::validation(
                ValidationCode::InvalidCount,
                format!("count 必须是整数或 \"all\": {}", other),
            )),
        }
    }

    fn effective(&self, size: u64) -> i64 {
        match self {
            // 正向归还封顶于容量
            PutCount::N(n) => (*n).min(size as i64),
            PutCount::All => size as i64,
        }
    }
}

/// take/wait 参数
#[derive(Debug, Clone)]
pub struct TakeParams {
    /// 桶类型名
    pub bucket: String,
    /// 桶实例键
    pub key: String,
    /// 令牌数量（缺省为 1）
    pub count: Option<TakeCount>,
    /// 调用级配置覆盖
    pub config_override: Option<BucketSpec>,
}

impl TakeParams {
    /// 创建参数
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            count: None,
            config_override: None,
        }
    }

    /// 设置数量
    pub fn count(mut self, count: TakeCount) -> Self {
        self.count = Some(count);
        self
    }

    /// 设置调用级覆盖
    pub fn config_override(mut self, spec: BucketSpec) -> Self {
        self.config_override = Some(spec);
        self
    }
}

/// put 参数
#[derive(Debug, Clone)]
pub struct PutParams {
    /// 桶类型名
    pub bucket: String,
    /// 桶实例键
    pub key: String,
    /// 令牌数量（缺省为归还到满）
    pub count: Option<PutCount>,
    /// 调用级配置覆盖
    pub config_override: Option<BucketSpec>,
}

impl PutParams {
    /// 创建参数
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            count: None,
            config_override: None,
        }
    }

    /// 设置数量
    pub fn count(mut self, count: PutCount) -> Self {
        self.count = Some(count);
        self
    }

    /// 设置调用级覆盖
    pub fn config_override(mut self, spec: BucketSpec) -> Self {
        self.config_override = Some(spec);
        self
    }
}

/// get 参数
#[derive(Debug, Clone)]
pub struct GetParams {
    /// 桶类型名
    pub bucket: String,
    /// 桶实例键
    pub key: String,
    /// 调用级配置覆盖
    pub config_override: Option<BucketSpec>,
}

impl GetParams {
    /// 创建参数
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            config_override: None,
        }
    }

    /// 设置调用级覆盖
    pub fn config_override(mut self, spec: BucketSpec) -> Self {
        self.config_override = Some(spec);
        self
    }
}

/// take/wait 响应
#[derive(Debug, Clone, PartialEq)]
pub struct TakeResult {
    /// 是否放行
    pub conformant: bool,
    /// 剩余令牌（负向归还后可能为负）
    pub remaining: i64,
    /// 桶重新满载的时刻（unix秒，固定桶为0）
    pub reset: i64,
    /// 桶容量
    pub limit: u64,
    /// 是否经过了 wait 延迟
    pub delayed: bool,
}

/// put 响应
#[derive(Debug, Clone, PartialEq)]
pub struct PutResult {
    /// 剩余令牌
    pub remaining: i64,
    /// 桶重新满载的时刻（unix秒，固定桶为0）
    pub reset: i64,
    /// 桶容量
    pub limit: u64,
}

/// get 响应
#[derive(Debug, Clone, PartialEq)]
pub struct GetResult {
    /// 剩余令牌
    pub remaining: i64,
    /// 桶重新满载的时刻（unix秒，固定桶为0）
    pub reset: i64,
    /// 桶容量
    pub limit: u64,
}

/// 跳过缓存条目
///
/// 引擎本地状态，从不持久化。
#[derive(Debug, Clone)]
struct SkipEntry {
    /// 自上次权威往返以来被跳过的次数
    count: u32,
    /// 上次权威结果（包括非放行，避免已触顶的桶被本地重新放行）
    last: TakeResult,
}

/// 限流引擎
pub struct Engine {
    registry: BucketRegistry,
    store: Arc<dyn BucketStore>,
    executor: Arc<ResilientExecutor>,
    /// 跳过缓存，键为 `type:key`
    skip_cache: DashMap<String, SkipEntry>,
}

impl Engine {
    /// 创建引擎
    pub fn new(
        registry: BucketRegistry,
        store: Arc<dyn BucketStore>,
        executor: Arc<ResilientExecutor>,
    ) -> Self {
        Self {
            registry,
            store,
            executor,
            skip_cache: DashMap::new(),
        }
    }

    /// 校验并查找桶类型
    fn lookup(&self, bucket: &str, key: &str) -> Result<&BucketType, BucketronError> {
        if bucket.is_empty() {
            return Err(BucketronError::validation(
                ValidationCode::MissingType,
                "桶类型不能为空",
            ));
        }
        if key.is_empty() {
            return Err(BucketronError::validation(
                ValidationCode::MissingKey,
                "键不能为空",
            ));
        }
        if key.len() > MAX_KEY_LENGTH {
            return Err(BucketronError::validation(
                ValidationCode::InvalidKey,
                format!("键长度超过限制（最大 {} 字符）", MAX_KEY_LENGTH),
            ));
        }
        self.registry.get(bucket).ok_or_else(|| {
            BucketronError::validation(
                ValidationCode::UnknownType,
                format!("未知的桶类型: {}", bucket),
            )
        })
    }

    /// 扣减令牌
    pub async fn take(&self, params: &TakeParams) -> Result<TakeResult, BucketronError> {
        let bucket = self.lookup(&params.bucket, &params.key)?;
        let resolved = self
            .registry
            .resolve(bucket, &params.key, params.config_override.as_ref())?;

        // 无限桶不访问存储
        if resolved.unlimited {
            return Ok(TakeResult {
                conformant: true,
                remaining: resolved.size as i64,
                reset: Utc::now().timestamp(),
                limit: resolved.size,
                delayed: false,
            });
        }

        let count = params.count.unwrap_or(TakeCount::N(1)).effective(resolved.size);
        let skip_key = format!("{}:{}", params.bucket, params.key);

        // 机会主义跳过缓存：权威往返之间允许有限次本地命中
        if resolved.skip_n_calls > 0 {
            if let Some(mut entry) = self.skip_cache.get_mut(&skip_key) {
                if entry.count < resolved.skip_n_calls {
                    entry.count += 1;
                    trace!(
                        "跳过缓存命中: {} ({}/{})",
                        skip_key,
                        entry.count,
                        resolved.skip_n_calls
                    );
                    return Ok(entry.last.clone());
                }
            }
        }

        let result = self.dispatch_take(&skip_key, &resolved, count).await?;

        if resolved.skip_n_calls > 0 {
            self.skip_cache.insert(
                skip_key,
                SkipEntry {
                    count: 0,
                    last: result.clone(),
                },
            );
        }

        Ok(result)
    }

    /// 权威 take 往返
    async fn dispatch_take(
        &self,
        instance_key: &str,
        resolved: &BucketParams,
        count: u64,
    ) -> Result<TakeResult, BucketronError> {
        let outcome = self
            .executor
            .execute(|| {
                self.store.take(
                    instance_key,
                    resolved.tokens_per_ms(),
                    resolved.size,
                    count,
                    resolved.ttl_secs,
                )
            })
            .await?;

        Ok(TakeResult {
            conformant: outcome.conformant,
            remaining: outcome.remaining.floor() as i64,
            reset: reset_secs_from_ms(outcome.reset_ms),
            limit: resolved.size,
            delayed: false,
        })
    }

    /// 阻塞直到有足够令牌
    ///
    /// 非放行时按 `ceil((count - remaining) * interval / per_interval)` 毫秒
    /// 延迟后重试，直到放行或出错；经过延迟的成功结果带 `delayed=true`。
    pub async fn wait(&self, params: &TakeParams) -> Result<TakeResult, BucketronError> {
        let mut delayed = false;
        loop {
            let mut result = self.take(params).await?;
            let bucket = self.lookup(&params.bucket, &params.key)?;
            let resolved = self
                .registry
                .resolve(bucket, &params.key, params.config_override.as_ref())?;
            let count = params.count.unwrap_or(TakeCount::N(1)).effective(resolved.size);

            if result.conformant {
                result.delayed = delayed;
                return Ok(result);
            }

            // 零扣减的探测调用不等待，直接按放行返回
            if count == 0 {
                result.conformant = true;
                result.delayed = false;
                return Ok(result);
            }

            // 固定桶永不自动补充，等待没有意义
            if resolved.is_fixed() {
                warn!(
                    "固定桶 {}:{} 令牌不足，wait 直接返回",
                    params.bucket, params.key
                );
                return Ok(result);
            }

            let deficit = count as f64 - result.remaining as f64;
            let min_wait_ms = (deficit * resolved.drip_interval_ms()).ceil().max(1.0) as u64;
            debug!(
                "{}:{} 令牌不足（remaining={}, count={}），{}ms 后重试",
                params.bucket, params.key, result.remaining, count, min_wait_ms
            );
            tokio::time::sleep(Duration::from_millis(min_wait_ms)).await;
            delayed = true;
        }
    }

    /// 归还令牌
    pub async fn put(&self, params: &PutParams) -> Result<PutResult, BucketronError> {
        let bucket = self.lookup(&params.bucket, &params.key)?;
        let resolved = self
            .registry
            .resolve(bucket, &params.key, params.config_override.as_ref())?;

        if resolved.unlimited {
            return Ok(PutResult {
                remaining: resolved.size as i64,
                reset: Utc::now().timestamp(),
                limit: resolved.size,
            });
        }

        let count = params
            .count
            .unwrap_or(PutCount::All)
            .effective(resolved.size);
        let instance_key = format!("{}:{}", params.bucket, params.key);

        let outcome = self
            .executor
            .execute(|| {
                self.store.put(
                    &instance_key,
                    count,
                    resolved.size,
                    resolved.ttl_secs,
                    resolved.drip_interval_ms(),
                )
            })
            .await?;

        Ok(PutResult {
            remaining: outcome.remaining.floor() as i64,
            reset: reset_secs_from_ms(outcome.reset_ms),
            limit: resolved.size,
        })
    }

    /// 查询桶状态（纯读，滴灌在引擎侧本地计算）
    pub async fn get(&self, params: &GetParams) -> Result<GetResult, BucketronError> {
        let bucket = self.lookup(&params.bucket, &params.key)?;
        let resolved = self
            .registry
            .resolve(bucket, &params.key, params.config_override.as_ref())?;

        if resolved.unlimited {
            return Ok(GetResult {
                remaining: resolved.size as i64,
                reset: Utc::now().timestamp(),
                limit: resolved.size,
            });
        }

        let instance_key = format!("{}:{}", params.bucket, params.key);
        let record = self
            .executor
            .execute(|| self.store.fetch(&instance_key))
            .await?;

        let now_ms = Utc::now().timestamp_millis();
        let remaining = match &record {
            // 键缺席视同满桶
            None => resolved.size as f64,
            Some(record) if resolved.per_interval > 0 => {
                let delta = (now_ms - record.last_drip_ms).max(0) as f64;
                (record.remaining + delta * resolved.tokens_per_ms()).min(resolved.size as f64)
            }
            Some(record) => record.remaining,
        };

        let reset = if resolved.per_interval > 0 {
            let reset_ms = now_ms as f64 + (resolved.size as f64 - remaining) * resolved.drip_interval_ms();
            reset_secs_from_ms(reset_ms.ceil() as i64)
        } else {
            0
        };

        Ok(GetResult {
            remaining: remaining.floor() as i64,
            reset,
            limit: resolved.size,
        })
    }

    /// 清空所有桶实例
    pub async fn reset_all(&self) -> Result<(), BucketronError> {
        self.skip_cache.clear();
        self.executor.execute(|| self.store.flush_all()).await
    }

    /// 列出某个类型现存的桶实例键（仅单机模式）
    pub async fn keys(&self, bucket: &str) -> Result<Vec<String>, BucketronError> {
        if bucket.is_empty() {
            return Err(BucketronError::validation(
                ValidationCode::MissingType,
                "桶类型不能为空",
            ));
        }
        if self.registry.get(bucket).is_none() {
            return Err(BucketronError::validation(
                ValidationCode::UnknownType,
                format!("未知的桶类型: {}", bucket),
            ));
        }

        let pattern = format!("{}:*", bucket);
        let keys = self
            .executor
            .execute(|| self.store.scan_keys(&pattern))
            .await?;

        let prefix = format!("{}:", bucket);
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(|s| s.to_string()))
            .collect())
    }
}

/// 毫秒重置时刻换算为unix秒（向上取整；0 表示固定桶）
fn reset_secs_from_ms(reset_ms: i64) -> i64 {
    if reset_ms <= 0 {
        0
    } else {
        (reset_ms + 999) / 1000
    }
}
