//! 桶配置解析
//!
//! 给定（类型, 键, 调用级覆盖）选出生效配置，优先级：
//! 调用级覆盖 > 键名精确覆盖 > 正则覆盖（LRU缓存） > 类型默认值。
//!
//! 正则覆盖按插入顺序扫描首个命中；命中结果进入每类型的LRU缓存，
//! 防止键唯一场景下的内存增长。

use ahash::AHashMap;
use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use tracing::{debug, trace};

use crate::bucket::{normalize_params, BucketParams, BucketSpec, BucketType};
use crate::constants::OVERRIDE_CACHE_CAPACITY;
use crate::error::{BucketronError, ValidationCode};

/// 正则覆盖匹配结果的LRU缓存
///
/// 值为 `overrides_match` 中的下标。多线程运行时下用互斥锁保护。
pub struct OverrideCache {
    inner: Mutex<LruCache<String, usize>>,
}

impl Default for OverrideCache {
    fn default() -> Self {
        Self::with_capacity(OVERRIDE_CACHE_CAPACITY)
    }
}

impl std::fmt::Debug for OverrideCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverrideCache")
            .field("len", &self.inner.lock().len())
            .finish()
    }
}

impl OverrideCache {
    /// 创建指定容量的缓存
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity >= 1");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// 查询缓存（更新访问顺序）
    pub fn get(&self, key: &str) -> Option<usize> {
        self.inner.lock().get(key).copied()
    }

    /// 写入缓存
    pub fn insert(&self, key: &str, index: usize) {
        self.inner.lock().put(key.to_string(), index);
    }

    /// 移除条目
    pub fn remove(&self, key: &str) {
        self.inner.lock().pop(key);
    }

    /// 当前条目数
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// 桶类型注册表
///
/// 持有全部规范化后的桶类型，并执行生效配置解析。
#[derive(Debug)]
pub struct BucketRegistry {
    buckets: AHashMap<String, BucketType>,
    global_ttl_secs: u64,
}

impl BucketRegistry {
    /// 从用户桶定义构建注册表
    ///
    /// 任一定义或覆盖项非法都是加载期配置错误。
    pub fn new(
        specs: &AHashMap<String, BucketSpec>,
        global_ttl_secs: u64,
    ) -> Result<Self, BucketronError> {
        let mut buckets = AHashMap::with_capacity(specs.len());
        for (name, spec) in specs {
            let bucket = BucketType::normalize(name.clone(), spec, global_ttl_secs)
                .map_err(BucketronError::ConfigError)?;
            debug!(
                "注册桶类型: {} size={} per_interval={} interval={}ms ttl={}s overrides={}/{}",
                name,
                bucket.params.size,
                bucket.params.per_interval,
                bucket.params.interval_ms,
                bucket.params.ttl_secs,
                bucket.overrides.len(),
                bucket.overrides_match.len()
            );
            buckets.insert(name.clone(), bucket);
        }
        Ok(Self {
            buckets,
            global_ttl_secs,
        })
    }

    /// 按名称查找桶类型
    pub fn get(&self, name: &str) -> Option<&BucketType> {
        self.buckets.get(name)
    }

    /// 已注册的类型名
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.buckets.keys().map(|s| s.as_str())
    }

    /// 解析生效配置
    ///
    /// 优先级：调用级覆盖 > 键名精确覆盖 > 正则覆盖（缓存优先）> 类型默认值。
    /// `until` 已过去的覆盖项视同不存在。
    pub fn resolve(
        &self,
        bucket: &BucketType,
        key: &str,
        override_spec: Option<&BucketSpec>,
    ) -> Result<BucketParams, BucketronError> {
        // 调用级覆盖独立规范化，短路一切
        if let Some(spec) = override_spec {
            let params = normalize_params(spec, self.global_ttl_secs).map_err(|e| {
                BucketronError::validation(ValidationCode::InvalidOverride, e)
            })?;
            trace!("使用调用级覆盖: {}:{}", bucket.name, key);
            return Ok(params);
        }

        let now = Utc::now();

        // 键名精确覆盖优先于正则覆盖
        if let Some(item) = bucket.overrides.get(key) {
            if !item.is_expired(now) {
                trace!("命中精确覆盖: {}:{} -> {}", bucket.name, key, item.name);
                return Ok(item.params.clone());
            }
        }

        // 正则覆盖先查缓存
        if let Some(index) = bucket.cache.get(key) {
            if let Some(item) = bucket.overrides_match.get(index) {
                if !item.is_expired(now) {
                    trace!("命中正则覆盖缓存: {}:{} -> {}", bucket.name, key, item.name);
                    return Ok(item.params.clone());
                }
            }
            // 缓存条目失效（覆盖项过期），移除后继续扫描
            bucket.cache.remove(key);
        }

        // 按插入顺序扫描首个命中的正则
        for (index, item) in bucket.overrides_match.iter().enumerate() {
            if item.is_expired(now) {
                continue;
            }
            if let Some(matcher) = &item.matcher {
                if matcher.is_match(key) {
                    bucket.cache.insert(key, index);
                    trace!("命中正则覆盖: {}:{} -> {}", bucket.name, key, item.name);
                    return Ok(item.params.clone());
                }
            }
        }

        Ok(bucket.params.clone())
    }
}
