//! 桶类型模型
//!
//! 将用户提供的桶定义规范化为内部标准形式：间隔统一为毫秒、
//! 推导容量与TTL、编译正则覆盖、解析覆盖的过期时间。
//!
//! # 规范化顺序
//!
//! 1. 展开 `per_second|per_minute|per_hour|per_day` 快捷方式
//! 2. `size` 缺失时默认为 `per_interval`
//! 3. `per_interval > 0` 时推导TTL（受全局上限约束）
//! 4. 递归规范化覆盖项，解析 `until`，编译 `match`
//! 5. 丢弃加载时已过期的覆盖项

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};

use crate::constants::{
    INTERVAL_PER_DAY_MS, INTERVAL_PER_HOUR_MS, INTERVAL_PER_MINUTE_MS, INTERVAL_PER_SECOND_MS,
};
use crate::resolver::OverrideCache;

/// 用户提供的桶定义（未规范化）
///
/// `per_second` 等快捷方式与 `interval`/`per_interval` 二选一，
/// 快捷方式优先级更高。
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BucketSpec {
    /// 桶容量（最大突发量）
    pub size: Option<u64>,
    /// 每个间隔补充的令牌数
    pub per_interval: Option<u64>,
    /// 补充间隔（毫秒）
    pub interval: Option<u64>,
    /// 每秒补充令牌数的快捷方式
    pub per_second: Option<u64>,
    /// 每分钟补充令牌数的快捷方式
    pub per_minute: Option<u64>,
    /// 每小时补充令牌数的快捷方式
    pub per_hour: Option<u64>,
    /// 每天补充令牌数的快捷方式
    pub per_day: Option<u64>,
    /// 无限桶：不访问存储，始终放行
    pub unlimited: bool,
    /// 机会主义跳过缓存额度（0 表示关闭）
    pub skip_n_calls: u32,
    /// 覆盖项的绝对过期时间（仅覆盖项有效）
    pub until: Option<DateTime<Utc>>,
    /// 按正则匹配键的模式（仅覆盖项有效，大小写不敏感）
    #[serde(rename = "match")]
    pub match_pattern: Option<String>,
    /// 按键名或正则特化的覆盖项
    pub overrides: OverrideMap,
}

/// 保持插入顺序的覆盖项表
///
/// 正则覆盖按声明顺序扫描，哈希表会丢失这一顺序。
#[derive(Debug, Clone, Default)]
pub struct OverrideMap(pub Vec<(String, BucketSpec)>);

impl OverrideMap {
    /// 覆盖项数量
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 按声明顺序迭代
    pub fn iter(&self) -> impl Iterator<Item = &(String, BucketSpec)> {
        self.0.iter()
    }
}

impl<'de> Deserialize<'de> for OverrideMap {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct OverrideMapVisitor;

        impl<'de> Visitor<'de> for OverrideMapVisitor {
            type Value = OverrideMap;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("覆盖项表")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut items = Vec::new();
                while let Some((name, spec)) = map.next_entry::<String, BucketSpec>()? {
                    items.push((name, spec));
                }
                Ok(OverrideMap(items))
            }
        }

        deserializer.deserialize_map(OverrideMapVisitor)
    }
}

impl BucketSpec {
    /// 创建空定义
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置容量
    pub fn size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// 设置补充速率（原始形式）
    pub fn refill(mut self, per_interval: u64, interval_ms: u64) -> Self {
        self.per_interval = Some(per_interval);
        self.interval = Some(interval_ms);
        self
    }

    /// 每秒补充 `n` 个令牌
    pub fn per_second(mut self, n: u64) -> Self {
        self.per_second = Some(n);
        self
    }

    /// 每分钟补充 `n` 个令牌
    pub fn per_minute(mut self, n: u64) -> Self {
        self.per_minute = Some(n);
        self
    }

    /// 每小时补充 `n` 个令牌
    pub fn per_hour(mut self, n: u64) -> Self {
        self.per_hour = Some(n);
        self
    }

    /// 每天补充 `n` 个令牌
    pub fn per_day(mut self, n: u64) -> Self {
        self.per_day = Some(n);
        self
    }

    /// 标记为无限桶
    pub fn unlimited(mut self) -> Self {
        self.unlimited = true;
        self
    }

    /// 设置跳过缓存额度
    pub fn skip_n_calls(mut self, n: u32) -> Self {
        self.skip_n_calls = n;
        self
    }

    /// 设置覆盖项过期时间
    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    /// 设置正则匹配模式
    pub fn match_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.match_pattern = Some(pattern.into());
        self
    }

    /// 添加覆盖项（声明顺序即正则扫描顺序）
    pub fn override_for(mut self, name: impl Into<String>, spec: BucketSpec) -> Self {
        self.overrides.0.push((name.into(), spec));
        self
    }
}

/// 规范化后的桶参数
///
/// 类型默认值与覆盖项共用这一形式，解析结果也是它。
#[derive(Debug, Clone, PartialEq)]
pub struct BucketParams {
    /// 桶容量
    pub size: u64,
    /// 每个间隔补充的令牌数（0 表示固定桶，永不自动补充）
    pub per_interval: u64,
    /// 补充间隔（毫秒）
    pub interval_ms: u64,
    /// 无限桶
    pub unlimited: bool,
    /// 跳过缓存额度
    pub skip_n_calls: u32,
    /// 桶实例TTL（秒）
    pub ttl_secs: u64,
}

impl BucketParams {
    /// 每毫秒补充的令牌数
    pub fn tokens_per_ms(&self) -> f64 {
        if self.per_interval == 0 || self.interval_ms == 0 {
            0.0
        } else {
            self.per_interval as f64 / self.interval_ms as f64
        }
    }

    /// 补充一个令牌所需的毫秒数（固定桶为 0）
    pub fn drip_interval_ms(&self) -> f64 {
        if self.per_interval == 0 || self.interval_ms == 0 {
            0.0
        } else {
            self.interval_ms as f64 / self.per_interval as f64
        }
    }

    /// 是否为固定桶（只能通过 put 恢复令牌）
    pub fn is_fixed(&self) -> bool {
        self.per_interval == 0
    }
}

/// 规范化后的覆盖项
#[derive(Debug, Clone)]
pub struct BucketOverride {
    /// 覆盖项名称（map 键）
    pub name: String,
    /// 覆盖参数
    pub params: BucketParams,
    /// 绝对过期时间；已过期的覆盖项视同不存在
    pub until: Option<DateTime<Utc>>,
    /// 编译后的键匹配正则（None 表示按键名精确匹配）
    pub matcher: Option<Regex>,
}

impl BucketOverride {
    /// 在给定时刻是否已过期
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.until.map(|until| until <= now).unwrap_or(false)
    }
}

/// 规范化后的桶类型
#[derive(Debug)]
pub struct BucketType {
    /// 类型名
    pub name: String,
    /// 类型默认参数
    pub params: BucketParams,
    /// 按键名精确匹配的覆盖项
    pub overrides: AHashMap<String, BucketOverride>,
    /// 按正则匹配的覆盖项（保持插入顺序扫描）
    pub overrides_match: Vec<BucketOverride>,
    /// 正则匹配结果的LRU缓存
    pub cache: OverrideCache,
}

impl BucketType {
    /// 从用户定义规范化出桶类型
    pub fn normalize(
        name: impl Into<String>,
        spec: &BucketSpec,
        global_ttl_secs: u64,
    ) -> Result<Self, String> {
        let name = name.into();
        let params = normalize_params(spec, global_ttl_secs)
            .map_err(|e| format!("桶类型 {} 无效: {}", name, e))?;

        let now = Utc::now();
        let mut overrides = AHashMap::new();
        let mut overrides_match = Vec::new();

        for (override_name, override_spec) in spec.overrides.iter() {
            let item = normalize_override(override_name, override_spec, global_ttl_secs)
                .map_err(|e| format!("桶类型 {} 的覆盖项 {} 无效: {}", name, override_name, e))?;

            // 加载时已过期的覆盖项直接丢弃
            if item.is_expired(now) {
                continue;
            }

            if item.matcher.is_some() {
                overrides_match.push(item);
            } else {
                overrides.insert(override_name.clone(), item);
            }
        }

        Ok(Self {
            name,
            params,
            overrides,
            overrides_match,
            cache: OverrideCache::default(),
        })
    }
}

/// 规范化桶参数（类型默认值与覆盖项共用）
pub fn normalize_params(spec: &BucketSpec, global_ttl_secs: u64) -> Result<BucketParams, String> {
    // 快捷方式展开，固定毫秒当量
    let shortcut = [
        (spec.per_second, INTERVAL_PER_SECOND_MS),
        (spec.per_minute, INTERVAL_PER_MINUTE_MS),
        (spec.per_hour, INTERVAL_PER_HOUR_MS),
        (spec.per_day, INTERVAL_PER_DAY_MS),
    ]
    .into_iter()
    .find_map(|(n, ms)| n.map(|n| (n, ms)));

    let (per_interval, interval_ms) = match shortcut {
        Some((n, ms)) => (n, ms),
        None => (
            spec.per_interval.unwrap_or(0),
            spec.interval.unwrap_or(0),
        ),
    };

    if per_interval > 0 && interval_ms == 0 {
        return Err("per_interval 大于 0 时必须提供 interval".to_string());
    }

    // size 缺失时默认为 per_interval
    let size = match spec.size {
        Some(size) => size,
        None => per_interval,
    };

    if size == 0 {
        return Err("size 必须大于等于 1".to_string());
    }

    // 固定桶（per_interval == 0）使用全局TTL；否则按排空时长推导
    let ttl_secs = if per_interval > 0 {
        let derived =
            ((size as f64 * interval_ms as f64) / per_interval as f64 / 1000.0).ceil() as u64;
        derived.clamp(1, global_ttl_secs)
    } else {
        global_ttl_secs
    };

    Ok(BucketParams {
        size,
        per_interval,
        interval_ms,
        unlimited: spec.unlimited,
        skip_n_calls: spec.skip_n_calls,
        ttl_secs,
    })
}

fn normalize_override(
    name: &str,
    spec: &BucketSpec,
    global_ttl_secs: u64,
) -> Result<BucketOverride, String> {
    let params = normalize_params(spec, global_ttl_secs)?;

    let matcher = match &spec.match_pattern {
        Some(pattern) => Some(
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| format!("无法编译正则 {}: {}", pattern, e))?,
        ),
        None => None,
    };

    Ok(BucketOverride {
        name: name.to_string(),
        params,
        until: spec.until,
        matcher,
    })
}
