//! Lua脚本管理器
//!
//! 提供Redis Lua脚本的预加载、SHA缓存和执行功能。
//!
//! # 特性
//!
//! - **脚本预加载**: 避免重复传输脚本
//! - **SHA缓存**: 缓存脚本SHA避免重复计算
//! - **原子性操作**: 滴灌补充与令牌扣减在存储端整体求值，不可交错
//! - **服务端时钟**: 脚本读取存储端 `TIME`，对客户端时钟偏移免疫

use redis::Script;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, trace};

use crate::error::BucketronError;

/// Lua脚本类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    /// 扣减令牌（含滴灌补充）
    Take,
    /// 归还令牌
    Put,
}

impl ScriptKind {
    /// 获取脚本名称
    pub fn name(&self) -> &str {
        match self {
            ScriptKind::Take => "take",
            ScriptKind::Put => "put",
        }
    }
}

/// 扣减脚本
///
/// 参数: KEYS[1] - 桶实例键,
///       ARGV[1] - tokens_per_ms, ARGV[2] - size, ARGV[3] - count, ARGV[4] - ttl_secs
/// 返回: (new_remaining: string, conformant: int, now_ms: int, reset_ms: int)
pub const TAKE_SCRIPT: &str = r#"
local key = KEYS[1]
local tokens_per_ms = tonumber(ARGV[1])
local size = tonumber(ARGV[2])
local count = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

-- 使用服务端时钟
local time = redis.call('TIME')
local now_ms = time[1] * 1000 + math.floor(time[2] / 1000)

local state = redis.call('HMGET', key, 'd', 'r')
local new_r
if state[1] and tokens_per_ms > 0 then
    -- 按流逝时间滴灌补充，封顶于容量
    local delta = math.max(now_ms - tonumber(state[1]), 0)
    local dripped = delta * tokens_per_ms
    new_r = math.min(tonumber(state[2]) + dripped, size)
elseif state[1] then
    -- 固定桶不随时间补充
    new_r = tonumber(state[2])
else
    -- 键不存在视同满桶
    new_r = size
end

local conformant = 0
if new_r >= count then
    conformant = 1
    new_r = math.min(new_r - count, size)
end

redis.call('HMSET', key, 'd', now_ms, 'r', tostring(new_r))
redis.call('EXPIRE', key, ttl)

local reset_ms = 0
if tokens_per_ms > 0 then
    reset_ms = math.ceil(now_ms + (size - new_r) / tokens_per_ms)
end

return { tostring(new_r), conformant, now_ms, reset_ms }
"#;

/// 归还脚本
///
/// 参数: KEYS[1] - 桶实例键,
///       ARGV[1] - count（可为负）, ARGV[2] - size, ARGV[3] - ttl_secs, ARGV[4] - drip_interval_ms
/// 返回: (new_remaining: string, now_ms: int, reset_ms: int)
pub const PUT_SCRIPT: &str = r#"
local key = KEYS[1]
local count = tonumber(ARGV[1])
local size = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])
local drip_interval = tonumber(ARGV[4])

local time = redis.call('TIME')
local now_ms = time[1] * 1000 + math.floor(time[2] / 1000)

local state = redis.call('HMGET', key, 'r')
local r = size
if state[1] then
    r = tonumber(state[1])
end

local new_r = math.min(r + count, size)

if new_r < size then
    redis.call('HMSET', key, 'd', now_ms, 'r', tostring(new_r))
    redis.call('EXPIRE', key, ttl)
else
    -- 满桶即缺席：写满等价于删除
    redis.call('DEL', key)
end

local reset_ms = 0
if drip_interval > 0 then
    reset_ms = math.ceil(now_ms + (size - new_r) * drip_interval)
end

return { tostring(new_r), now_ms, reset_ms }
"#;

/// Lua脚本信息
#[derive(Debug, Clone)]
pub struct ScriptInfo {
    /// 脚本类型
    pub kind: ScriptKind,
    /// 脚本内容
    pub source: &'static str,
    /// SHA哈希（计算后填充）
    sha: Arc<parking_lot::Mutex<Option<String>>>,
}

impl ScriptInfo {
    /// 创建新的脚本信息
    pub fn new(kind: ScriptKind, source: &'static str) -> Self {
        Self {
            kind,
            source,
            sha: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    /// 获取脚本SHA，如果未计算则返回None
    pub fn get_sha(&self) -> Option<String> {
        self.sha.lock().clone()
    }

    /// 设置脚本SHA
    pub fn set_sha(&self, sha: String) {
        *self.sha.lock() = Some(sha);
    }
}

/// Lua脚本管理器
pub struct ScriptManager {
    scripts: HashMap<ScriptKind, ScriptInfo>,
}

impl ScriptManager {
    /// 创建新的脚本管理器
    pub fn new() -> Self {
        let mut scripts = HashMap::new();
        scripts.insert(ScriptKind::Take, ScriptInfo::new(ScriptKind::Take, TAKE_SCRIPT));
        scripts.insert(ScriptKind::Put, ScriptInfo::new(ScriptKind::Put, PUT_SCRIPT));
        Self { scripts }
    }

    /// 获取脚本信息
    pub fn get_script(&self, kind: ScriptKind) -> Option<&ScriptInfo> {
        self.scripts.get(&kind)
    }

    /// 获取所有脚本
    pub fn get_all_scripts(&self) -> Vec<&ScriptInfo> {
        self.scripts.values().collect()
    }

    /// 预加载所有脚本到存储端
    pub async fn preload_all_scripts<C>(&self, conn: &mut C) -> Result<(), BucketronError>
    where
        C: redis::aio::ConnectionLike + Send,
    {
        info!("开始预加载Lua脚本");
        for script_info in self.get_all_scripts() {
            self.preload_script(conn, script_info).await?;
        }
        info!("Lua脚本预加载完成");
        Ok(())
    }

    /// 预加载单个脚本
    pub async fn preload_script<C>(
        &self,
        conn: &mut C,
        script_info: &ScriptInfo,
    ) -> Result<(), BucketronError>
    where
        C: redis::aio::ConnectionLike + Send,
    {
        // 计算并缓存SHA
        let script = Script::new(script_info.source);
        let sha = script.get_hash().to_string();
        script_info.set_sha(sha.clone());

        let _: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(script_info.source)
            .query_async(conn)
            .await
            .map_err(|e| {
                error!("预加载脚本失败: {:?}, 错误: {}", script_info.kind, e);
                BucketronError::TransportError(format!("预加载脚本失败: {}", e))
            })?;

        debug!("脚本预加载成功: {:?}, SHA: {}", script_info.kind, sha);
        Ok(())
    }

    /// 执行脚本（优先使用SHA，NOSCRIPT 时重新加载后重试）
    pub async fn execute<C, T>(
        &self,
        conn: &mut C,
        kind: ScriptKind,
        keys: &[&str],
        args: &[String],
    ) -> Result<T, BucketronError>
    where
        C: redis::aio::ConnectionLike + Send,
        T: redis::FromRedisValue,
    {
        let script_info = self
            .get_script(kind)
            .ok_or_else(|| BucketronError::StoreError(format!("未找到脚本: {:?}", kind)))?;

        let sha = match script_info.get_sha() {
            Some(sha) => sha,
            None => {
                // 首次使用时惰性预加载
                self.preload_script(conn, script_info).await?;
                script_info
                    .get_sha()
                    .ok_or_else(|| BucketronError::StoreError("脚本SHA未初始化".to_string()))?
            }
        };

        trace!("执行脚本: {:?}, SHA: {}", kind, sha);

        match redis::cmd("EVALSHA")
            .arg(&sha)
            .arg(keys.len())
            .arg(keys)
            .arg(args)
            .query_async::<_, T>(conn)
            .await
        {
            Ok(result) => Ok(result),
            Err(e) => {
                // 目标节点缺失脚本时重新加载（集群各节点独立缓存脚本）
                if e.to_string().contains("NOSCRIPT") {
                    debug!("脚本SHA不存在，重新加载: {:?}", kind);
                    self.preload_script(conn, script_info).await?;

                    redis::cmd("EVALSHA")
                        .arg(&sha)
                        .arg(keys.len())
                        .arg(keys)
                        .arg(args)
                        .query_async::<_, T>(conn)
                        .await
                        .map_err(|e| {
                            error!("脚本执行失败: {:?}, 错误: {}", kind, e);
                            BucketronError::from(e)
                        })
                } else {
                    error!("脚本执行失败: {:?}, 错误: {}", kind, e);
                    Err(BucketronError::from(e))
                }
            }
        }
    }

    /// 清除所有脚本的SHA缓存
    pub fn clear_sha_cache(&self) {
        for script_info in self.get_all_scripts() {
            *script_info.sha.lock() = None;
        }
        debug!("已清除所有脚本的SHA缓存");
    }
}

impl Default for ScriptManager {
    fn default() -> Self {
        Self::new()
    }
}
