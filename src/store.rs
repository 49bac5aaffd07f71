//! 存储驱动
//!
//! 实现基于Redis的存储驱动，支持单机和集群模式，注册原子Lua脚本，
//! 暴露 take/put/fetch/scan/flush/ping 能力。
//!
//! # 特性
//!
//! - **快速失败**: 不做离线排队，连接断开时立即报错
//! - **Lua脚本**: 预加载脚本，原子性操作
//! - **集群支持**: flush 路由到全部主节点
//! - **READONLY重连**: 收到只读副本响应时强制重连
//! - **状态事件**: ready / error / node error / closed 广播给引擎

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{Client, IntoConnectionInfo};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::config::LimiterOptions;
use crate::constants::{EVENT_CHANNEL_CAPACITY, SCAN_COUNT};
use crate::error::BucketronError;
use crate::scripts::{ScriptKind, ScriptManager};

/// 限流器生命周期事件
#[derive(Debug, Clone)]
pub enum LimiterEvent {
    /// 存储连接就绪
    Ready,
    /// 传输错误
    Error(String),
    /// 集群节点错误
    NodeError {
        /// 错误描述
        message: String,
        /// 节点地址
        node: String,
    },
    /// 连接已关闭
    Closed,
    /// Ping监控报告
    Ping(PingReport),
}

/// Ping结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingStatus {
    /// 探测成功
    Success,
    /// 探测失败
    Error,
    /// 已触发强制重连
    Reconnect,
    /// 达到失败阈值但未启用强制重连
    ReconnectDryRun,
}

/// Ping监控报告
#[derive(Debug, Clone)]
pub struct PingReport {
    /// 状态
    pub status: PingStatus,
    /// 本次探测耗时
    pub duration: Duration,
    /// 失败时的错误描述
    pub error: Option<String>,
    /// 当前连续失败计数
    pub failed_pings: u32,
}

/// `take` 脚本的执行结果
#[derive(Debug, Clone, PartialEq)]
pub struct TakeOutcome {
    /// 扣减后的剩余令牌（可能为小数）
    pub remaining: f64,
    /// 是否符合（有足够令牌）
    pub conformant: bool,
    /// 存储端当前时间（unix毫秒）
    pub now_ms: i64,
    /// 桶重新满载的时间（unix毫秒，固定桶为0）
    pub reset_ms: i64,
}

/// `put` 脚本的执行结果
#[derive(Debug, Clone, PartialEq)]
pub struct PutOutcome {
    /// 归还后的剩余令牌
    pub remaining: f64,
    /// 存储端当前时间（unix毫秒）
    pub now_ms: i64,
    /// 桶重新满载的时间（unix毫秒，固定桶为0）
    pub reset_ms: i64,
}

/// 桶实例的原始存储状态
#[derive(Debug, Clone, PartialEq)]
pub struct BucketRecord {
    /// 最后一次滴灌/变更时间（unix毫秒）
    pub last_drip_ms: i64,
    /// 剩余令牌
    pub remaining: f64,
}

/// 存储驱动接口
///
/// 引擎、Ping监控和测试桩都通过这一接口访问存储。
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// 原子扣减（含滴灌补充）
    async fn take(
        &self,
        key: &str,
        tokens_per_ms: f64,
        size: u64,
        count: u64,
        ttl_secs: u64,
    ) -> Result<TakeOutcome, BucketronError>;

    /// 原子归还（count 可为负）
    async fn put(
        &self,
        key: &str,
        count: i64,
        size: u64,
        ttl_secs: u64,
        drip_interval_ms: f64,
    ) -> Result<PutOutcome, BucketronError>;

    /// 读取桶实例原始状态（HMGET d,r）
    async fn fetch(&self, key: &str) -> Result<Option<BucketRecord>, BucketronError>;

    /// 按模式列出桶实例键（仅单机模式）
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, BucketronError>;

    /// 清空所有桶实例（集群模式下作用于全部主节点）
    async fn flush_all(&self) -> Result<(), BucketronError>;

    /// 存活探测，返回往返耗时
    async fn ping(&self) -> Result<Duration, BucketronError>;

    /// 强制断开并重建连接
    async fn reconnect(&self) -> Result<(), BucketronError>;

    /// 关闭连接
    async fn close(&self) -> Result<(), BucketronError>;
}

/// 底层连接（单机或集群）
#[derive(Clone)]
enum StoreConnection {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

/// Redis存储驱动
pub struct RedisStore {
    /// 连接（None 表示未连接，操作快速失败）
    conn: Arc<Mutex<Option<StoreConnection>>>,
    /// 连接参数
    uri: Option<String>,
    nodes: Vec<String>,
    username: Option<String>,
    password: Option<String>,
    /// 全局键前缀
    prefix: Option<String>,
    /// Lua脚本管理器
    scripts: ScriptManager,
    /// 事件广播
    events: broadcast::Sender<LimiterEvent>,
}

impl RedisStore {
    /// 建立连接并预加载脚本
    pub async fn connect(options: &LimiterOptions) -> Result<Self, BucketronError> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self::connect_with_events(options, events).await
    }

    /// 使用外部事件通道建立连接
    pub async fn connect_with_events(
        options: &LimiterOptions,
        events: broadcast::Sender<LimiterEvent>,
    ) -> Result<Self, BucketronError> {
        let store = Self {
            conn: Arc::new(Mutex::new(None)),
            uri: options.uri.clone(),
            nodes: options.nodes.clone(),
            username: options.username.clone(),
            password: options.password_plain(),
            prefix: options.prefix.clone(),
            scripts: ScriptManager::new(),
            events,
        };

        store.establish().await?;

        // 预加载Lua脚本（集群各节点缺失时由 NOSCRIPT 兜底重载）
        if let Some(conn) = store.connection().await {
            match conn {
                StoreConnection::Single(mut c) => {
                    store.scripts.preload_all_scripts(&mut c).await?;
                }
                StoreConnection::Cluster(mut c) => {
                    store.scripts.preload_all_scripts(&mut c).await?;
                }
            }
        }

        info!("存储驱动创建成功");
        Ok(store)
    }

    /// 订阅生命周期事件
    pub fn subscribe(&self) -> broadcast::Receiver<LimiterEvent> {
        self.events.subscribe()
    }

    /// 是否为集群模式
    pub fn is_cluster(&self) -> bool {
        self.uri.is_none()
    }

    /// 建立底层连接
    async fn establish(&self) -> Result<(), BucketronError> {
        let connection = if let Some(uri) = &self.uri {
            debug!("建立单机连接: {}", uri);
            let mut info = uri
                .as_str()
                .into_connection_info()
                .map_err(|e| BucketronError::ConfigError(format!("无效的连接URI: {}", e)))?;
            if let Some(username) = &self.username {
                info.redis.username = Some(username.clone());
            }
            if let Some(password) = &self.password {
                info.redis.password = Some(password.clone());
            }

            let client = Client::open(info).map_err(|e| {
                error!("创建Redis客户端失败: {}", e);
                BucketronError::TransportError(format!("创建Redis客户端失败: {}", e))
            })?;

            let manager = ConnectionManager::new(client).await.map_err(|e| {
                error!("创建连接管理器失败: {}", e);
                BucketronError::TransportError(format!("创建连接管理器失败: {}", e))
            })?;

            StoreConnection::Single(manager)
        } else {
            debug!("建立集群连接: {:?}", self.nodes);
            let mut builder = ClusterClient::builder(self.nodes.clone());
            if let Some(username) = &self.username {
                builder = builder.username(username.clone());
            }
            if let Some(password) = &self.password {
                builder = builder.password(password.clone());
            }

            let client = builder.build().map_err(|e| {
                error!("创建集群客户端失败: {}", e);
                BucketronError::TransportError(format!("创建集群客户端失败: {}", e))
            })?;

            let conn = client.get_async_connection().await.map_err(|e| {
                error!("建立集群连接失败: {}", e);
                let _ = self.events.send(LimiterEvent::NodeError {
                    message: e.to_string(),
                    node: self.nodes.first().cloned().unwrap_or_default(),
                });
                BucketronError::TransportError(format!("建立集群连接失败: {}", e))
            })?;

            StoreConnection::Cluster(conn)
        };

        *self.conn.lock().await = Some(connection);
        let _ = self.events.send(LimiterEvent::Ready);
        info!("存储连接建立成功");
        Ok(())
    }

    /// 获取连接克隆（持锁窗口最小化）
    async fn connection(&self) -> Option<StoreConnection> {
        self.conn.lock().await.clone()
    }

    /// 获取连接，未连接时快速失败
    async fn require_connection(&self) -> Result<StoreConnection, BucketronError> {
        self.connection()
            .await
            .ok_or_else(|| BucketronError::TransportError("连接未初始化".to_string()))
    }

    /// 应用全局前缀
    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) if !prefix.is_empty() => format!("{}:{}", prefix, key),
            _ => key.to_string(),
        }
    }

    /// 剥离全局前缀（SCAN 返回值还原为引擎视角的键）
    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        match &self.prefix {
            Some(prefix) if !prefix.is_empty() => key
                .strip_prefix(prefix.as_str())
                .and_then(|s| s.strip_prefix(':'))
                .unwrap_or(key),
            _ => key,
        }
    }

    /// 统一错误处理：READONLY 响应触发强制重连
    async fn handle_redis_error(&self, e: redis::RedisError) -> BucketronError {
        if e.code() == Some("READONLY") {
            warn!("收到 READONLY 响应，强制重连");
            if let Err(reconnect_err) = self.reconnect().await {
                error!("READONLY 后重连失败: {}", reconnect_err);
            }
        }
        let mapped = BucketronError::from(e);
        let _ = self.events.send(LimiterEvent::Error(mapped.to_string()));
        mapped
    }

    /// 执行一条命令
    async fn query<T: redis::FromRedisValue>(
        &self,
        cmd: &redis::Cmd,
    ) -> Result<T, BucketronError> {
        let result = match self.require_connection().await? {
            StoreConnection::Single(mut c) => cmd.query_async::<_, T>(&mut c).await,
            StoreConnection::Cluster(mut c) => cmd.query_async::<_, T>(&mut c).await,
        };
        match result {
            Ok(value) => Ok(value),
            Err(e) => Err(self.handle_redis_error(e).await),
        }
    }

    /// 执行一个Lua脚本
    async fn eval<T: redis::FromRedisValue>(
        &self,
        kind: ScriptKind,
        key: &str,
        args: Vec<String>,
    ) -> Result<T, BucketronError> {
        match self.require_connection().await? {
            StoreConnection::Single(mut c) => {
                self.scripts.execute(&mut c, kind, &[key], &args).await
            }
            StoreConnection::Cluster(mut c) => {
                self.scripts.execute(&mut c, kind, &[key], &args).await
            }
        }
    }
}

#[async_trait]
impl BucketStore for RedisStore {
    async fn take(
        &self,
        key: &str,
        tokens_per_ms: f64,
        size: u64,
        count: u64,
        ttl_secs: u64,
    ) -> Result<TakeOutcome, BucketronError> {
        let full_key = self.full_key(key);
        let args = vec![
            tokens_per_ms.to_string(),
            size.to_string(),
            count.to_string(),
            ttl_secs.to_string(),
        ];

        let (remaining, conformant, now_ms, reset_ms): (String, i64, i64, i64) =
            self.eval(ScriptKind::Take, &full_key, args).await?;

        let remaining: f64 = remaining
            .parse()
            .map_err(|e| BucketronError::StoreError(format!("无法解析剩余令牌: {}", e)))?;

        trace!(
            "take key={} count={} conformant={} remaining={}",
            full_key,
            count,
            conformant == 1,
            remaining
        );

        Ok(TakeOutcome {
            remaining,
            conformant: conformant == 1,
            now_ms,
            reset_ms,
        })
    }

    async fn put(
        &self,
        key: &str,
        count: i64,
        size: u64,
        ttl_secs: u64,
        drip_interval_ms: f64,
    ) -> Result<PutOutcome, BucketronError> {
        let full_key = self.full_key(key);
        let args = vec![
            count.to_string(),
            size.to_string(),
            ttl_secs.to_string(),
            drip_interval_ms.to_string(),
        ];

        let (remaining, now_ms, reset_ms): (String, i64, i64) =
            self.eval(ScriptKind::Put, &full_key, args).await?;

        let remaining: f64 = remaining
            .parse()
            .map_err(|e| BucketronError::StoreError(format!("无法解析剩余令牌: {}", e)))?;

        trace!("put key={} count={} remaining={}", full_key, count, remaining);

        Ok(PutOutcome {
            remaining,
            now_ms,
            reset_ms,
        })
    }

    async fn fetch(&self, key: &str) -> Result<Option<BucketRecord>, BucketronError> {
        let full_key = self.full_key(key);
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(&full_key).arg("d").arg("r");

        let values: Vec<Option<String>> = self.query(&cmd).await?;

        match (values.first().cloned().flatten(), values.get(1).cloned().flatten()) {
            (Some(d), Some(r)) => {
                let last_drip_ms = d
                    .parse()
                    .map_err(|e| BucketronError::StoreError(format!("无法解析滴灌时间: {}", e)))?;
                let remaining = r
                    .parse()
                    .map_err(|e| BucketronError::StoreError(format!("无法解析剩余令牌: {}", e)))?;
                Ok(Some(BucketRecord {
                    last_drip_ms,
                    remaining,
                }))
            }
            _ => Ok(None),
        }
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, BucketronError> {
        if self.is_cluster() {
            return Err(BucketronError::StoreError(
                "SCAN 仅支持单机模式".to_string(),
            ));
        }

        let full_pattern = self.full_key(pattern);
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor)
                .arg("MATCH")
                .arg(&full_pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT);

            let (next, batch): (u64, Vec<String>) = self.query(&cmd).await?;
            keys.extend(batch.iter().map(|k| self.strip_prefix(k).to_string()));
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        debug!("SCAN pattern={} 共 {} 个键", full_pattern, keys.len());
        Ok(keys)
    }

    async fn flush_all(&self) -> Result<(), BucketronError> {
        match self.require_connection().await? {
            StoreConnection::Single(mut c) => {
                let _: () = redis::cmd("FLUSHDB")
                    .query_async(&mut c)
                    .await
                    .map_err(|e| {
                        error!("FLUSHDB失败: {}", e);
                        BucketronError::from(e)
                    })?;
            }
            StoreConnection::Cluster(mut c) => {
                use redis::cluster_routing::{
                    MultipleNodeRoutingInfo, ResponsePolicy, RoutingInfo,
                };
                // flush 必须作用于全部主节点
                let cmd = redis::cmd("FLUSHDB");
                let _ = c
                    .route_command(
                        &cmd,
                        RoutingInfo::MultiNode((
                            MultipleNodeRoutingInfo::AllMasters,
                            Some(ResponsePolicy::AllSucceeded),
                        )),
                    )
                    .await
                    .map_err(|e| {
                        error!("集群FLUSHDB失败: {}", e);
                        BucketronError::from(e)
                    })?;
            }
        }
        info!("已清空全部桶实例");
        Ok(())
    }

    async fn ping(&self) -> Result<Duration, BucketronError> {
        let started = Instant::now();
        let response: String = self.query(&redis::cmd("PING")).await?;
        if response == "PONG" {
            Ok(started.elapsed())
        } else {
            Err(BucketronError::TransportError(format!(
                "意外的PING响应: {}",
                response
            )))
        }
    }

    async fn reconnect(&self) -> Result<(), BucketronError> {
        debug!("强制重建存储连接");
        *self.conn.lock().await = None;
        self.scripts.clear_sha_cache();
        self.establish().await
    }

    async fn close(&self) -> Result<(), BucketronError> {
        // QUIT 只对单机连接有意义，集群连接直接丢弃
        if let Some(StoreConnection::Single(mut c)) = self.connection().await {
            let _: Result<String, _> = redis::cmd("QUIT").query_async(&mut c).await;
        }
        *self.conn.lock().await = None;
        let _ = self.events.send(LimiterEvent::Closed);
        info!("存储连接已关闭");
        Ok(())
    }
}
