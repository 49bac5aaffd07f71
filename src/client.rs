//! 客户端门面
//!
//! 组装存储驱动、弹性执行器、限流引擎和Ping监控，
//! 对外暴露 take/wait/put/get/reset_all/keys 操作与生命周期事件。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, instrument};

use crate::config::LimiterOptions;
use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::engine::{Engine, GetParams, GetResult, PutParams, PutResult, TakeParams, TakeResult};
use crate::error::BucketronError;
use crate::ping::PingMonitor;
use crate::resilience::ResilientExecutor;
use crate::resolver::BucketRegistry;
use crate::store::{BucketStore, LimiterEvent, RedisStore};

/// 分布式令牌桶限流客户端
///
/// # 示例
///
/// ```no_run
/// use bucketron::{Bucketron, BucketSpec, LimiterOptions, TakeParams};
///
/// #[tokio::main]
/// async fn main() -> Result<(), bucketron::BucketronError> {
///     let options = LimiterOptions::single("redis://127.0.0.1:6379")
///         .bucket("ip", BucketSpec::new().per_second(5).size(10));
///     let limiter = Bucketron::connect(options).await?;
///
///     let result = limiter.take(&TakeParams::new("ip", "1.1.1.1")).await?;
///     if result.conformant {
///         // 放行请求
///     }
///     limiter.close().await?;
///     Ok(())
/// }
/// ```
pub struct Bucketron {
    engine: Engine,
    store: Arc<dyn BucketStore>,
    ping: Option<PingMonitor>,
    events: broadcast::Sender<LimiterEvent>,
    closed: AtomicBool,
}

impl Bucketron {
    /// 连接存储并构建客户端
    pub async fn connect(options: LimiterOptions) -> Result<Self, BucketronError> {
        options.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let store: Arc<dyn BucketStore> =
            Arc::new(RedisStore::connect_with_events(&options, events.clone()).await?);
        Self::assemble(options, store, events)
    }

    /// 使用注入的存储驱动构建客户端
    ///
    /// 存储驱动是依赖注入的组件，测试桩和自定义驱动都从这里进入。
    pub fn with_store(
        options: LimiterOptions,
        store: Arc<dyn BucketStore>,
    ) -> Result<Self, BucketronError> {
        options.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self::assemble(options, store, events)
    }

    fn assemble(
        options: LimiterOptions,
        store: Arc<dyn BucketStore>,
        events: broadcast::Sender<LimiterEvent>,
    ) -> Result<Self, BucketronError> {
        let registry = BucketRegistry::new(&options.buckets, options.global_ttl_secs)?;
        let executor = Arc::new(ResilientExecutor::new(
            options.retry.clone(),
            options.command_timeout_ms,
            options.breaker.clone(),
        ));
        let engine = Engine::new(registry, store.clone(), executor);

        // Ping监控仅单机模式启用
        let ping = match (&options.ping, options.is_cluster()) {
            (Some(ping_options), false) => {
                let monitor =
                    PingMonitor::new(store.clone(), ping_options.clone(), events.clone());
                monitor.start();
                Some(monitor)
            }
            _ => None,
        };

        info!(
            "限流客户端就绪: buckets={} cluster={}",
            options.buckets.len(),
            options.is_cluster()
        );

        Ok(Self {
            engine,
            store,
            ping,
            events,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), BucketronError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BucketronError::AlreadyClosed)
        } else {
            Ok(())
        }
    }

    /// 扣减令牌
    #[instrument(skip(self), fields(bucket = %params.bucket, key = %params.key))]
    pub async fn take(&self, params: &TakeParams) -> Result<TakeResult, BucketronError> {
        self.ensure_open()?;
        self.engine.take(params).await
    }

    /// 阻塞直到有足够令牌
    #[instrument(skip(self), fields(bucket = %params.bucket, key = %params.key))]
    pub async fn wait(&self, params: &TakeParams) -> Result<TakeResult, BucketronError> {
        self.ensure_open()?;
        self.engine.wait(params).await
    }

    /// 归还令牌
    #[instrument(skip(self), fields(bucket = %params.bucket, key = %params.key))]
    pub async fn put(&self, params: &PutParams) -> Result<PutResult, BucketronError> {
        self.ensure_open()?;
        self.engine.put(params).await
    }

    /// 查询桶状态
    #[instrument(skip(self), fields(bucket = %params.bucket, key = %params.key))]
    pub async fn get(&self, params: &GetParams) -> Result<GetResult, BucketronError> {
        self.ensure_open()?;
        self.engine.get(params).await
    }

    /// 清空所有桶实例
    pub async fn reset_all(&self) -> Result<(), BucketronError> {
        self.ensure_open()?;
        self.engine.reset_all().await
    }

    /// 列出某个类型现存的桶实例键（仅单机模式）
    pub async fn keys(&self, bucket: &str) -> Result<Vec<String>, BucketronError> {
        self.ensure_open()?;
        self.engine.keys(bucket).await
    }

    /// 订阅生命周期事件
    pub fn subscribe(&self) -> broadcast::Receiver<LimiterEvent> {
        self.events.subscribe()
    }

    /// 关闭客户端
    ///
    /// 停止Ping监控并断开存储连接；重复关闭返回 `AlreadyClosed`。
    pub async fn close(&self) -> Result<(), BucketronError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(BucketronError::AlreadyClosed);
        }
        if let Some(ping) = &self.ping {
            ping.stop();
        }
        self.store.close().await?;
        info!("限流客户端已关闭");
        Ok(())
    }
}
