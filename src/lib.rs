//! Bucketron - 分布式令牌桶限流器
//!
//! 权威状态存储于共享的Redis兼容存储（单机或集群），通过原子Lua脚本
//! 执行滴灌补充与令牌扣减，对客户端时钟偏移免疫。
//!
//! # 特性
//!
//! - **令牌桶算法**：存储端原子执行，支持溢出封顶、小数速率和固定桶
//! - **桶配置模型**：类型默认值、键名/正则覆盖（LRU缓存）、调用级覆盖、限时覆盖
//! - **弹性层**：有界重试、单次命令超时、区分校验错误的熔断器
//! - **Ping监控**：持续失败后可强制驱动重连
//! - **wait协议**：阻塞等待令牌补充；可选的机会主义跳过缓存
//!
//! # 快速开始
//!
//! ```no_run
//! use bucketron::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), BucketronError> {
//!     let options = LimiterOptions::single("redis://127.0.0.1:6379")
//!         .bucket("ip", BucketSpec::new().per_second(5).size(10));
//!     let limiter = Bucketron::connect(options).await?;
//!
//!     let result = limiter.take(&TakeParams::new("ip", "1.1.1.1")).await?;
//!     println!("conformant={} remaining={}", result.conformant, result.remaining);
//!     Ok(())
//! }
//! ```
//!
//! # 模块
//!
//! - `bucket`: 桶类型模型与规范化
//! - `client`: 客户端门面
//! - `config`: 构造配置
//! - `constants`: 集中常量
//! - `engine`: 限流引擎
//! - `error`: 错误类型
//! - `ping`: Ping监控
//! - `resilience`: 重试/超时/熔断
//! - `resolver`: 生效配置解析
//! - `scripts`: Lua脚本
//! - `store`: 存储驱动

pub mod bucket;
pub mod client;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod ping;
pub mod prelude;
pub mod resilience;
pub mod resolver;
pub mod scripts;
pub mod store;

// 重新导出常用类型
pub use bucket::{BucketParams, BucketSpec, OverrideMap};
pub use client::Bucketron;
pub use config::{BreakerOptions, LimiterOptions, PingOptions, RetryOptions};
pub use engine::{
    Engine, GetParams, GetResult, PutCount, PutParams, PutResult, TakeCount, TakeParams,
    TakeResult,
};
pub use error::{BucketronError, ValidationCode};
pub use ping::PingMonitor;
pub use resilience::{BreakerStats, CircuitBreaker, CircuitState, ResilientExecutor};
pub use resolver::BucketRegistry;
pub use store::{
    BucketRecord, BucketStore, LimiterEvent, PingReport, PingStatus, PutOutcome, RedisStore,
    TakeOutcome,
};
