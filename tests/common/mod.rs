#![allow(dead_code)]

//! 测试公共设施
//!
//! 提供带可控时钟的内存版存储桩，语义与存储端Lua脚本一致，
//! 并支持注入失败与延迟以测试弹性层。

use ahash::AHashMap;
use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use bucketron::{BucketRecord, BucketStore, BucketronError, PutOutcome, TakeOutcome};

/// 可控时钟
///
/// `fixed` 模式手动推进；`system` 模式跟随真实时钟。
pub struct MockClock {
    manual: Option<AtomicI64>,
}

impl MockClock {
    /// 固定起点的手动时钟
    pub fn fixed(start_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            manual: Some(AtomicI64::new(start_ms)),
        })
    }

    /// 跟随真实时钟
    pub fn system() -> Arc<Self> {
        Arc::new(Self { manual: None })
    }

    /// 当前时间（unix毫秒）
    pub fn now_ms(&self) -> i64 {
        match &self.manual {
            Some(manual) => manual.load(Ordering::SeqCst),
            None => chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 推进手动时钟
    pub fn advance(&self, ms: i64) {
        let manual = self.manual.as_ref().expect("system时钟不可手动推进");
        manual.fetch_add(ms, Ordering::SeqCst);
    }
}

/// 内存版存储桩
///
/// take/put 的语义逐条对应Lua脚本；写锁保证脚本级原子性。
pub struct MockStore {
    buckets: RwLock<AHashMap<String, (i64, f64)>>,
    clock: Arc<MockClock>,
    /// 权威 take 往返计数
    pub take_calls: AtomicU32,
    /// put 往返计数
    pub put_calls: AtomicU32,
    /// 还需注入的失败次数
    fail_next: AtomicU32,
    /// 注入的响应延迟（毫秒）
    slow_ms: AtomicU64,
    /// 强制重连计数
    pub reconnects: AtomicU32,
}

impl MockStore {
    pub fn new(clock: Arc<MockClock>) -> Arc<Self> {
        Arc::new(Self {
            buckets: RwLock::new(AHashMap::new()),
            clock,
            take_calls: AtomicU32::new(0),
            put_calls: AtomicU32::new(0),
            fail_next: AtomicU32::new(0),
            slow_ms: AtomicU64::new(0),
            reconnects: AtomicU32::new(0),
        })
    }

    /// 注入接下来 n 次调用的传输失败
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// 注入响应延迟
    pub fn set_slow(&self, ms: u64) {
        self.slow_ms.store(ms, Ordering::SeqCst);
    }

    /// 读取桶实例原始状态（测试断言用）
    pub async fn raw(&self, key: &str) -> Option<(i64, f64)> {
        self.buckets.read().await.get(key).copied()
    }

    async fn pre_call(&self) -> Result<(), BucketronError> {
        let slow = self.slow_ms.load(Ordering::SeqCst);
        if slow > 0 {
            tokio::time::sleep(Duration::from_millis(slow)).await;
        }
        let remaining = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if remaining {
            return Err(BucketronError::TransportError(
                "注入的传输失败".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl BucketStore for MockStore {
    async fn take(
        &self,
        key: &str,
        tokens_per_ms: f64,
        size: u64,
        count: u64,
        _ttl_secs: u64,
    ) -> Result<TakeOutcome, BucketronError> {
        self.pre_call().await?;
        self.take_calls.fetch_add(1, Ordering::SeqCst);

        let now_ms = self.clock.now_ms();
        let mut buckets = self.buckets.write().await;
        let size_f = size as f64;

        let new_r = match buckets.get(key) {
            Some((d, r)) if tokens_per_ms > 0.0 => {
                let delta = (now_ms - d).max(0) as f64;
                (r + delta * tokens_per_ms).min(size_f)
            }
            Some((_, r)) => *r,
            None => size_f,
        };

        let conformant = new_r >= count as f64;
        let new_r = if conformant {
            (new_r - count as f64).min(size_f)
        } else {
            new_r
        };

        buckets.insert(key.to_string(), (now_ms, new_r));

        let reset_ms = if tokens_per_ms > 0.0 {
            (now_ms as f64 + (size_f - new_r) / tokens_per_ms).ceil() as i64
        } else {
            0
        };

        Ok(TakeOutcome {
            remaining: new_r,
            conformant,
            now_ms,
            reset_ms,
        })
    }

    async fn put(
        &self,
        key: &str,
        count: i64,
        size: u64,
        _ttl_secs: u64,
        drip_interval_ms: f64,
    ) -> Result<PutOutcome, BucketronError> {
        self.pre_call().await?;
        self.put_calls.fetch_add(1, Ordering::SeqCst);

        let now_ms = self.clock.now_ms();
        let mut buckets = self.buckets.write().await;
        let size_f = size as f64;

        let r = buckets.get(key).map(|(_, r)| *r).unwrap_or(size_f);
        let new_r = (r + count as f64).min(size_f);

        if new_r < size_f {
            buckets.insert(key.to_string(), (now_ms, new_r));
        } else {
            // 满桶即缺席
            buckets.remove(key);
        }

        let reset_ms = if drip_interval_ms > 0.0 {
            (now_ms as f64 + (size_f - new_r) * drip_interval_ms).ceil() as i64
        } else {
            0
        };

        Ok(PutOutcome {
            remaining: new_r,
            now_ms,
            reset_ms,
        })
    }

    async fn fetch(&self, key: &str) -> Result<Option<BucketRecord>, BucketronError> {
        self.pre_call().await?;
        Ok(self
            .buckets
            .read()
            .await
            .get(key)
            .map(|(d, r)| BucketRecord {
                last_drip_ms: *d,
                remaining: *r,
            }))
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, BucketronError> {
        self.pre_call().await?;
        let prefix = pattern.trim_end_matches('*');
        let mut keys: Vec<String> = self
            .buckets
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn flush_all(&self) -> Result<(), BucketronError> {
        self.pre_call().await?;
        self.buckets.write().await.clear();
        Ok(())
    }

    async fn ping(&self) -> Result<Duration, BucketronError> {
        self.pre_call().await?;
        Ok(Duration::from_millis(1))
    }

    async fn reconnect(&self) -> Result<(), BucketronError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), BucketronError> {
        Ok(())
    }
}
