//! 弹性层
//!
//! 包裹每一次存储往返的三个正交关注点：
//!
//! - **重试**: 预算内的有界重试，退避区间内随机取值
//! - **命令超时**: 每次尝试独立计时，提前1ms触发后让出一个tick，
//!   给在途完成最后一次竞争机会
//! - **熔断器**: 三状态转换（Closed/Open/HalfOpen），冷却时间指数升级，
//!   校验错误永不计入
//!
//! 校验错误与熔断器打开错误不重试；重试耗尽后返回最后一次错误。

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

use crate::config::{BreakerOptions, RetryOptions};
use crate::error::BucketronError;

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// 关闭状态（正常）
    Closed,
    /// 打开状态（熔断）
    Open,
    /// 半开状态（探测）
    HalfOpen,
}

/// 熔断器统计信息
#[derive(Debug, Clone)]
pub struct BreakerStats {
    /// 当前状态
    pub state: CircuitState,
    /// 当前连续失败计数
    pub failure_count: u32,
    /// 总调用次数
    pub total_calls: u64,
    /// 被熔断拒绝的调用次数
    pub rejected_calls: u64,
    /// 熔断触发次数
    pub trips: u32,
}

/// 熔断器
///
/// 失败必须落在滚动窗口内才计为连续；连续失败达到阈值后熔断。
/// 每次重新熔断冷却时间翻倍，封顶于 `max_cooldown_ms`；恢复后回到初始值。
pub struct CircuitBreaker {
    /// 当前状态
    state: Arc<RwLock<CircuitState>>,
    /// 连续失败计数
    failure_count: Arc<AtomicU32>,
    /// 最后失败时间
    last_failure: Arc<RwLock<Option<Instant>>>,
    /// 熔断时间
    opened_at: Arc<RwLock<Option<Instant>>>,
    /// 连续熔断次数（决定冷却升级）
    consecutive_trips: Arc<AtomicU32>,
    /// 半开状态下的探测占用标记
    probe_inflight: Arc<AtomicBool>,
    /// 总调用次数
    total_calls: Arc<AtomicU64>,
    /// 被拒绝的调用次数
    rejected_calls: Arc<AtomicU64>,
    /// 配置
    options: BreakerOptions,
}

impl CircuitBreaker {
    /// 创建新的熔断器
    pub fn new(options: BreakerOptions) -> Self {
        debug!(
            "创建熔断器: max_failures={} window={}ms cooldown={}ms max_cooldown={}ms",
            options.max_failures, options.window_ms, options.cooldown_ms, options.max_cooldown_ms
        );
        Self {
            state: Arc::new(RwLock::new(CircuitState::Closed)),
            failure_count: Arc::new(AtomicU32::new(0)),
            last_failure: Arc::new(RwLock::new(None)),
            opened_at: Arc::new(RwLock::new(None)),
            consecutive_trips: Arc::new(AtomicU32::new(0)),
            probe_inflight: Arc::new(AtomicBool::new(false)),
            total_calls: Arc::new(AtomicU64::new(0)),
            rejected_calls: Arc::new(AtomicU64::new(0)),
            options,
        }
    }

    /// 当前冷却时间（随连续熔断次数指数升级）
    fn current_cooldown(&self) -> Duration {
        let trips = self.consecutive_trips.load(Ordering::Relaxed).max(1);
        let cooldown = self
            .options
            .cooldown_ms
            .saturating_mul(1u64 << (trips - 1).min(16))
            .min(self.options.max_cooldown_ms);
        Duration::from_millis(cooldown)
    }

    /// 执行操作，自动处理熔断逻辑
    ///
    /// 返回 `Err(BucketronError::BreakerOpen)` 表示调用被熔断拒绝。
    /// 校验错误原样穿透，不影响任何计数。
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, BucketronError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BucketronError>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let is_probe = self.before_call().await?;

        let result = operation().await;

        match &result {
            Ok(_) => self.on_success(is_probe).await,
            Err(e) if e.counts_toward_breaker() => self.on_failure(is_probe).await,
            Err(_) => {
                // 校验等不计入的错误：释放探测名额，状态不变
                if is_probe {
                    self.probe_inflight.store(false, Ordering::Release);
                }
            }
        }

        result
    }

    /// 调用前检查，返回本次调用是否为半开探测
    async fn before_call(&self) -> Result<bool, BucketronError> {
        let state = *self.state.read().await;
        match state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let opened_at = *self.opened_at.read().await;
                let cooled_down = opened_at
                    .map(|t| t.elapsed() >= self.current_cooldown())
                    .unwrap_or(true);
                if cooled_down {
                    self.transition_to_half_open().await;
                    // 冷却结束后的第一个调用即探测
                    self.probe_inflight.store(true, Ordering::Release);
                    Ok(true)
                } else {
                    self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                    trace!("熔断器打开，拒绝请求");
                    Err(BucketronError::BreakerOpen)
                }
            }
            CircuitState::HalfOpen => {
                // 半开状态只放行单个探测
                if self
                    .probe_inflight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    Ok(true)
                } else {
                    self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                    trace!("半开状态探测占用中，拒绝请求");
                    Err(BucketronError::BreakerOpen)
                }
            }
        }
    }

    /// 操作成功时的处理
    async fn on_success(&self, is_probe: bool) {
        let state = *self.state.read().await;
        match state {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Relaxed);
            }
            CircuitState::HalfOpen => {
                if is_probe {
                    self.transition_to_closed().await;
                }
            }
            CircuitState::Open => {
                // 打开状态不应该执行到这里
                warn!("熔断器打开状态下收到成功响应");
            }
        }
    }

    /// 操作失败时的处理
    async fn on_failure(&self, is_probe: bool) {
        let state = *self.state.read().await;
        match state {
            CircuitState::Closed => {
                // 滚动窗口外的失败重新开始计数
                let window = Duration::from_millis(self.options.window_ms);
                let mut last_failure = self.last_failure.write().await;
                let consecutive = last_failure
                    .map(|t| t.elapsed() <= window)
                    .unwrap_or(false);
                *last_failure = Some(Instant::now());
                drop(last_failure);

                let count = if consecutive {
                    self.failure_count.fetch_add(1, Ordering::Relaxed) + 1
                } else {
                    self.failure_count.store(1, Ordering::Relaxed);
                    1
                };

                if count >= self.options.max_failures {
                    self.transition_to_open().await;
                } else {
                    trace!("操作失败: {}/{}", count, self.options.max_failures);
                }
            }
            CircuitState::HalfOpen => {
                if is_probe {
                    // 探测失败，重新熔断并升级冷却
                    self.transition_to_open().await;
                }
            }
            CircuitState::Open => {
                warn!("熔断器打开状态下收到失败响应");
            }
        }
    }

    /// 切换到打开状态
    async fn transition_to_open(&self) {
        let old_state = *self.state.read().await;
        if old_state != CircuitState::Open {
            *self.state.write().await = CircuitState::Open;
            *self.opened_at.write().await = Some(Instant::now());
            self.probe_inflight.store(false, Ordering::Release);
            let trips = self.consecutive_trips.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                "熔断器状态变更: {:?} -> Open (trips={}, cooldown={:?})",
                old_state,
                trips,
                self.current_cooldown()
            );
        }
    }

    /// 切换到半开状态
    async fn transition_to_half_open(&self) {
        let old_state = *self.state.read().await;
        if old_state != CircuitState::HalfOpen {
            *self.state.write().await = CircuitState::HalfOpen;
            self.probe_inflight.store(false, Ordering::Release);
            info!("熔断器状态变更: {:?} -> HalfOpen", old_state);
        }
    }

    /// 切换到关闭状态
    async fn transition_to_closed(&self) {
        let old_state = *self.state.read().await;
        if old_state != CircuitState::Closed {
            *self.state.write().await = CircuitState::Closed;
            self.failure_count.store(0, Ordering::Relaxed);
            self.consecutive_trips.store(0, Ordering::Relaxed);
            self.probe_inflight.store(false, Ordering::Release);
            *self.last_failure.write().await = None;
            info!("熔断器状态变更: {:?} -> Closed", old_state);
        }
    }

    /// 获取当前状态
    pub async fn get_state(&self) -> CircuitState {
        *self.state.read().await
    }

    /// 重置熔断器到关闭状态
    pub async fn reset(&self) {
        info!("重置熔断器");
        *self.state.write().await = CircuitState::Closed;
        self.failure_count.store(0, Ordering::Relaxed);
        self.consecutive_trips.store(0, Ordering::Relaxed);
        self.probe_inflight.store(false, Ordering::Release);
        *self.last_failure.write().await = None;
        *self.opened_at.write().await = None;
    }

    /// 获取统计信息
    pub async fn get_stats(&self) -> BreakerStats {
        BreakerStats {
            state: *self.state.read().await,
            failure_count: self.failure_count.load(Ordering::Relaxed),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            trips: self.consecutive_trips.load(Ordering::Relaxed),
        }
    }
}

/// 弹性执行器
///
/// 组合命令超时、熔断器和有界重试，包裹每一次存储往返。
pub struct ResilientExecutor {
    retry: RetryOptions,
    command_timeout: Duration,
    breaker: CircuitBreaker,
}

impl ResilientExecutor {
    /// 创建新的执行器
    pub fn new(retry: RetryOptions, command_timeout_ms: u64, breaker: BreakerOptions) -> Self {
        Self {
            retry,
            command_timeout: Duration::from_millis(command_timeout_ms),
            breaker: CircuitBreaker::new(breaker),
        }
    }

    /// 访问内部熔断器
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// 执行操作：每次尝试独立计时，可重试错误在预算内重试
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T, BucketronError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BucketronError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let result = self
                .breaker
                .execute(|| self.with_command_timeout(operation()))
                .await;

            match result {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retriable() => return Err(e),
                Err(e) => {
                    if attempt >= self.retry.retries {
                        return Err(e);
                    }
                    attempt += 1;
                    let backoff = self.backoff_ms();
                    warn!(
                        "操作失败，将在 {}ms 后重试 (尝试 {}/{}): {}",
                        backoff, attempt, self.retry.retries, e
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
        }
    }

    /// 在退避区间内随机取值
    fn backoff_ms(&self) -> u64 {
        use rand::Rng;
        let min = self.retry.min_backoff_ms;
        let max = self.retry.max_backoff_ms.max(min);
        rand::thread_rng().gen_range(min..=max)
    }

    /// 单次尝试的命令超时
    ///
    /// 计时器在 `T-1ms` 触发，然后让出一个tick再做最终检查，
    /// 只有在途操作仍未完成时才报超时。
    async fn with_command_timeout<T>(
        &self,
        fut: impl Future<Output = Result<T, BucketronError>>,
    ) -> Result<T, BucketronError> {
        let timeout_ms = self.command_timeout.as_millis() as u64;
        let early = self.command_timeout.saturating_sub(Duration::from_millis(1));
        tokio::pin!(fut);

        tokio::select! {
            result = &mut fut => return result,
            _ = tokio::time::sleep(early) => {}
        }

        tokio::task::yield_now().await;
        if let std::task::Poll::Ready(result) = futures::poll!(&mut fut) {
            return result;
        }

        Err(BucketronError::CommandTimeout(timeout_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationCode;

    fn breaker_options(max_failures: u32, cooldown_ms: u64) -> BreakerOptions {
        BreakerOptions {
            max_failures,
            window_ms: 10_000,
            cooldown_ms,
            max_cooldown_ms: cooldown_ms * 3,
        }
    }

    fn transport_err<T>() -> Result<T, BucketronError> {
        Err(BucketronError::TransportError("connection reset".to_string()))
    }

    #[tokio::test]
    async fn test_breaker_initial_state() {
        let breaker = CircuitBreaker::new(BreakerOptions::default());
        assert_eq!(breaker.get_state().await, CircuitState::Closed);
        let stats = breaker.get_stats().await;
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.total_calls, 0);
    }

    #[tokio::test]
    async fn test_breaker_trips_after_max_failures() {
        let breaker = CircuitBreaker::new(breaker_options(3, 1_000));

        for _ in 0..3 {
            let _ = breaker.execute(|| async { transport_err::<()>() }).await;
        }
        assert_eq!(breaker.get_state().await, CircuitState::Open);

        // 打开状态下立即拒绝
        let result = breaker
            .execute(|| async { Ok::<(), BucketronError>(()) })
            .await;
        assert!(matches!(result, Err(BucketronError::BreakerOpen)));
    }

    #[tokio::test]
    async fn test_validation_errors_never_trip() {
        let breaker = CircuitBreaker::new(breaker_options(2, 1_000));

        for _ in 0..10 {
            let result = breaker
                .execute(|| async {
                    Err::<(), _>(BucketronError::validation(
                        ValidationCode::InvalidCount,
                        "bad count",
                    ))
                })
                .await;
            // 校验错误原样穿透
            assert!(matches!(
                result,
                Err(BucketronError::ValidationError { .. })
            ));
        }
        assert_eq!(breaker.get_state().await, CircuitState::Closed);
        assert_eq!(breaker.get_stats().await.failure_count, 0);
    }

    #[tokio::test]
    async fn test_breaker_half_open_recovery() {
        let breaker = CircuitBreaker::new(breaker_options(2, 50));

        for _ in 0..2 {
            let _ = breaker.execute(|| async { transport_err::<()>() }).await;
        }
        assert_eq!(breaker.get_state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;

        // 冷却结束，探测成功后恢复
        let result = breaker
            .execute(|| async { Ok::<(), BucketronError>(()) })
            .await;
        assert!(result.is_ok());
        assert_eq!(breaker.get_state().await, CircuitState::Closed);
        assert_eq!(breaker.get_stats().await.trips, 0);
    }

    #[tokio::test]
    async fn test_breaker_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(breaker_options(2, 50));

        for _ in 0..2 {
            let _ = breaker.execute(|| async { transport_err::<()>() }).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        let _ = breaker.execute(|| async { transport_err::<()>() }).await;
        assert_eq!(breaker.get_state().await, CircuitState::Open);
        // 重新熔断后冷却升级
        assert_eq!(breaker.get_stats().await.trips, 2);
    }

    #[tokio::test]
    async fn test_cooldown_escalates_and_caps() {
        let breaker = CircuitBreaker::new(BreakerOptions {
            max_failures: 1,
            window_ms: 10_000,
            cooldown_ms: 1_000,
            max_cooldown_ms: 3_000,
        });

        let _ = breaker.execute(|| async { transport_err::<()>() }).await;
        assert_eq!(breaker.current_cooldown(), Duration::from_millis(1_000));

        breaker.consecutive_trips.store(2, Ordering::Relaxed);
        assert_eq!(breaker.current_cooldown(), Duration::from_millis(2_000));

        breaker.consecutive_trips.store(5, Ordering::Relaxed);
        assert_eq!(breaker.current_cooldown(), Duration::from_millis(3_000));
    }

    #[tokio::test]
    async fn test_breaker_reset() {
        let breaker = CircuitBreaker::new(breaker_options(1, 60_000));
        let _ = breaker.execute(|| async { transport_err::<()>() }).await;
        assert_eq!(breaker.get_state().await, CircuitState::Open);

        breaker.reset().await;
        assert_eq!(breaker.get_state().await, CircuitState::Closed);
        let result = breaker
            .execute(|| async { Ok::<(), BucketronError>(()) })
            .await;
        assert!(result.is_ok());
    }

    fn executor(retries: u32, timeout_ms: u64) -> ResilientExecutor {
        ResilientExecutor::new(
            RetryOptions {
                retries,
                min_backoff_ms: 1,
                max_backoff_ms: 2,
            },
            timeout_ms,
            BreakerOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_executor_retries_transport_errors() {
        let executor = executor(1, 1_000);
        let calls = Arc::new(AtomicU32::new(0));

        let calls_clone = calls.clone();
        let result: Result<u32, _> = executor
            .execute(move || {
                let calls = calls_clone.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        transport_err()
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_executor_surfaces_last_error_after_budget() {
        let executor = executor(1, 1_000);
        let calls = Arc::new(AtomicU32::new(0));

        let calls_clone = calls.clone();
        let result: Result<(), _> = executor
            .execute(move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    transport_err()
                }
            })
            .await;

        assert!(matches!(result, Err(BucketronError::TransportError(_))));
        // 首次尝试 + 1 次重试
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_executor_does_not_retry_validation() {
        let executor = executor(3, 1_000);
        let calls = Arc::new(AtomicU32::new(0));

        let calls_clone = calls.clone();
        let result: Result<(), _> = executor
            .execute(move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(BucketronError::validation(
                        ValidationCode::MissingKey,
                        "键不能为空",
                    ))
                }
            })
            .await;

        assert!(result.unwrap_err().is_validation());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_command_timeout_fires() {
        let executor = executor(0, 20);
        let result: Result<(), _> = executor
            .execute(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(BucketronError::CommandTimeout(20))));
    }

    #[tokio::test]
    async fn test_fast_operation_beats_timeout() {
        let executor = executor(0, 50);
        let result = executor.execute(|| async { Ok::<u32, BucketronError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
