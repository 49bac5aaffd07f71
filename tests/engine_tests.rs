//! 引擎端到端场景测试
//!
//! 使用带可控时钟的内存存储桩验证令牌桶语义：
//! 滴灌补充、溢出封顶、固定桶、无限桶、覆盖、负向归还、
//! 满桶删除和 wait 协议。

mod common;

use common::{MockClock, MockStore};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bucketron::{
    BucketSpec, Bucketron, BucketronError, GetParams, LimiterOptions, PutCount, PutParams,
    TakeCount, TakeParams,
};

/// 场景基准时间：2015-03-09T16:17:47Z
const NOW_MS: i64 = 1_425_920_267_000;

fn limiter_with(specs: Vec<(&str, BucketSpec)>, store: Arc<MockStore>) -> Bucketron {
    let mut options = LimiterOptions::single("redis://127.0.0.1:6379");
    for (name, spec) in specs {
        options = options.bucket(name, spec);
    }
    Bucketron::with_store(options, store).unwrap()
}

fn ip_bucket() -> BucketSpec {
    BucketSpec::new().per_second(5).size(10)
}

/// 基础扣减：remaining 与 reset 按滴灌公式换算
#[tokio::test]
async fn test_take_one_token() {
    let clock = MockClock::fixed(NOW_MS);
    let store = MockStore::new(clock);
    let limiter = limiter_with(vec![("ip", ip_bucket())], store);

    let result = limiter.take(&TakeParams::new("ip", "1.1.1.1")).await.unwrap();
    assert!(result.conformant);
    assert_eq!(result.remaining, 9);
    assert_eq!(result.reset, 1_425_920_268);
    assert_eq!(result.limit, 10);
    assert!(!result.delayed);
}

/// 超过容量的扣减不放行，也不消耗令牌
#[tokio::test]
async fn test_take_more_than_size_is_not_conformant() {
    let clock = MockClock::fixed(NOW_MS);
    let store = MockStore::new(clock);
    let limiter = limiter_with(vec![("ip", ip_bucket())], store);

    let result = limiter
        .take(&TakeParams::new("ip", "1.1.1.1").count(TakeCount::N(12)))
        .await
        .unwrap();
    assert!(!result.conformant);
    assert_eq!(result.remaining, 10);
    assert_eq!(result.reset, 1_425_920_267);
    assert_eq!(result.limit, 10);
}

/// 排空后随时间补充：不足一个令牌的滴灌仍然不放行，
/// 满一秒后按速率整体补充
#[tokio::test]
async fn test_drain_and_refill_over_time() {
    let clock = MockClock::fixed(NOW_MS);
    let store = MockStore::new(clock.clone());
    let limiter = limiter_with(vec![("ip", ip_bucket())], store);
    let params = TakeParams::new("ip", "1.1.1.1");

    for _ in 0..10 {
        let result = limiter.take(&params).await.unwrap();
        assert!(result.conformant);
    }

    let result = limiter.take(&params).await.unwrap();
    assert!(!result.conformant);
    assert_eq!(result.remaining, 0);

    // 100ms 只滴灌 0.5 个令牌，仍然不足
    clock.advance(100);
    let result = limiter.take(&params).await.unwrap();
    assert!(!result.conformant);
    assert_eq!(result.remaining, 0);

    // 距上次写入满 900ms（共 1s），补充 4.5 个，加上残余共 5 个
    clock.advance(900);
    let result = limiter.take(&params).await.unwrap();
    assert!(result.conformant);
    assert_eq!(result.remaining, 4);
}

/// 键名精确覆盖提升配额
#[tokio::test]
async fn test_exact_override_raises_limit() {
    let clock = MockClock::fixed(NOW_MS);
    let store = MockStore::new(clock);
    let limiter = limiter_with(
        vec![(
            "ip",
            ip_bucket().override_for("127.0.0.1", BucketSpec::new().per_second(100).size(100)),
        )],
        store,
    );
    let params = TakeParams::new("ip", "127.0.0.1");

    for _ in 0..10 {
        let result = limiter.take(&params).await.unwrap();
        assert!(result.conformant);
    }

    let result = limiter.take(&params).await.unwrap();
    assert!(result.conformant);
    assert_eq!(result.remaining, 89);
    assert_eq!(result.limit, 100);
}

/// 固定桶不随时间补充，reset 恒为 0
#[tokio::test]
async fn test_fixed_bucket_never_refills() {
    let clock = MockClock::fixed(NOW_MS);
    let store = MockStore::new(clock.clone());
    let limiter = limiter_with(vec![("pass", BucketSpec::new().size(10))], store);
    let params = TakeParams::new("pass", "user-1");

    for _ in 0..10 {
        let result = limiter.take(&params).await.unwrap();
        assert!(result.conformant);
        assert_eq!(result.reset, 0);
    }

    let result = limiter.take(&params).await.unwrap();
    assert!(!result.conformant);
    assert_eq!(result.remaining, 0);
    assert_eq!(result.reset, 0);

    // 时间流逝不改变固定桶
    clock.advance(3_600_000);
    let result = limiter.take(&params).await.unwrap();
    assert!(!result.conformant);
    assert_eq!(result.remaining, 0);
    assert_eq!(result.reset, 0);
}

/// 负向归还把桶压到零以下，后续扣减不放行且报告负余额
#[tokio::test]
async fn test_negative_put_pushes_below_zero() {
    let clock = MockClock::fixed(NOW_MS);
    let store = MockStore::new(clock);
    let limiter = limiter_with(vec![("ip", ip_bucket())], store);

    let result = limiter
        .take(&TakeParams::new("ip", "1.1.1.1").count(TakeCount::N(9)))
        .await
        .unwrap();
    assert_eq!(result.remaining, 1);

    let result = limiter
        .put(&PutParams::new("ip", "1.1.1.1").count(PutCount::N(-100)))
        .await
        .unwrap();
    assert_eq!(result.remaining, -99);

    let result = limiter.take(&TakeParams::new("ip", "1.1.1.1")).await.unwrap();
    assert!(!result.conformant);
    assert_eq!(result.remaining, -99);
}

/// 无限桶不访问存储
#[tokio::test]
async fn test_unlimited_bucket_skips_store() {
    let clock = MockClock::fixed(NOW_MS);
    let store = MockStore::new(clock);
    let limiter = limiter_with(
        vec![("free", BucketSpec::new().size(100).unlimited())],
        store.clone(),
    );

    for _ in 0..50 {
        let result = limiter.take(&TakeParams::new("free", "any")).await.unwrap();
        assert!(result.conformant);
        assert_eq!(result.remaining, 100);
        assert_eq!(result.limit, 100);
    }
    assert_eq!(store.take_calls.load(Ordering::SeqCst), 0);

    let result = limiter.put(&PutParams::new("free", "any")).await.unwrap();
    assert_eq!(result.remaining, 100);
    assert_eq!(store.put_calls.load(Ordering::SeqCst), 0);
}

/// 容量为 N 的桶并发扣减恰好放行 N 次，存储余额不为负
#[tokio::test]
async fn test_concurrent_takes_are_linearized() {
    let clock = MockClock::fixed(NOW_MS);
    let store = MockStore::new(clock);
    let limiter = Arc::new(limiter_with(vec![("ip", ip_bucket())], store.clone()));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let limiter = limiter.clone();
        handles.push(tokio::spawn(async move {
            limiter.take(&TakeParams::new("ip", "9.9.9.9")).await.unwrap()
        }));
    }

    let mut conformant = 0;
    for handle in handles {
        if handle.await.unwrap().conformant {
            conformant += 1;
        }
    }
    assert_eq!(conformant, 10);

    let result = limiter.take(&TakeParams::new("ip", "9.9.9.9")).await.unwrap();
    assert!(!result.conformant);

    let (_, r) = store.raw("ip:9.9.9.9").await.unwrap();
    assert!(r >= 0.0);
}

/// 归还到满删除键，下一次扣减视同满桶
#[tokio::test]
async fn test_full_put_deletes_key() {
    let clock = MockClock::fixed(NOW_MS);
    let store = MockStore::new(clock);
    let limiter = limiter_with(vec![("ip", ip_bucket())], store.clone());

    let result = limiter
        .take(&TakeParams::new("ip", "1.1.1.1").count(TakeCount::N(3)))
        .await
        .unwrap();
    assert_eq!(result.remaining, 7);
    assert!(store.raw("ip:1.1.1.1").await.is_some());

    let result = limiter.put(&PutParams::new("ip", "1.1.1.1")).await.unwrap();
    assert_eq!(result.remaining, 10);
    assert!(store.raw("ip:1.1.1.1").await.is_none());

    let result = limiter.take(&TakeParams::new("ip", "1.1.1.1")).await.unwrap();
    assert!(result.conformant);
    assert_eq!(result.remaining, 9);
}

/// put 的正向归还封顶于容量
#[tokio::test]
async fn test_put_capped_at_size() {
    let clock = MockClock::fixed(NOW_MS);
    let store = MockStore::new(clock);
    let limiter = limiter_with(vec![("ip", ip_bucket())], store);

    let _ = limiter
        .take(&TakeParams::new("ip", "1.1.1.1").count(TakeCount::N(2)))
        .await
        .unwrap();
    let result = limiter
        .put(&PutParams::new("ip", "1.1.1.1").count(PutCount::N(1_000)))
        .await
        .unwrap();
    assert_eq!(result.remaining, 10);
}

/// take("all") 取走全部容量
#[tokio::test]
async fn test_take_all() {
    let clock = MockClock::fixed(NOW_MS);
    let store = MockStore::new(clock);
    let limiter = limiter_with(vec![("ip", ip_bucket())], store);

    let result = limiter
        .take(&TakeParams::new("ip", "1.1.1.1").count(TakeCount::All))
        .await
        .unwrap();
    assert!(result.conformant);
    assert_eq!(result.remaining, 0);

    let result = limiter.take(&TakeParams::new("ip", "1.1.1.1")).await.unwrap();
    assert!(!result.conformant);
}

/// 零扣减是一次只滴灌不消费的探测
#[tokio::test]
async fn test_take_zero_is_probe() {
    let clock = MockClock::fixed(NOW_MS);
    let store = MockStore::new(clock);
    let limiter = limiter_with(vec![("ip", ip_bucket())], store);

    let result = limiter
        .take(&TakeParams::new("ip", "1.1.1.1").count(TakeCount::N(0)))
        .await
        .unwrap();
    assert!(result.conformant);
    assert_eq!(result.remaining, 10);
}

/// wait 在令牌补充后返回，delayed 标记生效
#[tokio::test]
async fn test_wait_delays_until_refill() {
    // wait 依赖真实时间流逝
    let clock = MockClock::system();
    let store = MockStore::new(clock);
    let limiter = limiter_with(
        vec![("fast", BucketSpec::new().per_second(20).size(2))],
        store,
    );

    let result = limiter
        .take(&TakeParams::new("fast", "k").count(TakeCount::N(2)))
        .await
        .unwrap();
    assert!(result.conformant);

    let started = std::time::Instant::now();
    let result = limiter.wait(&TakeParams::new("fast", "k")).await.unwrap();
    assert!(result.conformant);
    assert!(result.delayed);
    // 一个令牌 50ms，至少要等一次
    assert!(started.elapsed() >= std::time::Duration::from_millis(20));
}

/// 未延迟的 wait 不带 delayed 标记
#[tokio::test]
async fn test_wait_without_delay() {
    let clock = MockClock::system();
    let store = MockStore::new(clock);
    let limiter = limiter_with(
        vec![("fast", BucketSpec::new().per_second(100).size(2))],
        store,
    );

    let result = limiter.wait(&TakeParams::new("fast", "k")).await.unwrap();
    assert!(result.conformant);
    assert!(!result.delayed);
}

/// 零扣减的 wait 在不放行时也立即按放行返回
#[tokio::test]
async fn test_wait_zero_count_returns_immediately() {
    let clock = MockClock::fixed(NOW_MS);
    let store = MockStore::new(clock);
    let limiter = limiter_with(vec![("ip", ip_bucket())], store);

    // 负向归还让桶处于负余额，take(0) 将不放行
    let _ = limiter
        .put(&PutParams::new("ip", "1.1.1.1").count(PutCount::N(-100)))
        .await
        .unwrap();

    let result = limiter
        .wait(&TakeParams::new("ip", "1.1.1.1").count(TakeCount::N(0)))
        .await
        .unwrap();
    assert!(result.conformant);
    assert!(!result.delayed);
}

/// get 纯读：键缺席视同满桶，滴灌在引擎侧本地计算
#[tokio::test]
async fn test_get_reads_without_mutation() {
    let clock = MockClock::system();
    let store = MockStore::new(clock);
    let limiter = limiter_with(vec![("ip", ip_bucket())], store.clone());

    // 缺席键
    let result = limiter.get(&GetParams::new("ip", "1.1.1.1")).await.unwrap();
    assert_eq!(result.remaining, 10);
    assert_eq!(result.limit, 10);

    // 扣减后 get 反映余额且不再写存储
    let _ = limiter
        .take(&TakeParams::new("ip", "1.1.1.1").count(TakeCount::N(5)))
        .await
        .unwrap();
    let takes_before = store.take_calls.load(Ordering::SeqCst);
    let result = limiter.get(&GetParams::new("ip", "1.1.1.1")).await.unwrap();
    // 真实时钟下两次调用之间可能滴灌出一个令牌
    assert!((5..=6).contains(&result.remaining));
    assert!(result.reset > 0);
    assert_eq!(store.take_calls.load(Ordering::SeqCst), takes_before);
}

/// 固定桶的 get 报告 reset == 0
#[tokio::test]
async fn test_get_fixed_bucket_reset_zero() {
    let clock = MockClock::fixed(NOW_MS);
    let store = MockStore::new(clock);
    let limiter = limiter_with(vec![("pass", BucketSpec::new().size(10))], store);

    let _ = limiter
        .take(&TakeParams::new("pass", "u").count(TakeCount::N(4)))
        .await
        .unwrap();
    let result = limiter.get(&GetParams::new("pass", "u")).await.unwrap();
    assert_eq!(result.remaining, 6);
    assert_eq!(result.reset, 0);
}

/// reset_all 清空全部桶实例
#[tokio::test]
async fn test_reset_all_flushes_instances() {
    let clock = MockClock::fixed(NOW_MS);
    let store = MockStore::new(clock);
    let limiter = limiter_with(vec![("ip", ip_bucket())], store.clone());

    let _ = limiter
        .take(&TakeParams::new("ip", "1.1.1.1").count(TakeCount::N(5)))
        .await
        .unwrap();
    assert!(store.raw("ip:1.1.1.1").await.is_some());

    limiter.reset_all().await.unwrap();
    assert!(store.raw("ip:1.1.1.1").await.is_none());

    let result = limiter.take(&TakeParams::new("ip", "1.1.1.1")).await.unwrap();
    assert_eq!(result.remaining, 9);
}

/// keys 列出现存桶实例
#[tokio::test]
async fn test_keys_lists_instances() {
    let clock = MockClock::fixed(NOW_MS);
    let store = MockStore::new(clock);
    let limiter = limiter_with(vec![("ip", ip_bucket())], store);

    let _ = limiter.take(&TakeParams::new("ip", "1.1.1.1")).await.unwrap();
    let _ = limiter.take(&TakeParams::new("ip", "2.2.2.2")).await.unwrap();

    let keys = limiter.keys("ip").await.unwrap();
    assert_eq!(keys, vec!["1.1.1.1".to_string(), "2.2.2.2".to_string()]);
}

/// 调用级覆盖独立于类型配置生效
#[tokio::test]
async fn test_call_level_override() {
    let clock = MockClock::fixed(NOW_MS);
    let store = MockStore::new(clock);
    let limiter = limiter_with(vec![("ip", ip_bucket())], store);

    let result = limiter
        .take(
            &TakeParams::new("ip", "1.1.1.1")
                .config_override(BucketSpec::new().per_second(1000).size(1000)),
        )
        .await
        .unwrap();
    assert!(result.conformant);
    assert_eq!(result.remaining, 999);
    assert_eq!(result.limit, 1000);
}

/// 跳过缓存：权威往返之间最多跳过 n 次，
/// 非放行结果同样被回放，已触顶的桶不会被本地重新放行
#[tokio::test]
async fn test_skip_cache_replays_tripped_result() {
    let clock = MockClock::fixed(NOW_MS);
    let store = MockStore::new(clock);
    let limiter = limiter_with(
        vec![(
            "api",
            BucketSpec::new().per_second(1).size(1).skip_n_calls(2),
        )],
        store.clone(),
    );
    let params = TakeParams::new("api", "k");

    // 权威：放行（桶排空）
    let result = limiter.take(&params).await.unwrap();
    assert!(result.conformant);
    // 两次本地跳过，回放上次的放行结果
    for _ in 0..2 {
        let result = limiter.take(&params).await.unwrap();
        assert!(result.conformant);
    }
    assert_eq!(store.take_calls.load(Ordering::SeqCst), 1);

    // 额度用尽，第四次回到权威往返：桶已空，不放行
    let result = limiter.take(&params).await.unwrap();
    assert!(!result.conformant);
    assert_eq!(store.take_calls.load(Ordering::SeqCst), 2);

    // 后续跳过的调用同样报告不放行
    for _ in 0..2 {
        let result = limiter.take(&params).await.unwrap();
        assert!(!result.conformant);
    }
    assert_eq!(store.take_calls.load(Ordering::SeqCst), 2);
}

/// 重复关闭返回 AlreadyClosed，关闭后的操作被拒绝
#[tokio::test]
async fn test_close_twice_errors() {
    let clock = MockClock::fixed(NOW_MS);
    let store = MockStore::new(clock);
    let limiter = limiter_with(vec![("ip", ip_bucket())], store);

    limiter.close().await.unwrap();

    let err = limiter.close().await.unwrap_err();
    assert!(matches!(err, BucketronError::AlreadyClosed));

    let err = limiter.take(&TakeParams::new("ip", "1.1.1.1")).await.unwrap_err();
    assert!(matches!(err, BucketronError::AlreadyClosed));
}
