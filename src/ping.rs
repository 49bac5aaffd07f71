//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Ping监控
//!
//! 周期性探测存储存活；连续失败达到阈值后，按配置发出 dry-run 事件
//! 或在抖动延迟后强制驱动重连。仅单机模式启用。
//!
//! 监控不会堆积探测任务：上一个探测完成（或超过一个间隔被判定迟到
//! 并丢弃）之前不会发起新的探测。每次 `stop` 都会递增任务代数，
//! 迟到的响应因代数不匹配被忽略。

use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PingOptions;
use crate::constants::PING_RECONNECT_JITTER_FACTOR;
use crate::store::{BucketStore, LimiterEvent, PingReport, PingStatus};

/// Ping监控器
pub struct PingMonitor {
    store: Arc<dyn BucketStore>,
    options: PingOptions,
    events: tokio::sync::broadcast::Sender<LimiterEvent>,
    /// 任务代数，stop 时递增使迟到响应失效
    generation: Arc<AtomicU64>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl PingMonitor {
    /// 创建监控器（不自动启动）
    pub fn new(
        store: Arc<dyn BucketStore>,
        options: PingOptions,
        events: tokio::sync::broadcast::Sender<LimiterEvent>,
    ) -> Self {
        Self {
            store,
            options,
            events,
            generation: Arc::new(AtomicU64::new(0)),
            handle: parking_lot::Mutex::new(None),
        }
    }

    /// 启动监控循环
    pub fn start(&self) {
        let my_gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = self.generation.clone();
        let store = self.store.clone();
        let options = self.options.clone();
        let events = self.events.clone();

        info!(
            "启动Ping监控: interval={}ms max_failed_attempts={} reconnect_if_failed={}",
            options.interval_ms, options.max_failed_attempts, options.reconnect_if_failed
        );

        let handle = tokio::spawn(async move {
            let interval = Duration::from_millis(options.interval_ms.max(1));
            let mut failed_pings: u32 = 0;

            loop {
                tokio::time::sleep(interval).await;
                if generation.load(Ordering::SeqCst) != my_gen {
                    break;
                }

                let started = Instant::now();
                // 超过一个间隔仍未返回的探测视为迟到并丢弃
                let outcome = tokio::time::timeout(interval, store.ping()).await;
                let duration = started.elapsed();

                if generation.load(Ordering::SeqCst) != my_gen {
                    debug!("忽略迟到的Ping响应");
                    break;
                }

                match outcome {
                    Ok(Ok(rtt)) => {
                        failed_pings = 0;
                        let _ = events.send(LimiterEvent::Ping(PingReport {
                            status: PingStatus::Success,
                            duration: rtt,
                            error: None,
                            failed_pings,
                        }));
                    }
                    failure => {
                        failed_pings += 1;
                        let message = match failure {
                            Ok(Err(e)) => e.to_string(),
                            _ => format!("Ping超时（>{}ms）", options.interval_ms),
                        };
                        warn!("Ping失败({}/{}): {}", failed_pings, options.max_failed_attempts, message);
                        let _ = events.send(LimiterEvent::Ping(PingReport {
                            status: PingStatus::Error,
                            duration,
                            error: Some(message),
                            failed_pings,
                        }));

                        if failed_pings >= options.max_failed_attempts {
                            if !options.reconnect_if_failed {
                                let _ = events.send(LimiterEvent::Ping(PingReport {
                                    status: PingStatus::ReconnectDryRun,
                                    duration,
                                    error: None,
                                    failed_pings,
                                }));
                                continue;
                            }

                            // 抖动延迟，避免多个进程同时重连
                            let jitter_ms = rand::thread_rng()
                                .gen_range(0.0..=PING_RECONNECT_JITTER_FACTOR)
                                * options.interval_ms as f64
                                * options.max_failed_attempts as f64;
                            tokio::time::sleep(Duration::from_millis(jitter_ms as u64)).await;

                            if generation.load(Ordering::SeqCst) != my_gen {
                                break;
                            }

                            let _ = events.send(LimiterEvent::Ping(PingReport {
                                status: PingStatus::Reconnect,
                                duration,
                                error: None,
                                failed_pings,
                            }));

                            warn!("Ping连续失败 {} 次，强制重连", failed_pings);
                            if let Err(e) = store.reconnect().await {
                                warn!("强制重连失败: {}", e);
                            }
                            failed_pings = 0;
                        }
                    }
                }
            }
        });

        *self.handle.lock() = Some(handle);
    }

    /// 停止监控
    ///
    /// 递增任务代数，使仍在途的探测结果被丢弃。
    pub fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
        info!("Ping监控已停止");
    }
}

impl Drop for PingMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}
