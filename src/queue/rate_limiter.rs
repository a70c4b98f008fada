// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// 滑动窗口长度
const WINDOW: Duration = Duration::from_secs(60);

/// 单个提供商的预算配置
///
/// 两个预算同时有余量才放行：请求数/分钟与令牌数/分钟。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderLimits {
    /// 每分钟允许的请求数
    pub requests_per_minute: u32,
    /// 每分钟允许的令牌数
    pub tokens_per_minute: u32,
}

impl Default for ProviderLimits {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            tokens_per_minute: 90_000,
        }
    }
}

/// 准入判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitDecision {
    /// 放行，窗口已记账
    Admitted,
    /// 预算耗尽；wait_ms 为窗口内最老条目过期所需毫秒数，
    /// 调度器据此精确退避而不是盲目轮询
    RetryAfter { wait_ms: u64 },
}

/// 窗口内一次已放行请求的记账条目
#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    at: Instant,
    tokens: u32,
}

#[derive(Debug, Default)]
struct Window {
    entries: VecDeque<WindowEntry>,
}

impl Window {
    /// 剔除滑出窗口的条目
    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.entries.front() {
            if now.duration_since(front.at) >= WINDOW {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn token_sum(&self) -> u64 {
        self.entries.iter().map(|e| e.tokens as u64).sum()
    }

    /// 最老条目过期剩余毫秒数
    fn oldest_expiry_ms(&self, now: Instant) -> u64 {
        match self.entries.front() {
            Some(front) => {
                let elapsed = now.duration_since(front.at);
                WINDOW.saturating_sub(elapsed).as_millis().max(1) as u64
            }
            None => 1,
        }
    }
}

/// 限流器
///
/// 以 (tenant, provider) 为键的滑动60秒窗口，同时跟踪请求数与
/// 令牌数两个预算。准入检查与窗口记账在同一把每键互斥锁下完成：
/// 两个任务竞争最后一个预算槽位时不可能同时放行。
pub struct RateLimiter {
    /// 各提供商的默认预算
    default_limits: HashMap<String, ProviderLimits>,
    /// 未配置提供商时的兜底预算
    fallback_limits: ProviderLimits,
    /// 租户级运行时覆盖（套餐升级等场景，无需重启进程）
    tenant_limits: DashMap<Uuid, HashMap<String, ProviderLimits>>,
    /// 每个 (tenant, provider) 键一个窗口
    windows: DashMap<(Uuid, String), Mutex<Window>>,
}

impl RateLimiter {
    /// 创建新的限流器实例
    ///
    /// # 参数
    ///
    /// * `default_limits` - 各提供商的默认预算
    /// * `fallback_limits` - 未知提供商的兜底预算
    pub fn new(
        default_limits: HashMap<String, ProviderLimits>,
        fallback_limits: ProviderLimits,
    ) -> Self {
        Self {
            default_limits,
            fallback_limits,
            tenant_limits: DashMap::new(),
            windows: DashMap::new(),
        }
    }

    /// 查询对给定 (tenant, provider) 生效的预算
    ///
    /// 租户覆盖优先于提供商默认值，最后落到兜底预算。
    pub fn limits_for(&self, tenant_id: Uuid, provider: &str) -> ProviderLimits {
        if let Some(overrides) = self.tenant_limits.get(&tenant_id) {
            if let Some(limits) = overrides.get(provider) {
                return *limits;
            }
        }
        self.default_limits
            .get(provider)
            .copied()
            .unwrap_or(self.fallback_limits)
    }

    /// 运行时替换租户的预算覆盖
    ///
    /// 套餐或设置变更时调用，立即对后续准入生效；已在窗口内的
    /// 记账不受影响。
    pub fn update_limits(&self, tenant_id: Uuid, limits: HashMap<String, ProviderLimits>) {
        self.tenant_limits.insert(tenant_id, limits);
    }

    /// 尝试为一次提供商调用取得准入
    ///
    /// # 参数
    ///
    /// * `tenant_id` - 租户ID
    /// * `provider` - 提供商键名
    /// * `estimated_tokens` - 本次调用的预估令牌数
    ///
    /// # 返回值
    ///
    /// * `AdmitDecision::Admitted` - 放行并已记账
    /// * `AdmitDecision::RetryAfter` - 预算耗尽，附带精确等待毫秒数
    pub fn try_admit(
        &self,
        tenant_id: Uuid,
        provider: &str,
        estimated_tokens: u32,
    ) -> AdmitDecision {
        let limits = self.limits_for(tenant_id, provider);
        let key = (tenant_id, provider.to_string());
        let window = self.windows.entry(key).or_default();
        let mut guard = window.lock();

        let now = Instant::now();
        guard.prune(now);

        let requests_ok = (guard.entries.len() as u64) < limits.requests_per_minute as u64;
        // 单笔超出整个令牌预算的请求在空窗口时单独放行，否则永远无法派发
        let tokens_ok = guard.token_sum() + estimated_tokens as u64
            <= limits.tokens_per_minute as u64
            || guard.entries.is_empty();

        if requests_ok && tokens_ok {
            guard.entries.push_back(WindowEntry {
                at: now,
                tokens: estimated_tokens,
            });
            AdmitDecision::Admitted
        } else {
            AdmitDecision::RetryAfter {
                wait_ms: guard.oldest_expiry_ms(now),
            }
        }
    }
}
