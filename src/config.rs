use crate::channel::Channel;
use crate::proxy::ProxyProfile;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub channels: Vec<Channel>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen: String,
    pub ffmpeg_binary: String,

    /// 频道工作目录根路径，替换参数中的 `{output_dir}`
    /// 未配置时不创建目录
    #[serde(default)]
    pub output_root: Option<String>,

    /// 配置持久化文件 (JSON)，未配置时仅保存在内存中
    #[serde(default)]
    pub store_path: Option<String>,

    /// 启动子进程前要求的最小可用内存 (KB)
    #[serde(default = "default_min_free_memory_kb")]
    pub min_free_memory_kb: u64,
}

/// 代理健康检查与切换策略
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProxyConfig {
    /// 健康检查间隔 (毫秒)
    pub health_interval_ms: u64,
    /// 单次探测超时 (毫秒)
    pub probe_timeout_ms: u64,
    /// 最近一次成功探测的有效期，超过后状态降级为 degraded
    pub stale_after_ms: u64,
    /// 延迟超过该值视为 degraded
    pub degraded_latency_ms: u64,
    /// 连续失败多少次后判定为 error
    pub failure_threshold: u32,
    /// 探测目标 (id -> URL)
    pub targets: BTreeMap<String, String>,
    pub default_target: String,
    /// 代理切换后对运行中频道的处理策略
    pub restart_policy: RestartPolicy,
    /// 初始代理配置 (存储中有记录时以存储为准)
    pub profiles: Vec<ProxyProfile>,
    pub active_profile_id: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        let mut targets = BTreeMap::new();
        targets.insert(
            "google".to_string(),
            "https://www.google.com/generate_204".to_string(),
        );
        targets.insert("github".to_string(), "https://github.com".to_string());
        Self {
            health_interval_ms: 30_000,
            probe_timeout_ms: 5_000,
            stale_after_ms: 90_000,
            degraded_latency_ms: 1_500,
            failure_threshold: 3,
            targets,
            default_target: "google".to_string(),
            restart_policy: RestartPolicy::default(),
            profiles: Vec::new(),
            active_profile_id: None,
        }
    }
}

impl ProxyConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

/// 出口变更后运行中频道的重启策略
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// 所有运行中的频道都重启
    #[default]
    Always,
    /// 仅重启设置了 `restart_on_egress_change` 的频道
    OptIn,
    /// 不重启，等待下一次自然重启
    Never,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SupervisorConfig {
    /// 子进程首次输出的最长等待时间 (毫秒)
    pub startup_timeout_ms: u64,
    /// 优雅停止的等待时间，超时后强制结束 (毫秒)
    pub stop_grace_ms: u64,
    /// 整体关闭的最长时间 (毫秒)
    pub shutdown_timeout_ms: u64,
    /// 故障重试策略
    pub retry: RetryPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_timeout_ms: 10_000,
            stop_grace_ms: 5_000,
            shutdown_timeout_ms: 15_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryPolicy {
    /// 窗口期内允许的最大崩溃次数，达到后永久停止
    pub max_attempts: u32,
    /// 初始退避时间 (毫秒)
    pub initial_backoff_ms: u64,
    /// 最大退避时间 (毫秒)
    pub max_backoff_ms: u64,
    /// 崩溃计数的滚动窗口 (毫秒)
    pub window_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff_ms: 2_000,
            max_backoff_ms: 60_000,
            window_ms: 600_000,
        }
    }
}

impl RetryPolicy {
    /// 第 `attempt` 次重试 (从 1 开始) 的退避时间
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(2u64.saturating_pow(exp))
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

fn default_min_free_memory_kb() -> u64 {
    5120
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: AppConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let retry = &self.supervisor.retry;
        if retry.max_attempts == 0 {
            anyhow::bail!("supervisor.retry.max_attempts must be at least 1");
        }
        if retry.initial_backoff_ms > retry.max_backoff_ms {
            anyhow::bail!("supervisor.retry.initial_backoff_ms exceeds max_backoff_ms");
        }
        if !self.proxy.targets.contains_key(&self.proxy.default_target) {
            anyhow::bail!(
                "proxy.default_target `{}` is not listed in proxy.targets",
                self.proxy.default_target
            );
        }
        if self.proxy.failure_threshold == 0 {
            anyhow::bail!("proxy.failure_threshold must be at least 1");
        }
        Ok(())
    }
}
