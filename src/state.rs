use crate::proxy::{Egress, ProxyManager};
use crate::supervisor::StreamSupervisor;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// worker 进程状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Crashing,
    Restarting,
    /// 崩溃次数超出预算，需要人工重启
    StoppedPermanently,
}

impl ProcessState {
    /// 非终止状态：存在进程或即将启动进程
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ProcessState::Starting
                | ProcessState::Running
                | ProcessState::Crashing
                | ProcessState::Restarting
        )
    }
}

/// 单个频道的 worker 运行时记录
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub state: ProcessState,
    pub pid: Option<u32>,
    /// 进程启动时间 (用于计算运行时长)
    pub started_at: Option<Instant>,
    /// 自动恢复次数，仅在人工启动/重启时清零
    pub restart_count: u32,
    /// spawn 时捕获的出口，进程存活期间不变
    pub egress: Option<Egress>,
    pub last_exit_code: Option<i32>,
    pub last_error: Option<String>,
}

impl WorkerHandle {
    pub fn new() -> Self {
        Self {
            state: ProcessState::Stopped,
            pid: None,
            started_at: None,
            restart_count: 0,
            egress: None,
            last_exit_code: None,
            last_error: None,
        }
    }

    /// 进程结束后清理运行期字段
    pub fn clear_process(&mut self) {
        self.pid = None;
        self.started_at = None;
        self.egress = None;
    }
}

impl Default for WorkerHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// 故障恢复状态
#[derive(Debug, Default)]
pub struct RecoveryState {
    /// 滚动窗口内的崩溃时间点
    crashes: VecDeque<Instant>,
    /// 下次允许尝试重启的最早时间点
    pub next_retry_at: Option<Instant>,
}

impl RecoveryState {
    /// 记录一次崩溃，返回窗口内的崩溃次数
    pub fn record_crash(&mut self, now: Instant, window: Duration) -> u32 {
        while let Some(first) = self.crashes.front() {
            if now.duration_since(*first) > window {
                self.crashes.pop_front();
            } else {
                break;
            }
        }
        self.crashes.push_back(now);
        self.crashes.len() as u32
    }

    pub fn reset(&mut self) {
        self.crashes.clear();
        self.next_retry_at = None;
    }
}

/// 全局应用上下文
pub struct AppState {
    pub proxy: Arc<ProxyManager>,
    pub supervisor: Arc<StreamSupervisor>,
    /// 服务启动时间
    pub started_at: std::time::Instant,
}

pub type SharedState = Arc<AppState>;
