//! 频道 worker 的生命周期管理
//!
//! 每个进程由一个 watch 任务持有：读取输出判断存活、等待退出、
//! 响应停止请求。意外退出按指数退避重启，窗口期内崩溃次数超出预算后
//! 进入 `stopped_permanently`，必须人工重启。

use crate::channel::Channel;
use crate::config::{ServerConfig, SupervisorConfig};
use crate::engine::{self, ExitInfo, OutputStream, ProcessLauncher, WorkerProcess};
use crate::error::{Error, Result};
use crate::output::OutputRecordReader;
use crate::proxy::{Egress, ProxyManager};
use crate::scheduler::TaskScheduler;
use crate::state::{ProcessState, RecoveryState, WorkerHandle};
use crate::stats::{SeriesStats, StatsCollector};
use crate::store::{ConfigStore, CHANNELS_KEY};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 强制结束后等待回收的额外时间
const KILL_MARGIN: Duration = Duration::from_secs(2);

/// 需要人工介入的告警
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub channel_id: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// 对外的频道状态快照
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub channel_id: String,
    pub name: String,
    pub source: String,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub uptime_seconds: Option<u64>,
    pub restart_count: u32,
    pub egress: Option<Egress>,
    pub last_exit_code: Option<i32>,
    pub last_error: Option<String>,
    pub next_retry_in_ms: Option<u64>,
    pub auto_start: bool,
}

/// 出口切换时供协调器决策的信息
#[derive(Debug, Clone)]
pub struct EgressSnapshot {
    pub channel_id: String,
    pub state: ProcessState,
    pub egress: Option<Egress>,
    pub restart_on_egress_change: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// 人工启动，重置重启计数
    Manual,
    /// 崩溃后的自动恢复，epoch 用于丢弃过期的定时任务
    Recovery { epoch: u64 },
    /// 出口变更触发的重启
    EgressChange,
}

enum WorkerExit {
    /// 人工停止
    Stopped(Option<ExitInfo>),
    Exited(ExitInfo),
    Lost(String),
    StartupTimeout,
}

struct ProcessControl {
    stop: CancellationToken,
    exited: oneshot::Receiver<()>,
}

struct ChannelSlot {
    channel: Channel,
    handle: WorkerHandle,
    recovery: RecoveryState,
    /// 每次 spawn 或强制停止都会递增
    epoch: u64,
    control: Option<ProcessControl>,
}

impl ChannelSlot {
    fn new(channel: Channel) -> Self {
        Self {
            channel,
            handle: WorkerHandle::new(),
            recovery: RecoveryState::default(),
            epoch: 0,
            control: None,
        }
    }
}

pub struct StreamSupervisor {
    server: ServerConfig,
    settings: SupervisorConfig,
    proxy: Arc<ProxyManager>,
    launcher: Arc<dyn ProcessLauncher>,
    store: Arc<dyn ConfigStore>,
    channels: Mutex<BTreeMap<String, ChannelSlot>>,
    timers: TaskScheduler,
    stats: Mutex<StatsCollector>,
    alerts: broadcast::Sender<Alert>,
    shutting_down: AtomicBool,
    /// 关停超出期限后触发，跳过剩余的优雅等待直接 kill
    force_kill: CancellationToken,
}

impl StreamSupervisor {
    /// 从存储恢复频道列表，没有记录时使用配置文件中的频道
    pub fn new(
        server: ServerConfig,
        settings: SupervisorConfig,
        proxy: Arc<ProxyManager>,
        launcher: Arc<dyn ProcessLauncher>,
        store: Arc<dyn ConfigStore>,
        seed: Vec<Channel>,
    ) -> Result<Arc<Self>> {
        let channels = match store.get(CHANNELS_KEY)? {
            Some(value) => serde_json::from_value::<Vec<Channel>>(value)
                .map_err(|e| Error::Store(anyhow::anyhow!("corrupt channel record: {}", e)))?,
            None => seed,
        };

        let mut slots = BTreeMap::new();
        for channel in channels {
            channel.validate()?;
            if slots.contains_key(&channel.id) {
                return Err(Error::Validation(format!(
                    "duplicate channel id `{}`",
                    channel.id
                )));
            }
            slots.insert(channel.id.clone(), ChannelSlot::new(channel));
        }
        let (alerts, _) = broadcast::channel(32);

        Ok(Arc::new(Self {
            server,
            settings,
            proxy,
            launcher,
            store,
            channels: Mutex::new(slots),
            timers: TaskScheduler::new(),
            stats: Mutex::new(StatsCollector::default()),
            alerts,
            shutting_down: AtomicBool::new(false),
            force_kill: CancellationToken::new(),
        }))
    }

    /// 订阅告警 (崩溃预算耗尽等需要人工处理的事件)
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    /// 启动所有标记为 auto_start 的频道
    pub async fn start_auto_channels(self: &Arc<Self>) {
        let ids: Vec<String> = self
            .channels
            .lock()
            .values()
            .filter(|s| s.channel.auto_start)
            .map(|s| s.channel.id.clone())
            .collect();
        for id in ids {
            if let Err(e) = self.start_channel(&id).await {
                error!("Auto-start failed [{}]: {}", id, e);
            }
        }
    }

    /// 人工启动频道
    pub async fn start_channel(self: &Arc<Self>, id: &str) -> Result<WorkerStatus> {
        self.launch(id, Trigger::Manual).await?;
        self.status(id)
    }

    /// 优雅停止频道，超时后强制结束；无论哪条路径，最终都会进入 stopped
    pub async fn stop_channel(self: &Arc<Self>, id: &str) -> Result<WorkerStatus> {
        // 1. 取消待执行的重启，并取走进程控制权
        let (control, epoch) = {
            let mut channels = self.channels.lock();
            let slot = channels
                .get_mut(id)
                .ok_or_else(|| Error::UnknownChannel(id.to_string()))?;
            if !slot.handle.state.is_active() {
                return Err(Error::NotRunning(id.to_string()));
            }
            self.timers.cancel(id);
            slot.recovery.next_retry_at = None;

            match slot.control.take() {
                Some(control) => (control, slot.epoch),
                None => {
                    // 等待重启或正在 spawn，没有存活进程
                    slot.epoch += 1;
                    slot.handle.state = ProcessState::Stopped;
                    slot.handle.clear_process();
                    info!("Stream [{}] stopped (no live process).", id);
                    return Ok(status_of(slot, &self.timers));
                }
            }
        };

        // 2. 通知 watch 任务终止进程，等待其回收
        control.stop.cancel();
        let deadline = self.settings.stop_grace() + KILL_MARGIN;
        if tokio::time::timeout(deadline, control.exited).await.is_err() {
            // 3. 进程无法回收，不再等待
            let err = Error::ShutdownTimeout(id.to_string());
            error!("{}; marking channel stopped", err);
            let mut channels = self.channels.lock();
            if let Some(slot) = channels.get_mut(id) {
                if slot.epoch == epoch {
                    slot.epoch += 1;
                    slot.handle.state = ProcessState::Stopped;
                    slot.handle.clear_process();
                    slot.handle.last_error = Some(err.to_string());
                }
            }
        }
        self.status(id)
    }

    /// 人工重启：停止后重新启动，重置重启计数；也用于解除 stopped_permanently
    pub async fn restart_channel(self: &Arc<Self>, id: &str) -> Result<WorkerStatus> {
        match self.stop_channel(id).await {
            Ok(_) | Err(Error::NotRunning(_)) => {}
            Err(e) => return Err(e),
        }
        self.start_channel(id).await
    }

    /// 出口变更触发的重启，与人工重启走同一停止/启动流程，但保留重启计数
    pub async fn restart_for_egress(self: &Arc<Self>, id: &str) -> Result<()> {
        self.stop_channel(id).await?;
        self.launch(id, Trigger::EgressChange).await
    }

    /// 新增频道 (初始为 stopped) 并持久化频道列表
    pub fn add_channel(&self, channel: Channel) -> Result<WorkerStatus> {
        channel.validate()?;
        let status = {
            let mut channels = self.channels.lock();
            if channels.contains_key(&channel.id) {
                return Err(Error::Validation(format!(
                    "channel `{}` already exists",
                    channel.id
                )));
            }
            let id = channel.id.clone();
            let slot = channels.entry(id).or_insert_with(|| ChannelSlot::new(channel));
            let status = status_of(slot, &self.timers);
            self.persist(&channels);
            status
        };
        info!("Channel [{}] added", status.channel_id);
        Ok(status)
    }

    /// 删除频道，运行中的进程先优雅停止
    pub async fn remove_channel(self: &Arc<Self>, id: &str) -> Result<()> {
        match self.stop_channel(id).await {
            Ok(_) | Err(Error::NotRunning(_)) => {}
            Err(e) => return Err(e),
        }
        let mut channels = self.channels.lock();
        self.timers.cancel(id);
        if channels.remove(id).is_none() {
            return Err(Error::UnknownChannel(id.to_string()));
        }
        self.persist(&channels);
        info!("Channel [{}] removed", id);
        Ok(())
    }

    /// 查询单个频道的状态快照
    pub fn status(&self, id: &str) -> Result<WorkerStatus> {
        let channels = self.channels.lock();
        channels
            .get(id)
            .map(|slot| status_of(slot, &self.timers))
            .ok_or_else(|| Error::UnknownChannel(id.to_string()))
    }

    /// 所有频道的状态快照，按 id 排序
    pub fn statuses(&self) -> Vec<WorkerStatus> {
        self.channels
            .lock()
            .values()
            .map(|slot| status_of(slot, &self.timers))
            .collect()
    }

    /// 各频道 spawn 时捕获的出口，供出口变更时判断哪些频道需要重启
    pub fn egress_snapshots(&self) -> Vec<EgressSnapshot> {
        self.channels
            .lock()
            .values()
            .map(|slot| EgressSnapshot {
                channel_id: slot.channel.id.clone(),
                state: slot.handle.state,
                egress: slot.handle.egress.clone(),
                restart_on_egress_change: slot.channel.restart_on_egress_change,
            })
            .collect()
    }

    /// worker 启动耗时与崩溃次数统计
    pub fn stats(&self) -> BTreeMap<String, SeriesStats> {
        self.stats.lock().snapshot()
    }

    /// 取消所有退避定时器并在期限内停止全部频道
    pub async fn shutdown(self: &Arc<Self>) {
        // 1. 阻止新的自动重启
        self.shutting_down.store(true, Ordering::SeqCst);
        self.timers.cancel_all();

        let ids: Vec<String> = self
            .channels
            .lock()
            .values()
            .filter(|s| s.handle.state.is_active())
            .map(|s| s.channel.id.clone())
            .collect();
        info!("Shutting down {} active channel(s)", ids.len());

        let stops = join_all(ids.iter().map(|id| self.stop_channel(id)));
        tokio::pin!(stops);
        let results = match tokio::time::timeout(self.settings.shutdown_timeout(), &mut stops).await {
            Ok(results) => Some(results),
            Err(_) => {
                // 2. 超出期限，通知所有 watch 任务立即 kill
                error!(
                    "Shutdown deadline of {}ms exceeded, force killing remaining workers",
                    self.settings.shutdown_timeout_ms
                );
                self.force_kill.cancel();
                // 3. 给被 kill 的进程留出回收时间
                tokio::time::timeout(KILL_MARGIN, &mut stops).await.ok()
            }
        };

        match results {
            Some(results) => {
                for (id, result) in ids.iter().zip(results) {
                    if let Err(e) = result {
                        warn!("Stop during shutdown failed [{}]: {}", id, e);
                    }
                }
            }
            None => {
                // 4. 仍未退出的进程不再等待，频道直接标记为 stopped
                let mut channels = self.channels.lock();
                for slot in channels.values_mut().filter(|s| s.handle.state.is_active()) {
                    let err = Error::ShutdownTimeout(slot.channel.id.clone());
                    error!("{}; abandoning worker", err);
                    slot.epoch += 1;
                    slot.control = None;
                    slot.handle.state = ProcessState::Stopped;
                    slot.handle.clear_process();
                    slot.handle.last_error = Some(err.to_string());
                }
            }
        }
    }

    async fn launch(self: &Arc<Self>, id: &str, trigger: Trigger) -> Result<()> {
        // 1. 在锁内占位，保证同一频道只有一个进程
        let (channel, epoch) = {
            let mut channels = self.channels.lock();
            let slot = channels
                .get_mut(id)
                .ok_or_else(|| Error::UnknownChannel(id.to_string()))?;
            match trigger {
                Trigger::Recovery { epoch } => {
                    if slot.epoch != epoch || slot.handle.state != ProcessState::Restarting {
                        debug!("Stale restart for [{}] ignored", id);
                        return Ok(());
                    }
                }
                Trigger::Manual | Trigger::EgressChange => {
                    if slot.handle.state.is_active() {
                        return Err(Error::AlreadyRunning(id.to_string()));
                    }
                }
            }
            if trigger != Trigger::Manual && self.shutting_down.load(Ordering::SeqCst) {
                slot.handle.state = ProcessState::Stopped;
                return Ok(());
            }
            if trigger == Trigger::Manual {
                slot.handle.restart_count = 0;
                slot.handle.last_error = None;
                slot.recovery.reset();
            }
            slot.recovery.next_retry_at = None;
            slot.epoch += 1;
            slot.handle.state = ProcessState::Starting;
            (slot.channel.clone(), slot.epoch)
        };

        // 2. 检查系统内存是否足够
        if let Err(e) = engine::check_memory(self.server.min_free_memory_kb) {
            return Err(self.launch_failed(id, epoch, trigger, e));
        }

        // 3. 准备工作目录
        let output_dir = match engine::prepare_output_dir(&self.server, id).await {
            Ok(dir) => dir,
            Err(source) => {
                let err = Error::Spawn {
                    channel: id.to_string(),
                    source,
                };
                return Err(self.launch_failed(id, epoch, trigger, err));
            }
        };

        // 4. 在提交临界区内读取出口并 spawn，不会读到半提交的代理配置
        let spawned = {
            let committed = self.proxy.committed().await;
            let egress = committed.egress();
            let command = engine::build_launch(&self.server, &channel, &egress, output_dir.as_deref());
            self.launcher.launch(&command).map(|process| (process, egress))
        };
        let (process, egress) = match spawned {
            Ok(v) => v,
            Err(source) => {
                error!("Failed to spawn worker for [{}]: {}", id, source);
                let err = Error::Spawn {
                    channel: id.to_string(),
                    source,
                };
                return Err(self.launch_failed(id, epoch, trigger, err));
            }
        };

        // 5. 登记进程并交给 watch 任务
        let stop = CancellationToken::new();
        let (exited_tx, exited_rx) = oneshot::channel();
        {
            let mut channels = self.channels.lock();
            match channels.get_mut(id) {
                Some(slot) if slot.epoch == epoch => {
                    slot.handle.pid = process.pid();
                    slot.handle.started_at = Some(Instant::now());
                    slot.handle.egress = Some(egress.clone());
                    slot.control = Some(ProcessControl {
                        stop: stop.clone(),
                        exited: exited_rx,
                    });
                    info!(
                        "Starting stream [{}] (pid {:?}) via egress {}",
                        id,
                        process.pid(),
                        egress
                    );
                }
                _ => {
                    // spawn 期间被停止或删除
                    warn!("Channel [{}] was stopped while spawning, terminating", id);
                    stop.cancel();
                }
            }
        }
        tokio::spawn(Arc::clone(self).watch(id.to_string(), epoch, process, stop, exited_tx));
        Ok(())
    }

    /// 启动失败：人工启动直接回到 stopped，自动路径按崩溃处理
    fn launch_failed(self: &Arc<Self>, id: &str, epoch: u64, trigger: Trigger, err: Error) -> Error {
        let mut channels = self.channels.lock();
        if let Some(slot) = channels.get_mut(id) {
            if slot.epoch == epoch {
                match trigger {
                    Trigger::Manual => {
                        slot.handle.state = ProcessState::Stopped;
                        slot.handle.clear_process();
                        slot.handle.last_error = Some(err.to_string());
                    }
                    Trigger::Recovery { .. } | Trigger::EgressChange => {
                        self.record_crash(slot, err.to_string());
                    }
                }
            }
        }
        err
    }

    /// 持有进程直到其结束：首条输出标记 running，启动超时则 kill
    async fn watch(
        self: Arc<Self>,
        id: String,
        epoch: u64,
        mut process: Box<dyn WorkerProcess>,
        stop: CancellationToken,
        exited: oneshot::Sender<()>,
    ) {
        let spawned_at = Instant::now();
        let mut output = process.take_output().map(OutputRecordReader::new);
        let startup = tokio::time::sleep(self.settings.startup_timeout());
        tokio::pin!(startup);
        let mut live = false;
        // 最近一条输出，崩溃时作为错误上下文
        let mut last_line: Option<String> = None;

        let exit = loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    break WorkerExit::Stopped(self.terminate(&id, process.as_mut()).await);
                }
                status = process.wait() => {
                    break match status {
                        Ok(info) => WorkerExit::Exited(info),
                        Err(e) => WorkerExit::Lost(e.to_string()),
                    };
                }
                line = next_record(&mut output) => match line {
                    Some(line) => {
                        if !live {
                            live = true;
                            self.mark_running(&id, epoch, spawned_at.elapsed());
                        }
                        debug!("[{}] {}", id, line);
                        last_line = Some(line);
                    }
                    None => output = None,
                },
                _ = &mut startup, if !live => {
                    warn!("Stream [{}] produced no output within {}ms, killing", id, self.settings.startup_timeout_ms);
                    if let Err(e) = process.kill().await {
                        error!("Failed to kill [{}]: {}", id, e);
                    }
                    break WorkerExit::StartupTimeout;
                }
            }
        };

        self.on_exit(&id, epoch, exit, last_line);
        let _ = exited.send(());
    }

    /// SIGTERM 后等待优雅期，超时或关停期限到达时 kill
    async fn terminate(&self, id: &str, process: &mut dyn WorkerProcess) -> Option<ExitInfo> {
        if let Err(e) = process.terminate() {
            warn!("Failed to signal [{}]: {}", id, e);
        }
        let graceful = tokio::select! {
            result = tokio::time::timeout(self.settings.stop_grace(), process.wait()) => result.ok(),
            _ = self.force_kill.cancelled() => None,
        };
        match graceful {
            Some(Ok(info)) => Some(info),
            Some(Err(e)) => {
                warn!("Failed to reap [{}]: {}", id, e);
                None
            }
            None => {
                warn!(
                    "Stream [{}] did not exit after termination (grace {}ms), force killing",
                    id, self.settings.stop_grace_ms
                );
                if let Err(e) = process.kill().await {
                    error!("Failed to kill [{}]: {}", id, e);
                }
                process.wait().await.ok()
            }
        }
    }

    fn mark_running(&self, id: &str, epoch: u64, startup: Duration) {
        let mut channels = self.channels.lock();
        if let Some(slot) = channels.get_mut(id) {
            if slot.epoch == epoch && slot.handle.state == ProcessState::Starting {
                slot.handle.state = ProcessState::Running;
                self.stats
                    .lock()
                    .record_success(&format!("worker:{}", id), startup);
                info!("Stream [{}] is running ({}ms to first output)", id, startup.as_millis());
            }
        }
    }

    /// 进程结束后的状态迁移
    ///
    /// stop_channel 在发出停止信号前先取走 `control`，因此 `control` 已为空
    /// 说明停止请求在途：即使进程恰好在此时自行退出，也按人工停止处理，
    /// 不计入崩溃、不安排重启。
    fn on_exit(self: &Arc<Self>, id: &str, epoch: u64, exit: WorkerExit, last_line: Option<String>) {
        let mut channels = self.channels.lock();
        let Some(slot) = channels.get_mut(id) else {
            return;
        };
        if slot.epoch != epoch {
            return;
        }
        let stopping = slot.control.take().is_none();
        let exit = match exit {
            WorkerExit::Exited(info) if stopping => WorkerExit::Stopped(Some(info)),
            WorkerExit::Lost(_) | WorkerExit::StartupTimeout if stopping => WorkerExit::Stopped(None),
            other => other,
        };

        match exit {
            WorkerExit::Stopped(info) => {
                slot.handle.state = ProcessState::Stopped;
                slot.handle.clear_process();
                slot.handle.last_exit_code = info.and_then(|i| i.code);
                info!("Stream [{}] stopped.", id);
            }
            WorkerExit::Exited(info) => {
                slot.handle.last_exit_code = info.code;
                let mut reason = match info.code {
                    Some(code) => format!("exited with code {}", code),
                    None => "terminated by signal".to_string(),
                };
                if let Some(line) = last_line {
                    reason = format!("{}: {}", reason, line);
                }
                warn!("Stream [{}] exited unexpectedly: {}", id, reason);
                self.record_crash(slot, reason);
            }
            WorkerExit::Lost(e) => {
                slot.handle.last_exit_code = None;
                self.record_crash(slot, format!("lost track of process: {}", e));
            }
            WorkerExit::StartupTimeout => {
                let err = Error::StartupTimeout {
                    channel: id.to_string(),
                    timeout: self.settings.startup_timeout(),
                };
                slot.handle.last_exit_code = None;
                self.record_crash(slot, err.to_string());
            }
        }
    }

    /// 崩溃记账：计算退避并安排重启，超出预算则永久停止
    fn record_crash(self: &Arc<Self>, slot: &mut ChannelSlot, reason: String) {
        let id = slot.channel.id.clone();
        self.stats.lock().record_failure(&format!("worker:{}", id));
        slot.handle.state = ProcessState::Crashing;
        slot.handle.clear_process();
        slot.handle.last_error = Some(reason.clone());

        if self.shutting_down.load(Ordering::SeqCst) {
            slot.handle.state = ProcessState::Stopped;
            return;
        }

        let retry = &self.settings.retry;
        let now = Instant::now();
        let crashes = slot.recovery.record_crash(now, retry.window());
        if crashes >= retry.max_attempts {
            let err = Error::CrashLoopExceeded {
                channel: id.clone(),
                crashes,
            };
            slot.handle.state = ProcessState::StoppedPermanently;
            slot.handle.last_error = Some(format!("{} (last failure: {})", err, reason));
            slot.recovery.next_retry_at = None;
            error!(
                "Stream [{}] reached max retry attempts ({}). Giving up.",
                id, retry.max_attempts
            );
            let _ = self.alerts.send(Alert {
                channel_id: id,
                message: err.to_string(),
                at: Utc::now(),
            });
            return;
        }

        let backoff = retry.backoff(crashes);
        slot.handle.restart_count += 1;
        slot.handle.state = ProcessState::Restarting;
        slot.recovery.next_retry_at = Some(now + backoff);
        warn!(
            "Stream [{}] crashed. Retry {}/{}. Backing off for {}ms.",
            id,
            crashes,
            retry.max_attempts,
            backoff.as_millis()
        );

        let epoch = slot.epoch;
        let supervisor = Arc::clone(self);
        let key = id.clone();
        self.timers.schedule(&key, backoff, async move {
            info!("Supervisor: Attempting to restart stream [{}]", id);
            if let Err(e) = supervisor.launch(&id, Trigger::Recovery { epoch }).await {
                error!("Restart failed [{}]: {}", id, e);
            }
        });
    }

    fn persist(&self, channels: &BTreeMap<String, ChannelSlot>) {
        let list: Vec<&Channel> = channels.values().map(|s| &s.channel).collect();
        let result = serde_json::to_value(&list)
            .map_err(anyhow::Error::from)
            .and_then(|value| self.store.put(CHANNELS_KEY, value));
        if let Err(e) = result {
            warn!("Failed to persist channels: {:#}", e);
        }
    }
}

fn status_of(slot: &ChannelSlot, timers: &TaskScheduler) -> WorkerStatus {
    let handle = &slot.handle;
    WorkerStatus {
        channel_id: slot.channel.id.clone(),
        name: slot.channel.name.clone(),
        source: slot.channel.source.clone(),
        state: handle.state,
        pid: handle.pid,
        uptime_seconds: handle.started_at.map(|t| t.elapsed().as_secs()),
        restart_count: handle.restart_count,
        egress: handle.egress.clone(),
        last_exit_code: handle.last_exit_code,
        last_error: handle.last_error.clone(),
        next_retry_in_ms: (handle.state == ProcessState::Restarting)
            .then(|| timers.remaining(&slot.channel.id))
            .flatten()
            .map(|d| d.as_millis() as u64),
        auto_start: slot.channel.auto_start,
    }
}

async fn next_record(output: &mut Option<OutputRecordReader<OutputStream>>) -> Option<String> {
    match output {
        Some(reader) => reader.next_record().await.ok().flatten(),
        None => std::future::pending().await,
    }
}
