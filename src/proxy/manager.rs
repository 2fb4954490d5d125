//! 代理管理：配置提交、连通性状态机与周期健康检查
//!
//! 所有对生效配置的写入都经过 `writer` 串行化；worker 启动时通过
//! [`ProxyManager::committed`] 持有同一把读锁读取出口，因此不会读到半提交的配置。

use super::probe::{run_probe, ConnectivityProbe, ProbeSample};
use super::profile::{Egress, ProfileStore, ProxyProfile};
use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::stats::{SeriesStats, StatsCollector};
use crate::store::{ConfigStore, PROXY_KEY};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock, RwLockReadGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeRecord {
    pub at: DateTime<Utc>,
    pub profile_id: Option<String>,
    pub success: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

/// 代理状态变化通知
#[derive(Debug, Clone)]
pub enum ProxyEvent {
    /// 生效出口已变更 (已提交)
    EgressChanged {
        generation: u64,
        previous: Egress,
        current: Egress,
    },
    StatusChanged {
        from: ConnectionStatus,
        to: ConnectionStatus,
    },
}

/// 对外的状态快照
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatus {
    pub active_profile_id: Option<String>,
    pub connection_status: ConnectionStatus,
    pub generation: u64,
    pub last_probe: Option<ProbeRecord>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub profiles: Vec<ProxyProfile>,
    pub statistics: BTreeMap<String, SeriesStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyAction {
    Start,
    Stop,
    Restart,
}

#[derive(Serialize, Deserialize)]
struct PersistedProxy {
    profiles: Vec<ProxyProfile>,
    active_profile_id: Option<String>,
}

struct Committed {
    profiles: ProfileStore,
    generation: u64,
}

struct Health {
    status: ConnectionStatus,
    last_probe: Option<ProbeRecord>,
    last_success: Option<Instant>,
    consecutive_failures: u32,
    last_error: Option<String>,
}

enum HealthUpdate {
    Probed(Duration),
    Cleared,
    Unchanged,
}

/// 持有提交锁期间的只读视图
pub struct CommittedEgress<'a> {
    guard: RwLockReadGuard<'a, Committed>,
}

impl CommittedEgress<'_> {
    /// 当前生效的出口 (直连或代理)
    pub fn egress(&self) -> Egress {
        self.guard.profiles.egress().clone()
    }
}

pub struct ProxyManager {
    settings: ProxyConfig,
    probe: Arc<dyn ConnectivityProbe>,
    store: Arc<dyn ConfigStore>,
    committed: RwLock<Committed>,
    health: Mutex<Health>,
    stats: Mutex<StatsCollector>,
    writer: tokio::sync::Mutex<()>,
    events: broadcast::Sender<ProxyEvent>,
}

impl ProxyManager {
    /// 从存储恢复配置，没有记录时使用配置文件中的初始值
    pub fn new(
        settings: ProxyConfig,
        probe: Arc<dyn ConnectivityProbe>,
        store: Arc<dyn ConfigStore>,
    ) -> Result<Self> {
        let persisted = match store.get(PROXY_KEY)? {
            Some(value) => serde_json::from_value::<PersistedProxy>(value)
                .map_err(|e| Error::Store(anyhow::anyhow!("corrupt proxy record: {}", e)))?,
            None => PersistedProxy {
                profiles: settings.profiles.clone(),
                active_profile_id: settings.active_profile_id.clone(),
            },
        };
        let profiles = ProfileStore::new(persisted.profiles, persisted.active_profile_id)?;
        let (events, _) = broadcast::channel(64);

        Ok(Self {
            settings,
            probe,
            store,
            committed: RwLock::new(Committed {
                profiles,
                generation: 0,
            }),
            health: Mutex::new(Health {
                status: ConnectionStatus::Disconnected,
                last_probe: None,
                last_success: None,
                consecutive_failures: 0,
                last_error: None,
            }),
            stats: Mutex::new(StatsCollector::default()),
            writer: tokio::sync::Mutex::new(()),
            events,
        })
    }

    /// 订阅出口变更与连接状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.events.subscribe()
    }

    /// 进入提交临界区读取当前出口；持有期间不会发生提交
    pub async fn committed(&self) -> CommittedEgress<'_> {
        CommittedEgress {
            guard: self.committed.read().await,
        }
    }

    /// 替换整个代理集合并切换生效配置
    ///
    /// 新的生效配置必须先通过探测才会提交；探测失败时保留原配置不变。
    pub async fn update_config(
        &self,
        profiles: Vec<ProxyProfile>,
        active_id: Option<String>,
    ) -> Result<ProxyStatus> {
        // 1. 先校验整个集合，非法配置不会进入提交流程
        let candidate = ProfileStore::new(profiles, active_id)?;
        // 2. 串行化提交，探测通过后替换
        let _writer = self.writer.lock().await;
        self.probe_and_commit(candidate).await?;
        Ok(self.status().await)
    }

    /// 启用指定的代理 (配置集合不变)
    pub async fn activate(&self, profile_id: &str) -> Result<ProxyStatus> {
        let _writer = self.writer.lock().await;
        let profiles = {
            let committed = self.committed.read().await;
            if committed.profiles.get(profile_id).is_none() {
                return Err(Error::UnknownProfile(profile_id.to_string()));
            }
            committed.profiles.to_vec()
        };
        let candidate = ProfileStore::new(profiles, Some(profile_id.to_string()))?;
        self.probe_and_commit(candidate).await?;
        Ok(self.status().await)
    }

    /// 删除一条配置；若为当前生效配置，同一次提交中回退为直连
    pub async fn delete_profile(&self, profile_id: &str) -> Result<ProxyStatus> {
        let _writer = self.writer.lock().await;
        let (candidate, was_active) = {
            let committed = self.committed.read().await;
            if committed.profiles.get(profile_id).is_none() {
                return Err(Error::UnknownProfile(profile_id.to_string()));
            }
            let remaining: Vec<ProxyProfile> = committed
                .profiles
                .to_vec()
                .into_iter()
                .filter(|p| p.id != profile_id)
                .collect();
            let was_active = committed.profiles.active_id() == Some(profile_id);
            let active = if was_active {
                None
            } else {
                committed.profiles.active_id().map(str::to_string)
            };
            (ProfileStore::new(remaining, active)?, was_active)
        };
        let update = if was_active {
            HealthUpdate::Cleared
        } else {
            HealthUpdate::Unchanged
        };
        self.commit(candidate, update).await;
        info!("Proxy profile [{}] deleted", profile_id);
        Ok(self.status().await)
    }

    /// 停用代理，回到直连；重复调用无副作用
    pub async fn stop_proxy(&self) -> ProxyStatus {
        {
            let _writer = self.writer.lock().await;
            let candidate = {
                let committed = self.committed.read().await;
                let idle = committed.profiles.active_id().is_none()
                    && self.health.lock().status == ConnectionStatus::Disconnected;
                if idle {
                    None
                } else {
                    // 去掉 active 的同一集合一定合法
                    ProfileStore::new(committed.profiles.to_vec(), None).ok()
                }
            };
            if let Some(candidate) = candidate {
                self.commit(candidate, HealthUpdate::Cleared).await;
                info!("Proxy stopped, egress is now direct");
            }
        }
        self.status().await
    }

    /// 按动作启停代理：stop 回到直连，start/restart 重新探测并启用指定 (或当前) 配置
    pub async fn control(
        &self,
        action: ProxyAction,
        profile_id: Option<&str>,
    ) -> Result<ProxyStatus> {
        match action {
            ProxyAction::Stop => Ok(self.stop_proxy().await),
            ProxyAction::Start | ProxyAction::Restart => {
                let id = match profile_id {
                    Some(id) => id.to_string(),
                    None => self
                        .committed
                        .read()
                        .await
                        .profiles
                        .active_id()
                        .map(str::to_string)
                        .ok_or_else(|| {
                            Error::Validation("no profile given and none is active".into())
                        })?,
                };
                self.activate(&id).await
            }
        }
    }

    /// 一次性探测，不修改生效配置，断开状态下也可使用
    pub async fn test_proxy_config(
        &self,
        profile: Option<&ProxyProfile>,
        target_id: Option<&str>,
    ) -> Result<ProbeSample> {
        let egress = match profile {
            Some(profile) => {
                profile.validate()?;
                Egress::for_profile(profile)?
            }
            None => Egress::direct(),
        };
        let target = self.target_url(target_id)?;
        let latency = self.probe_egress(&egress, &target).await?;
        Ok(ProbeSample::from_result(&Ok(latency)))
    }

    /// 当前状态快照，凭据已脱敏；超过有效期未成功探测时降级
    pub async fn status(&self) -> ProxyStatus {
        let committed = self.committed.read().await;
        let mut health = self.health.lock();
        self.refresh_staleness(&mut health);
        ProxyStatus {
            active_profile_id: committed.profiles.active_id().map(str::to_string),
            connection_status: health.status,
            generation: committed.generation,
            last_probe: health.last_probe.clone(),
            last_error: health.last_error.clone(),
            consecutive_failures: health.consecutive_failures,
            profiles: committed
                .profiles
                .profiles()
                .iter()
                .map(|p| p.redacted())
                .collect(),
            statistics: self.stats.lock().snapshot(),
        }
    }

    /// 周期健康检查，直到取消
    pub async fn run_health_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.health_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.health_check_once() => {}
            }
        }
        debug!("Proxy health loop stopped");
    }

    /// 对当前生效配置做一次健康检查
    ///
    /// 探测期间如果发生了新的提交，结果直接丢弃。
    pub async fn health_check_once(&self) {
        // 1. 记录探测对象及其所属的提交代数
        let (egress, generation) = {
            let committed = self.committed.read().await;
            if committed.profiles.active_id().is_none() {
                return;
            }
            (committed.profiles.egress().clone(), committed.generation)
        };
        let target = match self.target_url(None) {
            Ok(t) => t,
            Err(e) => {
                warn!("Health check skipped: {}", e);
                return;
            }
        };
        // 2. 探测期间不持有任何锁
        let result = self.probe_egress(&egress, &target).await;

        // 3. 代数已变化或正在提交时丢弃结果
        let committed = self.committed.read().await;
        if committed.generation != generation {
            debug!("Discarding health result for superseded generation {}", generation);
            return;
        }
        let transition = {
            let mut health = self.health.lock();
            if health.status == ConnectionStatus::Connecting {
                return;
            }
            // 4. 更新连续失败计数并计算新状态
            let before = health.status;
            health.last_probe = Some(record(&egress, &result));
            match &result {
                Ok(latency) => {
                    health.consecutive_failures = 0;
                    health.last_success = Some(Instant::now());
                    health.last_error = None;
                    health.status = self.status_for_latency(*latency);
                }
                Err(e) => {
                    health.consecutive_failures += 1;
                    health.last_error = Some(e.to_string());
                    health.status = if health.consecutive_failures >= self.settings.failure_threshold
                    {
                        ConnectionStatus::Error
                    } else {
                        match before {
                            ConnectionStatus::Connected | ConnectionStatus::Degraded => {
                                ConnectionStatus::Degraded
                            }
                            _ => ConnectionStatus::Error,
                        }
                    };
                    warn!(
                        "Proxy [{}] health check failed ({}/{}): {}",
                        egress, health.consecutive_failures, self.settings.failure_threshold, e
                    );
                }
            }
            (before, health.status)
        };
        drop(committed);
        self.notify_status(transition.0, transition.1);
    }

    fn target_url(&self, target_id: Option<&str>) -> Result<String> {
        let id = target_id.unwrap_or(&self.settings.default_target);
        self.settings
            .targets
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownTarget(id.to_string()))
    }

    async fn probe_egress(&self, egress: &Egress, target: &str) -> Result<Duration> {
        let result = run_probe(
            self.probe.as_ref(),
            egress,
            target,
            self.settings.probe_timeout(),
        )
        .await;
        let key = format!("proxy:{}", egress);
        let mut stats = self.stats.lock();
        match &result {
            Ok(latency) => stats.record_success(&key, *latency),
            Err(_) => stats.record_failure(&key),
        }
        result
    }

    /// 调用方必须持有 `writer`
    async fn probe_and_commit(&self, candidate: ProfileStore) -> Result<()> {
        if candidate.active_id().is_none() {
            self.commit(candidate, HealthUpdate::Cleared).await;
            return Ok(());
        }

        let egress = candidate.egress().clone();
        let target = self.target_url(None)?;
        let (previous_status, had_active) = {
            let had_active = self.committed.read().await.profiles.active_id().is_some();
            let mut health = self.health.lock();
            let previous = health.status;
            health.status = ConnectionStatus::Connecting;
            (previous, had_active)
        };
        self.notify_status(previous_status, ConnectionStatus::Connecting);
        info!("Probing proxy [{}] before commit", egress);

        match self.probe_egress(&egress, &target).await {
            Ok(latency) => {
                self.commit(candidate, HealthUpdate::Probed(latency)).await;
                Ok(())
            }
            Err(e) => {
                let restored = if had_active {
                    previous_status
                } else {
                    ConnectionStatus::Error
                };
                {
                    let mut health = self.health.lock();
                    health.status = restored;
                    health.last_probe = Some(record(&egress, &Err::<Duration, _>(e.to_string())));
                    health.last_error = Some(e.to_string());
                }
                self.notify_status(ConnectionStatus::Connecting, restored);
                warn!("Proxy [{}] rejected, keeping previous config: {}", egress, e);
                Err(e)
            }
        }
    }

    async fn commit(&self, candidate: ProfileStore, update: HealthUpdate) {
        let mut committed = self.committed.write().await;
        let previous = committed.profiles.egress().clone();
        committed.profiles = candidate;
        committed.generation += 1;
        let generation = committed.generation;
        let current = committed.profiles.egress().clone();

        let (before, after) = {
            let mut health = self.health.lock();
            let before = health.status;
            match update {
                HealthUpdate::Probed(latency) => {
                    health.status = self.status_for_latency(latency);
                    health.last_probe = Some(record(&current, &Ok::<_, String>(latency)));
                    health.last_success = Some(Instant::now());
                    health.consecutive_failures = 0;
                    health.last_error = None;
                }
                HealthUpdate::Cleared => {
                    health.status = ConnectionStatus::Disconnected;
                    health.last_success = None;
                    health.consecutive_failures = 0;
                    health.last_error = None;
                }
                HealthUpdate::Unchanged => {}
            }
            (before, health.status)
        };

        self.persist(&committed.profiles);
        drop(committed);

        info!(
            "Proxy config committed (generation {}), egress: {}",
            generation, current
        );
        if previous != current {
            let _ = self.events.send(ProxyEvent::EgressChanged {
                generation,
                previous,
                current,
            });
        }
        self.notify_status(before, after);
    }

    fn persist(&self, profiles: &ProfileStore) {
        let record = PersistedProxy {
            profiles: profiles.to_vec(),
            active_profile_id: profiles.active_id().map(str::to_string),
        };
        let result = serde_json::to_value(&record)
            .map_err(anyhow::Error::from)
            .and_then(|value| self.store.put(PROXY_KEY, value));
        if let Err(e) = result {
            warn!("Failed to persist proxy config: {:#}", e);
        }
    }

    fn status_for_latency(&self, latency: Duration) -> ConnectionStatus {
        if latency.as_millis() as u64 > self.settings.degraded_latency_ms {
            ConnectionStatus::Degraded
        } else {
            ConnectionStatus::Connected
        }
    }

    /// connected 但最近一次成功探测已过期时降级
    fn refresh_staleness(&self, health: &mut Health) {
        if health.status != ConnectionStatus::Connected {
            return;
        }
        let stale = health
            .last_success
            .map_or(true, |at| at.elapsed() > self.settings.stale_after());
        if stale {
            health.status = ConnectionStatus::Degraded;
            let _ = self.events.send(ProxyEvent::StatusChanged {
                from: ConnectionStatus::Connected,
                to: ConnectionStatus::Degraded,
            });
        }
    }

    fn notify_status(&self, from: ConnectionStatus, to: ConnectionStatus) {
        if from != to {
            debug!("Proxy status {:?} -> {:?}", from, to);
            let _ = self.events.send(ProxyEvent::StatusChanged { from, to });
        }
    }
}

fn record<E: ToString>(egress: &Egress, result: &std::result::Result<Duration, E>) -> ProbeRecord {
    ProbeRecord {
        at: Utc::now(),
        profile_id: egress.profile_id.clone(),
        success: result.is_ok(),
        latency_ms: result.as_ref().ok().map(|l| l.as_millis() as u64),
        error: result.as_ref().err().map(|e| e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::testing::{profile, MockProbe};
    use crate::store::MemoryStore;

    fn settings() -> ProxyConfig {
        ProxyConfig {
            health_interval_ms: 1_000,
            probe_timeout_ms: 500,
            stale_after_ms: 5_000,
            degraded_latency_ms: 300,
            ..ProxyConfig::default()
        }
    }

    fn manager(probe: Arc<MockProbe>) -> ProxyManager {
        ProxyManager::new(settings(), probe, Arc::new(MemoryStore::new())).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn commit_socks_profile() {
        let probe = Arc::new(MockProbe::with_latency(Duration::from_millis(40)));
        let mgr = manager(probe.clone());
        let mut events = mgr.subscribe();

        let status = mgr
            .update_config(vec![profile("p1", 1080)], Some("p1".into()))
            .await
            .unwrap();

        assert_eq!(status.connection_status, ConnectionStatus::Connected);
        assert_eq!(status.active_profile_id.as_deref(), Some("p1"));
        let last = status.last_probe.unwrap();
        assert!(last.success);
        assert_eq!(last.latency_ms, Some(40));
        assert_eq!(
            status.statistics["proxy:p1"].last_latency_ms,
            Some(40)
        );
        assert_eq!(
            mgr.committed().await.egress().profile_id.as_deref(),
            Some("p1")
        );

        let mut saw_egress_change = false;
        while let Ok(event) = events.try_recv() {
            if let ProxyEvent::EgressChanged { current, .. } = event {
                assert_eq!(current.profile_id.as_deref(), Some("p1"));
                saw_egress_change = true;
            }
        }
        assert!(saw_egress_change);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_config_changes_nothing() {
        let probe = Arc::new(MockProbe::with_latency(Duration::from_millis(10)));
        let mgr = manager(probe.clone());
        mgr.update_config(vec![profile("p1", 1080)], Some("p1".into()))
            .await
            .unwrap();

        let dup = mgr
            .update_config(vec![profile("p2", 1), profile("p2", 2)], Some("p2".into()))
            .await;
        assert!(matches!(dup, Err(Error::Validation(_))));
        let bad_port = mgr
            .update_config(vec![profile("p2", 0)], Some("p2".into()))
            .await;
        assert!(matches!(bad_port, Err(Error::Validation(_))));

        let status = mgr.status().await;
        assert_eq!(status.active_profile_id.as_deref(), Some("p1"));
        assert_eq!(status.generation, 1);
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reverts() {
        let probe = Arc::new(MockProbe::with_latency(Duration::from_millis(10)));
        let mgr = manager(probe.clone());
        mgr.update_config(vec![profile("p1", 1080)], Some("p1".into()))
            .await
            .unwrap();
        probe.fail("p2");

        let err = mgr
            .update_config(
                vec![profile("p1", 1080), profile("p2", 1081)],
                Some("p2".into()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProbeFailure { .. }));

        let status = mgr.status().await;
        assert_eq!(status.active_profile_id.as_deref(), Some("p1"));
        assert_eq!(status.profiles.len(), 1);
        assert_eq!(status.connection_status, ConnectionStatus::Connected);
        assert!(status.last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_first_activation_reports_error() {
        let probe = Arc::new(MockProbe::with_latency(Duration::from_secs(5)));
        let mgr = manager(probe);
        let err = mgr
            .update_config(vec![profile("p1", 1080)], Some("p1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProbeTimeout { .. }));
        let status = mgr.status().await;
        assert_eq!(status.active_profile_id, None);
        assert_eq!(status.connection_status, ConnectionStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn readers_see_old_egress_while_probing() {
        let probe = Arc::new(MockProbe::with_latency(Duration::from_millis(40)));
        let mgr = Arc::new(manager(probe));
        mgr.update_config(vec![profile("p1", 1080)], Some("p1".into()))
            .await
            .unwrap();

        let pending = {
            let mgr = mgr.clone();
            tokio::spawn(async move {
                mgr.update_config(
                    vec![profile("p1", 1080), profile("p2", 1081)],
                    Some("p2".into()),
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            mgr.committed().await.egress().profile_id.as_deref(),
            Some("p1")
        );
        assert_eq!(
            mgr.status().await.connection_status,
            ConnectionStatus::Connecting
        );

        pending.await.unwrap().unwrap();
        assert_eq!(
            mgr.committed().await.egress().profile_id.as_deref(),
            Some("p2")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deleting_active_profile_falls_back_to_direct() {
        let probe = Arc::new(MockProbe::with_latency(Duration::from_millis(10)));
        let mgr = manager(probe);
        mgr.update_config(
            vec![profile("p1", 1080), profile("p2", 1081)],
            Some("p1".into()),
        )
        .await
        .unwrap();
        let mut events = mgr.subscribe();

        let status = mgr.delete_profile("p1").await.unwrap();
        assert_eq!(status.active_profile_id, None);
        assert_eq!(status.connection_status, ConnectionStatus::Disconnected);
        assert_eq!(status.profiles.len(), 1);
        assert!(mgr.committed().await.egress().is_direct());

        match events.try_recv().unwrap() {
            ProxyEvent::EgressChanged { previous, current, .. } => {
                assert_eq!(previous.profile_id.as_deref(), Some("p1"));
                assert!(current.is_direct());
            }
            other => panic!("unexpected event {:?}", other),
        }

        assert!(matches!(
            mgr.delete_profile("p9").await,
            Err(Error::UnknownProfile(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn deleting_inactive_profile_keeps_status() {
        let probe = Arc::new(MockProbe::with_latency(Duration::from_millis(10)));
        let mgr = manager(probe);
        mgr.update_config(
            vec![profile("p1", 1080), profile("p2", 1081)],
            Some("p1".into()),
        )
        .await
        .unwrap();
        let status = mgr.delete_profile("p2").await.unwrap();
        assert_eq!(status.active_profile_id.as_deref(), Some("p1"));
        assert_eq!(status.connection_status, ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn health_loop_degrades_then_errors() {
        let probe = Arc::new(MockProbe::with_latency(Duration::from_millis(10)));
        let mgr = manager(probe.clone());
        mgr.update_config(vec![profile("p1", 1080)], Some("p1".into()))
            .await
            .unwrap();

        probe.fail("p1");
        mgr.health_check_once().await;
        assert_eq!(mgr.status().await.connection_status, ConnectionStatus::Degraded);
        mgr.health_check_once().await;
        assert_eq!(mgr.status().await.connection_status, ConnectionStatus::Degraded);
        mgr.health_check_once().await;
        let status = mgr.status().await;
        assert_eq!(status.connection_status, ConnectionStatus::Error);
        assert_eq!(status.consecutive_failures, 3);
        // 健康检查不会改动生效配置
        assert_eq!(status.active_profile_id.as_deref(), Some("p1"));

        probe.recover("p1");
        mgr.health_check_once().await;
        assert_eq!(mgr.status().await.connection_status, ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_is_degraded() {
        let probe = Arc::new(MockProbe::with_latency(Duration::from_millis(400)));
        let mgr = manager(probe);
        let status = mgr
            .update_config(vec![profile("p1", 1080)], Some("p1".into()))
            .await
            .unwrap();
        assert_eq!(status.connection_status, ConnectionStatus::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_success_degrades() {
        let probe = Arc::new(MockProbe::with_latency(Duration::from_millis(10)));
        let mgr = manager(probe);
        mgr.update_config(vec![profile("p1", 1080)], Some("p1".into()))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(mgr.status().await.connection_status, ConnectionStatus::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn health_loop_runs_until_cancelled() {
        let probe = Arc::new(MockProbe::with_latency(Duration::from_millis(10)));
        let mgr = Arc::new(manager(probe.clone()));
        mgr.update_config(vec![profile("p1", 1080)], Some("p1".into()))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(mgr.clone().run_health_loop(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        cancel.cancel();
        task.await.unwrap();

        // 提交时一次 + 0s/1s/2s 三次
        assert_eq!(probe.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let probe = Arc::new(MockProbe::with_latency(Duration::from_millis(10)));
        let mgr = manager(probe);
        mgr.update_config(vec![profile("p1", 1080)], Some("p1".into()))
            .await
            .unwrap();

        let first = mgr.stop_proxy().await;
        assert_eq!(first.active_profile_id, None);
        assert_eq!(first.connection_status, ConnectionStatus::Disconnected);
        let generation = first.generation;

        let second = mgr.stop_proxy().await;
        assert_eq!(second.generation, generation);
        assert_eq!(second.profiles.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn control_restarts_active_profile() {
        let probe = Arc::new(MockProbe::with_latency(Duration::from_millis(10)));
        let mgr = manager(probe.clone());
        assert!(matches!(
            mgr.control(ProxyAction::Restart, None).await,
            Err(Error::Validation(_))
        ));
        mgr.update_config(vec![profile("p1", 1080)], None).await.unwrap();
        let status = mgr.control(ProxyAction::Start, Some("p1")).await.unwrap();
        assert_eq!(status.active_profile_id.as_deref(), Some("p1"));
        let status = mgr.control(ProxyAction::Restart, None).await.unwrap();
        assert_eq!(status.connection_status, ConnectionStatus::Connected);
        assert_eq!(probe.calls(), 2);
        let status = mgr.control(ProxyAction::Stop, None).await.unwrap();
        assert_eq!(status.active_profile_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_test_leaves_active_untouched() {
        let probe = Arc::new(MockProbe::with_latency(Duration::from_millis(25)));
        let mgr = manager(probe);
        let sample = mgr
            .test_proxy_config(Some(&profile("px", 9050)), Some("github"))
            .await
            .unwrap();
        assert!(sample.success);
        assert_eq!(sample.latency_ms, Some(25));

        let status = mgr.status().await;
        assert_eq!(status.active_profile_id, None);
        assert_eq!(status.connection_status, ConnectionStatus::Disconnected);
        assert_eq!(status.statistics["proxy:px"].total, 1);

        assert!(matches!(
            mgr.test_proxy_config(None, Some("nope")).await,
            Err(Error::UnknownTarget(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn restores_from_store() {
        let store: Arc<dyn ConfigStore> = Arc::new(MemoryStore::new());
        let probe = Arc::new(MockProbe::with_latency(Duration::from_millis(10)));
        {
            let mgr = ProxyManager::new(settings(), probe.clone(), store.clone()).unwrap();
            mgr.update_config(vec![profile("p1", 1080)], Some("p1".into()))
                .await
                .unwrap();
        }
        let mgr = ProxyManager::new(settings(), probe, store).unwrap();
        let status = mgr.status().await;
        assert_eq!(status.active_profile_id.as_deref(), Some("p1"));
        // 重启后尚未探测
        assert_eq!(status.connection_status, ConnectionStatus::Disconnected);
        mgr.health_check_once().await;
        assert_eq!(mgr.status().await.connection_status, ConnectionStatus::Connected);
    }
    #[tokio::test(start_paused = true)]
    async fn health_result_from_old_generation_is_dropped() {
        let probe = Arc::new(MockProbe::with_latency(Duration::from_millis(40)));
        let mgr = Arc::new(manager(probe.clone()));
        mgr.update_config(
            vec![profile("p1", 1080), profile("p2", 1081)],
            Some("p1".into()),
        )
        .await
        .unwrap();

        // p1 的健康检查很慢且会失败，期间提交切换到 p2
        probe.slow("p1", Duration::from_millis(200));
        probe.fail("p1");
        let health = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.health_check_once().await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        mgr.activate("p2").await.unwrap();
        health.await.unwrap();

        let status = mgr.status().await;
        assert_eq!(status.active_profile_id.as_deref(), Some("p2"));
        assert_eq!(status.connection_status, ConnectionStatus::Connected);
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_error.is_none());
        let last = status.last_probe.unwrap();
        assert_eq!(last.profile_id.as_deref(), Some("p2"));
        assert!(last.success);
    }

    #[tokio::test(start_paused = true)]
    async fn health_failure_during_commit_is_ignored() {
        let probe = Arc::new(MockProbe::with_latency(Duration::from_millis(40)));
        let mgr = Arc::new(manager(probe.clone()));
        mgr.update_config(
            vec![profile("p1", 1080), profile("p2", 1081)],
            Some("p1".into()),
        )
        .await
        .unwrap();

        probe.slow("p2", Duration::from_millis(200));
        probe.fail("p1");
        let pending = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.activate("p2").await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        // 提交仍在 connecting，这次失败不计入
        mgr.health_check_once().await;
        let status = mgr.status().await;
        assert_eq!(status.connection_status, ConnectionStatus::Connecting);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.active_profile_id.as_deref(), Some("p1"));

        pending.await.unwrap().unwrap();
        let status = mgr.status().await;
        assert_eq!(status.connection_status, ConnectionStatus::Connected);
        assert_eq!(status.active_profile_id.as_deref(), Some("p2"));
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_probe.unwrap().success);
    }
}
