//! 代理出口变更后的 worker 调度
//!
//! 监听 [`ProxyEvent::EgressChanged`]，按重启策略让运行中的频道切换到新出口。
//! 未被重启的频道继续使用 spawn 时的出口快照，直到下一次自然重启。

use crate::config::RestartPolicy;
use crate::proxy::{ProxyEvent, ProxyManager};
use crate::state::ProcessState;
use crate::supervisor::StreamSupervisor;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Coordinator {
    proxy: Arc<ProxyManager>,
    supervisor: Arc<StreamSupervisor>,
    policy: RestartPolicy,
}

impl Coordinator {
    /// `policy` 决定出口变更时哪些运行中的频道需要重启
    pub fn new(
        proxy: Arc<ProxyManager>,
        supervisor: Arc<StreamSupervisor>,
        policy: RestartPolicy,
    ) -> Self {
        Self {
            proxy,
            supervisor,
            policy,
        }
    }

    /// 处理代理事件直到取消
    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<ProxyEvent>, cancel: CancellationToken) {
        info!("Coordinator started (restart policy: {:?})", self.policy);
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(ProxyEvent::EgressChanged {
                    generation,
                    previous,
                    current,
                }) => {
                    info!(
                        "Egress changed {} -> {} (generation {})",
                        previous, current, generation
                    );
                    self.reconcile().await;
                }
                Ok(ProxyEvent::StatusChanged { from, to }) => {
                    debug!("Proxy status {:?} -> {:?}", from, to);
                }
                Err(RecvError::Lagged(skipped)) => {
                    // 丢失了事件，直接与当前提交状态对齐
                    warn!("Coordinator lagged by {} events, reconciling", skipped);
                    self.reconcile().await;
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!("Coordinator stopped");
    }

    /// 重启出口快照与当前生效出口不一致的频道，返回成功重启的频道
    pub async fn reconcile(&self) -> Vec<String> {
        if self.policy == RestartPolicy::Never {
            return Vec::new();
        }
        // 1. 只读取一次，不在重启期间持有提交锁
        let current = self.proxy.committed().await.egress();

        // 2. 筛选快照与当前出口不一致且策略允许重启的频道
        let targets: Vec<String> = self
            .supervisor
            .egress_snapshots()
            .into_iter()
            .filter(|s| matches!(s.state, ProcessState::Starting | ProcessState::Running))
            .filter(|s| s.egress.as_ref() != Some(&current))
            .filter(|s| self.policy == RestartPolicy::Always || s.restart_on_egress_change)
            .map(|s| s.channel_id)
            .collect();
        if targets.is_empty() {
            return targets;
        }
        info!("Restarting {} channel(s) onto egress {}", targets.len(), current);

        // 3. 并发重启，各频道互不阻塞
        let restarts = targets
            .iter()
            .map(|id| self.supervisor.restart_for_egress(id));
        let results = join_all(restarts).await;

        targets
            .into_iter()
            .zip(results)
            .filter_map(|(id, result)| match result {
                Ok(()) => Some(id),
                Err(e) => {
                    error!("Egress restart failed [{}]: {}", id, e);
                    None
                }
            })
            .collect()
    }
}
