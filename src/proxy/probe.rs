use super::profile::Egress;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// 通过指定出口访问探测目标
///
/// 实现必须使用与 worker 完全相同的代理传输 (SOCKS5 / HTTP CONNECT)，
/// 这样探测通过才能说明 worker 可以连通。
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn check(&self, egress: &Egress, target: &str) -> std::result::Result<(), String>;
}

/// 基于 reqwest 的探测，代理 URL 与注入 worker 环境变量的值一致
pub struct HttpProbe {
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn client(&self, egress: &Egress) -> reqwest::Result<reqwest::Client> {
        let builder = reqwest::Client::builder()
            .connect_timeout(self.timeout)
            .timeout(self.timeout);
        let builder = match egress.proxy_url() {
            Some(url) => builder.proxy(reqwest::Proxy::all(url)?),
            // 直连时忽略系统代理变量，和 worker 的环境保持一致
            None => builder.no_proxy(),
        };
        builder.build()
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn check(&self, egress: &Egress, target: &str) -> std::result::Result<(), String> {
        let client = self.client(egress).map_err(|e| e.to_string())?;
        // 只要拿到 HTTP 响应就说明隧道可用，不关心目标站点本身的状态码
        client
            .get(target)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// 单次探测结果
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProbeSample {
    pub success: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

impl ProbeSample {
    pub fn from_result(result: &Result<Duration>) -> Self {
        match result {
            Ok(latency) => Self {
                success: true,
                latency_ms: Some(latency.as_millis() as u64),
                error: None,
            },
            Err(e) => Self {
                success: false,
                latency_ms: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// 带超时的单次探测，成功时返回延迟
pub async fn run_probe(
    probe: &dyn ConnectivityProbe,
    egress: &Egress,
    target: &str,
    timeout: Duration,
) -> Result<Duration> {
    let started = Instant::now();
    match tokio::time::timeout(timeout, probe.check(egress, target)).await {
        Ok(Ok(())) => Ok(started.elapsed()),
        Ok(Err(reason)) => Err(Error::ProbeFailure {
            egress: egress.to_string(),
            reason,
        }),
        Err(_) => Err(Error::ProbeTimeout {
            egress: egress.to_string(),
            timeout,
        }),
    }
}
