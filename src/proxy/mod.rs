//! 代理配置、连通性探测与状态管理

mod manager;
mod probe;
mod profile;

pub use manager::{ProxyAction, ProxyEvent, ProxyManager};
pub use probe::{ConnectivityProbe, HttpProbe, ProbeSample};
pub use profile::{Egress, ProxyProfile, PROXY_ENV_VARS};

#[cfg(test)]
pub use profile::ProxyKind;
