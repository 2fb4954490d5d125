use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use url::Url;

/// 代理类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Direct,
    Socks5,
    Http,
}

impl ProxyKind {
    fn scheme(self) -> Option<&'static str> {
        match self {
            ProxyKind::Direct => None,
            // socks5h: 由代理端解析域名，与 worker 的行为保持一致
            ProxyKind::Socks5 => Some("socks5h"),
            ProxyKind::Http => Some("http"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// 一条代理配置，创建后不可修改，编辑即整体替换
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyProfile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub kind: ProxyKind,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ProxyProfile {
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() || self.id.chars().any(char::is_whitespace) {
            return Err(Error::Validation(format!(
                "profile id `{}` must be non-empty without whitespace",
                self.id
            )));
        }
        if self.kind == ProxyKind::Direct {
            return Ok(());
        }
        let host = self.host.trim();
        if host.is_empty()
            || host.len() != self.host.len()
            || host.contains("://")
            || host.contains(['/', '@', ' '])
        {
            return Err(Error::Validation(format!(
                "profile `{}` has malformed host `{}`",
                self.id, self.host
            )));
        }
        if self.port == 0 {
            return Err(Error::Validation(format!(
                "profile `{}` has invalid port 0",
                self.id
            )));
        }
        self.proxy_url().map(|_| ())
    }

    /// 代理地址 (含凭据)，直连返回 None
    pub fn proxy_url(&self) -> Result<Option<Url>> {
        let Some(scheme) = self.kind.scheme() else {
            return Ok(None);
        };
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let invalid = |reason: String| {
            Error::Validation(format!("profile `{}`: {}", self.id, reason))
        };
        let mut url = Url::parse(&format!("{}://{}:{}", scheme, host, self.port))
            .map_err(|e| invalid(e.to_string()))?;
        if let Some(creds) = &self.credentials {
            url.set_username(&creds.username)
                .map_err(|_| invalid("cannot set username".into()))?;
            url.set_password(Some(&creds.password))
                .map_err(|_| invalid("cannot set password".into()))?;
        }
        Ok(Some(url))
    }

    /// 对外展示用，隐藏密码
    pub fn redacted(&self) -> ProxyProfile {
        let mut profile = self.clone();
        if let Some(creds) = profile.credentials.as_mut() {
            creds.password = "******".to_string();
        }
        profile
    }
}

/// worker 进程与探测使用的网络出口
///
/// 在 spawn 时捕获，进程存活期间不再修改。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Egress {
    pub profile_id: Option<String>,
    pub kind: ProxyKind,
    #[serde(skip)]
    proxy_url: Option<String>,
}

/// 注入 / 清除的代理环境变量
pub const PROXY_ENV_VARS: [&str; 6] = [
    "ALL_PROXY",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "all_proxy",
    "http_proxy",
    "https_proxy",
];

impl Egress {
    pub fn direct() -> Self {
        Self {
            profile_id: None,
            kind: ProxyKind::Direct,
            proxy_url: None,
        }
    }

    pub fn for_profile(profile: &ProxyProfile) -> Result<Self> {
        Ok(Self {
            profile_id: Some(profile.id.clone()),
            kind: profile.kind,
            proxy_url: profile.proxy_url()?.map(|u| u.to_string()),
        })
    }

    pub fn proxy_url(&self) -> Option<&str> {
        self.proxy_url.as_deref()
    }

    pub fn is_direct(&self) -> bool {
        self.proxy_url.is_none()
    }

    /// 子进程环境变量；直连时为空 (调用方负责清除继承的代理变量)
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        match &self.proxy_url {
            Some(url) => PROXY_ENV_VARS.iter().map(|k| (*k, url.clone())).collect(),
            None => Vec::new(),
        }
    }
}

impl fmt::Display for Egress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.profile_id {
            Some(id) => write!(f, "{}", id),
            None => write!(f, "direct"),
        }
    }
}

/// 代理配置集合与当前生效的配置
#[derive(Debug, Clone)]
pub struct ProfileStore {
    profiles: Vec<Arc<ProxyProfile>>,
    active_id: Option<String>,
    egress: Egress,
}

impl Default for ProfileStore {
    fn default() -> Self {
        Self {
            profiles: Vec::new(),
            active_id: None,
            egress: Egress::direct(),
        }
    }
}

impl ProfileStore {
    /// 校验整个集合：id 唯一、地址合法、active 必须存在且已启用
    pub fn new(profiles: Vec<ProxyProfile>, active_id: Option<String>) -> Result<Self> {
        let mut seen = HashSet::new();
        for profile in &profiles {
            profile.validate()?;
            if !seen.insert(profile.id.as_str()) {
                return Err(Error::Validation(format!(
                    "duplicate profile id `{}`",
                    profile.id
                )));
            }
        }

        let egress = match &active_id {
            None => Egress::direct(),
            Some(id) => {
                let profile = profiles
                    .iter()
                    .find(|p| &p.id == id)
                    .ok_or_else(|| {
                        Error::Validation(format!("active profile `{}` is not in the set", id))
                    })?;
                if !profile.enabled {
                    return Err(Error::Validation(format!("profile `{}` is disabled", id)));
                }
                Egress::for_profile(profile)?
            }
        };

        Ok(Self {
            profiles: profiles.into_iter().map(Arc::new).collect(),
            active_id,
            egress,
        })
    }

    pub fn profiles(&self) -> &[Arc<ProxyProfile>] {
        &self.profiles
    }

    pub fn get(&self, id: &str) -> Option<&Arc<ProxyProfile>> {
        self.profiles.iter().find(|p| p.id == id)
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active_id.as_deref()
    }

    pub fn egress(&self) -> &Egress {
        &self.egress
    }

    /// 克隆出可编辑的配置列表
    pub fn to_vec(&self) -> Vec<ProxyProfile> {
        self.profiles.iter().map(|p| (**p).clone()).collect()
    }
}
