use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// 一路需要转发/转码的直播流
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// 拉流地址 (RTMP 等)
    pub source: String,
    /// 追加在 `-i <source>` 之后的参数，支持 `{output_dir}` 占位符
    #[serde(default)]
    pub output_args: Vec<String>,
    #[serde(default)]
    pub auto_start: bool,
    /// 在 `opt_in` 策略下，出口切换时是否重启
    #[serde(default)]
    pub restart_on_egress_change: bool,
}

impl Channel {
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Validation("channel id must not be empty".into()));
        }
        if self.id.contains('/') || self.id.contains("..") {
            return Err(Error::Validation(format!(
                "channel id `{}` contains path characters",
                self.id
            )));
        }
        if self.source.trim().is_empty() {
            return Err(Error::Validation(format!(
                "channel `{}` has no source",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(id: &str, source: &str) -> Channel {
        Channel {
            id: id.into(),
            name: String::new(),
            source: source.into(),
            output_args: vec![],
            auto_start: false,
            restart_on_egress_change: false,
        }
    }

    #[test]
    fn validation() {
        assert!(channel("cam1", "rtmp://a/live").validate().is_ok());
        assert!(channel(" ", "rtmp://a/live").validate().is_err());
        assert!(channel("../etc", "rtmp://a/live").validate().is_err());
        assert!(channel("cam1", "").validate().is_err());
    }
}
