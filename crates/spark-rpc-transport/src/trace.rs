use crate::{error::Result, properties::Properties};

/// `tracing` 目标名：网络层事件。
pub const NETWORK_TARGET: &str = "spark::network";
/// `tracing` 目标名：安全层事件。
pub const SECURITY_TARGET: &str = "spark::security";

/// 追踪级别配置。
///
/// 传输层的追踪事件统一经由 `tracing` 发出；本结构体决定“是否值得发出”，
/// 订阅者（`tracing-subscriber` 等）决定“发往哪里”。级别为 0 时完全静默。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TraceLevels {
    pub network: i32,
    pub security: i32,
}

impl TraceLevels {
    /// 从 `Spark.Trace.Network` 与 `Spark.Trace.Security` 读取级别。
    pub fn from_properties(properties: &Properties) -> Result<Self> {
        Ok(Self {
            network: properties.get_property_as_int("Spark.Trace.Network")?,
            security: properties.get_property_as_int("Spark.Trace.Security")?,
        })
    }

    /// 网络事件是否达到追踪阈值。
    pub fn network_enabled(&self, level: i32) -> bool {
        self.network >= level
    }

    /// 安全事件是否达到追踪阈值。
    pub fn security_enabled(&self, level: i32) -> bool {
        self.security >= level
    }
}
