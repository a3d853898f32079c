//! 传输上下文的配置模型。
//!
//! # 模块角色（Why）
//! - 将零拷贝开关、邮箱握手开关与缓冲默认值集中到一个可序列化结构，宿主可以从 TOML 文件加载；
//! - 日志过滤器也在此声明，由 `dataplane-otel` 在安装订阅器时读取。
//!
//! # 契约说明（What）
//! - 缺失字段全部回落到 [`Default`]；
//! - [`TransportConfig::validate`] 拒绝 0 个缓冲、0 字节缓冲以及非 2 的幂对齐。

use serde::Deserialize;

use crate::error::{DataplaneError, ErrorKind, Result, codes};

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// 两端真实位置都在本进程时，是否以零拷贝移交替代数据拷贝。
    pub zero_copy: bool,
    /// 是否通过共享内存邮箱交换偏移；关闭后只能走描述符路径。
    pub use_mailboxes: bool,
    /// 元数据未指定时的缓冲数量。
    pub default_buffer_count: u32,
    /// 元数据未指定时的缓冲字节数。
    pub default_buffer_size: u32,
    /// 端口向分配器请求区间时使用的对齐。
    pub buffer_alignment: u64,
    pub logging: LoggingConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            zero_copy: true,
            use_mailboxes: true,
            default_buffer_count: 2,
            default_buffer_size: 2048,
            buffer_alignment: 16,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` 语法的过滤表达式；`RUST_LOG` 存在时优先。
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_owned(),
        }
    }
}

impl TransportConfig {
    /// 解析 TOML 文本并校验取值。
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: TransportConfig = toml::from_str(input).map_err(|err| {
            DataplaneError::new(
                codes::INVALID_CONFIG,
                ErrorKind::InvalidArgument,
                "transport configuration is not valid TOML",
            )
            .with_cause(err)
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_buffer_count == 0 {
            return Err(invalid("default_buffer_count must be at least 1"));
        }
        if self.default_buffer_size == 0 {
            return Err(invalid("default_buffer_size must be at least 1"));
        }
        if !self.buffer_alignment.is_power_of_two() {
            return Err(invalid("buffer_alignment must be a power of two"));
        }
        Ok(())
    }
}

fn invalid(message: &'static str) -> DataplaneError {
    DataplaneError::new(codes::INVALID_CONFIG, ErrorKind::InvalidArgument, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = TransportConfig::from_toml_str("").expect("空配置应回落默认值");
        assert_eq!(config, TransportConfig::default());
        assert!(config.zero_copy);
    }

    #[test]
    fn partial_document_overrides_fields() {
        let config = TransportConfig::from_toml_str(
            r#"
            zero_copy = false
            default_buffer_count = 4

            [logging]
            filter = "dataplane_core=debug"
            "#,
        )
        .expect("解析配置");
        assert!(!config.zero_copy);
        assert_eq!(config.default_buffer_count, 4);
        assert_eq!(config.default_buffer_size, 2048);
        assert_eq!(config.logging.filter, "dataplane_core=debug");
    }

    #[test]
    fn rejects_invalid_alignment() {
        let err = TransportConfig::from_toml_str("buffer_alignment = 24").expect_err("24 不是 2 的幂");
        assert_eq!(err.code(), codes::INVALID_CONFIG);
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = TransportConfig::from_toml_str("zero_copies = true").expect_err("未知字段应报错");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
