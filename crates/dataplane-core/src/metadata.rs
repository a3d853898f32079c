//! 电路拓扑的声明式描述：连接 → 端口集 → 端口。

use std::collections::BTreeSet;

use crate::{
    descriptor::{DescriptorOptions, Role},
    distribution::DataDistribution,
    error::{DataplaneError, Result},
    layout::MAX_PCONTRIBS,
};

/// 端口编号，在电路内唯一，输出端口在前且从 0 连续编号。
pub type PortId = u32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortMetadata {
    pub id: PortId,
    /// 真实缓冲所在端点；未知时端口初始化延后。
    pub real_location: Option<String>,
    /// 影子端点。为空时取传输上下文的首个本地端点。
    pub shadow_location: Option<String>,
    pub role: Role,
    pub options: DescriptorOptions,
    /// 对端电路编号；握手请求优先使用。
    pub remote_circuit_id: Option<u32>,
    pub remote_port_id: Option<PortId>,
}

impl PortMetadata {
    pub fn new(id: PortId, real_location: impl Into<String>) -> Self {
        Self {
            id,
            real_location: Some(real_location.into()),
            shadow_location: None,
            role: Role::NoRole,
            options: DescriptorOptions::empty(),
            remote_circuit_id: None,
            remote_port_id: None,
        }
    }

    /// 真实位置待定的端口（例如等待 `Circuit::finalize` 的输出端）。
    pub fn unresolved(id: PortId) -> Self {
        Self {
            real_location: None,
            ..Self::new(id, String::new())
        }
    }

    pub fn with_shadow(mut self, location: impl Into<String>) -> Self {
        self.shadow_location = Some(location.into());
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_options(mut self, bits: u32) -> Self {
        self.options = DescriptorOptions::from_bits(bits);
        self
    }

    pub fn with_remote(mut self, circuit: u32, port: PortId) -> Self {
        self.remote_circuit_id = Some(circuit);
        self.remote_port_id = Some(port);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortSetMetadata {
    pub output: bool,
    pub buffer_count: u32,
    pub buffer_length: u32,
    pub distribution: DataDistribution,
    pub ports: Vec<PortMetadata>,
}

impl PortSetMetadata {
    pub fn output(buffer_count: u32, buffer_length: u32, distribution: DataDistribution) -> Self {
        Self {
            output: true,
            buffer_count,
            buffer_length,
            distribution,
            ports: Vec::new(),
        }
    }

    pub fn input(buffer_count: u32, buffer_length: u32, distribution: DataDistribution) -> Self {
        Self {
            output: false,
            ..Self::output(buffer_count, buffer_length, distribution)
        }
    }

    pub fn with_port(mut self, port: PortMetadata) -> Self {
        self.ports.push(port);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionMetadata {
    pub output: PortSetMetadata,
    pub inputs: Vec<PortSetMetadata>,
}

impl ConnectionMetadata {
    pub fn new(output: PortSetMetadata) -> Self {
        Self {
            output,
            inputs: Vec::new(),
        }
    }

    pub fn with_input_set(mut self, set: PortSetMetadata) -> Self {
        self.inputs.push(set);
        self
    }

    /// 下一个可用的端口编号。
    pub fn next_port_id(&self) -> PortId {
        self.all_ports().map(|p| p.id + 1).max().unwrap_or(0)
    }

    pub fn all_ports(&self) -> impl Iterator<Item = &PortMetadata> {
        self.output
            .ports
            .iter()
            .chain(self.inputs.iter().flat_map(|set| set.ports.iter()))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.output.output || self.inputs.iter().any(|set| set.output) {
            return Err(DataplaneError::invalid_argument(
                "output set must be flagged output and input sets must not",
            ));
        }
        for set in std::iter::once(&self.output).chain(self.inputs.iter()) {
            if set.buffer_count == 0 || set.buffer_length == 0 {
                return Err(DataplaneError::invalid_argument(
                    "port sets need at least one buffer of at least one byte",
                ));
            }
        }
        for (ordinal, port) in self.output.ports.iter().enumerate() {
            if port.id as usize != ordinal {
                return Err(DataplaneError::invalid_argument(format!(
                    "output port ids must be 0..n in order, found {} at {ordinal}",
                    port.id
                )));
            }
        }
        let mut seen = BTreeSet::new();
        for port in self.all_ports() {
            if port.id as usize >= MAX_PCONTRIBS {
                return Err(DataplaneError::invalid_argument(format!(
                    "port id {} exceeds the {MAX_PCONTRIBS} contributor limit",
                    port.id
                )));
            }
            if !seen.insert(port.id) {
                return Err(DataplaneError::invalid_argument(format!(
                    "port id {} is used twice",
                    port.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology() -> ConnectionMetadata {
        ConnectionMetadata::new(
            PortSetMetadata::output(2, 64, DataDistribution::parallel())
                .with_port(PortMetadata::new(0, "a")),
        )
        .with_input_set(
            PortSetMetadata::input(2, 64, DataDistribution::parallel())
                .with_port(PortMetadata::new(1, "b"))
                .with_port(PortMetadata::new(2, "b")),
        )
    }

    #[test]
    fn valid_topology_passes() {
        let meta = topology();
        meta.validate().expect("拓扑合法");
        assert_eq!(meta.next_port_id(), 3);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut meta = topology();
        meta.inputs[0].ports[1].id = 1;
        assert!(meta.validate().is_err());
    }

    #[test]
    fn ids_beyond_contributor_limit_are_rejected() {
        let mut meta = topology();
        meta.inputs[0].ports[1].id = MAX_PCONTRIBS as PortId;
        assert!(meta.validate().is_err());
    }
}
