use crate::{
    buffer::{PortRef, PortSetId},
    distribution::DataDistribution,
    error::{DataplaneError, Result},
    metadata::{PortId, PortMetadata, PortSetMetadata},
    port::Port,
};

/// 一组共享缓冲数量、长度与分布方式的端口。
#[derive(Debug)]
pub struct PortSet {
    output: bool,
    buffer_count: usize,
    buffer_length: u64,
    distribution: DataDistribution,
    alignment: u64,
    pub(crate) ports: Vec<Port>,
}

impl PortSet {
    pub(crate) fn new(meta: &PortSetMetadata, alignment: u64) -> Self {
        let mut set = Self {
            output: meta.output,
            buffer_count: meta.buffer_count as usize,
            buffer_length: u64::from(meta.buffer_length),
            distribution: meta.distribution,
            alignment,
            ports: Vec::with_capacity(meta.ports.len()),
        };
        for port in &meta.ports {
            set.add_port(port.clone());
        }
        set
    }

    /// 追加端口，返回其 rank。
    pub(crate) fn add_port(&mut self, meta: PortMetadata) -> usize {
        let rank = self.ports.len();
        self.ports.push(Port::new(
            meta,
            self.output,
            rank,
            self.buffer_count,
            self.buffer_length,
            self.alignment,
        ));
        rank
    }

    pub fn is_output(&self) -> bool {
        self.output
    }

    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    pub fn buffer_length(&self) -> u64 {
        self.buffer_length
    }

    pub fn distribution(&self) -> &DataDistribution {
        &self.distribution
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    pub fn port(&self, index: usize) -> Option<&Port> {
        self.ports.get(index)
    }

    pub(crate) fn port_mut(&mut self, index: usize) -> Option<&mut Port> {
        self.ports.get_mut(index)
    }

    pub fn index_of(&self, id: PortId) -> Option<usize> {
        self.ports.iter().position(|port| port.id() == id)
    }
}

/// 电路的端口拓扑：一个输出端口集与若干输入端口集。
#[derive(Debug)]
pub struct Topology {
    pub output: PortSet,
    pub inputs: Vec<PortSet>,
}

impl Topology {
    pub fn set(&self, id: PortSetId) -> Option<&PortSet> {
        match id {
            PortSetId::Output => Some(&self.output),
            PortSetId::Input(set) => self.inputs.get(set),
        }
    }

    pub(crate) fn set_mut(&mut self, id: PortSetId) -> Option<&mut PortSet> {
        match id {
            PortSetId::Output => Some(&mut self.output),
            PortSetId::Input(set) => self.inputs.get_mut(set),
        }
    }

    pub fn port(&self, port: PortRef) -> Result<&Port> {
        self.set(port.set)
            .and_then(|set| set.port(port.index))
            .ok_or_else(|| unknown_port(port))
    }

    pub(crate) fn port_mut(&mut self, port: PortRef) -> Result<&mut Port> {
        self.set_mut(port.set)
            .and_then(|set| set.port_mut(port.index))
            .ok_or_else(|| unknown_port(port))
    }

    /// 按 (端口集, rank) 顺序遍历全部端口。
    pub fn ports(&self) -> impl Iterator<Item = (PortRef, &Port)> {
        let outputs = self
            .output
            .ports()
            .iter()
            .enumerate()
            .map(|(idx, port)| (PortRef::output(idx), port));
        let inputs = self.inputs.iter().enumerate().flat_map(|(set, ports)| {
            ports
                .ports()
                .iter()
                .enumerate()
                .map(move |(idx, port)| (PortRef::input(set, idx), port))
        });
        outputs.chain(inputs)
    }

    /// 按端口编号查找。
    pub fn find(&self, id: PortId) -> Option<PortRef> {
        self.ports().find(|(_, port)| port.id() == id).map(|(port_ref, _)| port_ref)
    }
}

fn unknown_port(port: PortRef) -> DataplaneError {
    DataplaneError::invalid_argument(format!("no port at {port:?}"))
}
