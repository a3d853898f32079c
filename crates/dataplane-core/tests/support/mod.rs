//! 集成测试共用的拓扑搭建工具。
//!
//! 每个测试文件只用到其中一部分，未用到的函数不应触发告警。
#![allow(dead_code)]

use std::sync::Arc;

use dataplane_core::{
    BufferRef, Circuit, ConnectionMetadata, DataDistribution, Endpoint, MailboxId, PortMetadata,
    PortRef, PortSetMetadata, SendOutcome, Transport, TransportConfig, XferFactory,
};
use dataplane_smb::Fabric;

pub const ENDPOINT_SIZE: u64 = 1 << 20;

/// 一台“主机”：一个本地端点加一个传输实例。
pub struct Host {
    pub endpoint: Arc<dyn Endpoint>,
    pub transport: Transport,
}

impl Host {
    pub fn name(&self) -> String {
        self.endpoint.name().to_owned()
    }

    pub fn circuit(&mut self, id: u32) -> &mut Circuit {
        self.transport.circuit_mut(id).expect("电路应已创建")
    }
}

pub fn config(zero_copy: bool) -> TransportConfig {
    TransportConfig {
        zero_copy,
        ..TransportConfig::default()
    }
}

pub fn host(fabric: &Arc<Fabric>, address: &str, mailbox: MailboxId, config: TransportConfig) -> Host {
    let endpoint = fabric
        .create_endpoint(address, ENDPOINT_SIZE, mailbox, 16)
        .expect("创建端点");
    let factory: Arc<dyn XferFactory> = fabric.clone();
    let transport = Transport::new(factory, config, vec![Arc::clone(&endpoint)]).expect("创建传输实例");
    Host { endpoint, transport }
}

/// 单输出端口 → 单输入端口集的并行整块拓扑。
pub fn parallel(out_at: &str, in_at: &[&str], count: u32, len: u32) -> ConnectionMetadata {
    let mut inputs = PortSetMetadata::input(count, len, DataDistribution::parallel());
    for (offset, location) in in_at.iter().enumerate() {
        inputs = inputs.with_port(PortMetadata::new(1 + offset as u32, *location));
    }
    ConnectionMetadata::new(
        PortSetMetadata::output(count, len, DataDistribution::parallel())
            .with_port(PortMetadata::new(0, out_at)),
    )
    .with_input_set(inputs)
}

/// 轮询两端的就绪与邮箱，直到两端都就绪。
pub fn connect(a: &mut Host, b: &mut Host, id: u32) {
    for _ in 0..8 {
        let a_ready = a.circuit(id).ready().expect("a 轮询就绪");
        let b_ready = b.circuit(id).ready().expect("b 轮询就绪");
        if a_ready && b_ready {
            return;
        }
        a.transport.check_mailboxes().expect("a 应答邮箱");
        b.transport.check_mailboxes().expect("b 应答邮箱");
    }
    panic!("电路 {id} 在 8 轮握手内未就绪");
}

/// 取空缓冲、写入载荷并发送。
pub fn send(circuit: &mut Circuit, port: usize, payload: &[u8]) -> (BufferRef, SendOutcome) {
    let buf = circuit
        .get_next_empty_output_buffer(port)
        .expect("取空缓冲")
        .expect("应有空闲输出缓冲");
    circuit.write_output(buf, payload).expect("写入载荷");
    let outcome = circuit
        .send_output_buffer(buf, payload.len() as u64, 0, false)
        .expect("发送");
    (buf, outcome)
}

/// 取下一个满输入缓冲并读出载荷，不归还。
pub fn receive(circuit: &mut Circuit, port: PortRef) -> (BufferRef, Vec<u8>) {
    let buf = circuit
        .get_next_full_input_buffer(port)
        .expect("取满缓冲")
        .expect("应有满输入缓冲");
    let data = circuit.input_data(buf).expect("读取载荷").to_vec();
    (buf, data)
}
