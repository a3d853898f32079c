//! 传输上下文与电路注册表。
//!
//! # 模块角色（Why）
//! - [`TransportContext`] 是电路与端口共享的只读环境：配置、端点工厂与本地端点列表；
//! - [`Transport`] 按编号持有电路，并在本地端点的邮箱通信区上充当握手应答方。
//!
//! # 核心机制（How）
//! - 端点名先在本地端点中查找，未命中再交给 [`XferFactory`] 解析；
//! - [`Transport::check_mailboxes`] 扫描每个本地端点的邮箱槽，把请求的偏移字段从应答方端口的
//!   偏移表直接拷进请求方的偏移表，最后清空请求方的槽；
//! - 跨电路的零拷贝转发先从上游电路读出来源，再交给下游电路投递，两次借用互不重叠。
//!
//! # 契约说明（What）
//! - 未知电路或端口的请求记录告警、清槽并计入 `rejected`，不会让扫描失败；
//! - 应答方端口尚未初始化时请求留在槽中并计入 `deferred`，对端可以任意顺序启动；
//! - 单线程协作式驱动：调用方串行化 `Transport` 上的全部操作。

use std::{collections::BTreeMap, sync::Arc};

use crate::{
    buffer::{BufferRef, UpstreamRef},
    circuit::{Circuit, SendOutcome},
    config::TransportConfig,
    endpoint::{CopyKind, Endpoint, XferFactory, XferServices},
    error::{DataplaneError, ErrorKind, Result, codes},
    handshake::{MAILBOX_SLOT_SIZE, MailboxRequest, RequestKind, slot_offset},
    layout::{BUFFER_OFFSETS_SIZE, offsets},
    metadata::ConnectionMetadata,
};

/// 电路与端口共享的传输环境。
pub struct TransportContext {
    config: TransportConfig,
    factory: Arc<dyn XferFactory>,
    locals: Vec<Arc<dyn Endpoint>>,
}

impl TransportContext {
    pub fn new(
        factory: Arc<dyn XferFactory>,
        config: TransportConfig,
        locals: Vec<Arc<dyn Endpoint>>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            factory,
            locals,
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn factory(&self) -> &dyn XferFactory {
        self.factory.as_ref()
    }

    pub fn local_endpoints(&self) -> &[Arc<dyn Endpoint>] {
        &self.locals
    }

    pub fn is_local(&self, name: &str) -> bool {
        self.locals.iter().any(|ep| ep.name() == name)
    }

    pub fn local_endpoint(&self, name: &str) -> Option<&Arc<dyn Endpoint>> {
        self.locals.iter().find(|ep| ep.name() == name)
    }

    /// 影子端口未指定位置时使用的本地端点。
    pub fn default_endpoint(&self) -> Result<&Arc<dyn Endpoint>> {
        self.locals
            .first()
            .ok_or_else(|| DataplaneError::invalid_argument("transport has no local endpoint"))
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Endpoint>> {
        match self.local_endpoint(name) {
            Some(ep) => Ok(Arc::clone(ep)),
            None => self.factory.endpoint(name),
        }
    }

    pub fn services(&self, source: &Arc<dyn Endpoint>, target: &Arc<dyn Endpoint>) -> Result<Arc<dyn XferServices>> {
        self.factory.services(source, target)
    }
}

impl std::fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportContext")
            .field("config", &self.config)
            .field(
                "locals",
                &self.locals.iter().map(|ep| ep.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// 一次邮箱扫描的统计。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MailboxReport {
    pub served: usize,
    pub rejected: usize,
    /// 应答方端口尚未初始化、留待下一轮的请求。
    pub deferred: usize,
}

/// 电路注册表与邮箱应答方。
#[derive(Debug)]
pub struct Transport {
    ctx: Arc<TransportContext>,
    circuits: BTreeMap<u32, Circuit>,
}

impl Transport {
    pub fn new(
        factory: Arc<dyn XferFactory>,
        config: TransportConfig,
        locals: Vec<Arc<dyn Endpoint>>,
    ) -> Result<Self> {
        let ctx = TransportContext::new(factory, config, locals)?;
        tracing::info!(
            locals = ctx.local_endpoints().len(),
            zero_copy = ctx.config().zero_copy,
            "transport created"
        );
        Ok(Self {
            ctx: Arc::new(ctx),
            circuits: BTreeMap::new(),
        })
    }

    pub fn context(&self) -> &Arc<TransportContext> {
        &self.ctx
    }

    /// 创建电路。编号重复时返回 `InvalidArgument`。
    pub fn create_circuit(&mut self, id: u32, metadata: ConnectionMetadata) -> Result<&mut Circuit> {
        if self.circuits.contains_key(&id) {
            return Err(DataplaneError::invalid_argument(format!("circuit {id} already exists")).with_circuit(id));
        }
        let circuit = Circuit::new(id, Arc::clone(&self.ctx), metadata)?;
        Ok(self.circuits.entry(id).or_insert(circuit))
    }

    pub fn circuit(&self, id: u32) -> Option<&Circuit> {
        self.circuits.get(&id)
    }

    pub fn circuit_mut(&mut self, id: u32) -> Option<&mut Circuit> {
        self.circuits.get_mut(&id)
    }

    pub fn circuit_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.circuits.keys().copied()
    }

    fn circuit_or_err(&mut self, id: u32) -> Result<&mut Circuit> {
        self.circuits.get_mut(&id).ok_or_else(|| unknown_circuit(id))
    }

    /// 释放一次引用；引用归零的电路从注册表移除。
    pub fn release_circuit(&mut self, id: u32) -> Result<bool> {
        let released = self.circuit_or_err(id)?.release();
        if released {
            self.circuits.remove(&id);
            tracing::debug!(circuit = id, "circuit removed");
        }
        Ok(released)
    }

    /// 把 `input_circuit` 中已满的输入缓冲作为 `output_circuit` 输出端口的数据转发出去。
    ///
    /// 上游缓冲在下游传输完成后才被归还；下游暂无空闲缓冲时排队。
    pub fn send_zcopy_input_buffer(
        &mut self,
        output_circuit: u32,
        output_port: usize,
        input_circuit: u32,
        input: BufferRef,
        len: u64,
    ) -> Result<SendOutcome> {
        if output_circuit == input_circuit {
            return Err(DataplaneError::invalid_argument(
                "zero-copy forwarding needs two different circuits",
            )
            .with_circuit(output_circuit));
        }
        let upstream = UpstreamRef {
            circuit: input_circuit,
            buffer: input,
        };
        let source = self
            .circuits
            .get(&input_circuit)
            .ok_or_else(|| unknown_circuit(input_circuit))?
            .forward_source(input, len)?;
        let outcome = self
            .circuit_or_err(output_circuit)?
            .send_zcopy_input_buffer(output_port, upstream, source)?;
        self.drain_released_upstreams()?;
        Ok(outcome)
    }

    /// 归还输入缓冲，并沿零拷贝链归还被释放的上游。
    pub fn consume(&mut self, circuit: u32, buf: BufferRef) -> Result<()> {
        if let Some(upstream) = self.circuit_or_err(circuit)?.consume(buf)? {
            self.circuit_or_err(circuit)?.push_released_upstream(upstream);
        }
        self.drain_released_upstreams()
    }

    /// 驱动全部电路：重试排队传输并归还被释放的上游，返回发出的传输数。
    pub fn service(&mut self) -> Result<usize> {
        let mut sent = 0;
        for circuit in self.circuits.values_mut() {
            if circuit.is_ready() {
                sent += circuit.check_queued_transfers()?;
            }
        }
        self.drain_released_upstreams()?;
        Ok(sent)
    }

    fn drain_released_upstreams(&mut self) -> Result<()> {
        loop {
            let released: Vec<UpstreamRef> = self
                .circuits
                .values_mut()
                .flat_map(Circuit::take_released_upstreams)
                .collect();
            if released.is_empty() {
                return Ok(());
            }
            for upstream in released {
                let circuit = self.circuit_or_err(upstream.circuit)?;
                if let Some(next) = circuit.consume(upstream.buffer)? {
                    circuit.push_released_upstream(next);
                }
            }
        }
    }

    /// 作为应答方扫描本地端点的邮箱槽。
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn check_mailboxes(&mut self) -> Result<MailboxReport> {
        let mut report = MailboxReport::default();
        let locals: Vec<Arc<dyn Endpoint>> = self.ctx.local_endpoints().to_vec();
        for local in &locals {
            let memory = local.memory();
            for mb in 0..local.max_mailboxes() {
                if mb == local.mailbox() {
                    continue;
                }
                let slot = slot_offset(mb);
                let mut raw = [0u8; MAILBOX_SLOT_SIZE as usize];
                memory.read(slot, &mut raw)?;
                let request = match MailboxRequest::decode(&raw) {
                    Ok(request) => request,
                    Err(err) => {
                        tracing::warn!(endpoint = local.name(), mailbox = mb, error = %err, "malformed mailbox slot");
                        memory.write(slot, &[0u8; MAILBOX_SLOT_SIZE as usize])?;
                        report.rejected += 1;
                        continue;
                    }
                };
                if request.kind == RequestKind::NoRequest {
                    continue;
                }
                memory.write(slot, &[0u8; MAILBOX_SLOT_SIZE as usize])?;
                match self.serve(local, mb, &request) {
                    Ok(()) => report.served += 1,
                    Err(err) if err.code() == codes::UNKNOWN_CIRCUIT => {
                        tracing::warn!(
                            endpoint = local.name(),
                            circuit = request.circuit_id,
                            port = request.port_id,
                            error = %err,
                            "mailbox request for unknown circuit or port"
                        );
                        self.clear_requester_slot(local, mb, &request)?;
                        report.rejected += 1;
                    }
                    Err(err) if err.kind() == ErrorKind::NotReady => {
                        // 应答方端口尚未初始化：请求原样放回，下一轮扫描再处理。
                        tracing::debug!(
                            endpoint = local.name(),
                            circuit = request.circuit_id,
                            port = request.port_id,
                            error = %err,
                            "mailbox request deferred"
                        );
                        memory.write(slot, &raw)?;
                        report.deferred += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        if report.served + report.rejected + report.deferred > 0 {
            tracing::debug!(
                served = report.served,
                rejected = report.rejected,
                deferred = report.deferred,
                "mailboxes checked"
            );
        }
        Ok(report)
    }

    fn clear_requester_slot(&self, local: &Arc<dyn Endpoint>, mb: u16, request: &MailboxRequest) -> Result<()> {
        let requester = self.ctx.resolve(&request.url)?;
        let services = self.ctx.services(local, &requester)?;
        let mut xfer = services.create_request();
        xfer.copy(slot_offset(mb), slot_offset(mb), MAILBOX_SLOT_SIZE, CopyKind::Flag)?;
        xfer.post()?;
        Ok(())
    }

    fn serve(&mut self, local: &Arc<dyn Endpoint>, mb: u16, request: &MailboxRequest) -> Result<()> {
        let ctx = Arc::clone(&self.ctx);
        let circuit = self
            .circuits
            .get_mut(&request.circuit_id)
            .ok_or_else(|| unknown_circuit(request.circuit_id))?;
        let port_ref = circuit.topology().find(request.port_id).ok_or_else(|| {
            unknown_circuit(request.circuit_id).with_port(request.port_id)
        })?;
        let port = circuit.topology().port(port_ref)?;
        let source = port
            .local_endpoint()
            .cloned()
            .ok_or_else(|| DataplaneError::not_ready("responding port is not initialized").with_port(port.id()))?;
        let requester = ctx.resolve(&request.url)?;
        let services = ctx.services(&source, &requester)?;
        let mut xfer = services.create_request();

        let table = port.offsets_table_offset()?;
        let entries = request.return_size.min(port.buffer_count() as u64);
        let (field, len) = match request.kind {
            RequestKind::ShadowRstateOffset => (offsets::shadow(local.mailbox() as usize), 8),
            RequestKind::InputOffsets => (offsets::BUFFER, offsets::PORT_SET_CONTROL),
            RequestKind::OutputControlOffset => (offsets::BUFFER, offsets::SHADOWS),
            RequestKind::NoRequest => return Ok(()),
        };

        let mut staged = None;
        if request.kind == RequestKind::OutputControlOffset && request.protocol_size > 0 {
            staged = circuit.take_staged_protocol();
            if let Some(lease) = &staged {
                let protocol_services = ctx.services(lease.endpoint(), &requester)?;
                let mut protocol = protocol_services.create_request();
                protocol.copy(
                    lease.offset(),
                    request.protocol_offset,
                    lease.size().min(request.protocol_size),
                    CopyKind::Data,
                )?;
                protocol.post()?;
            }
        }

        for tid in 0..entries {
            let at = tid * BUFFER_OFFSETS_SIZE + field;
            xfer.copy(table + at, request.return_offset + at, len, CopyKind::Metadata)?;
        }
        if source.name() == local.name() {
            xfer.copy(slot_offset(mb), slot_offset(mb), MAILBOX_SLOT_SIZE, CopyKind::Flag)?;
            xfer.post()?;
        } else {
            xfer.post()?;
            self.clear_requester_slot(local, mb, request)?;
        }
        if let Some(lease) = staged {
            lease.release()?;
        }
        tracing::debug!(
            circuit = request.circuit_id,
            port = request.port_id,
            kind = ?request.kind,
            to = %request.url,
            entries,
            "mailbox request served"
        );
        Ok(())
    }
}

fn unknown_circuit(id: u32) -> DataplaneError {
    DataplaneError::new(
        codes::UNKNOWN_CIRCUIT,
        ErrorKind::InvalidArgument,
        format!("no circuit {id}"),
    )
    .with_circuit(id)
}
