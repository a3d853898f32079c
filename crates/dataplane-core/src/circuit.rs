//! 电路：一个输出端口集与若干输入端口集组成的连接，对外提供缓冲级的收发接口。
//!
//! # 模块角色（Why）
//! - 电路是用户唯一直接操作的实体：取空缓冲、发送、取满缓冲、消费；
//! - 端口握手、模板生成与控制器调度全部收敛在电路内部，用户只需轮询 [`Circuit::ready`]。
//!
//! # 核心机制（How）
//! - 就绪判定单调：首次全部端口就绪时生成模板并创建控制器，此后直到 [`Circuit::reset`] 保持就绪；
//! - 发送被拒时按输出端口序号排队，[`Circuit::check_queued_transfers`] 严格按 FIFO 重试；
//! - 多个输入端口集时，一个输出缓冲要在每个端口集都发送完成后才允许置空；
//! - 协议字符串由输出端暂存、输入端预留，握手应答时一次性搬运。
//!
//! # 契约说明（What）
//! - 就绪前的传输调用返回 `NotReady`；
//! - 缓冲引用是 (端口, 编号) 索引，电路销毁后失效；
//! - 所有方法要求调用方串行化访问。

use std::{collections::VecDeque, fmt, sync::Arc};

use bytes::Bytes;

use crate::{
    buffer::{BufferRef, PortRef, PortSetId, UpstreamRef},
    controller::{
        ForwardSource, ProduceOutcome, TransferController, TransferPattern, input_buffer_mut,
        output_buffer, output_buffer_mut, release_if_done,
    },
    descriptor::{DescriptorType, Descriptors},
    distribution::Selector,
    endpoint::EndpointAddress,
    error::{DataplaneError, Result},
    generator::TemplateGenerator,
    layout::{BufferMetaData, EF_FULL, MAX_PCONTRIBS},
    metadata::{ConnectionMetadata, PortId, PortMetadata},
    port::{OutputPeer, PortRole, ProtocolSlot},
    port_set::{PortSet, Topology},
    resource::OffsetLease,
    transport::TransportContext,
};

/// 电路对外报告的连接状态。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CircuitStatus {
    Active,
    Disconnecting,
    #[default]
    Unknown,
}

/// 一次发送请求的去向。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// 模板已投递。
    Sent,
    /// 目标不空闲，缓冲进入该输出端口的重试队列。
    Queued,
}

/// 描述符交换的一步：`send` 为需要发给对端的描述符，`done` 表示本端口已完成定义。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalizeOutcome {
    pub send: Option<Descriptors>,
    pub done: bool,
}

/// 协议字符串所在的区间。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolInfo {
    pub size: u64,
    pub offset: u64,
}

struct QueuedTransfer {
    buffer: BufferRef,
    broadcast: bool,
    pending_sets: Vec<usize>,
    source: Option<ForwardSource>,
}

struct PendingForward {
    port: usize,
    upstream: UpstreamRef,
    source: ForwardSource,
}

#[derive(Default)]
struct ProtocolState {
    staged: Option<OffsetLease>,
    reserved: Option<OffsetLease>,
    info: Option<ProtocolInfo>,
    bytes: Option<Vec<u8>>,
}

/// 一个输出端口集到若干输入端口集的连接。
///
/// # 设计背景（Why）
/// - 电路是引擎的调度单元：端口拓扑、每个输入端口集的传输控制器与重试队列都归它所有，
///   调用方只通过缓冲引用与它交互；
///
/// # 逻辑解析（How）
/// - `ready` 在全部端口完成握手后生成模板并建立控制器；
/// - 输出侧按“取空缓冲 → 写入 → 发送”使用，发送被拒时排队，由 `check_queued_transfers` 重试；
/// - 输入侧按“取满缓冲 → 读取 → 归还”使用，缓冲编号严格循环。
///
/// # 契约说明（What）
/// - 就绪前所有传输操作返回可重试的 `NotReady`；
/// - 单线程协作式驱动，调用方串行化同一电路上的全部操作。
pub struct Circuit {
    id: u32,
    ctx: Arc<TransportContext>,
    metadata: ConnectionMetadata,
    topology: Topology,
    controllers: Vec<TransferController>,
    queues: Vec<VecDeque<QueuedTransfer>>,
    zcopy_queue: VecDeque<PendingForward>,
    released: Vec<UpstreamRef>,
    open: bool,
    ready: bool,
    status: CircuitStatus,
    ref_count: u32,
    last_port_set: usize,
    protocol: ProtocolState,
    sequence: u32,
    timestamp: u64,
}

impl Circuit {
    pub(crate) fn new(id: u32, ctx: Arc<TransportContext>, metadata: ConnectionMetadata) -> Result<Self> {
        if id == 0 {
            return Err(DataplaneError::invalid_argument("circuit id 0 is reserved"));
        }
        metadata.validate().map_err(|err| err.with_circuit(id))?;
        let align = ctx.config().buffer_alignment;
        let topology = Topology {
            output: PortSet::new(&metadata.output, align),
            inputs: metadata
                .inputs
                .iter()
                .map(|set| PortSet::new(set, align))
                .collect(),
        };
        let queues = (0..topology.output.port_count()).map(|_| VecDeque::new()).collect();
        let mut circuit = Self {
            id,
            ctx,
            metadata,
            topology,
            controllers: Vec::new(),
            queues,
            zcopy_queue: VecDeque::new(),
            released: Vec::new(),
            open: true,
            ready: false,
            status: CircuitStatus::Unknown,
            ref_count: 1,
            last_port_set: 0,
            protocol: ProtocolState::default(),
            sequence: 0,
            timestamp: 0,
        };
        circuit.update_connection();
        tracing::debug!(circuit = id, open = circuit.open, "circuit created");
        Ok(circuit)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn status(&self) -> CircuitStatus {
        self.status
    }

    /// 仍有端口位置未定、需要描述符交换或 `finalize` 时为 `true`。
    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.metadata
    }

    /// 输出端口集与各输入端口集的端口实体，用于检查角色与偏移表。
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// 每个输入端口集一个控制器，下标即端口集编号；就绪前为空。
    pub fn controllers(&self) -> &[TransferController] {
        &self.controllers
    }

    /// 输入端口集 `set` 使用的传输模式；就绪前为 `None`。
    pub fn pattern(&self, set: usize) -> Option<TransferPattern> {
        self.controllers.get(set).map(TransferController::pattern)
    }

    /// 各输出端口重试队列与零拷贝转发队列中等待的传输总数。
    pub fn queued_transfers(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum::<usize>() + self.zcopy_queue.len()
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.ready {
            Ok(())
        } else {
            Err(DataplaneError::not_ready("circuit is not ready").with_circuit(self.id))
        }
    }

    // ---- 连接管理 -----------------------------------------------------------

    /// 再登记一个使用者；与 [`Transport::release_circuit`](crate::Transport::release_circuit) 成对调用。
    pub fn attach(&mut self) {
        self.ref_count += 1;
    }

    /// 释放一次引用，归零时拆除全部端口并返回 `true`。
    pub(crate) fn release(&mut self) -> bool {
        self.ref_count = self.ref_count.saturating_sub(1);
        if self.ref_count > 0 {
            return false;
        }
        self.status = CircuitStatus::Disconnecting;
        self.controllers.clear();
        self.queues.iter_mut().for_each(VecDeque::clear);
        self.zcopy_queue.clear();
        self.protocol = ProtocolState::default();
        for set in std::iter::once(&mut self.topology.output).chain(self.topology.inputs.iter_mut()) {
            for port in &mut set.ports {
                port.teardown();
            }
        }
        self.ready = false;
        tracing::debug!(circuit = self.id, "circuit released");
        true
    }

    /// 端口多于一个且输出端口 0 位置已知时，电路关闭（可以就绪）。
    fn update_connection(&mut self) {
        let ports = self.topology.ports().count();
        let located = self
            .topology
            .output
            .port(0)
            .is_some_and(|port| port.metadata().real_location.is_some());
        self.open = !(ports > 1 && located);
    }

    /// 追加端口。就绪后拓扑不可再变。
    pub fn add_port(&mut self, set: PortSetId, meta: PortMetadata) -> Result<PortRef> {
        if self.ready {
            return Err(DataplaneError::invalid_argument("cannot add ports to a ready circuit").with_circuit(self.id));
        }
        if meta.id as usize >= MAX_PCONTRIBS || self.topology.find(meta.id).is_some() {
            return Err(DataplaneError::invalid_argument(format!("port id {} is not available", meta.id))
                .with_circuit(self.id)
                .with_port(meta.id));
        }
        let index = match set {
            PortSetId::Output => {
                if meta.id as usize != self.topology.output.port_count() {
                    return Err(DataplaneError::invalid_argument(
                        "output port ids must follow their rank",
                    )
                    .with_circuit(self.id)
                    .with_port(meta.id));
                }
                self.metadata.output.ports.push(meta.clone());
                self.queues.push(VecDeque::new());
                self.topology.output.add_port(meta)
            }
            PortSetId::Input(k) => {
                let (Some(set_meta), Some(port_set)) =
                    (self.metadata.inputs.get_mut(k), self.topology.inputs.get_mut(k))
                else {
                    return Err(DataplaneError::invalid_argument(format!("no input port set {k}"))
                        .with_circuit(self.id));
                };
                set_meta.ports.push(meta.clone());
                port_set.add_port(meta)
            }
        };
        self.update_connection();
        Ok(PortRef { set, index })
    }

    /// 按消费者描述符在输入端口集 `set` 中登记一个本地输入端口。
    pub fn add_input_port(&mut self, set: usize, desc: &Descriptors, our_endpoint: &str) -> Result<PortRef> {
        if desc.kind == DescriptorType::Producer {
            return Err(DataplaneError::protocol_violation(
                "input ports are created from consumer descriptors",
            )
            .with_circuit(self.id));
        }
        let id: PortId = self.metadata.next_port_id();
        let meta = PortMetadata::new(id, our_endpoint)
            .with_role(desc.role)
            .with_options(desc.options.bits());
        self.add_port(PortSetId::Input(set), meta)
    }

    /// 确定输出端口 0 的位置并关闭电路。
    pub fn finalize(&mut self, endpoint: &str) -> Result<()> {
        let port = self
            .topology
            .output
            .port_mut(0)
            .ok_or_else(|| DataplaneError::invalid_argument("circuit has no output port").with_circuit(self.id))?;
        match &port.metadata().real_location {
            Some(existing) if existing != endpoint => {
                return Err(DataplaneError::invalid_argument(format!(
                    "output port 0 is already located at `{existing}`"
                ))
                .with_circuit(self.id));
            }
            _ => port.set_real_location(endpoint),
        }
        if let Some(meta) = self.metadata.output.ports.first_mut() {
            meta.real_location = Some(endpoint.to_owned());
        }
        self.open = false;
        Ok(())
    }

    /// 重新打开电路：清空队列与控制器，全部缓冲恢复为空，就绪状态清除。
    pub fn reset(&mut self) -> Result<()> {
        self.open = true;
        self.ready = false;
        self.controllers.clear();
        self.queues.iter_mut().for_each(VecDeque::clear);
        self.zcopy_queue.clear();
        for set in std::iter::once(&mut self.topology.output).chain(self.topology.inputs.iter_mut()) {
            for port in &mut set.ports {
                port.reset()?;
            }
        }
        tracing::debug!(circuit = self.id, "circuit reset");
        Ok(())
    }

    /// 非阻塞轮询。首次成功时生成传输模板；此后一直返回 `true`。
    #[tracing::instrument(level = "debug", skip(self), fields(circuit = self.id))]
    pub fn ready(&mut self) -> Result<bool> {
        if self.ready {
            return Ok(true);
        }
        if self.open || self.topology.inputs.is_empty() {
            return Ok(false);
        }
        let ctx = Arc::clone(&self.ctx);
        let mut peers = Vec::with_capacity(self.topology.output.port_count());
        for port in &mut self.topology.output.ports {
            if !port.initialize(&ctx)? {
                return Ok(false);
            }
            if let Some(endpoint) = port.real_endpoint() {
                peers.push(OutputPeer {
                    endpoint: Arc::clone(endpoint),
                    local: !port.is_shadow(),
                });
            }
        }
        let protocol = self.protocol.reserved.as_ref().map(|lease| ProtocolSlot {
            offset: lease.offset(),
            size: lease.size(),
        });

        let mut all = true;
        for set in std::iter::once(&mut self.topology.output).chain(self.topology.inputs.iter_mut()) {
            for port in &mut set.ports {
                let slot = if port.role() == Some(PortRole::ShadowOutput) {
                    protocol
                } else {
                    None
                };
                let port_ready = port.ready(&ctx, self.id, &peers, slot)?;
                all &= port_ready;
            }
        }
        if !all {
            return Ok(false);
        }

        self.settle_protocol()?;
        let controllers = self.build_controllers()?;
        self.controllers = controllers;
        self.ready = true;
        self.status = CircuitStatus::Active;
        tracing::info!(
            circuit = self.id,
            patterns = ?self.controllers.iter().map(TransferController::pattern).collect::<Vec<_>>(),
            "circuit ready"
        );
        Ok(true)
    }

    fn build_controllers(&self) -> Result<Vec<TransferController>> {
        let output = &self.topology.output;
        let port0 = output
            .port(0)
            .ok_or_else(|| DataplaneError::invalid_argument("circuit has no output port").with_circuit(self.id))?;
        let mut controllers = Vec::with_capacity(self.topology.inputs.len());
        for (set, inputs) in self.topology.inputs.iter().enumerate() {
            let input_role = inputs
                .port(0)
                .map(|port| port.connection_role())
                .unwrap_or_default();
            let pattern = TransferPattern::select(
                output.distribution(),
                inputs.distribution(),
                port0.connection_role(),
                input_role,
                port0.is_shadow(),
            );
            let templates = TemplateGenerator::new(&self.ctx, &self.topology, set, pattern)
                .generate()
                .map_err(|err| err.with_circuit(self.id))?;
            let selector = Selector::new(
                inputs.distribution().sub_type,
                u64::from(self.id) << 8 | set as u64,
            );
            tracing::debug!(circuit = self.id, set, ?pattern, templates = templates.len(), "controller built");
            controllers.push(TransferController::new(pattern, set, templates, selector));
        }
        Ok(controllers)
    }

    /// 就绪时落定协议字符串：远端送来的预留区读出后归还；同址时直接读暂存区。
    fn settle_protocol(&mut self) -> Result<()> {
        let shadow_output = self
            .topology
            .output
            .port(0)
            .is_some_and(|port| port.is_shadow());
        if shadow_output {
            if let Some(lease) = self.protocol.reserved.take() {
                let mut raw = vec![0u8; lease.size() as usize];
                lease.endpoint().memory().read(lease.offset(), &mut raw)?;
                lease.release()?;
                let end = raw.iter().rposition(|b| *b != 0).map_or(0, |pos| pos + 1);
                raw.truncate(end);
                if !raw.is_empty() {
                    self.protocol.bytes = Some(raw);
                }
            }
        } else if let (Some(lease), Some(info)) = (&self.protocol.staged, self.protocol.info) {
            let mut raw = vec![0u8; info.size as usize];
            lease.endpoint().memory().read(lease.offset(), &mut raw)?;
            self.protocol.bytes = Some(raw);
        }
        Ok(())
    }

    // ---- 输出侧 -------------------------------------------------------------

    /// 归还已完成的输出缓冲，记录随之释放的上游。
    fn sweep_outputs(&mut self) -> Result<()> {
        let mut buffers = Vec::new();
        for (index, port) in self.topology.output.ports().iter().enumerate() {
            if port.is_shadow() {
                continue;
            }
            for buffer in &port.output_buffers {
                if !buffer.in_use && port.output_flag(buffer.tid)? == EF_FULL {
                    buffers.push(PortRef::output(index).buffer(buffer.tid));
                }
            }
        }
        for buf in buffers {
            if let (_, Some(upstream)) = release_if_done(&mut self.topology, buf)? {
                self.released.push(upstream);
            }
        }
        Ok(())
    }

    fn real_output(&self, index: usize) -> Result<PortRef> {
        let port = self.topology.port(PortRef::output(index))?;
        if port.is_shadow() {
            return Err(DataplaneError::invalid_argument("output port is not local")
                .with_circuit(self.id)
                .with_port(port.id()));
        }
        Ok(PortRef::output(index))
    }

    /// 按严格循环顺序取下一个空输出缓冲；下一个不空时返回 `None` 且不前进。
    pub fn get_next_empty_output_buffer(&mut self, port: usize) -> Result<Option<BufferRef>> {
        self.ensure_ready()?;
        let port_ref = self.real_output(port)?;
        self.sweep_outputs()?;
        let port = self.topology.port(port_ref)?;
        let tid = (port.last_tid() + 1) % port.buffer_count();
        let buf = port_ref.buffer(tid);
        let (empty, upstream) = release_if_done(&mut self.topology, buf)?;
        if let Some(upstream) = upstream {
            self.released.push(upstream);
        }
        if !empty {
            return Ok(None);
        }
        let port = self.topology.port_mut(port_ref)?;
        output_buffer_mut(port, tid)?.in_use = true;
        port.set_last_tid(tid);
        tracing::trace!(circuit = self.id, buffer = ?buf, "empty output buffer taken");
        Ok(Some(buf))
    }

    /// 与 [`get_next_empty_output_buffer`](Self::get_next_empty_output_buffer) 判定相同，但不占用缓冲。
    ///
    /// 判定前会回收已完成的传输，因此可能顺带释放零拷贝链上的上游缓冲。
    pub fn has_empty_output_buffer(&mut self, port: usize) -> Result<bool> {
        self.ensure_ready()?;
        let port_ref = self.real_output(port)?;
        self.sweep_outputs()?;
        let port = self.topology.port(port_ref)?;
        let tid = (port.last_tid() + 1) % port.buffer_count();
        let (empty, upstream) = release_if_done(&mut self.topology, port_ref.buffer(tid))?;
        if let Some(upstream) = upstream {
            self.released.push(upstream);
        }
        Ok(empty)
    }

    fn held_output(&self, buf: BufferRef) -> Result<()> {
        if buf.port.set != PortSetId::Output {
            return Err(DataplaneError::invalid_argument("not an output buffer").with_circuit(self.id));
        }
        let port = self.topology.port(buf.port)?;
        if !output_buffer(port, buf.tid)?.in_use {
            return Err(DataplaneError::invalid_argument("output buffer is not held")
                .with_circuit(self.id)
                .with_port(port.id()));
        }
        Ok(())
    }

    /// 向持有的输出缓冲写入载荷。
    pub fn write_output(&mut self, buf: BufferRef, payload: &[u8]) -> Result<()> {
        self.held_output(buf)?;
        self.topology.port(buf.port)?.write_data(buf.tid, payload)
    }

    /// 填写元数据并发送。`eos` 为真时改走广播，让每个输入端口都看到流结束。
    pub fn send_output_buffer(&mut self, buf: BufferRef, len: u64, opcode: u8, eos: bool) -> Result<SendOutcome> {
        self.ensure_ready()?;
        self.held_output(buf)?;
        let port = self.topology.port(buf.port)?;
        if len > port.buffer_length() {
            return Err(DataplaneError::invalid_argument(format!(
                "length {len} exceeds buffer length {}",
                port.buffer_length()
            ))
            .with_circuit(self.id)
            .with_port(port.id()));
        }
        self.timestamp += 1;
        let md = BufferMetaData {
            length: len as u32,
            opcode,
            end: eos,
            timestamp: self.timestamp,
            xfer_meta_data: pack_xfer_meta(len, opcode, eos),
            sequence: self.sequence,
            end_of_stream: eos,
            broadcast: eos,
            src_rank: port.rank() as u32,
            ..BufferMetaData::default()
        };
        self.sequence = self.sequence.wrapping_add(1);
        port.write_metadata(buf.tid, port.id() as usize, &md)?;
        if eos {
            self.broadcast_buffer(buf)
        } else {
            self.start_buffer_transfer(buf)
        }
    }

    fn may_bypass_queue(&self) -> bool {
        self.controllers
            .iter()
            .all(TransferController::can_transfer_while_others_queued)
    }

    /// 每个输入端口集的目标都空闲时返回 `true`。
    pub fn can_transfer_buffer(&mut self, buf: BufferRef) -> Result<bool> {
        self.ensure_ready()?;
        for controller in &mut self.controllers {
            if !controller.can_produce(&self.topology, buf)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// 立即发送，被拒时排队。
    pub fn start_buffer_transfer(&mut self, buf: BufferRef) -> Result<SendOutcome> {
        self.ensure_ready()?;
        self.held_output(buf)?;
        let entry = QueuedTransfer {
            buffer: buf,
            broadcast: false,
            pending_sets: (0..self.controllers.len()).collect(),
            source: None,
        };
        self.dispatch(entry)
    }

    fn dispatch(&mut self, mut entry: QueuedTransfer) -> Result<SendOutcome> {
        let index = entry.buffer.port.index;
        let queued = self.queues.get(index).is_some_and(|queue| !queue.is_empty());
        if queued && !self.may_bypass_queue() {
            self.enqueue(entry, false)?;
            return Ok(SendOutcome::Queued);
        }
        if self.try_transfer(&mut entry)? {
            self.finish_transfer(entry.buffer)?;
            Ok(SendOutcome::Sent)
        } else {
            self.enqueue(entry, false)?;
            Ok(SendOutcome::Queued)
        }
    }

    fn enqueue(&mut self, entry: QueuedTransfer, prepend: bool) -> Result<()> {
        let index = entry.buffer.port.index;
        let queue = self
            .queues
            .get_mut(index)
            .ok_or_else(|| DataplaneError::invalid_argument(format!("no output port {index}")))?;
        tracing::trace!(buffer = ?entry.buffer, prepend, "transfer queued");
        if prepend {
            queue.push_front(entry);
        } else {
            queue.push_back(entry);
        }
        Ok(())
    }

    /// 把已填写的输出缓冲放入队列，`prepend` 时插到队首优先重试。
    pub fn que_transfer(&mut self, buf: BufferRef, prepend: bool) -> Result<()> {
        self.held_output(buf)?;
        let entry = QueuedTransfer {
            buffer: buf,
            broadcast: false,
            pending_sets: (0..self.controllers.len()).collect(),
            source: None,
        };
        self.enqueue(entry, prepend)
    }

    /// 对每个尚未完成的输入端口集尝试发送；全部完成返回 `true`。
    fn try_transfer(&mut self, entry: &mut QueuedTransfer) -> Result<bool> {
        let mut remaining = Vec::new();
        for &set in &entry.pending_sets {
            let controller = self
                .controllers
                .get_mut(set)
                .ok_or_else(|| DataplaneError::invalid_argument(format!("no controller for set {set}")))?;
            let ready = if entry.broadcast {
                controller.can_broadcast(&self.topology, entry.buffer)?
            } else {
                controller.can_produce(&self.topology, entry.buffer)?
            };
            if !ready {
                remaining.push(set);
                continue;
            }
            let outcome = controller.produce(
                &self.ctx,
                &mut self.topology,
                entry.buffer,
                entry.broadcast,
                entry.source.as_ref(),
            )?;
            if outcome != ProduceOutcome::Complete {
                remaining.push(set);
            }
        }
        entry.pending_sets = remaining;
        Ok(entry.pending_sets.is_empty())
    }

    fn finish_transfer(&mut self, buf: BufferRef) -> Result<()> {
        output_buffer_mut(self.topology.port_mut(buf.port)?, buf.tid)?.in_use = false;
        if let (_, Some(upstream)) = release_if_done(&mut self.topology, buf)? {
            self.released.push(upstream);
        }
        Ok(())
    }

    /// 按输出端口严格 FIFO 重试排队的传输，返回本次发出的数量。
    pub fn check_queued_transfers(&mut self) -> Result<usize> {
        if !self.ready {
            return Ok(0);
        }
        self.sweep_outputs()?;
        let mut sent = 0;
        while let Some(port) = self.zcopy_queue.front().map(|pending| pending.port) {
            let Some(buf) = self.get_next_empty_output_buffer(port)? else {
                break;
            };
            if let Some(pending) = self.zcopy_queue.pop_front() {
                self.forward(buf, pending.upstream, pending.source)?;
                sent += 1;
            }
        }
        for index in 0..self.queues.len() {
            while let Some(mut entry) = self.queues[index].pop_front() {
                if self.try_transfer(&mut entry)? {
                    self.finish_transfer(entry.buffer)?;
                    sent += 1;
                } else {
                    self.queues[index].push_front(entry);
                    break;
                }
            }
        }
        if sent > 0 {
            tracing::trace!(circuit = self.id, sent, "queued transfers drained");
        }
        Ok(sent)
    }

    /// 广播到每个输入端口集的全部端口，并轮转起始端口集。
    pub fn broadcast_buffer(&mut self, buf: BufferRef) -> Result<SendOutcome> {
        self.ensure_ready()?;
        self.held_output(buf)?;
        let port = self.topology.port(buf.port)?;
        let mut md = port.read_metadata(buf.tid, port.id() as usize)?;
        md.broadcast = true;
        port.write_metadata(buf.tid, port.id() as usize, &md)?;
        let sets = self.controllers.len();
        let start = self.last_port_set % sets.max(1);
        self.last_port_set = (start + 1) % sets.max(1);
        let entry = QueuedTransfer {
            buffer: buf,
            broadcast: true,
            pending_sets: (0..sets).map(|k| (start + k) % sets).collect(),
            source: None,
        };
        self.dispatch(entry)
    }

    /// 把上游输入缓冲作为 `port` 的输出转发；没有空输出缓冲时排入零拷贝队列。
    pub(crate) fn send_zcopy_input_buffer(
        &mut self,
        port: usize,
        upstream: UpstreamRef,
        source: ForwardSource,
    ) -> Result<SendOutcome> {
        self.ensure_ready()?;
        match self.get_next_empty_output_buffer(port)? {
            Some(buf) => self.forward(buf, upstream, source),
            None => {
                self.zcopy_queue.push_back(PendingForward {
                    port,
                    upstream,
                    source,
                });
                Ok(SendOutcome::Queued)
            }
        }
    }

    fn forward(&mut self, buf: BufferRef, upstream: UpstreamRef, source: ForwardSource) -> Result<SendOutcome> {
        self.timestamp += 1;
        let port = self.topology.port(buf.port)?;
        let md = BufferMetaData {
            length: source.length as u32,
            timestamp: self.timestamp,
            xfer_meta_data: pack_xfer_meta(source.length, source.metadata.opcode, source.metadata.end_of_stream),
            sequence: self.sequence,
            src_rank: port.rank() as u32,
            zero_copy: true,
            ..source.metadata
        };
        self.sequence = self.sequence.wrapping_add(1);
        port.write_metadata(buf.tid, port.id() as usize, &md)?;
        output_buffer_mut(self.topology.port_mut(buf.port)?, buf.tid)?.zero_copy_from = Some(upstream);
        tracing::trace!(circuit = self.id, buffer = ?buf, ?upstream, "input buffer forwarded");
        let entry = QueuedTransfer {
            buffer: buf,
            broadcast: false,
            pending_sets: (0..self.controllers.len()).collect(),
            source: Some(source),
        };
        self.dispatch(entry)
    }

    /// 供另一电路转发本电路已取出的输入缓冲。
    pub(crate) fn forward_source(&self, buf: BufferRef, len: u64) -> Result<ForwardSource> {
        let metadata = self.input_metadata(buf)?;
        let port = self.topology.port(buf.port)?;
        let (endpoint, data_offset) = match port.input_buffers.get(buf.tid).and_then(|ib| ib.attached) {
            Some(output) => {
                let out = self.topology.port(output.port)?;
                (out.real_endpoint().cloned(), out.offsets(output.tid)?.buffer_offset)
            }
            None => (port.real_endpoint().cloned(), port.offsets(buf.tid)?.buffer_offset),
        };
        let endpoint = endpoint.ok_or_else(|| DataplaneError::not_ready("input port has no endpoint"))?;
        Ok(ForwardSource {
            endpoint,
            data_offset,
            length: len.min(u64::from(metadata.length)),
            metadata,
        })
    }

    pub(crate) fn take_released_upstreams(&mut self) -> Vec<UpstreamRef> {
        std::mem::take(&mut self.released)
    }

    pub(crate) fn push_released_upstream(&mut self, upstream: UpstreamRef) {
        self.released.push(upstream);
    }

    // ---- 输入侧 -------------------------------------------------------------

    fn real_input(&self, port: PortRef) -> Result<usize> {
        let PortSetId::Input(set) = port.set else {
            return Err(DataplaneError::invalid_argument("not an input port").with_circuit(self.id));
        };
        if self.topology.port(port)?.is_shadow() {
            return Err(DataplaneError::invalid_argument("input port is not local").with_circuit(self.id));
        }
        Ok(set)
    }

    fn input_full(&self, buf: BufferRef) -> Result<bool> {
        let port = self.topology.port(buf.port)?;
        let Some(input) = port.input_buffers.get(buf.tid) else {
            return Ok(false);
        };
        Ok(!input.in_use && (input.attached.is_some() || port.full_column(buf.tid)?.is_some()))
    }

    /// 按严格循环顺序取下一个满输入缓冲；AFC 消费者此时拉取数据。
    pub fn get_next_full_input_buffer(&mut self, port_ref: PortRef) -> Result<Option<BufferRef>> {
        self.ensure_ready()?;
        let set = self.real_input(port_ref)?;
        let port = self.topology.port(port_ref)?;
        let tid = (port.last_tid() + 1) % port.buffer_count();
        let buf = port_ref.buffer(tid);
        if !self.input_full(buf)? {
            return Ok(None);
        }
        let port = self.topology.port_mut(port_ref)?;
        input_buffer_mut(port, tid)?.in_use = true;
        port.set_last_tid(tid);
        if let Some(controller) = self.controllers.get(set) {
            controller.pull(&self.topology, buf)?;
        }
        tracing::trace!(circuit = self.id, buffer = ?buf, "full input buffer taken");
        Ok(Some(buf))
    }

    /// 循环顺序上的下一个输入缓冲是否已满；不取出。
    pub fn has_full_input_buffer(&self, port_ref: PortRef) -> Result<bool> {
        self.ensure_ready()?;
        self.real_input(port_ref)?;
        let port = self.topology.port(port_ref)?;
        let tid = (port.last_tid() + 1) % port.buffer_count();
        self.input_full(port_ref.buffer(tid))
    }

    /// 输入缓冲的元数据：零拷贝挂接时读输出端口的槽，否则读写入方所在的列。
    pub fn input_metadata(&self, buf: BufferRef) -> Result<BufferMetaData> {
        let port = self.topology.port(buf.port)?;
        if let Some(output) = port.input_buffers.get(buf.tid).and_then(|ib| ib.attached) {
            let out = self.topology.port(output.port)?;
            return out.read_metadata(output.tid, out.id() as usize);
        }
        let column = port.full_column(buf.tid)?.ok_or_else(|| {
            DataplaneError::not_ready("input buffer is not full")
                .with_circuit(self.id)
                .with_port(port.id())
        })?;
        port.read_metadata(buf.tid, column)
    }

    /// 输入缓冲的载荷，长度取自元数据；零拷贝挂接时直接读输出缓冲。
    pub fn input_data(&self, buf: BufferRef) -> Result<Bytes> {
        let md = self.input_metadata(buf)?;
        let port = self.topology.port(buf.port)?;
        match port.input_buffers.get(buf.tid).and_then(|ib| ib.attached) {
            Some(output) => self
                .topology
                .port(output.port)?
                .read_data(output.tid, u64::from(md.length)),
            None => port.read_data(buf.tid, u64::from(md.length)),
        }
    }

    /// 流结束标记，由广播发送写入。
    pub fn is_eos(&self, buf: BufferRef) -> Result<bool> {
        Ok(self.input_metadata(buf)?.end_of_stream)
    }

    /// 分块传输中一份整体的最后一个分片。
    pub fn is_eow(&self, buf: BufferRef) -> Result<bool> {
        Ok(self.input_metadata(buf)?.end_of_whole)
    }

    /// 归还输入缓冲。返回值为因此被释放、需要继续归还的上游缓冲。
    pub fn consume(&mut self, buf: BufferRef) -> Result<Option<UpstreamRef>> {
        self.ensure_ready()?;
        let set = self.real_input(buf.port)?;
        let controller = self
            .controllers
            .get_mut(set)
            .ok_or_else(|| DataplaneError::invalid_argument(format!("no controller for set {set}")))?;
        controller.consume(&mut self.topology, buf)
    }

    // ---- 协议字符串 ---------------------------------------------------------

    /// 输出端：在本地 SMB 暂存协议字符串，等待对端的控制块请求取走。
    pub fn stage_protocol(&mut self, bytes: &[u8]) -> Result<()> {
        let endpoint = Arc::clone(self.ctx.default_endpoint()?);
        let lease = OffsetLease::acquire(&endpoint, (bytes.len() as u64).max(1), self.ctx.config().buffer_alignment)?;
        lease.zero()?;
        endpoint.memory().write(lease.offset(), bytes)?;
        self.set_protocol_info(bytes.len() as u64, lease.offset());
        self.protocol.staged = Some(lease);
        Ok(())
    }

    /// 输入端：预留 `size` 字节，由对端在应答控制块请求时填入。
    pub fn reserve_protocol(&mut self, size: u64) -> Result<()> {
        let endpoint = Arc::clone(self.ctx.default_endpoint()?);
        let lease = OffsetLease::acquire(&endpoint, size.max(1), self.ctx.config().buffer_alignment)?;
        lease.zero()?;
        self.set_protocol_info(size, lease.offset());
        self.protocol.reserved = Some(lease);
        Ok(())
    }

    /// 记录协议字符串所在区间；握手请求按它告诉对端写到哪里。
    pub fn set_protocol_info(&mut self, size: u64, offset: u64) {
        self.protocol.info = Some(ProtocolInfo { size, offset });
    }

    pub fn protocol_info(&self) -> Option<ProtocolInfo> {
        self.protocol.info
    }

    /// 取走协议字符串，只在第一次返回 `Some`。
    pub fn get_protocol(&mut self) -> Option<Vec<u8>> {
        self.protocol.bytes.take()
    }

    pub(crate) fn take_staged_protocol(&mut self) -> Option<OffsetLease> {
        self.protocol.staged.take()
    }

    // ---- 描述符路径 ---------------------------------------------------------

    /// 本地真实端口的描述符。
    pub fn port_descriptor(&self, port: PortRef, other: Option<&Descriptors>) -> Result<Descriptors> {
        let mut desc = Descriptors::default();
        self.topology.port(port)?.fill_port_descriptor(&mut desc, other)?;
        Ok(desc)
    }

    /// 描述符交换的一步：协商角色、初始化端口、应用对端描述符并关闭电路。
    pub fn finalize_port(&mut self, port_ref: PortRef, other: Option<&Descriptors>) -> Result<FinalizeOutcome> {
        let ctx = Arc::clone(&self.ctx);
        let id = self.id;
        let port = self.topology.port_mut(port_ref)?;
        if let Some(other) = other {
            port.negotiate_role(other);
        }
        if !port.initialize(&ctx)? {
            return Err(DataplaneError::not_ready("port location is not known yet")
                .with_circuit(id)
                .with_port(port.id()));
        }
        let outcome = match port.role() {
            Some(PortRole::RealOutput | PortRole::RealInput) => {
                let mut mine = Descriptors::default();
                port.fill_port_descriptor(&mut mine, other)?;
                let done = match other {
                    Some(other) if other.kind == DescriptorType::ConsumerFlowControl => {
                        let mailbox = descriptor_mailbox(other)?;
                        port.set_flow_control_descriptor(mailbox, other)?;
                        true
                    }
                    Some(_) => true,
                    None => false,
                };
                FinalizeOutcome { send: Some(mine), done }
            }
            Some(role @ (PortRole::ShadowOutput | PortRole::ShadowInput)) => {
                let other = other.ok_or_else(|| {
                    DataplaneError::protocol_violation("shadow ports need the peer descriptor")
                        .with_circuit(id)
                })?;
                port.finish_connect(other)?;
                port.mark_definition_complete();
                let send = if role == PortRole::ShadowInput {
                    Some(port.user_port_flow_control_descriptor()?)
                } else {
                    None
                };
                FinalizeOutcome { send, done: true }
            }
            None => return Err(DataplaneError::not_ready("port is not initialized").with_circuit(id)),
        };
        self.open = false;
        Ok(outcome)
    }

    /// 把对端描述符应用到影子端口的偏移表。
    pub fn finish_connect(&mut self, port: PortRef, desc: &Descriptors) -> Result<()> {
        let ctx = Arc::clone(&self.ctx);
        let port = self.topology.port_mut(port)?;
        port.initialize(&ctx)?;
        port.finish_connect(desc)?;
        port.mark_definition_complete();
        Ok(())
    }

    /// 记录消费者的空标志地址，端口随即视为定义完成。
    pub fn set_flow_control_descriptor(&mut self, port: PortRef, desc: &Descriptors) -> Result<()> {
        let ctx = Arc::clone(&self.ctx);
        let mailbox = descriptor_mailbox(desc)?;
        let port = self.topology.port_mut(port)?;
        port.initialize(&ctx)?;
        port.set_flow_control_descriptor(mailbox, desc)
    }
}

impl fmt::Debug for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Circuit")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("open", &self.open)
            .field("ready", &self.ready)
            .field("ref_count", &self.ref_count)
            .field("topology", &self.topology)
            .field("queued", &self.queued_transfers())
            .finish()
    }
}

/// 满标志取自元数据时，低 32 位必须非零。
fn pack_xfer_meta(len: u64, opcode: u8, eos: bool) -> u64 {
    1 | u64::from(opcode) << 8 | u64::from(eos) << 16 | (len & 0xFFFF_FFFF) << 32
}

fn descriptor_mailbox(desc: &Descriptors) -> Result<u16> {
    let address: EndpointAddress = desc.desc.oob.oep.parse()?;
    Ok(address.mailbox)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_meta_flag_is_never_empty() {
        assert_ne!(pack_xfer_meta(0, 0, false) & 0xFFFF_FFFF, 0);
        let packed = pack_xfer_meta(4096, 7, true);
        assert_eq!(packed >> 32, 4096);
        assert_eq!((packed >> 8) & 0xFF, 7);
        assert_eq!((packed >> 16) & 1, 1);
    }
}
