//! 传输控制器：按模式决定何时、向谁投递预计算模板。
//!
//! # 模块角色（Why）
//! - 一个电路对每个输入端口集持有一个控制器；控制器只关心“目标是否空闲”与“投递哪个模板”，
//!   端口内存布局的细节由 [`Port`] 封装。
//!
//! # 核心机制（How）
//! - [`TransferPattern::select`] 由分布方式、分区与角色映射出闭集模式；
//! - 生产：检查目标空闲 → 置满本地/影子标志 → 执行零拷贝挂接 → 投递模板 → 推进游标；
//! - 消费：解除挂接或清除满标志 → 投递“已消费”模板；
//! - 分片模式把一个输出缓冲拆成多次子传输，每次投递前在输出元数据槽写入分片字段。
//!
//! # 契约说明（What）
//! - 同一缓冲的投递顺序即模板登记顺序，标志段总在数据段之后；
//! - 输出缓冲只有在全部请求完成、零拷贝依赖清空、分片发完后才回到空闲；
//! - 单线程协作式驱动：调用方串行化对同一电路的访问。

use std::sync::Arc;

use crate::{
    buffer::{BufferRef, InputBuffer, OutputBuffer, PartProgress, PortSetId, UpstreamRef},
    descriptor::Role,
    distribution::{Candidate, DataDistribution, DataPartition, DistributionKind, Selector},
    endpoint::{CopyKind, Endpoint, XferRequest},
    error::{DataplaneError, Result},
    layout::{BufferMetaData, EF_EMPTY, EF_FULL, FF_FULL},
    port::Port,
    port_set::Topology,
    template::{InputKey, LegKind, OutputKey, TemplateBuilder, TemplateTable, TransferTemplate},
    transport::TransportContext,
};

/// 闭集传输模式。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransferPattern {
    /// 并行整块：一个输出缓冲送往全部输入端口的同号缓冲。
    Pattern1,
    /// 生产者为 AFC 角色、本地持有真实输出：只送满标志，由消费者拉取。
    Pattern1Afc,
    /// 生产者为 AFC 角色、本地只有影子输出：消费者拉取并回写空标志。
    Pattern1AfcShadow,
    /// 任一端为 Passive：本端只维护状态，由对端完成拷贝。
    Pattern1Passive,
    /// 并行输出 + 顺序输入：每个缓冲只送往一个被选中的输入端口。
    Pattern2,
    /// 顺序输出 + 顺序输入：在模式 2 基础上由令牌决定哪个输出端口可以发送。
    Pattern3,
    /// 并行分块：按块切片，分多次子传输送往全部输入端口。
    Pattern4,
    NotSupported,
}

impl TransferPattern {
    /// 模式选择。`output_role`/`input_role` 为已套用默认值的角色。
    pub fn select(
        output: &DataDistribution,
        input: &DataDistribution,
        output_role: Role,
        input_role: Role,
        output_is_shadow: bool,
    ) -> Self {
        let output_role = output_role.or_default_for(true);
        let input_role = input_role.or_default_for(false);
        if output_role == Role::Passive || input_role == Role::Passive {
            return TransferPattern::Pattern1Passive;
        }
        let standard = output_role == Role::ActiveMessage && input_role == Role::ActiveFlowControl;
        match (output.kind, input.kind, input.partition) {
            (DistributionKind::Parallel, DistributionKind::Parallel, DataPartition::Indivisible) => {
                if output_role == Role::ActiveFlowControl {
                    if output_is_shadow {
                        TransferPattern::Pattern1AfcShadow
                    } else {
                        TransferPattern::Pattern1Afc
                    }
                } else if standard {
                    TransferPattern::Pattern1
                } else {
                    TransferPattern::NotSupported
                }
            }
            (DistributionKind::Parallel, DistributionKind::Sequential, DataPartition::Indivisible)
                if standard =>
            {
                TransferPattern::Pattern2
            }
            (DistributionKind::Sequential, DistributionKind::Sequential, DataPartition::Indivisible)
                if standard =>
            {
                TransferPattern::Pattern3
            }
            (DistributionKind::Parallel, DistributionKind::Parallel, DataPartition::Block { .. })
                if standard =>
            {
                TransferPattern::Pattern4
            }
            _ => TransferPattern::NotSupported,
        }
    }

    /// 队列非空时是否允许新缓冲越过队列直接发送。
    pub fn can_transfer_while_others_queued(self) -> bool {
        !matches!(
            self,
            TransferPattern::Pattern1 | TransferPattern::Pattern1Passive | TransferPattern::Pattern3
        )
    }
}

/// 一次生产调用的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProduceOutcome {
    /// 该输入端口集的传输已全部发出。
    Complete,
    /// 分片模式下发出了一部分，剩余分片留待下次。
    Partial,
    /// 目标不空闲，什么也没发。
    Busy,
}

/// 零拷贝转发时替换数据段的来源。
#[derive(Clone)]
pub(crate) struct ForwardSource {
    pub endpoint: Arc<dyn Endpoint>,
    pub data_offset: u64,
    pub length: u64,
    pub metadata: BufferMetaData,
}

/// 一个输入端口集的传输控制器。
///
/// # 设计背景（Why）
/// - 模式只在就绪时确定一次，之后每次生产/消费都是“判定目标空闲 → 查表投递”，
///   控制器把这两步与各模式的游标规则收拢在一起；
///
/// # 逻辑解析（How）
/// - 并行模式共用 `next_tid` 作为全部输入端口的写游标；顺序模式每个端口各有游标，
///   由选择器在空闲的候选中挑出目标；
/// - 分块模式把一个输出缓冲拆成多次子传输，进度记在输出缓冲上，目标不空闲时分批发出。
///
/// # 契约说明（What）
/// - `can_produce` 为真后紧接着的 `produce` 使用同一个选中目标；
/// - 控制器不持有端口，所有状态读写都经由调用方传入的拓扑完成。
pub struct TransferController {
    pattern: TransferPattern,
    set: usize,
    templates: TemplateTable,
    next_tid: usize,
    selector: Selector,
    selected: Option<(usize, usize)>,
}

impl TransferController {
    pub(crate) fn new(
        pattern: TransferPattern,
        set: usize,
        templates: TemplateTable,
        selector: Selector,
    ) -> Self {
        Self {
            pattern,
            set,
            templates,
            next_tid: 0,
            selector,
            selected: None,
        }
    }

    pub fn pattern(&self) -> TransferPattern {
        self.pattern
    }

    /// 负责的输入端口集编号。
    pub fn input_set(&self) -> usize {
        self.set
    }

    /// 就绪时生成的全部模板，按输出/输入/拉取三类键索引。
    pub fn templates(&self) -> &TemplateTable {
        &self.templates
    }

    /// 见 [`TransferPattern::can_transfer_while_others_queued`]。
    pub fn can_transfer_while_others_queued(&self) -> bool {
        self.pattern.can_transfer_while_others_queued()
    }

    fn input_ports<'t>(&self, topo: &'t Topology) -> Result<&'t [Port]> {
        topo.inputs
            .get(self.set)
            .map(|set| set.ports())
            .ok_or_else(|| DataplaneError::invalid_argument(format!("no input port set {}", self.set)))
    }

    fn all_free(&self, topo: &Topology, tid: usize) -> Result<bool> {
        for port in self.input_ports(topo)? {
            if !target_free(port, tid)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn is_idle_parallel_rank(&self, topo: &Topology, buf: BufferRef) -> Result<bool> {
        Ok(topo.output.distribution().is_parallel() && topo.port(buf.port)?.rank() != 0)
    }

    /// 顺序分布的候选：每个输入端口在其下一个目标缓冲空闲时入选。
    fn candidates(&self, topo: &Topology) -> Result<Vec<Candidate>> {
        let mut out = Vec::new();
        for (idx, port) in self.input_ports(topo)?.iter().enumerate() {
            let tid = port.produce_tid;
            if target_free(port, tid)? {
                out.push(Candidate {
                    port: idx,
                    tid,
                    busy_factor: port.busy_factor(),
                });
            }
        }
        Ok(out)
    }

    /// 目标是否就绪；顺序分布下会记住选中的目标供随后的 [`produce`](Self::produce) 使用。
    pub(crate) fn can_produce(&mut self, topo: &Topology, buf: BufferRef) -> Result<bool> {
        if self.is_idle_parallel_rank(topo, buf)? {
            return Ok(true);
        }
        match self.pattern {
            TransferPattern::Pattern1 | TransferPattern::Pattern4 => self.all_free(topo, self.next_tid),
            TransferPattern::Pattern2 | TransferPattern::Pattern3 => {
                if self.pattern == TransferPattern::Pattern3 {
                    let port = topo.port(buf.port)?;
                    if port.read_control()?.sequential_control_token != port.id() {
                        return Ok(false);
                    }
                }
                let candidates = self.candidates(topo)?;
                self.selected = self
                    .selector
                    .pick(&candidates)
                    .map(|idx| (candidates[idx].port, candidates[idx].tid));
                Ok(self.selected.is_some())
            }
            TransferPattern::Pattern1Afc
            | TransferPattern::Pattern1AfcShadow
            | TransferPattern::Pattern1Passive => Ok(true),
            TransferPattern::NotSupported => Ok(false),
        }
    }

    /// 广播目标：顺序分布下每个输入端口按各自的写游标接收，其余模式共用同一缓冲编号。
    fn broadcast_targets(&self, topo: &Topology, buf: BufferRef) -> Result<Vec<(usize, usize)>> {
        let ports = self.input_ports(topo)?;
        Ok(match self.pattern {
            TransferPattern::Pattern2 | TransferPattern::Pattern3 => ports
                .iter()
                .enumerate()
                .map(|(idx, port)| (idx, port.produce_tid))
                .collect(),
            TransferPattern::Pattern1Afc => (0..ports.len()).map(|idx| (idx, buf.tid)).collect(),
            _ => (0..ports.len()).map(|idx| (idx, self.next_tid)).collect(),
        })
    }

    /// 广播要求每个输入端口的目标缓冲空闲。
    pub(crate) fn can_broadcast(&self, topo: &Topology, buf: BufferRef) -> Result<bool> {
        if self.is_idle_parallel_rank(topo, buf)? {
            return Ok(true);
        }
        match self.pattern {
            TransferPattern::NotSupported => Ok(false),
            TransferPattern::Pattern1Afc
            | TransferPattern::Pattern1AfcShadow
            | TransferPattern::Pattern1Passive => Ok(true),
            _ => {
                let ports = self.input_ports(topo)?;
                for (idx, tid) in self.broadcast_targets(topo, buf)? {
                    if !target_free(&ports[idx], tid)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    /// 投递 `buf`。调用前应先由 `can_produce`/`can_broadcast` 确认目标空闲。
    ///
    /// 缓冲的占用标记与置空由电路在全部输入端口集完成后处理。
    #[tracing::instrument(level = "trace", skip(self, ctx, topo, source), fields(pattern = ?self.pattern))]
    pub(crate) fn produce(
        &mut self,
        ctx: &TransportContext,
        topo: &mut Topology,
        buf: BufferRef,
        broadcast: bool,
        source: Option<&ForwardSource>,
    ) -> Result<ProduceOutcome> {
        if self.is_idle_parallel_rank(topo, buf)? {
            // 并行分布只由 rank 0 发送，其余端口的缓冲原样归还。
            return Ok(ProduceOutcome::Complete);
        }
        match self.pattern {
            TransferPattern::NotSupported => Err(DataplaneError::unsupported_pattern(
                "circuit has no supported transfer pattern",
            )),
            TransferPattern::Pattern1Passive => {
                let port = topo.port_mut(buf.port)?;
                port.set_output_flag(buf.tid, EF_FULL)?;
                output_buffer_mut(port, buf.tid)?.slave = true;
                Ok(ProduceOutcome::Complete)
            }
            TransferPattern::Pattern1AfcShadow => Err(DataplaneError::unsupported_pattern(
                "a flow-controlled consumer host cannot produce on a remote output",
            )),
            TransferPattern::Pattern4 if !broadcast => self.produce_parts(ctx, topo, buf, source),
            _ => self.produce_whole(ctx, topo, buf, broadcast, source),
        }
    }

    fn produce_whole(
        &mut self,
        ctx: &TransportContext,
        topo: &mut Topology,
        buf: BufferRef,
        broadcast: bool,
        source: Option<&ForwardSource>,
    ) -> Result<ProduceOutcome> {
        let s_port = topo.port(buf.port)?;
        let s_pid = s_port.id();
        let n_inputs = self.input_ports(topo)?.len();

        let per_port = matches!(self.pattern, TransferPattern::Pattern2 | TransferPattern::Pattern3);
        let targets: Vec<(usize, usize)> = if broadcast {
            self.broadcast_targets(topo, buf)?
        } else {
            match self.pattern {
                TransferPattern::Pattern2 | TransferPattern::Pattern3 => {
                    let selected = match self.selected.take() {
                        Some(selected) => selected,
                        None => {
                            if !self.can_produce(topo, buf)? {
                                return Ok(ProduceOutcome::Busy);
                            }
                            self.selected.take().ok_or_else(|| {
                                DataplaneError::protocol_violation("no sequential target selected")
                            })?
                        }
                    };
                    vec![selected]
                }
                TransferPattern::Pattern1Afc => (0..n_inputs).map(|idx| (idx, buf.tid)).collect(),
                _ => (0..n_inputs).map(|idx| (idx, self.next_tid)).collect(),
            }
        };
        // 顺序分布按目标端口逐个取模板；其余模式一个模板覆盖全部输入端口。
        let keys: Vec<OutputKey> = if per_port {
            let ports = self.input_ports(topo)?;
            targets
                .iter()
                .map(|&(idx, tid)| OutputKey {
                    output_port: s_pid,
                    output_tid: buf.tid,
                    input_port: Some(ports[idx].id()),
                    input_tid: tid,
                    broadcast,
                })
                .collect()
        } else {
            vec![OutputKey {
                output_port: s_pid,
                output_tid: buf.tid,
                input_port: None,
                input_tid: targets.first().map_or(self.next_tid, |&(_, tid)| tid),
                broadcast,
            }]
        };
        for key in &keys {
            if self.templates.output(key).is_none() {
                return Err(missing_template(key));
            }
        }

        topo.port(buf.port)?.set_output_flag(buf.tid, EF_FULL)?;
        for &(idx, tid) in &targets {
            let port = &self.input_ports(topo)?[idx];
            if port.is_shadow() {
                port.set_shadow_flag(tid, EF_FULL)?;
            }
        }
        if self.pattern == TransferPattern::Pattern3 {
            // 令牌先交出，控制段随后把它拷给下一个输出端口。
            let port = topo.port(buf.port)?;
            let count = topo.output.port_count() as u32;
            let mut control = port.read_control()?;
            control.sequential_control_token = (s_pid + 1) % count.max(1);
            control.sequence = control.sequence.wrapping_add(1);
            port.write_control(&control)?;
        }
        if broadcast {
            let port = topo.port(buf.port)?;
            let mut control = port.read_control()?;
            control.end_of_stream = true;
            port.write_control(&control)?;
        }

        let mut pending = Vec::new();
        let mut slave = false;
        for key in &keys {
            let template = self.templates.output(key).ok_or_else(|| missing_template(key))?;
            pending.extend(post_with_hand_offs(ctx, topo, template, buf, source)?);
            slave |= self.pattern == TransferPattern::Pattern1Afc && template.count(LegKind::Flag) > 0;
        }
        {
            let out = output_buffer_mut(topo.port_mut(buf.port)?, buf.tid)?;
            out.pending.extend(pending);
            out.slave |= slave;
        }

        match self.pattern {
            TransferPattern::Pattern2 | TransferPattern::Pattern3 => {
                let set = topo
                    .inputs
                    .get_mut(self.set)
                    .ok_or_else(|| DataplaneError::invalid_argument("input set vanished"))?;
                let buffer_count = set.buffer_count();
                for &(idx, tid) in &targets {
                    if let Some(port) = set.port_mut(idx) {
                        port.produce_tid = (tid + 1) % buffer_count;
                    }
                }
                if !broadcast && let [(idx, _)] = targets.as_slice() {
                    self.selector.commit(*idx, n_inputs);
                }
            }
            TransferPattern::Pattern1Afc => {}
            _ => {
                let count = topo.inputs.get(self.set).map_or(1, |set| set.buffer_count());
                let t_tid = keys.first().map_or(self.next_tid, |key| key.input_tid);
                self.next_tid = (t_tid + 1) % count;
            }
        }

        tracing::trace!(buffer = ?buf, targets = targets.len(), "output buffer produced");
        Ok(ProduceOutcome::Complete)
    }

    fn produce_parts(
        &mut self,
        ctx: &TransportContext,
        topo: &mut Topology,
        buf: BufferRef,
        source: Option<&ForwardSource>,
    ) -> Result<ProduceOutcome> {
        let s_port = topo.port(buf.port)?;
        let s_pid = s_port.id();
        let existing = output_buffer(s_port, buf.tid)?.parts;
        let mut progress = match existing {
            Some(progress) => progress,
            None => {
                let whole = s_port.read_metadata(buf.tid, s_pid as usize)?;
                let root = OutputKey {
                    output_port: s_pid,
                    output_tid: buf.tid,
                    input_port: None,
                    input_tid: self.next_tid,
                    broadcast: false,
                };
                let template = self.templates.output(&root).ok_or_else(|| missing_template(&root))?;
                s_port.set_output_flag(buf.tid, EF_FULL)?;
                PartProgress {
                    next_transfer: 0,
                    total_transfers: template.gated().len() + 1,
                    whole,
                }
            }
        };
        let buffer_count = topo.inputs.get(self.set).map_or(1, |set| set.buffer_count());

        let mut sent = 0;
        while !progress.is_complete() && self.all_free(topo, self.next_tid)? {
            let key = OutputKey {
                output_port: s_pid,
                output_tid: buf.tid,
                input_port: None,
                input_tid: self.next_tid,
                broadcast: false,
            };
            let root = self.templates.output(&key).ok_or_else(|| missing_template(&key))?;
            let part = if progress.next_transfer == 0 {
                root
            } else {
                root.gated()
                    .get(progress.next_transfer - 1)
                    .ok_or_else(|| missing_template(&key))?
            };

            let s_port = topo.port(buf.port)?;
            for preset in part.presets() {
                let whole_len = u64::from(progress.whole.length);
                let end = (preset.span.offset + preset.span.len).min(whole_len);
                let md = BufferMetaData {
                    length: end.saturating_sub(preset.span.offset) as u32,
                    end_of_whole: preset.last_transfer,
                    parts_sequence: preset.span.sequence,
                    parts_per_whole: preset.parts_per_whole,
                    sequence: progress.whole.sequence,
                    ..progress.whole
                };
                s_port.write_metadata(buf.tid, preset.column, &md)?;
            }
            for port in self.input_ports(topo)? {
                if port.is_shadow() {
                    port.set_shadow_flag(self.next_tid, EF_FULL)?;
                }
            }
            let pending = post_with_hand_offs(ctx, topo, part, buf, source)?;
            output_buffer_mut(topo.port_mut(buf.port)?, buf.tid)?
                .pending
                .extend(pending);
            progress.next_transfer += 1;
            self.next_tid = (self.next_tid + 1) % buffer_count;
            sent += 1;
        }

        let complete = progress.is_complete();
        output_buffer_mut(topo.port_mut(buf.port)?, buf.tid)?.parts = Some(progress);
        tracing::trace!(buffer = ?buf, sent, complete, "output parts produced");
        Ok(if complete {
            ProduceOutcome::Complete
        } else if sent == 0 {
            ProduceOutcome::Busy
        } else {
            ProduceOutcome::Partial
        })
    }

    /// AFC 消费者取到满缓冲后，从生产者拉取数据与元数据。
    pub(crate) fn pull(&self, topo: &Topology, buf: BufferRef) -> Result<()> {
        if self.pattern != TransferPattern::Pattern1AfcShadow {
            return Ok(());
        }
        let port = topo.port(buf.port)?;
        let key = InputKey {
            input_port: port.id(),
            input_tid: buf.tid,
            broadcast: false,
        };
        if let Some(template) = self.templates.pull(&key) {
            template.post()?;
        }
        Ok(())
    }

    /// 归还输入缓冲。返回因此被释放的上游（零拷贝转发链）。
    #[tracing::instrument(level = "trace", skip(self, topo), fields(pattern = ?self.pattern))]
    pub(crate) fn consume(&mut self, topo: &mut Topology, buf: BufferRef) -> Result<Option<UpstreamRef>> {
        let port = topo.port_mut(buf.port)?;
        let busy = port.input_buffers.iter().filter(|b| b.in_use).count() as u32;
        let pid = port.id();
        let attached = {
            let input = input_buffer_mut(port, buf.tid)?;
            input.in_use = false;
            input.attached.take()
        };
        port.clear_input_flags(buf.tid)?;
        port.stage_busy_factor(buf.tid, busy.saturating_sub(1))?;

        let mut upstream = None;
        if let Some(output) = attached {
            let out_port = topo.port_mut(output.port)?;
            output_buffer_mut(out_port, output.tid)?
                .dependents
                .retain(|dep| *dep != buf);
            upstream = release_if_done(topo, output)?.1;
        }

        let key = InputKey {
            input_port: pid,
            input_tid: buf.tid,
            broadcast: false,
        };
        if let Some(template) = self.templates.input(&key) {
            template.post()?;
        }
        tracing::trace!(buffer = ?buf, "input buffer consumed");
        Ok(upstream)
    }

    pub(crate) fn reset(&mut self) {
        self.next_tid = 0;
        self.selected = None;
    }
}

fn missing_template(key: &OutputKey) -> DataplaneError {
    DataplaneError::protocol_violation(format!("no transfer template for {key:?}"))
        .with_port(key.output_port)
}

/// 目标输入缓冲是否可以接收新数据。
pub(crate) fn target_free(port: &Port, tid: usize) -> Result<bool> {
    if port.is_shadow() {
        return Ok(port.shadow_state(tid)?.flag == EF_EMPTY);
    }
    let Some(buffer) = port.input_buffers.get(tid) else {
        return Ok(false);
    };
    Ok(!buffer.in_use && buffer.attached.is_none() && port.full_column(tid)?.is_none())
}

pub(crate) fn output_buffer(port: &Port, tid: usize) -> Result<&OutputBuffer> {
    port.output_buffers
        .get(tid)
        .ok_or_else(|| DataplaneError::invalid_argument(format!("no output buffer {tid}")).with_port(port.id()))
}

pub(crate) fn output_buffer_mut(port: &mut Port, tid: usize) -> Result<&mut OutputBuffer> {
    let id = port.id();
    port.output_buffers
        .get_mut(tid)
        .ok_or_else(|| DataplaneError::invalid_argument(format!("no output buffer {tid}")).with_port(id))
}

pub(crate) fn input_buffer_mut(port: &mut Port, tid: usize) -> Result<&mut InputBuffer> {
    let id = port.id();
    port.input_buffers
        .get_mut(tid)
        .ok_or_else(|| DataplaneError::invalid_argument(format!("no input buffer {tid}")).with_port(id))
}

/// 执行零拷贝挂接后投递模板。
fn post_with_hand_offs(
    ctx: &TransportContext,
    topo: &mut Topology,
    template: &TransferTemplate,
    buf: BufferRef,
    source: Option<&ForwardSource>,
) -> Result<Vec<Arc<dyn XferRequest>>> {
    if let Some(source) = source
        && !template.hand_offs().is_empty()
    {
        // 挂接的输入直接读取输出缓冲，转发来源需要先落到输出缓冲里。
        let port = topo.port(buf.port)?;
        let target = port
            .real_endpoint()
            .cloned()
            .ok_or_else(|| DataplaneError::not_ready("output port has no endpoint"))?;
        let services = ctx.services(&source.endpoint, &target)?;
        let mut request = services.create_request();
        request.copy(
            source.data_offset,
            port.offsets(buf.tid)?.buffer_offset,
            source.length.min(port.buffer_length()),
            CopyKind::Data,
        )?;
        request.post()?;
    }
    for hand_off in template.hand_offs() {
        let out_pid = topo.port(hand_off.output.port)?.id();
        let input_port = topo.port_mut(hand_off.input.port)?;
        input_buffer_mut(input_port, hand_off.input.tid)?.attached = Some(hand_off.output);
        input_port.set_input_flag(hand_off.input.tid, out_pid as usize, FF_FULL)?;
        output_buffer_mut(topo.port_mut(hand_off.output.port)?, hand_off.output.tid)?
            .dependents
            .push(hand_off.input);
    }
    match source {
        Some(source) => {
            let data_base = topo.port(buf.port)?.offsets(buf.tid)?.buffer_offset;
            rebuild_with_source(ctx, template, source, data_base)?.post()
        }
        None => template.post(),
    }
}

/// 把模板中的数据段改为从转发来源读取，其余拷贝段原样保留。
fn rebuild_with_source(
    ctx: &TransportContext,
    template: &TransferTemplate,
    source: &ForwardSource,
    data_base: u64,
) -> Result<TransferTemplate> {
    let mut builder = TemplateBuilder::new(ctx);
    for leg in template.legs() {
        let target = ctx.resolve(&leg.target)?;
        if leg.kind == LegKind::Data {
            let from = source.data_offset + leg.from.saturating_sub(data_base);
            let len = leg.len.min(source.length.saturating_sub(leg.from.saturating_sub(data_base)));
            if len > 0 {
                builder.copy(leg.kind, &source.endpoint, &target, from, leg.to, len)?;
            }
        } else {
            let origin = ctx.resolve(&leg.source)?;
            builder.copy(leg.kind, &origin, &target, leg.from, leg.to, leg.len)?;
        }
    }
    Ok(builder.build())
}

/// 刷新输出缓冲状态，满足条件时置空。返回 (是否空闲, 被释放的上游)。
pub(crate) fn release_if_done(topo: &mut Topology, buf: BufferRef) -> Result<(bool, Option<UpstreamRef>)> {
    if buf.port.set != PortSetId::Output {
        return Err(DataplaneError::invalid_argument("not an output buffer"));
    }
    let port = topo.port_mut(buf.port)?;
    let flag = port.output_flag(buf.tid)?;
    let (in_use, slave, releasable) = {
        let out = output_buffer(port, buf.tid)?;
        (out.in_use, out.slave, out.can_release())
    };
    if in_use {
        return Ok((false, None));
    }
    if flag == EF_EMPTY {
        let out = output_buffer_mut(port, buf.tid)?;
        let mut upstream = None;
        if slave {
            // 消费者已回写空标志。
            out.slave = false;
            out.pending.clear();
            out.parts = None;
            upstream = out.zero_copy_from.take();
        }
        return Ok((true, upstream));
    }
    if releasable {
        port.set_output_flag(buf.tid, EF_EMPTY)?;
        let out = output_buffer_mut(port, buf.tid)?;
        out.pending.clear();
        out.parts = None;
        return Ok((true, out.zero_copy_from.take()));
    }
    Ok((false, None))
}
