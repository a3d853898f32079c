//! 模板生成：电路首次就绪时，为每个 (输出端口集, 输入端口集) 组合预计算全部拷贝段。
//!
//! # 核心机制（How）
//! - 输出侧：遍历本地真实输出端口（并行分布只取 rank 0），按模式生成逐对或整组模板，
//!   另为每个目标缓冲生成广播模板；
//! - 输入侧：遍历本地真实输入端口，为每个输出端邮箱生成一次“已消费”回写；同址输出端改为零拷贝释放；
//! - 模式是闭集，唯一需要额外拷贝段的是模式 3：`add_transfer_pre_state` 在元数据段与标志段之间
//!   扇出影子状态并传递令牌，其余模式的数据段前后不插入任何内容。
//!
//! # 契约说明（What）
//! - 可零拷贝的同址组合只登记移交，不产生数据/元数据/标志段；其余组合恰好各一段；
//! - 标志来源优先级：计数 > 元数据 > 状态槽；
//! - 任一请求构建失败即整体失败，电路保持未就绪。

use std::sync::Arc;

use crate::{
    buffer::PortRef,
    controller::TransferPattern,
    descriptor::DescriptorOptions,
    endpoint::{Endpoint, MailboxId},
    error::{DataplaneError, Result},
    layout::{self, BUFFER_METADATA_SIZE, BUFFER_STATE_SIZE, PORT_SET_CONTROL_SIZE, STATE_ROW_SIZE},
    port::Port,
    port_set::{PortSet, Topology},
    template::{
        InputKey, LegKind, OutputKey, PresetMetadata, TemplateBuilder, TemplateTable, TransferTemplate,
    },
    transport::TransportContext,
};

pub(crate) struct TemplateGenerator<'a> {
    ctx: &'a TransportContext,
    topo: &'a Topology,
    set: usize,
    pattern: TransferPattern,
    zero_copy: bool,
}

impl<'a> TemplateGenerator<'a> {
    pub(crate) fn new(
        ctx: &'a TransportContext,
        topo: &'a Topology,
        set: usize,
        pattern: TransferPattern,
    ) -> Self {
        // 分片传输要求每个端口拿到各自的切片，不能共享整块输出缓冲。
        let zero_copy = ctx.config().zero_copy && pattern != TransferPattern::Pattern4;
        Self {
            ctx,
            topo,
            set,
            pattern,
            zero_copy,
        }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(set = self.set, pattern = ?self.pattern))]
    pub(crate) fn generate(&self) -> Result<TemplateTable> {
        if self.pattern == TransferPattern::NotSupported {
            return Err(DataplaneError::unsupported_pattern(
                "no transfer pattern matches this distribution and role combination",
            ));
        }
        let mut table = TemplateTable::default();
        let output = &self.topo.output;
        for (s_idx, s_port) in output.ports().iter().enumerate() {
            if s_port.is_shadow() {
                continue;
            }
            if output.distribution().is_parallel() && s_port.rank() != 0 {
                continue;
            }
            self.create_output_transfers(s_idx, s_port, &mut table)?;
            self.create_broadcast_transfers(s_idx, s_port, &mut table)?;
        }
        let input = self.input_set()?;
        for (t_idx, t_port) in input.ports().iter().enumerate() {
            if t_port.is_shadow() {
                continue;
            }
            self.create_input_transfers(t_idx, t_port, &mut table)?;
        }
        tracing::debug!(templates = table.len(), "transfer templates generated");
        Ok(table)
    }

    fn input_set(&self) -> Result<&'a PortSet> {
        self.topo
            .inputs
            .get(self.set)
            .ok_or_else(|| DataplaneError::invalid_argument(format!("no input port set {}", self.set)))
    }

    fn supports_zero_copy(&self, s_port: &Port, t_port: &Port) -> bool {
        self.zero_copy && !s_port.is_shadow() && !t_port.is_shadow()
    }

    fn create_output_transfers(&self, s_idx: usize, s_port: &Port, table: &mut TemplateTable) -> Result<()> {
        let input = self.input_set()?;
        let n_t = input.buffer_count();
        for s_tid in 0..s_port.buffer_count() {
            match self.pattern {
                TransferPattern::Pattern1 | TransferPattern::Pattern1Afc => {
                    for t_tid in 0..n_t {
                        let mut b = TemplateBuilder::new(self.ctx);
                        for (t_idx, t_port) in input.ports().iter().enumerate() {
                            self.add_pair(&mut b, s_idx, s_port, s_tid, t_idx, t_port, t_tid)?;
                        }
                        table.output.insert(
                            OutputKey {
                                output_port: s_port.id(),
                                output_tid: s_tid,
                                input_port: None,
                                input_tid: t_tid,
                                broadcast: false,
                            },
                            b.build(),
                        );
                    }
                }
                TransferPattern::Pattern2 | TransferPattern::Pattern3 => {
                    for (t_idx, t_port) in input.ports().iter().enumerate() {
                        for t_tid in 0..n_t {
                            let mut b = TemplateBuilder::new(self.ctx);
                            self.add_pair(&mut b, s_idx, s_port, s_tid, t_idx, t_port, t_tid)?;
                            table.output.insert(
                                OutputKey {
                                    output_port: s_port.id(),
                                    output_tid: s_tid,
                                    input_port: Some(t_port.id()),
                                    input_tid: t_tid,
                                    broadcast: false,
                                },
                                b.build(),
                            );
                        }
                    }
                }
                TransferPattern::Pattern4 => {
                    for t_tid in 0..n_t {
                        let template = self.create_gated_transfers(s_idx, s_port, s_tid, t_tid)?;
                        table.output.insert(
                            OutputKey {
                                output_port: s_port.id(),
                                output_tid: s_tid,
                                input_port: None,
                                input_tid: t_tid,
                                broadcast: false,
                            },
                            template,
                        );
                    }
                }
                TransferPattern::Pattern1AfcShadow
                | TransferPattern::Pattern1Passive
                | TransferPattern::NotSupported => {}
            }
        }
        Ok(())
    }

    /// 分片模板：根模板承载第 0 次子传输，门控子模板依次承载后续子传输。
    fn create_gated_transfers(
        &self,
        s_idx: usize,
        s_port: &Port,
        s_tid: usize,
        t_tid: usize,
    ) -> Result<TransferTemplate> {
        let input = self.input_set()?;
        let n_ports = input.port_count();
        let partition = input.distribution().partition;
        let total = s_port.buffer_length();
        let count = partition.transfer_count(total, n_ports);
        let parts_per_whole = partition.parts_per_whole(total, n_ports);
        let plan = partition.plan(total, n_ports);
        let so = s_port.offsets(s_tid)?;
        let src = real_endpoint(s_port)?;
        let s_pid = u64::from(s_port.id());

        let mut builders = Vec::with_capacity(count);
        for transfer in 0..count {
            let mut b = TemplateBuilder::new(self.ctx);
            for span in plan.iter().filter(|span| span.transfer == transfer) {
                let t_port = &input.ports()[span.port];
                let to = t_port.offsets(t_tid)?;
                let dst = real_endpoint(t_port)?;
                let t_pid = u64::from(t_port.id());
                b.preset(PresetMetadata {
                    output: PortRef::output(s_idx).buffer(s_tid),
                    column: t_port.id() as usize,
                    span: *span,
                    parts_per_whole,
                    last_transfer: transfer + 1 == count,
                });
                if span.len > 0 {
                    b.copy(
                        LegKind::Data,
                        &src,
                        &dst,
                        so.buffer_offset + span.offset,
                        to.buffer_offset,
                        span.len.min(t_port.buffer_length()),
                    )?;
                }
                b.copy(
                    LegKind::Metadata,
                    &src,
                    &dst,
                    so.meta_data_offset + t_pid * BUFFER_METADATA_SIZE,
                    to.meta_data_offset + s_pid * BUFFER_METADATA_SIZE,
                    BUFFER_METADATA_SIZE,
                )?;
                b.copy(
                    LegKind::Flag,
                    &src,
                    &dst,
                    flag_source(s_port, t_port, s_tid)?,
                    to.local_state_offset + s_pid * BUFFER_STATE_SIZE,
                    BUFFER_STATE_SIZE,
                )?;
            }
            builders.push(b);
        }
        let mut parts = builders.into_iter();
        let Some(mut root) = parts.next() else {
            return Ok(TransferTemplate::default());
        };
        for part in parts {
            root.gate(part.build());
        }
        Ok(root.build())
    }

    fn create_broadcast_transfers(&self, s_idx: usize, s_port: &Port, table: &mut TemplateTable) -> Result<()> {
        if matches!(
            self.pattern,
            TransferPattern::Pattern1AfcShadow | TransferPattern::Pattern1Passive
        ) {
            return Ok(());
        }
        let input = self.input_set()?;
        // 顺序分布下各输入端口的写游标互不相同，广播按端口各自成模板。
        let per_port = matches!(self.pattern, TransferPattern::Pattern2 | TransferPattern::Pattern3);
        for s_tid in 0..s_port.buffer_count() {
            for t_tid in 0..input.buffer_count() {
                if per_port {
                    for (t_idx, t_port) in input.ports().iter().enumerate() {
                        let mut b = TemplateBuilder::new(self.ctx);
                        self.add_pair_legs(&mut b, s_idx, s_port, s_tid, t_idx, t_port, t_tid, false)?;
                        if t_idx == 0 {
                            self.add_end_of_stream_control(&mut b, s_port)?;
                        }
                        table.output.insert(
                            OutputKey {
                                output_port: s_port.id(),
                                output_tid: s_tid,
                                input_port: Some(t_port.id()),
                                input_tid: t_tid,
                                broadcast: true,
                            },
                            b.build(),
                        );
                    }
                    continue;
                }
                let mut b = TemplateBuilder::new(self.ctx);
                for (t_idx, t_port) in input.ports().iter().enumerate() {
                    self.add_pair_legs(&mut b, s_idx, s_port, s_tid, t_idx, t_port, t_tid, false)?;
                }
                self.add_end_of_stream_control(&mut b, s_port)?;
                table.output.insert(
                    OutputKey {
                        output_port: s_port.id(),
                        output_tid: s_tid,
                        input_port: None,
                        input_tid: t_tid,
                        broadcast: true,
                    },
                    b.build(),
                );
            }
        }
        Ok(())
    }

    /// 流结束需要所有输出端口都看到，控制块拷给其余端口。
    fn add_end_of_stream_control(&self, b: &mut TemplateBuilder<'_>, s_port: &Port) -> Result<()> {
        let src = real_endpoint(s_port)?;
        let own = s_port.offsets(0)?.port_set_control_offset;
        for other in self.topo.output.ports() {
            if other.id() == s_port.id() {
                continue;
            }
            let control = other.offsets(0)?.port_set_control_offset;
            if control == 0 {
                continue;
            }
            b.copy(LegKind::Control, &src, &real_endpoint(other)?, own, control, PORT_SET_CONTROL_SIZE)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn add_pair(
        &self,
        b: &mut TemplateBuilder<'_>,
        s_idx: usize,
        s_port: &Port,
        s_tid: usize,
        t_idx: usize,
        t_port: &Port,
        t_tid: usize,
    ) -> Result<()> {
        let with_pre_state = self.pattern == TransferPattern::Pattern3;
        self.add_pair_legs(b, s_idx, s_port, s_tid, t_idx, t_port, t_tid, with_pre_state)
    }

    /// 一对 (输出缓冲, 输入缓冲) 的拷贝段：数据、元数据、前置状态、标志。
    #[allow(clippy::too_many_arguments)]
    fn add_pair_legs(
        &self,
        b: &mut TemplateBuilder<'_>,
        s_idx: usize,
        s_port: &Port,
        s_tid: usize,
        t_idx: usize,
        t_port: &Port,
        t_tid: usize,
        with_pre_state: bool,
    ) -> Result<()> {
        let output_ref = PortRef::output(s_idx).buffer(s_tid);
        let input_ref = PortRef::input(self.set, t_idx).buffer(t_tid);
        if self.supports_zero_copy(s_port, t_port) {
            b.hand_off(output_ref, input_ref);
            if with_pre_state {
                self.add_transfer_pre_state(b, s_port, s_tid, t_port, t_tid, true)?;
            }
            return Ok(());
        }
        let so = s_port.offsets(s_tid)?;
        let to = t_port.offsets(t_tid)?;
        let src = real_endpoint(s_port)?;
        let dst = real_endpoint(t_port)?;
        let s_pid = u64::from(s_port.id());
        // 远端消费者自行拉取数据，生产者只送满标志。
        let flag_only = self.pattern == TransferPattern::Pattern1Afc && t_port.is_shadow();

        if !flag_only {
            b.copy(
                LegKind::Data,
                &src,
                &dst,
                so.buffer_offset,
                to.buffer_offset,
                s_port.buffer_length().min(t_port.buffer_length()),
            )?;
            b.copy(
                LegKind::Metadata,
                &src,
                &dst,
                so.meta_data_offset + s_pid * BUFFER_METADATA_SIZE,
                to.meta_data_offset + s_pid * BUFFER_METADATA_SIZE,
                BUFFER_METADATA_SIZE,
            )?;
        }
        if with_pre_state {
            self.add_transfer_pre_state(b, s_port, s_tid, t_port, t_tid, false)?;
        }
        b.copy(
            LegKind::Flag,
            &src,
            &dst,
            flag_source(s_port, t_port, s_tid)?,
            to.local_state_offset + s_pid * BUFFER_STATE_SIZE,
            BUFFER_STATE_SIZE,
        )?;
        Ok(())
    }

    /// 顺序分布：把本端已置满的影子状态扇出给其它输出端邮箱，再把令牌交给下一个输出端口。
    fn add_transfer_pre_state(
        &self,
        b: &mut TemplateBuilder<'_>,
        s_port: &Port,
        s_tid: usize,
        t_port: &Port,
        t_tid: usize,
        zero_copy: bool,
    ) -> Result<()> {
        let output = &self.topo.output;
        let src = real_endpoint(s_port)?;
        let our_mb = s_port.mailbox().unwrap_or_default();

        if !zero_copy && t_port.is_shadow() {
            let shadow_home = t_port
                .local_endpoint()
                .cloned()
                .ok_or_else(|| DataplaneError::not_ready("shadow port has no local endpoint").with_port(t_port.id()))?;
            let shadows = t_port.offsets(t_tid)?.my_shadows_remote_state_offsets;
            let ours = shadows[our_mb as usize];
            let mut sent: Vec<MailboxId> = vec![our_mb];
            for other in output.ports() {
                let Some(mb) = other.mailbox() else { continue };
                if sent.contains(&mb) || shadows[mb as usize] == 0 || ours == 0 {
                    continue;
                }
                sent.push(mb);
                b.copy(
                    LegKind::PreState,
                    &shadow_home,
                    &real_endpoint(other)?,
                    ours,
                    shadows[mb as usize],
                    BUFFER_STATE_SIZE,
                )?;
            }
        }

        let count = output.port_count();
        if count > 1 {
            let next = &output.ports()[(s_port.rank() + 1) % count];
            let from = s_port.offsets(s_tid)?.port_set_control_offset;
            let to = next.offsets(0)?.port_set_control_offset;
            if to != 0 {
                b.copy(LegKind::Control, &src, &real_endpoint(next)?, from, to, PORT_SET_CONTROL_SIZE)?;
            }
        }
        Ok(())
    }

    fn create_input_transfers(&self, t_idx: usize, t_port: &Port, table: &mut TemplateTable) -> Result<()> {
        if self.pattern == TransferPattern::Pattern1Passive {
            return Ok(());
        }
        let output = &self.topo.output;
        let t_pid = u64::from(t_port.id());
        let dst_local = real_endpoint(t_port)?;
        for t_tid in 0..t_port.buffer_count() {
            let to = t_port.offsets(t_tid)?;
            let staged_empty = to.local_state_offset + STATE_ROW_SIZE + t_pid * BUFFER_STATE_SIZE;
            let mut consume = TemplateBuilder::new(self.ctx);
            let mut pull = TemplateBuilder::new(self.ctx);
            let mut sent: Vec<MailboxId> = Vec::new();

            for s_port in output.ports() {
                let Some(s_mb) = s_port.mailbox() else { continue };
                if sent.contains(&s_mb) {
                    continue;
                }
                if output.distribution().is_parallel() && s_port.rank() != 0 {
                    continue;
                }
                sent.push(s_mb);
                if !s_port.is_shadow() {
                    if self.pattern == TransferPattern::Pattern1Afc && !self.zero_copy {
                        // 同址 AFC 输出缓冲只认消费者回写的空标志。
                        let so = s_port.offsets(t_tid)?;
                        let s_pid = u64::from(s_port.id());
                        consume.copy(
                            LegKind::Flag,
                            &dst_local,
                            &real_endpoint(s_port)?,
                            staged_empty,
                            so.local_state_offset + s_pid * BUFFER_STATE_SIZE,
                            BUFFER_STATE_SIZE,
                        )?;
                    } else {
                        // 同址输出端：消费时解除挂接或直接观察真实状态，无需回写。
                        consume.release_zero_copy();
                    }
                    continue;
                }
                let s_ep = real_endpoint(s_port)?;
                if self.pattern == TransferPattern::Pattern1AfcShadow {
                    if s_port.buffer_count() != t_port.buffer_count() {
                        return Err(DataplaneError::protocol_violation(format!(
                            "flow-controlled pull needs equal buffer counts, output has {} and input has {}",
                            s_port.buffer_count(),
                            t_port.buffer_count()
                        ))
                        .with_port(t_port.id()));
                    }
                    let so = s_port.offsets(t_tid)?;
                    let s_pid = u64::from(s_port.id());
                    pull.copy(
                        LegKind::Pull,
                        &s_ep,
                        &dst_local,
                        so.buffer_offset,
                        to.buffer_offset,
                        s_port.buffer_length().min(t_port.buffer_length()),
                    )?;
                    pull.copy(
                        LegKind::Pull,
                        &s_ep,
                        &dst_local,
                        so.meta_data_offset + s_pid * BUFFER_METADATA_SIZE,
                        to.meta_data_offset + s_pid * BUFFER_METADATA_SIZE,
                        BUFFER_METADATA_SIZE,
                    )?;
                    consume.copy(
                        LegKind::Flag,
                        &dst_local,
                        &s_ep,
                        staged_empty,
                        so.local_state_offset + s_pid * BUFFER_STATE_SIZE,
                        BUFFER_STATE_SIZE,
                    )?;
                } else {
                    let shadow = to.my_shadows_remote_state_offsets[s_mb as usize];
                    if shadow == 0 {
                        return Err(DataplaneError::not_ready(format!(
                            "shadow state for mailbox {s_mb} is not known yet"
                        ))
                        .with_port(t_port.id()));
                    }
                    consume.copy(LegKind::Flag, &dst_local, &s_ep, staged_empty, shadow, BUFFER_STATE_SIZE)?;
                }
            }
            let key = InputKey {
                input_port: t_port.id(),
                input_tid: t_tid,
                broadcast: false,
            };
            table.input.insert(key, consume.build());
            let pull = pull.build();
            if !pull.is_empty() {
                table.pull.insert(key, pull);
            }
        }
        Ok(())
    }
}

fn real_endpoint(port: &Port) -> Result<Arc<dyn Endpoint>> {
    port.real_endpoint()
        .cloned()
        .ok_or_else(|| DataplaneError::not_ready("port has no resolved endpoint").with_port(port.id()))
}

/// 满标志的来源：计数 > 元数据 > 预置状态槽。
fn flag_source(s_port: &Port, t_port: &Port, s_tid: usize) -> Result<u64> {
    let so = s_port.offsets(s_tid)?;
    let s_pid = u64::from(s_port.id());
    let options = DescriptorOptions::from_bits(
        s_port.descriptor().options.bits() | t_port.descriptor().options.bits(),
    );
    let meta_slot = so.meta_data_offset + s_pid * BUFFER_METADATA_SIZE;
    Ok(if options.contains(DescriptorOptions::FLAG_IS_COUNTING) {
        meta_slot + layout::meta::TIMESTAMP
    } else if options.contains(DescriptorOptions::FLAG_IS_META) {
        meta_slot + layout::meta::XFER_META_DATA
    } else {
        so.local_state_offset + STATE_ROW_SIZE + s_pid * BUFFER_STATE_SIZE
    })
}
