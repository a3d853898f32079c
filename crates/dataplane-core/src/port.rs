//! 端口：缓冲区间的所有者、偏移表的发布者与握手状态机的载体。
//!
//! # 模块角色（Why）
//! - 端口把“真实/影子 × 输入/输出”四种角色的内存布局收敛到一个类型，
//!   上层控制器只通过缓冲编号与端口编号读写标志、元数据与数据；
//! - 影子端口代表远端的真实端口，只持有本地需要的那一部分（影子状态槽、偏移表）。
//!
//! # 核心机制（How）
//! - [`Port::initialize`] 解析端点、按角色向分配器申请区间并写入偏移表；
//!   所有区间由 [`OffsetLease`] 持有，中途失败时已分配的区间随局部变量释放；
//! - [`Port::ready`] 按角色轮询偏移组，缺失时通过邮箱向远端请求；
//! - 描述符路径（[`Port::fill_port_descriptor`]、[`Port::finish_connect`]、
//!   [`Port::set_flow_control_descriptor`]）可以不经邮箱完成同样的偏移交换。
//!
//! # 契约说明（What）
//! - 偏移表的唯一真相在本地 SMB 中，远端应答方直接写入；
//! - 真实输出端口状态：行 0 第 pid 列为本端口的空标志，行 1 预置 `FF_FULL`；
//! - 真实输入端口状态：行 0 第 s_pid 列为生产者写入的满标志，行 1 预置 `EF_EMPTY`；
//! - 影子输入端口状态：`my_shadows[本地邮箱]` 指向的空标志槽。

use std::{collections::BTreeMap, sync::Arc};

use bytes::Bytes;

use crate::{
    buffer::{InputBuffer, OutputBuffer},
    descriptor::{DescriptorOptions, DescriptorType, Descriptors, OutOfBand, Role},
    endpoint::{Endpoint, MailboxId, MappedRegion, MemoryServices},
    error::{DataplaneError, Result},
    handshake::{GroupAction, Mailbox, MailboxRequest, OffsetGroup, OffsetGroupKey, RequestKind},
    layout::{
        self, BUFFER_METADATA_SIZE, BUFFER_OFFSETS_SIZE, BUFFER_STATE_SIZE, BufferMetaData,
        BufferOffsets, BufferState, EF_EMPTY, FF_EMPTY, FF_FULL, MAX_PCONTRIBS, METADATA_BLOCK_SIZE,
        OutputPortSetControl, PORT_SET_CONTROL_SIZE, STATE_BLOCK_SIZE, STATE_ROW_SIZE,
    },
    metadata::{PortId, PortMetadata},
    resource::OffsetLease,
    transport::TransportContext,
};

/// 端口持有哪些区间由角色决定。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PortRole {
    RealOutput,
    RealInput,
    ShadowOutput,
    ShadowInput,
}

impl PortRole {
    pub fn is_shadow(self) -> bool {
        matches!(self, PortRole::ShadowOutput | PortRole::ShadowInput)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Unconnected,
    Initializing,
    WaitingForUpdate,
    DefinitionComplete,
    Ready,
}

/// 输入端口握手时需要知道的输出端口信息。
#[derive(Clone)]
pub(crate) struct OutputPeer {
    pub endpoint: Arc<dyn Endpoint>,
    pub local: bool,
}

/// 影子输出端口请求控制块时顺带拉取协议字符串的目标区间。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ProtocolSlot {
    pub offset: u64,
    pub size: u64,
}

#[derive(Default)]
struct Regions {
    data: Option<OffsetLease>,
    state: Option<OffsetLease>,
    metadata: Option<OffsetLease>,
    control: Option<OffsetLease>,
    shadow_state: Option<OffsetLease>,
}

pub struct Port {
    meta: PortMetadata,
    output: bool,
    rank: usize,
    buffer_count: usize,
    buffer_length: u64,
    alignment: u64,
    role: Option<PortRole>,
    state: ConnectionState,
    real: Option<Arc<dyn Endpoint>>,
    local: Option<Arc<dyn Endpoint>>,
    table: Option<OffsetLease>,
    /// 偏移表的映射窗口，按缓冲编号读写条目。
    table_view: Option<MappedRegion>,
    regions: Regions,
    groups: BTreeMap<OffsetGroupKey, OffsetGroup>,
    pub(crate) output_buffers: Vec<OutputBuffer>,
    pub(crate) input_buffers: Vec<InputBuffer>,
    /// 最近一次成功取出的缓冲编号（循环顺序指针）。
    last_tid: usize,
    /// 顺序分布下发往本端口的下一个目标缓冲。
    pub(crate) produce_tid: usize,
    descriptor: Descriptors,
    peer_descriptor: Option<Descriptors>,
    busy_factor: u32,
}

impl Port {
    pub(crate) fn new(
        meta: PortMetadata,
        output: bool,
        rank: usize,
        buffer_count: usize,
        buffer_length: u64,
        alignment: u64,
    ) -> Self {
        let descriptor = Descriptors {
            kind: if output {
                DescriptorType::Producer
            } else {
                DescriptorType::Consumer
            },
            role: meta.role.or_default_for(output),
            options: meta.options,
            ..Descriptors::default()
        };
        Self {
            meta,
            output,
            rank,
            buffer_count,
            buffer_length,
            alignment,
            role: None,
            state: ConnectionState::Unconnected,
            real: None,
            local: None,
            table: None,
            table_view: None,
            regions: Regions::default(),
            groups: BTreeMap::new(),
            output_buffers: Vec::new(),
            input_buffers: Vec::new(),
            last_tid: buffer_count.saturating_sub(1),
            produce_tid: 0,
            descriptor,
            peer_descriptor: None,
            busy_factor: 0,
        }
    }

    pub fn id(&self) -> PortId {
        self.meta.id
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn is_output(&self) -> bool {
        self.output
    }

    pub fn is_shadow(&self) -> bool {
        self.role.is_some_and(PortRole::is_shadow)
    }

    pub fn role(&self) -> Option<PortRole> {
        self.role
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn metadata(&self) -> &PortMetadata {
        &self.meta
    }

    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    pub fn buffer_length(&self) -> u64 {
        self.buffer_length
    }

    pub fn descriptor(&self) -> &Descriptors {
        &self.descriptor
    }

    pub fn peer_descriptor(&self) -> Option<&Descriptors> {
        self.peer_descriptor.as_ref()
    }

    /// 角色（默认值已套用）。
    pub fn connection_role(&self) -> Role {
        self.descriptor.role
    }

    pub fn real_endpoint(&self) -> Option<&Arc<dyn Endpoint>> {
        self.real.as_ref()
    }

    /// 偏移表与影子区间所在的本地端点。
    pub fn local_endpoint(&self) -> Option<&Arc<dyn Endpoint>> {
        self.local.as_ref()
    }

    /// 真实缓冲所在端点的邮箱号。
    pub fn mailbox(&self) -> Option<MailboxId> {
        self.real.as_ref().map(|ep| ep.mailbox())
    }

    pub fn is_initialized(&self) -> bool {
        self.role.is_some()
    }

    pub fn busy_factor(&self) -> u32 {
        self.busy_factor
    }

    pub fn set_busy_factor(&mut self, busy: u32) {
        self.busy_factor = busy;
    }

    pub(crate) fn set_real_location(&mut self, location: impl Into<String>) {
        self.meta.real_location = Some(location.into());
    }

    pub(crate) fn last_tid(&self) -> usize {
        self.last_tid
    }

    pub(crate) fn set_last_tid(&mut self, tid: usize) {
        self.last_tid = tid;
    }

    fn not_initialized(&self) -> DataplaneError {
        DataplaneError::not_ready("port is not initialized").with_port(self.meta.id)
    }

    fn local(&self) -> Result<&Arc<dyn Endpoint>> {
        self.local.as_ref().ok_or_else(|| self.not_initialized())
    }

    pub(crate) fn memory(&self) -> Result<Arc<dyn MemoryServices>> {
        Ok(self.local()?.memory())
    }

    /// 解析端点并按角色分配区间；重复调用无副作用。
    ///
    /// 真实位置未知时返回 `Ok(false)`，初始化延后到位置确定之后。
    #[tracing::instrument(level = "debug", skip_all, fields(port = self.meta.id))]
    pub(crate) fn initialize(&mut self, ctx: &TransportContext) -> Result<bool> {
        if self.role.is_some() {
            return Ok(true);
        }
        let Some(location) = self.meta.real_location.clone() else {
            return Ok(false);
        };
        self.state = ConnectionState::Initializing;
        let real = ctx.resolve(&location)?;
        let shadow = !ctx.is_local(real.name());
        let local = if shadow {
            match &self.meta.shadow_location {
                Some(name) => ctx.local_endpoint(name).cloned().ok_or_else(|| {
                    DataplaneError::invalid_argument(format!("shadow endpoint `{name}` is not local"))
                        .with_port(self.meta.id)
                })?,
                None => Arc::clone(ctx.default_endpoint()?),
            }
        } else {
            Arc::clone(&real)
        };
        let role = match (self.output, shadow) {
            (true, false) => PortRole::RealOutput,
            (false, false) => PortRole::RealInput,
            (true, true) => PortRole::ShadowOutput,
            (false, true) => PortRole::ShadowInput,
        };

        let count = self.buffer_count as u64;
        let align = self.alignment;
        let table = OffsetLease::acquire(&local, BUFFER_OFFSETS_SIZE * count, align)?;
        table.zero()?;
        let view = local.map(table.offset(), BUFFER_OFFSETS_SIZE * count)?;
        let memory = local.memory();
        let mut entries = vec![BufferOffsets::default(); self.buffer_count];
        let mut regions = Regions::default();

        match role {
            PortRole::RealOutput | PortRole::RealInput => {
                let data = OffsetLease::acquire(&local, self.buffer_length * count, align)?;
                let state = OffsetLease::acquire(&local, STATE_BLOCK_SIZE * count, align)?;
                let metadata = OffsetLease::acquire(&local, METADATA_BLOCK_SIZE * count, align)?;
                data.zero()?;
                state.zero()?;
                metadata.zero()?;
                let control = if self.output {
                    let control = OffsetLease::acquire(&local, PORT_SET_CONTROL_SIZE, align)?;
                    control.zero()?;
                    Some(control)
                } else {
                    None
                };
                // 行 0 是对端写入的标志，行 1 是供模板拷贝的预置常量。
                let (row0, row1) = if self.output {
                    (EF_EMPTY, FF_FULL)
                } else {
                    (FF_EMPTY, EF_EMPTY)
                };
                for (tid, entry) in entries.iter_mut().enumerate() {
                    let tid = tid as u64;
                    entry.buffer_offset = data.offset() + self.buffer_length * tid;
                    entry.buffer_size = self.buffer_length;
                    entry.local_state_offset = state.offset() + STATE_BLOCK_SIZE * tid;
                    entry.meta_data_offset = metadata.offset() + METADATA_BLOCK_SIZE * tid;
                    entry.port_set_control_offset = control.as_ref().map_or(0, |c| c.offset());
                    for col in 0..MAX_PCONTRIBS as u64 {
                        let slot = entry.local_state_offset + col * BUFFER_STATE_SIZE;
                        memory.write_u32(slot + layout::state::FLAG, row0)?;
                        memory.write_u32(slot + STATE_ROW_SIZE + layout::state::FLAG, row1)?;
                    }
                }
                regions.data = Some(data);
                regions.state = Some(state);
                regions.metadata = Some(metadata);
                regions.control = control;
            }
            PortRole::ShadowInput => {
                let slots = OffsetLease::acquire(&local, BUFFER_STATE_SIZE * count, align)?;
                slots.zero()?;
                let mb = local.mailbox() as usize;
                for (tid, entry) in entries.iter_mut().enumerate() {
                    let slot = slots.offset() + BUFFER_STATE_SIZE * tid as u64;
                    memory.write_u32(slot + layout::state::FLAG, EF_EMPTY)?;
                    entry.buffer_size = self.buffer_length;
                    entry.my_shadows_remote_state_offsets[mb] = slot;
                }
                regions.shadow_state = Some(slots);
            }
            PortRole::ShadowOutput => {}
        }

        for (tid, entry) in entries.iter().enumerate() {
            view.write(BUFFER_OFFSETS_SIZE * tid as u64, &entry.encode())?;
        }

        self.output_buffers = if self.output {
            (0..self.buffer_count).map(OutputBuffer::new).collect()
        } else {
            Vec::new()
        };
        self.input_buffers = if self.output {
            Vec::new()
        } else {
            (0..self.buffer_count).map(InputBuffer::new).collect()
        };
        self.descriptor.desc.oob.oep = real.name().to_owned();
        self.descriptor.desc.oob.port_id = u64::from(self.meta.id);
        self.table = Some(table);
        self.table_view = Some(view);
        self.regions = regions;
        self.real = Some(real);
        self.local = Some(local);
        self.role = Some(role);
        self.state = ConnectionState::WaitingForUpdate;
        tracing::debug!(port = self.meta.id, ?role, "port initialized");
        Ok(true)
    }

    /// 释放全部区间；可重复调用，只在第一次生效。
    pub(crate) fn teardown(&mut self) {
        self.regions = Regions::default();
        self.table_view = None;
        self.table = None;
        self.output_buffers.clear();
        self.input_buffers.clear();
        self.groups.clear();
        self.role = None;
        self.state = ConnectionState::Unconnected;
    }

    /// 把全部缓冲恢复为空、循环指针归位；区间保持不变。
    pub(crate) fn reset(&mut self) -> Result<()> {
        self.last_tid = self.buffer_count.saturating_sub(1);
        self.produce_tid = 0;
        for buffer in &mut self.output_buffers {
            buffer.reset();
        }
        for buffer in &mut self.input_buffers {
            buffer.reset();
        }
        match self.role {
            Some(PortRole::RealOutput) => {
                for tid in 0..self.buffer_count {
                    self.set_output_flag(tid, EF_EMPTY)?;
                }
            }
            Some(PortRole::RealInput) => {
                for tid in 0..self.buffer_count {
                    self.clear_input_flags(tid)?;
                }
            }
            Some(PortRole::ShadowInput) => {
                for tid in 0..self.buffer_count {
                    self.set_shadow_flag(tid, EF_EMPTY)?;
                }
            }
            Some(PortRole::ShadowOutput) | None => {}
        }
        if self.state == ConnectionState::Ready {
            self.state = ConnectionState::WaitingForUpdate;
        }
        Ok(())
    }

    // ---- 偏移表 -------------------------------------------------------------

    pub fn offsets_table_offset(&self) -> Result<u64> {
        self.table
            .as_ref()
            .map(OffsetLease::offset)
            .ok_or_else(|| self.not_initialized())
    }

    fn table_view(&self) -> Result<&MappedRegion> {
        self.table_view.as_ref().ok_or_else(|| self.not_initialized())
    }

    /// 第 `tid` 个缓冲的偏移表条目。
    pub fn offsets(&self, tid: usize) -> Result<BufferOffsets> {
        self.check_tid(tid)?;
        let mut raw = [0u8; BUFFER_OFFSETS_SIZE as usize];
        self.table_view()?.read(BUFFER_OFFSETS_SIZE * tid as u64, &mut raw)?;
        Ok(BufferOffsets::decode(&raw))
    }

    pub(crate) fn write_offsets_field(&self, tid: usize, field: u64, value: u64) -> Result<()> {
        self.check_tid(tid)?;
        self.table_view()?
            .write(BUFFER_OFFSETS_SIZE * tid as u64 + field, &value.to_le_bytes())
    }

    fn check_tid(&self, tid: usize) -> Result<()> {
        if tid >= self.buffer_count {
            return Err(DataplaneError::invalid_argument(format!(
                "buffer {tid} is outside 0..{}",
                self.buffer_count
            ))
            .with_port(self.meta.id));
        }
        Ok(())
    }

    // ---- 状态标志 -----------------------------------------------------------

    fn state_slot(&self, tid: usize, row: u64, col: usize) -> Result<u64> {
        Ok(self.offsets(tid)?.local_state_offset + row * STATE_ROW_SIZE + col as u64 * BUFFER_STATE_SIZE)
    }

    pub(crate) fn read_state(&self, tid: usize, row: u64, col: usize) -> Result<BufferState> {
        let mut raw = [0u8; BUFFER_STATE_SIZE as usize];
        self.memory()?.read(self.state_slot(tid, row, col)?, &mut raw)?;
        Ok(BufferState::decode(&raw))
    }

    /// 真实输出端口的空标志（行 0 第 pid 列）。
    pub(crate) fn output_flag(&self, tid: usize) -> Result<u32> {
        Ok(self.read_state(tid, 0, self.meta.id as usize)?.flag)
    }

    pub(crate) fn set_output_flag(&self, tid: usize, flag: u32) -> Result<()> {
        let slot = self.state_slot(tid, 0, self.meta.id as usize)?;
        self.memory()?.write_u32(slot + layout::state::FLAG, flag)
    }

    /// 真实输入端口中被置满的列（写入方端口编号）。
    pub(crate) fn full_column(&self, tid: usize) -> Result<Option<usize>> {
        let memory = self.memory()?;
        let base = self.state_slot(tid, 0, 0)?;
        for col in 0..MAX_PCONTRIBS {
            let flag = memory.read_u32(base + col as u64 * BUFFER_STATE_SIZE + layout::state::FLAG)?;
            if flag != FF_EMPTY {
                return Ok(Some(col));
            }
        }
        Ok(None)
    }

    pub(crate) fn set_input_flag(&self, tid: usize, col: usize, flag: u32) -> Result<()> {
        let slot = self.state_slot(tid, 0, col)?;
        self.memory()?.write_u32(slot + layout::state::FLAG, flag)
    }

    pub(crate) fn clear_input_flags(&self, tid: usize) -> Result<()> {
        let base = self.state_slot(tid, 0, 0)?;
        self.memory()?.write(base, &[0u8; STATE_ROW_SIZE as usize])
    }

    /// 在行 1 的预置空标志中写入本端口的负载，随“已消费”一起传播到影子。
    pub(crate) fn stage_busy_factor(&self, tid: usize, busy: u32) -> Result<()> {
        let slot = self.state_slot(tid, 1, self.meta.id as usize)?;
        self.memory()?.write_u32(slot + layout::state::BUSY_FACTOR, busy)
    }

    fn shadow_slot(&self, tid: usize) -> Result<u64> {
        let mb = self.local()?.mailbox() as usize;
        Ok(self.offsets(tid)?.my_shadows_remote_state_offsets[mb])
    }

    /// 影子输入端口的空标志槽。
    pub(crate) fn shadow_state(&self, tid: usize) -> Result<BufferState> {
        let mut raw = [0u8; BUFFER_STATE_SIZE as usize];
        self.memory()?.read(self.shadow_slot(tid)?, &mut raw)?;
        Ok(BufferState::decode(&raw))
    }

    pub(crate) fn set_shadow_flag(&self, tid: usize, flag: u32) -> Result<()> {
        let slot = self.shadow_slot(tid)?;
        self.memory()?.write_u32(slot + layout::state::FLAG, flag)
    }

    // ---- 元数据与数据 -------------------------------------------------------

    pub(crate) fn metadata_slot(&self, tid: usize, col: usize) -> Result<u64> {
        Ok(self.offsets(tid)?.meta_data_offset + col as u64 * BUFFER_METADATA_SIZE)
    }

    pub fn read_metadata(&self, tid: usize, col: usize) -> Result<BufferMetaData> {
        let mut raw = [0u8; BUFFER_METADATA_SIZE as usize];
        self.memory()?.read(self.metadata_slot(tid, col)?, &mut raw)?;
        Ok(BufferMetaData::decode(&raw))
    }

    pub(crate) fn write_metadata(&self, tid: usize, col: usize, md: &BufferMetaData) -> Result<()> {
        self.memory()?.write(self.metadata_slot(tid, col)?, &md.encode())
    }

    pub(crate) fn write_data(&self, tid: usize, payload: &[u8]) -> Result<()> {
        if payload.len() as u64 > self.buffer_length {
            return Err(DataplaneError::invalid_argument(format!(
                "payload of {} bytes exceeds buffer length {}",
                payload.len(),
                self.buffer_length
            ))
            .with_port(self.meta.id));
        }
        self.memory()?.write(self.offsets(tid)?.buffer_offset, payload)
    }

    pub(crate) fn read_data(&self, tid: usize, len: u64) -> Result<Bytes> {
        let len = len.min(self.buffer_length) as usize;
        let mut out = vec![0u8; len];
        self.memory()?.read(self.offsets(tid)?.buffer_offset, &mut out)?;
        Ok(Bytes::from(out))
    }

    pub(crate) fn read_control(&self) -> Result<OutputPortSetControl> {
        let mut raw = [0u8; PORT_SET_CONTROL_SIZE as usize];
        self.memory()?.read(self.offsets(0)?.port_set_control_offset, &mut raw)?;
        Ok(OutputPortSetControl::decode(&raw))
    }

    pub(crate) fn write_control(&self, control: &OutputPortSetControl) -> Result<()> {
        self.memory()?
            .write(self.offsets(0)?.port_set_control_offset, &control.encode())
    }

    // ---- 握手 ---------------------------------------------------------------

    /// 非阻塞轮询：偏移齐备返回 `true`，否则在邮箱空闲时发出请求。
    pub(crate) fn ready(
        &mut self,
        ctx: &TransportContext,
        circuit: u32,
        peers: &[OutputPeer],
        protocol: Option<ProtocolSlot>,
    ) -> Result<bool> {
        if !self.initialize(ctx)? {
            return Ok(false);
        }
        if self.state == ConnectionState::Ready {
            return Ok(true);
        }
        if self.state == ConnectionState::DefinitionComplete {
            // 描述符路径已经填好偏移表。
            self.state = ConnectionState::Ready;
            return Ok(true);
        }
        let role = self.role.ok_or_else(|| self.not_initialized())?;
        let complete = match role {
            PortRole::RealOutput => true,
            PortRole::RealInput => self.poll_shadow_states(ctx, circuit, peers)?,
            PortRole::ShadowInput => {
                let offsets = self.poll_input_offsets(ctx, circuit)?;
                let states = self.poll_shadow_states(ctx, circuit, peers)?;
                offsets && states
            }
            PortRole::ShadowOutput => self.poll_output_control(ctx, circuit, protocol)?,
        };
        if complete {
            self.state = ConnectionState::Ready;
            tracing::debug!(circuit, port = self.meta.id, ?role, "port ready");
        }
        Ok(complete)
    }

    fn request(&self, kind: RequestKind, circuit: u32) -> Result<MailboxRequest> {
        let local = self.local()?;
        Ok(MailboxRequest {
            kind,
            circuit_id: self.meta.remote_circuit_id.unwrap_or(circuit),
            port_id: self.meta.remote_port_id.unwrap_or(self.meta.id),
            return_mailbox: local.mailbox(),
            return_offset: self.offsets_table_offset()?,
            return_size: self.buffer_count as u64,
            protocol_offset: 0,
            protocol_size: 0,
            url: local.name().to_owned(),
        })
    }

    fn poll_group(
        &mut self,
        ctx: &TransportContext,
        key: OffsetGroupKey,
        satisfied: bool,
        target: &Arc<dyn Endpoint>,
        request: MailboxRequest,
    ) -> Result<bool> {
        let local = Arc::clone(self.local()?);
        let mailbox = Mailbox::new(&local);
        let free = satisfied || mailbox.is_available()?;
        let group = self.groups.entry(key).or_default();
        match group.poll(satisfied, free) {
            GroupAction::Done => Ok(true),
            GroupAction::Wait => Ok(false),
            GroupAction::Issue => {
                if ctx.config().use_mailboxes {
                    mailbox.post(ctx.factory(), target, &request)?;
                    group.mark_requested();
                }
                Ok(false)
            }
        }
    }

    fn poll_shadow_states(
        &mut self,
        ctx: &TransportContext,
        circuit: u32,
        peers: &[OutputPeer],
    ) -> Result<bool> {
        let last = self.buffer_count - 1;
        let mut complete = true;
        let mut seen: Vec<MailboxId> = Vec::new();
        for peer in peers {
            let mb = peer.endpoint.mailbox();
            if seen.contains(&mb) {
                continue;
            }
            seen.push(mb);
            let field = layout::offsets::shadow(mb as usize);
            if peer.local {
                // 同进程的输出端直接观察真实状态，影子槽只需一个非零占位。
                if self.role == Some(PortRole::RealInput) {
                    for tid in 0..self.buffer_count {
                        if self.offsets(tid)?.my_shadows_remote_state_offsets[mb as usize] == 0 {
                            let state = self.offsets(tid)?.local_state_offset;
                            self.write_offsets_field(tid, field, state)?;
                        }
                    }
                }
                continue;
            }
            let satisfied = self.offsets(last)?.my_shadows_remote_state_offsets[mb as usize] != 0;
            let request = self.request(RequestKind::ShadowRstateOffset, circuit)?;
            let done = self.poll_group(
                ctx,
                OffsetGroupKey::ShadowState(mb),
                satisfied,
                &peer.endpoint,
                request,
            )?;
            complete &= done;
        }
        Ok(complete)
    }

    fn poll_input_offsets(&mut self, ctx: &TransportContext, circuit: u32) -> Result<bool> {
        let last = self.offsets(self.buffer_count - 1)?;
        let satisfied =
            last.buffer_offset != 0 && last.local_state_offset != 0 && last.meta_data_offset != 0;
        let target = Arc::clone(self.real.as_ref().ok_or_else(|| self.not_initialized())?);
        let request = self.request(RequestKind::InputOffsets, circuit)?;
        self.poll_group(ctx, OffsetGroupKey::InputOffsets, satisfied, &target, request)
    }

    fn poll_output_control(
        &mut self,
        ctx: &TransportContext,
        circuit: u32,
        protocol: Option<ProtocolSlot>,
    ) -> Result<bool> {
        let satisfied = self.offsets(0)?.port_set_control_offset != 0;
        let target = Arc::clone(self.real.as_ref().ok_or_else(|| self.not_initialized())?);
        let mut request = self.request(RequestKind::OutputControlOffset, circuit)?;
        if let Some(slot) = protocol {
            request.protocol_offset = slot.offset;
            request.protocol_size = slot.size;
        }
        self.poll_group(ctx, OffsetGroupKey::OutputControl, satisfied, &target, request)
    }

    pub fn offset_group(&self, key: OffsetGroupKey) -> Option<OffsetGroup> {
        self.groups.get(&key).copied()
    }

    // ---- 描述符 -------------------------------------------------------------

    /// 生成本端口（必须是真实端口）的描述符。
    ///
    /// 输出端口与对端声明的缓冲数不一致时记录告警，并以本地数量为准。
    pub fn fill_port_descriptor(&self, desc: &mut Descriptors, other: Option<&Descriptors>) -> Result<()> {
        if self.is_shadow() {
            return Err(DataplaneError::protocol_violation(
                "port descriptors are only available for real ports",
            )
            .with_port(self.meta.id));
        }
        let first = self.offsets(0)?;
        if let Some(other) = other
            && self.output
            && other.desc.n_buffers as usize != self.buffer_count
        {
            tracing::warn!(
                port = self.meta.id,
                local = self.buffer_count,
                remote = other.desc.n_buffers,
                "buffer count mismatch, forcing local count"
            );
        }
        desc.kind = self.descriptor.kind;
        desc.role = self.descriptor.role;
        desc.options = self.descriptor.options;
        let d = &mut desc.desc;
        d.n_buffers = self.buffer_count as u32;
        d.data_buffer_base_addr = first.buffer_offset;
        d.data_buffer_pitch = self.buffer_length as u32;
        d.data_buffer_size = self.buffer_length as u32;
        d.meta_data_base_addr = first.meta_data_offset;
        d.meta_data_pitch = METADATA_BLOCK_SIZE as u32;
        d.full_flag_size = BUFFER_STATE_SIZE as u32;
        d.full_flag_base_addr = first.local_state_offset;
        d.full_flag_pitch = STATE_BLOCK_SIZE as u32;
        d.full_flag_value = u64::from(FF_FULL);
        if self.output {
            d.empty_flag_size = BUFFER_STATE_SIZE as u32;
            d.empty_flag_base_addr = first.local_state_offset;
            d.empty_flag_pitch = STATE_BLOCK_SIZE as u32;
            d.empty_flag_value = u64::from(EF_EMPTY);
        }
        d.oob = OutOfBand {
            oep: self.real.as_ref().map(|ep| ep.name().to_owned()).unwrap_or_default(),
            port_id: u64::from(self.meta.id),
            cookie: self.descriptor.desc.oob.cookie,
            address: 0,
        };
        Ok(())
    }

    /// 按对端描述符填写影子端口的偏移表：第 n 个缓冲取 `base + pitch * n`。
    pub(crate) fn finish_connect(&mut self, desc: &Descriptors) -> Result<()> {
        let d = &desc.desc;
        if d.n_buffers as usize != self.buffer_count {
            tracing::warn!(
                port = self.meta.id,
                local = self.buffer_count,
                remote = d.n_buffers,
                "descriptor buffer count differs from local port"
            );
        }
        let count = self.buffer_count.min(d.n_buffers as usize);
        for tid in 0..count {
            let n = tid as u64;
            self.write_offsets_field(
                tid,
                layout::offsets::BUFFER,
                d.data_buffer_base_addr + u64::from(d.data_buffer_pitch) * n,
            )?;
            self.write_offsets_field(tid, layout::offsets::SIZE, u64::from(d.data_buffer_size))?;
            self.write_offsets_field(
                tid,
                layout::offsets::META_DATA,
                d.meta_data_base_addr + u64::from(d.meta_data_pitch) * n,
            )?;
            self.write_offsets_field(
                tid,
                layout::offsets::LOCAL_STATE,
                d.full_flag_base_addr + u64::from(d.full_flag_pitch) * n,
            )?;
        }
        self.peer_descriptor = Some(desc.clone());
        Ok(())
    }

    /// 记录消费者的空标志地址：`my_shadows[mailbox][n] = base + pitch * n`。
    pub(crate) fn set_flow_control_descriptor(&mut self, mailbox: MailboxId, desc: &Descriptors) -> Result<()> {
        let d = &desc.desc;
        let field = layout::offsets::shadow(mailbox as usize);
        for tid in 0..self.buffer_count.min(d.n_buffers as usize) {
            self.write_offsets_field(
                tid,
                field,
                d.empty_flag_base_addr + u64::from(d.empty_flag_pitch) * tid as u64,
            )?;
            if self.role == Some(PortRole::RealInput) {
                self.clear_input_flags(tid)?;
            }
        }
        self.state = ConnectionState::DefinitionComplete;
        Ok(())
    }

    /// 影子输入端口对外公布的流控描述符：本地影子状态槽的地址。
    pub fn user_port_flow_control_descriptor(&self) -> Result<Descriptors> {
        if self.role != Some(PortRole::ShadowInput) {
            return Err(DataplaneError::protocol_violation(
                "flow control descriptors come from shadow input ports",
            )
            .with_port(self.meta.id));
        }
        let local = self.local()?;
        let first = self.offsets(0)?.my_shadows_remote_state_offsets[local.mailbox() as usize];
        let mut desc = Descriptors {
            kind: DescriptorType::ConsumerFlowControl,
            role: self.descriptor.role,
            options: self.descriptor.options,
            ..Descriptors::default()
        };
        desc.desc.n_buffers = self.buffer_count as u32;
        desc.desc.empty_flag_size = BUFFER_STATE_SIZE as u32;
        desc.desc.empty_flag_base_addr = first;
        desc.desc.empty_flag_pitch = BUFFER_STATE_SIZE as u32;
        desc.desc.empty_flag_value = u64::from(EF_EMPTY);
        desc.desc.oob.oep = local.name().to_owned();
        desc.desc.oob.port_id = u64::from(self.meta.id);
        Ok(desc)
    }

    /// 对端声明了强制角色且本端未指定时，采用对端的角色。
    pub(crate) fn negotiate_role(&mut self, other: &Descriptors) {
        if other.options.contains(DescriptorOptions::MANDATED_ROLE) && self.meta.role == Role::NoRole {
            self.descriptor.role = other.role.or_default_for(self.output);
            tracing::debug!(port = self.meta.id, role = ?self.descriptor.role, "mandated role adopted");
        }
    }

    pub(crate) fn mark_definition_complete(&mut self) {
        if self.state != ConnectionState::Ready {
            self.state = ConnectionState::DefinitionComplete;
        }
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.meta.id)
            .field("output", &self.output)
            .field("rank", &self.rank)
            .field("role", &self.role)
            .field("state", &self.state)
            .finish()
    }
}
