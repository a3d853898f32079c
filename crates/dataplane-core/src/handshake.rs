//! 共享内存邮箱握手：请求编码、邮箱投递与偏移组状态机。
//!
//! # 模块角色（Why）
//! - 端口在对端就绪前拿不到对方缓冲/状态的偏移；邮箱让两端在各自 SMB 的通信区
//!   异步交换这些字段，无需额外的控制通道。
//!
//! # 核心机制（How）
//! - 每个端点 SMB 起始处保留 `MAX_SYSTEM_SMBS` 个槽，槽下标为请求方邮箱号；
//! - 请求方先写本地槽，再拷贝到目标端点的同号槽；应答方（`Transport::check_mailboxes`）
//!   把字段直接写进请求方的偏移表，最后清空请求方的槽；
//! - “字段非零”即完成信号，不另设应答。
//!
//! # 契约说明（What）
//! - 同一端点同一时刻至多一个在途请求：槽非空即视为占用；
//! - [`OffsetGroup`] 保证在途期间不重复发送，槽释放而字段仍为零时才重发。

use std::sync::Arc;

use bytes::{Buf, BufMut};

use crate::{
    endpoint::{CopyKind, Endpoint, MailboxId, XferFactory},
    error::{DataplaneError, Result},
    layout::MAX_SYSTEM_SMBS,
};

pub const MAILBOX_SLOT_SIZE: u64 = 256;
/// 端点 SMB 开头的通信区大小；分配器从其后开始管理。
pub const COMMS_AREA_SIZE: u64 = MAILBOX_SLOT_SIZE * MAX_SYSTEM_SMBS as u64;
pub const MAX_URL_LEN: usize = 128;

const URL_AT: usize = 48;

pub const fn slot_offset(mailbox: MailboxId) -> u64 {
    mailbox as u64 * MAILBOX_SLOT_SIZE
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RequestKind {
    #[default]
    NoRequest = 0,
    /// 请求对端影子状态槽偏移（`my_shadows[对端邮箱]`）。
    ShadowRstateOffset = 1,
    /// 请求真实输入端口的缓冲/状态/元数据偏移。
    InputOffsets = 2,
    /// 请求真实输出端口的控制块偏移，可顺带拉取协议字符串。
    OutputControlOffset = 3,
}

impl RequestKind {
    fn from_wire(raw: u32) -> Result<Self> {
        Ok(match raw {
            0 => RequestKind::NoRequest,
            1 => RequestKind::ShadowRstateOffset,
            2 => RequestKind::InputOffsets,
            3 => RequestKind::OutputControlOffset,
            other => {
                return Err(DataplaneError::protocol_violation(format!(
                    "unknown mailbox request kind {other}"
                )));
            }
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MailboxRequest {
    pub kind: RequestKind,
    pub circuit_id: u32,
    pub port_id: u32,
    pub return_mailbox: MailboxId,
    /// 请求方偏移表在其端点内的起点。
    pub return_offset: u64,
    /// 请求方偏移表的表项数。
    pub return_size: u64,
    pub protocol_offset: u64,
    pub protocol_size: u64,
    /// 请求方端点名，应答方据此解析回写目标。
    pub url: String,
}

impl MailboxRequest {
    pub fn encode(&self) -> [u8; MAILBOX_SLOT_SIZE as usize] {
        let mut out = [0u8; MAILBOX_SLOT_SIZE as usize];
        let mut w = &mut out[..];
        w.put_u32_le(self.kind as u32);
        w.put_u32_le(self.circuit_id);
        w.put_u32_le(self.port_id);
        w.put_u32_le(u32::from(self.return_mailbox));
        w.put_u64_le(self.return_offset);
        w.put_u64_le(self.return_size);
        w.put_u64_le(self.protocol_offset);
        w.put_u64_le(self.protocol_size);
        let url = self.url.as_bytes();
        w.put_slice(&url[..url.len().min(MAX_URL_LEN - 1)]);
        out
    }

    pub fn decode(raw: &[u8; MAILBOX_SLOT_SIZE as usize]) -> Result<Self> {
        let mut r = &raw[..];
        let kind = RequestKind::from_wire(r.get_u32_le())?;
        let circuit_id = r.get_u32_le();
        let port_id = r.get_u32_le();
        let return_mailbox = MailboxId::try_from(r.get_u32_le()).map_err(|err| {
            DataplaneError::protocol_violation("return mailbox out of range").with_cause(err)
        })?;
        let return_offset = r.get_u64_le();
        let return_size = r.get_u64_le();
        let protocol_offset = r.get_u64_le();
        let protocol_size = r.get_u64_le();
        let url_raw = &raw[URL_AT..URL_AT + MAX_URL_LEN];
        let end = url_raw.iter().position(|b| *b == 0).unwrap_or(MAX_URL_LEN);
        let url = std::str::from_utf8(&url_raw[..end])
            .map_err(|err| {
                DataplaneError::protocol_violation("mailbox return url is not UTF-8").with_cause(err)
            })?
            .to_owned();
        Ok(Self {
            kind,
            circuit_id,
            port_id,
            return_mailbox,
            return_offset,
            return_size,
            protocol_offset,
            protocol_size,
            url,
        })
    }
}

/// 本地端点的邮箱视图。
pub struct Mailbox<'a> {
    local: &'a Arc<dyn Endpoint>,
}

impl<'a> Mailbox<'a> {
    pub fn new(local: &'a Arc<dyn Endpoint>) -> Self {
        Self { local }
    }

    /// 本端点的请求槽为空，即上一个请求已被应答方清除。
    pub fn is_available(&self) -> Result<bool> {
        let kind = self.local.memory().read_u32(slot_offset(self.local.mailbox()))?;
        Ok(kind == RequestKind::NoRequest as u32)
    }

    /// 写入本地槽并拷贝到 `target` 的同号槽。
    pub fn post(
        &self,
        factory: &dyn XferFactory,
        target: &Arc<dyn Endpoint>,
        request: &MailboxRequest,
    ) -> Result<()> {
        let slot = slot_offset(self.local.mailbox());
        self.local.memory().write(slot, &request.encode())?;
        let services = factory.services(self.local, target)?;
        let mut xfer = services.create_request();
        xfer.copy(slot, slot, MAILBOX_SLOT_SIZE, CopyKind::Metadata)?;
        xfer.post()?;
        tracing::debug!(
            from = self.local.name(),
            to = target.name(),
            kind = ?request.kind,
            circuit = request.circuit_id,
            port = request.port_id,
            "mailbox request posted"
        );
        Ok(())
    }
}

/// 端口等待的一组偏移字段。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OffsetGroupKey {
    InputOffsets,
    ShadowState(MailboxId),
    OutputControl,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GroupState {
    #[default]
    NotRequested,
    Requested,
    Satisfied,
}

/// 一次轮询后调用方应执行的动作。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupAction {
    Done,
    /// 发送请求后调用 [`OffsetGroup::mark_requested`]。
    Issue,
    Wait,
}

/// 偏移组状态机：`NotRequested → Requested → Satisfied`。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OffsetGroup {
    state: GroupState,
    attempts: u32,
}

impl OffsetGroup {
    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// `satisfied`：表中字段已非零；`mailbox_free`：本端点请求槽空闲。
    pub fn poll(&mut self, satisfied: bool, mailbox_free: bool) -> GroupAction {
        if self.state == GroupState::Satisfied || satisfied {
            self.state = GroupState::Satisfied;
            return GroupAction::Done;
        }
        if mailbox_free {
            GroupAction::Issue
        } else {
            GroupAction::Wait
        }
    }

    pub fn mark_requested(&mut self) {
        self.state = GroupState::Requested;
        self.attempts += 1;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
