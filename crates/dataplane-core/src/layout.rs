//! 共享内存布局：缓冲状态、元数据、端口集控制块与偏移表。
//!
//! 所有整数按小端存放，结构以固定字节布局编码，便于跨进程/跨主机的直接拷贝。
//!
//! ```text
//! 端点 SMB
//! ┌────────────────────────────────────────────────────┐
//! │ 邮箱通信区  MAX_SYSTEM_SMBS × MAILBOX_SLOT_SIZE     │
//! ├────────────────────────────────────────────────────┤
//! │ 分配器管理区（端口按需申请）                        │
//! │   数据      len × n                                 │
//! │   状态      STATE × MAX_PCONTRIBS × 2 × n           │
//! │             行 0：对端写入的标志；行 1：预置常量     │
//! │   元数据    MD × MAX_PCONTRIBS × n                  │
//! │   控制块    PORT_SET_CONTROL_SIZE（仅输出端口）      │
//! │   偏移表    BUFFER_OFFSETS_SIZE × n                 │
//! └────────────────────────────────────────────────────┘
//! ```

use bytes::{Buf, BufMut};

/// 单个电路内端口编号的上限，同时是状态/元数据矩阵的列数。
pub const MAX_PCONTRIBS: usize = 8;
/// 邮箱编号上限（不含）。
pub const MAX_SYSTEM_SMBS: usize = 16;

pub const BUFFER_STATE_SIZE: u64 = 8;
pub const BUFFER_METADATA_SIZE: u64 = 64;
pub const PORT_SET_CONTROL_SIZE: u64 = 16;
pub const BUFFER_OFFSETS_SIZE: u64 = offsets::SHADOWS + 8 * MAX_SYSTEM_SMBS as u64;

/// 输出侧/影子输入侧使用“空标志”：1 表示空。
pub const EF_EMPTY: u32 = 1;
pub const EF_FULL: u32 = 0;
/// 真实输入侧使用“满标志”：1 表示满。
pub const FF_FULL: u32 = 1;
pub const FF_EMPTY: u32 = 0;

/// 每个缓冲的状态矩阵大小（两行 × MAX_PCONTRIBS 列）。
pub const STATE_BLOCK_SIZE: u64 = BUFFER_STATE_SIZE * MAX_PCONTRIBS as u64 * 2;
/// 状态矩阵单行大小，行 1 起始偏移。
pub const STATE_ROW_SIZE: u64 = BUFFER_STATE_SIZE * MAX_PCONTRIBS as u64;
/// 每个缓冲的元数据矩阵大小。
pub const METADATA_BLOCK_SIZE: u64 = BUFFER_METADATA_SIZE * MAX_PCONTRIBS as u64;

pub mod state {
    pub const FLAG: u64 = 0;
    pub const BUSY_FACTOR: u64 = 4;
}

pub mod meta {
    /// 前 8 字节为 RplMetaData 字：length/opcode/end。
    pub const LENGTH: u64 = 0;
    pub const OPCODE: u64 = 4;
    pub const END: u64 = 5;
    pub const TIMESTAMP: u64 = 8;
    pub const XFER_META_DATA: u64 = 16;
    pub const SEQUENCE: u64 = 24;
    pub const PARTS_SEQUENCE: u64 = 28;
    pub const PARTS_PER_WHOLE: u64 = 32;
    pub const END_OF_STREAM: u64 = 36;
    pub const END_OF_WHOLE: u64 = 37;
    pub const BROADCAST: u64 = 38;
    pub const ZERO_COPY: u64 = 39;
    pub const SRC_RANK: u64 = 40;
    pub const BUSY_FACTOR: u64 = 44;
}

pub mod control {
    pub const TOKEN: u64 = 0;
    pub const SEQUENCE: u64 = 4;
    pub const END_OF_STREAM: u64 = 8;
    pub const END_OF_WHOLE: u64 = 9;
}

pub mod offsets {
    pub const BUFFER: u64 = 0;
    pub const SIZE: u64 = 8;
    pub const LOCAL_STATE: u64 = 16;
    pub const META_DATA: u64 = 24;
    pub const PORT_SET_CONTROL: u64 = 32;
    pub const SHADOWS: u64 = 40;

    /// `my_shadows_remote_state_offsets[mailbox]` 在表项内的偏移。
    pub const fn shadow(mailbox: usize) -> u64 {
        SHADOWS + 8 * mailbox as u64
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferState {
    pub flag: u32,
    pub busy_factor: u32,
}

impl BufferState {
    pub fn encode(&self) -> [u8; BUFFER_STATE_SIZE as usize] {
        let mut out = [0u8; BUFFER_STATE_SIZE as usize];
        let mut w = &mut out[..];
        w.put_u32_le(self.flag);
        w.put_u32_le(self.busy_factor);
        out
    }

    pub fn decode(raw: &[u8; BUFFER_STATE_SIZE as usize]) -> Self {
        let mut r = &raw[..];
        Self {
            flag: r.get_u32_le(),
            busy_factor: r.get_u32_le(),
        }
    }
}

/// 随缓冲一起传输的元数据槽。
///
/// 每个缓冲持有 `MAX_PCONTRIBS` 个槽，槽下标为写入方端口编号。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferMetaData {
    pub length: u32,
    pub opcode: u8,
    pub end: bool,
    pub timestamp: u64,
    pub xfer_meta_data: u64,
    pub sequence: u32,
    pub parts_sequence: u32,
    pub parts_per_whole: u32,
    pub end_of_stream: bool,
    pub end_of_whole: bool,
    pub broadcast: bool,
    pub zero_copy: bool,
    pub src_rank: u32,
    pub busy_factor: u32,
}

impl BufferMetaData {
    pub fn encode(&self) -> [u8; BUFFER_METADATA_SIZE as usize] {
        let mut out = [0u8; BUFFER_METADATA_SIZE as usize];
        let mut w = &mut out[..];
        w.put_u32_le(self.length);
        w.put_u8(self.opcode);
        w.put_u8(u8::from(self.end));
        w.put_u16_le(0);
        w.put_u64_le(self.timestamp);
        w.put_u64_le(self.xfer_meta_data);
        w.put_u32_le(self.sequence);
        w.put_u32_le(self.parts_sequence);
        w.put_u32_le(self.parts_per_whole);
        w.put_u8(u8::from(self.end_of_stream));
        w.put_u8(u8::from(self.end_of_whole));
        w.put_u8(u8::from(self.broadcast));
        w.put_u8(u8::from(self.zero_copy));
        w.put_u32_le(self.src_rank);
        w.put_u32_le(self.busy_factor);
        out
    }

    pub fn decode(raw: &[u8; BUFFER_METADATA_SIZE as usize]) -> Self {
        let mut r = &raw[..];
        let length = r.get_u32_le();
        let opcode = r.get_u8();
        let end = r.get_u8() != 0;
        r.advance(2);
        Self {
            length,
            opcode,
            end,
            timestamp: r.get_u64_le(),
            xfer_meta_data: r.get_u64_le(),
            sequence: r.get_u32_le(),
            parts_sequence: r.get_u32_le(),
            parts_per_whole: r.get_u32_le(),
            end_of_stream: r.get_u8() != 0,
            end_of_whole: r.get_u8() != 0,
            broadcast: r.get_u8() != 0,
            zero_copy: r.get_u8() != 0,
            src_rank: r.get_u32_le(),
            busy_factor: r.get_u32_le(),
        }
    }
}

/// 输出端口集控制块：顺序分布时的令牌与流结束标记。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OutputPortSetControl {
    pub sequential_control_token: u32,
    pub sequence: u32,
    pub end_of_stream: bool,
    pub end_of_whole: bool,
}

impl OutputPortSetControl {
    pub fn encode(&self) -> [u8; PORT_SET_CONTROL_SIZE as usize] {
        let mut out = [0u8; PORT_SET_CONTROL_SIZE as usize];
        let mut w = &mut out[..];
        w.put_u32_le(self.sequential_control_token);
        w.put_u32_le(self.sequence);
        w.put_u8(u8::from(self.end_of_stream));
        w.put_u8(u8::from(self.end_of_whole));
        out
    }

    pub fn decode(raw: &[u8; PORT_SET_CONTROL_SIZE as usize]) -> Self {
        let mut r = &raw[..];
        Self {
            sequential_control_token: r.get_u32_le(),
            sequence: r.get_u32_le(),
            end_of_stream: r.get_u8() != 0,
            end_of_whole: r.get_u8() != 0,
        }
    }
}

/// 端口偏移表的单个表项，每个缓冲一项。
///
/// 表本身也写入本地 SMB，远端握手应答方直接向其中拷贝字段；
/// 字段值为 0 表示“尚未获得”。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferOffsets {
    pub buffer_offset: u64,
    pub buffer_size: u64,
    pub local_state_offset: u64,
    pub meta_data_offset: u64,
    pub port_set_control_offset: u64,
    pub my_shadows_remote_state_offsets: [u64; MAX_SYSTEM_SMBS],
}

impl BufferOffsets {
    pub fn encode(&self) -> [u8; BUFFER_OFFSETS_SIZE as usize] {
        let mut out = [0u8; BUFFER_OFFSETS_SIZE as usize];
        let mut w = &mut out[..];
        w.put_u64_le(self.buffer_offset);
        w.put_u64_le(self.buffer_size);
        w.put_u64_le(self.local_state_offset);
        w.put_u64_le(self.meta_data_offset);
        w.put_u64_le(self.port_set_control_offset);
        for shadow in self.my_shadows_remote_state_offsets {
            w.put_u64_le(shadow);
        }
        out
    }

    pub fn decode(raw: &[u8; BUFFER_OFFSETS_SIZE as usize]) -> Self {
        let mut r = &raw[..];
        let mut decoded = Self {
            buffer_offset: r.get_u64_le(),
            buffer_size: r.get_u64_le(),
            local_state_offset: r.get_u64_le(),
            meta_data_offset: r.get_u64_le(),
            port_set_control_offset: r.get_u64_le(),
            my_shadows_remote_state_offsets: [0; MAX_SYSTEM_SMBS],
        };
        for shadow in decoded.my_shadows_remote_state_offsets.iter_mut() {
            *shadow = r.get_u64_le();
        }
        decoded
    }
}
