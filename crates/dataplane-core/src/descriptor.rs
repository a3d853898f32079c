//! 端口描述符：连接双方交换的缓冲布局与流控地址。
//!
//! # 模块角色（Why）
//! - 描述符是“无邮箱”连接路径的载体：消费者公布数据/元数据/满标志的基址与步长，
//!   生产者据此填写影子端口的偏移表（见 `Port::finish_connect`）；
//! - 反向的流控描述符携带空标志地址，消费者据此回写“已消费”。
//!
//! # 契约说明（What）
//! - 线格式固定 [`DESCRIPTORS_WIRE_SIZE`] 字节，小端编码；
//! - `oob.oep` 为端点名，最长 [`MAX_OEP_LEN`] 字节（含结尾 NUL）。

use bytes::{Buf, BufMut};

use crate::error::{DataplaneError, Result};

pub const DESCRIPTORS_WIRE_SIZE: usize = 256;
pub const MAX_OEP_LEN: usize = 128;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DescriptorType {
    #[default]
    Producer = 0,
    Consumer = 1,
    ConsumerFlowControl = 2,
}

/// 连接角色：决定谁推送数据、谁回写流控标志。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Role {
    ActiveMessage = 0,
    ActiveFlowControl = 1,
    ActiveOnly = 2,
    Passive = 3,
    #[default]
    NoRole = 4,
}

impl Role {
    /// 未指定角色时，输出端默认 ActiveMessage，输入端默认 ActiveFlowControl。
    pub fn or_default_for(self, output: bool) -> Role {
        match (self, output) {
            (Role::NoRole, true) => Role::ActiveMessage,
            (Role::NoRole, false) => Role::ActiveFlowControl,
            (role, _) => role,
        }
    }

    fn from_wire(raw: u32) -> Result<Self> {
        Ok(match raw {
            0 => Role::ActiveMessage,
            1 => Role::ActiveFlowControl,
            2 => Role::ActiveOnly,
            3 => Role::Passive,
            4 => Role::NoRole,
            other => {
                return Err(DataplaneError::protocol_violation(format!(
                    "unknown descriptor role {other}"
                )));
            }
        })
    }
}

impl DescriptorType {
    fn from_wire(raw: u32) -> Result<Self> {
        Ok(match raw {
            0 => DescriptorType::Producer,
            1 => DescriptorType::Consumer,
            2 => DescriptorType::ConsumerFlowControl,
            other => {
                return Err(DataplaneError::protocol_violation(format!(
                    "unknown descriptor type {other}"
                )));
            }
        })
    }
}

/// 描述符选项位。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DescriptorOptions(u32);

impl DescriptorOptions {
    /// 满标志携带元数据（`xfer_meta_data` 字段）。
    pub const FLAG_IS_META: u32 = 1 << 0;
    /// 满标志为递增计数（`timestamp` 字段）。
    pub const FLAG_IS_COUNTING: u32 = 1 << 1;
    /// 对端必须接受此角色。
    pub const MANDATED_ROLE: u32 = 1 << 2;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, bit: u32) -> bool {
        self.0 & bit == bit
    }

    pub fn insert(&mut self, bit: u32) {
        self.0 |= bit;
    }
}

/// 带外信息：端点名与端口 cookie。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutOfBand {
    pub oep: String,
    pub port_id: u64,
    pub cookie: u64,
    pub address: u64,
}

/// 缓冲布局。地址均为所属端点 SMB 内的偏移，第 n 个缓冲位于 `base + pitch * n`。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Desc {
    pub n_buffers: u32,
    pub data_buffer_base_addr: u64,
    pub data_buffer_pitch: u32,
    pub data_buffer_size: u32,
    pub meta_data_base_addr: u64,
    pub meta_data_pitch: u32,
    pub full_flag_size: u32,
    pub full_flag_base_addr: u64,
    pub full_flag_pitch: u32,
    pub empty_flag_size: u32,
    pub full_flag_value: u64,
    pub empty_flag_base_addr: u64,
    pub empty_flag_pitch: u32,
    pub empty_flag_value: u64,
    pub oob: OutOfBand,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Descriptors {
    pub kind: DescriptorType,
    pub role: Role,
    pub options: DescriptorOptions,
    pub desc: Desc,
}

impl Descriptors {
    pub fn encode(&self) -> [u8; DESCRIPTORS_WIRE_SIZE] {
        let mut out = [0u8; DESCRIPTORS_WIRE_SIZE];
        let mut w = &mut out[..];
        let d = &self.desc;
        w.put_u32_le(self.kind as u32);
        w.put_u32_le(self.role as u32);
        w.put_u32_le(self.options.bits());
        w.put_u32_le(0);
        w.put_u32_le(d.n_buffers);
        w.put_u32_le(0);
        w.put_u64_le(d.data_buffer_base_addr);
        w.put_u32_le(d.data_buffer_pitch);
        w.put_u32_le(d.data_buffer_size);
        w.put_u64_le(d.meta_data_base_addr);
        w.put_u32_le(d.meta_data_pitch);
        w.put_u32_le(d.full_flag_size);
        w.put_u64_le(d.full_flag_base_addr);
        w.put_u32_le(d.full_flag_pitch);
        w.put_u32_le(d.empty_flag_size);
        w.put_u64_le(d.full_flag_value);
        w.put_u64_le(d.empty_flag_base_addr);
        w.put_u32_le(d.empty_flag_pitch);
        w.put_u32_le(0);
        w.put_u64_le(d.empty_flag_value);
        w.put_u64_le(d.oob.port_id);
        w.put_u64_le(d.oob.cookie);
        w.put_u64_le(d.oob.address);
        let oep = d.oob.oep.as_bytes();
        let len = oep.len().min(MAX_OEP_LEN - 1);
        w.put_slice(&oep[..len]);
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < DESCRIPTORS_WIRE_SIZE {
            return Err(DataplaneError::protocol_violation(format!(
                "descriptor frame holds {} bytes, expected {DESCRIPTORS_WIRE_SIZE}",
                raw.len()
            )));
        }
        let mut r = &raw[..DESCRIPTORS_WIRE_SIZE];
        let kind = DescriptorType::from_wire(r.get_u32_le())?;
        let role = Role::from_wire(r.get_u32_le())?;
        let options = DescriptorOptions::from_bits(r.get_u32_le());
        r.advance(4);
        let n_buffers = r.get_u32_le();
        r.advance(4);
        let data_buffer_base_addr = r.get_u64_le();
        let data_buffer_pitch = r.get_u32_le();
        let data_buffer_size = r.get_u32_le();
        let meta_data_base_addr = r.get_u64_le();
        let meta_data_pitch = r.get_u32_le();
        let full_flag_size = r.get_u32_le();
        let full_flag_base_addr = r.get_u64_le();
        let full_flag_pitch = r.get_u32_le();
        let empty_flag_size = r.get_u32_le();
        let full_flag_value = r.get_u64_le();
        let empty_flag_base_addr = r.get_u64_le();
        let empty_flag_pitch = r.get_u32_le();
        r.advance(4);
        let empty_flag_value = r.get_u64_le();
        let port_id = r.get_u64_le();
        let cookie = r.get_u64_le();
        let address = r.get_u64_le();
        let oep_raw = &r[..MAX_OEP_LEN];
        let end = oep_raw.iter().position(|b| *b == 0).unwrap_or(MAX_OEP_LEN);
        let oep = std::str::from_utf8(&oep_raw[..end])
            .map_err(|err| {
                DataplaneError::protocol_violation("descriptor endpoint name is not UTF-8")
                    .with_cause(err)
            })?
            .to_owned();
        Ok(Self {
            kind,
            role,
            options,
            desc: Desc {
                n_buffers,
                data_buffer_base_addr,
                data_buffer_pitch,
                data_buffer_size,
                meta_data_base_addr,
                meta_data_pitch,
                full_flag_size,
                full_flag_base_addr,
                full_flag_pitch,
                empty_flag_size,
                full_flag_value,
                empty_flag_base_addr,
                empty_flag_pitch,
                empty_flag_value,
                oob: OutOfBand {
                    oep,
                    port_id,
                    cookie,
                    address,
                },
            },
        })
    }
}
