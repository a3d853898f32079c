//! 外部协作者契约：端点、偏移分配器、内存服务与传输请求。
//!
//! # 模块角色（Why）
//! - 引擎本身不关心字节如何跨越进程或主机，只依赖这里的窄接口；
//!   `dataplane-smb` 提供进程内实现，其它传输（PIO/DMA/网络）可各自实现同一组 trait。
//!
//! # 契约说明（What）
//! - 所有偏移均相对于端点 SMB 起点；
//! - [`XferRequest::post`] 按 `copy` 的登记顺序执行，数据段先于标志段；
//! - 实现必须是 `Send + Sync`，由调用方串行化对同一电路的访问。

use std::{fmt, str::FromStr, sync::Arc};

use crate::error::{DataplaneError, Result, codes, ErrorKind};

/// 邮箱编号，也是 `my_shadows_remote_state_offsets` 的下标。
pub type MailboxId = u16;

/// 端点 SMB 的区间分配器。
pub trait OffsetAllocator: Send + Sync {
    /// 分配 `size` 字节、按 `align` 对齐的区间，返回起始偏移。
    fn alloc(&self, size: u64, align: u64) -> Result<u64>;
    /// 归还先前分配的区间。
    fn free(&self, offset: u64, size: u64) -> Result<()>;
    /// 当前剩余可分配字节数。
    fn available(&self) -> u64;
}

/// 端点共享内存的字节访问。
pub trait MemoryServices: Send + Sync {
    fn size(&self) -> u64;
    fn read(&self, offset: u64, dst: &mut [u8]) -> Result<()>;
    fn write(&self, offset: u64, src: &[u8]) -> Result<()>;

    fn read_u32(&self, offset: u64) -> Result<u32> {
        let mut raw = [0u8; 4];
        self.read(offset, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    fn write_u32(&self, offset: u64, value: u32) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    fn read_u64(&self, offset: u64) -> Result<u64> {
        let mut raw = [0u8; 8];
        self.read(offset, &mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }

    fn write_u64(&self, offset: u64, value: u64) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }
}

/// 一段映射后的内存窗口，`Drop` 即解除映射。
///
/// 访问越界返回 [`codes::OUT_OF_BOUNDS`]。
pub struct MappedRegion {
    memory: Arc<dyn MemoryServices>,
    base: u64,
    len: u64,
}

impl MappedRegion {
    pub fn new(memory: Arc<dyn MemoryServices>, base: u64, len: u64) -> Result<Self> {
        let end = base.checked_add(len);
        if end.is_none_or(|end| end > memory.size()) {
            return Err(out_of_bounds(base, len, memory.size()));
        }
        Ok(Self { memory, base, len })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn read(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        self.check(offset, dst.len() as u64)?;
        self.memory.read(self.base + offset, dst)
    }

    pub fn write(&self, offset: u64, src: &[u8]) -> Result<()> {
        self.check(offset, src.len() as u64)?;
        self.memory.write(self.base + offset, src)
    }

    fn check(&self, offset: u64, len: u64) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(out_of_bounds(offset, len, self.len)),
        }
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}

pub(crate) fn out_of_bounds(offset: u64, len: u64, limit: u64) -> DataplaneError {
    DataplaneError::new(
        codes::OUT_OF_BOUNDS,
        ErrorKind::InvalidArgument,
        format!("access [{offset}, +{len}) exceeds {limit} bytes"),
    )
}

/// 一个可寻址的共享内存端点。
pub trait Endpoint: Send + Sync {
    /// 端点全名，格式见 [`EndpointAddress`]。
    fn name(&self) -> &str;
    fn mailbox(&self) -> MailboxId;
    fn max_mailboxes(&self) -> MailboxId;
    fn size(&self) -> u64;
    fn resource_manager(&self) -> &dyn OffsetAllocator;
    fn memory(&self) -> Arc<dyn MemoryServices>;

    fn map(&self, offset: u64, len: u64) -> Result<MappedRegion> {
        MappedRegion::new(self.memory(), offset, len)
    }
}

impl fmt::Debug for dyn Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name())
            .field("mailbox", &self.mailbox())
            .finish()
    }
}

/// 拷贝段的用途，用于日志与实现侧的排序优化。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CopyKind {
    Data,
    Metadata,
    Flag,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XferStatus {
    Pending,
    Complete,
}

/// 一组可重复投递的拷贝段。
pub trait XferRequest: Send + Sync {
    /// 登记一段从源端点 `from` 到目标端点 `to` 的拷贝。
    fn copy(&mut self, from: u64, to: u64, len: u64, kind: CopyKind) -> Result<()>;
    /// 合并另一请求，投递时依次执行。
    fn group(&mut self, other: Box<dyn XferRequest>) -> Result<()>;
    /// 投递全部拷贝段。
    fn post(&self) -> Result<XferStatus>;
    fn status(&self) -> XferStatus;
    /// 已登记的拷贝段数量（含合并进来的请求）。
    fn segment_count(&self) -> usize;
}

/// 源端点到目标端点的传输服务。
pub trait XferServices: Send + Sync {
    fn source(&self) -> &str;
    fn target(&self) -> &str;
    fn create_request(&self) -> Box<dyn XferRequest>;
}

/// 端点解析与传输服务工厂。
pub trait XferFactory: Send + Sync {
    /// 按名称解析端点（本地或远端）。
    fn endpoint(&self, name: &str) -> Result<Arc<dyn Endpoint>>;
    fn services(
        &self,
        source: &Arc<dyn Endpoint>,
        target: &Arc<dyn Endpoint>,
    ) -> Result<Arc<dyn XferServices>>;
}

/// 端点名的结构化形式：`protocol:address;size.mailbox.max_mailboxes`。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EndpointAddress {
    pub protocol: String,
    pub address: String,
    pub size: u64,
    pub mailbox: MailboxId,
    pub max_mailboxes: MailboxId,
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{};{}.{}.{}",
            self.protocol, self.address, self.size, self.mailbox, self.max_mailboxes
        )
    }
}

impl FromStr for EndpointAddress {
    type Err = DataplaneError;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || DataplaneError::invalid_argument(format!("malformed endpoint name `{s}`"));
        let (protocol, rest) = s.split_once(':').ok_or_else(malformed)?;
        let (address, tail) = rest.rsplit_once(';').ok_or_else(malformed)?;
        let mut fields = tail.split('.');
        let size = fields.next().and_then(|v| v.parse().ok()).ok_or_else(malformed)?;
        let mailbox = fields.next().and_then(|v| v.parse().ok()).ok_or_else(malformed)?;
        let max_mailboxes = fields.next().and_then(|v| v.parse().ok()).ok_or_else(malformed)?;
        if fields.next().is_some() || protocol.is_empty() || address.is_empty() {
            return Err(malformed());
        }
        if mailbox >= max_mailboxes {
            return Err(DataplaneError::invalid_argument(format!(
                "mailbox {mailbox} is outside 0..{max_mailboxes} in `{s}`"
            )));
        }
        Ok(Self {
            protocol: protocol.to_owned(),
            address: address.to_owned(),
            size,
            mailbox,
            max_mailboxes,
        })
    }
}
