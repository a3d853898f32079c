//! 缓冲的 Rust 侧簿记与跨实体引用。
//!
//! 共享内存中的 `BufferState`/`BufferMetaData` 由端口读写（见 `port.rs`）；
//! 这里只保存不需要跨进程可见的状态：占用标记、待完成的传输句柄与零拷贝链接。

use std::{fmt, sync::Arc};

use crate::{
    endpoint::{XferRequest, XferStatus},
    layout::BufferMetaData,
};

/// 端口集在电路内的位置。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PortSetId {
    Output,
    Input(usize),
}

/// 端口在电路内的索引引用。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortRef {
    pub set: PortSetId,
    /// 端口在端口集内的下标，即 rank。
    pub index: usize,
}

impl PortRef {
    pub const fn output(index: usize) -> Self {
        Self {
            set: PortSetId::Output,
            index,
        }
    }

    pub const fn input(set: usize, index: usize) -> Self {
        Self {
            set: PortSetId::Input(set),
            index,
        }
    }

    pub const fn buffer(self, tid: usize) -> BufferRef {
        BufferRef { port: self, tid }
    }
}

/// 缓冲引用：端口 + 缓冲编号（tid）。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferRef {
    pub port: PortRef,
    pub tid: usize,
}

/// 另一电路中的输入缓冲，作为零拷贝转发的上游。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UpstreamRef {
    pub circuit: u32,
    pub buffer: BufferRef,
}

/// 分片发送进度（模式 4）。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PartProgress {
    pub next_transfer: usize,
    pub total_transfers: usize,
    /// 用户写入的整份元数据，各分片在此基础上改写长度与分片字段。
    pub whole: BufferMetaData,
}

impl PartProgress {
    pub fn is_complete(&self) -> bool {
        self.next_transfer >= self.total_transfers
    }
}

#[derive(Default)]
pub struct OutputBuffer {
    pub tid: usize,
    /// 被用户持有（已取出、尚未发送）。
    pub in_use: bool,
    /// 尚在途的传输请求；全部完成后缓冲才能变空。
    pub pending: Vec<Arc<dyn XferRequest>>,
    /// 零拷贝挂接在本缓冲上的输入缓冲。
    pub dependents: Vec<BufferRef>,
    /// 本缓冲转发的上游输入缓冲（`send_zcopy_input_buffer`）。
    pub zero_copy_from: Option<UpstreamRef>,
    /// 由消费者回写空标志（AFC），本地不会自行置空。
    pub slave: bool,
    pub parts: Option<PartProgress>,
}

impl OutputBuffer {
    pub fn new(tid: usize) -> Self {
        Self {
            tid,
            ..Self::default()
        }
    }

    pub fn transfers_complete(&self) -> bool {
        self.pending
            .iter()
            .all(|request| request.status() == XferStatus::Complete)
    }

    pub fn parts_complete(&self) -> bool {
        self.parts.is_none_or(|progress| progress.is_complete())
    }

    /// 是否满足本地置空条件：未被占用、无零拷贝依赖、传输完成且分片发完。
    pub fn can_release(&self) -> bool {
        !self.in_use
            && !self.slave
            && self.dependents.is_empty()
            && self.transfers_complete()
            && self.parts_complete()
    }

    pub fn reset(&mut self) {
        let tid = self.tid;
        *self = Self::new(tid);
    }
}

impl fmt::Debug for OutputBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputBuffer")
            .field("tid", &self.tid)
            .field("in_use", &self.in_use)
            .field("pending", &self.pending.len())
            .field("dependents", &self.dependents)
            .field("zero_copy_from", &self.zero_copy_from)
            .field("slave", &self.slave)
            .field("parts", &self.parts)
            .finish()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InputBuffer {
    pub tid: usize,
    pub in_use: bool,
    /// 零拷贝挂接的输出缓冲；`Some` 即“已挂接”，与释放同时清除。
    pub attached: Option<BufferRef>,
}

impl InputBuffer {
    pub fn new(tid: usize) -> Self {
        Self {
            tid,
            ..Self::default()
        }
    }

    pub fn reset(&mut self) {
        let tid = self.tid;
        *self = Self::new(tid);
    }
}
