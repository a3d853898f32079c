use std::sync::Arc;

use dataplane_core::{
    DataplaneError, Endpoint, EndpointAddress, MailboxId, MemoryServices, OffsetAllocator, Result,
    handshake::COMMS_AREA_SIZE,
};

use crate::{allocator::ArenaAllocator, segment::Segment};

/// 协议前缀，与端点名 `ocpi-smb-pio:<address>;<size>.<mailbox>.<max>` 对应。
pub const PROTOCOL: &str = "ocpi-smb-pio";

/// 进程内端点：一块 [`Segment`] 加一个从通信区之后开始的 [`ArenaAllocator`]。
pub struct SmbEndpoint {
    name: String,
    address: EndpointAddress,
    segment: Arc<Segment>,
    allocator: ArenaAllocator,
}

impl SmbEndpoint {
    /// 以结构化地址创建端点。`size` 必须大于邮箱通信区。
    pub fn new(address: EndpointAddress) -> Result<Self> {
        if address.size <= COMMS_AREA_SIZE {
            return Err(DataplaneError::invalid_argument(format!(
                "endpoint size {} leaves no room after the {COMMS_AREA_SIZE}-byte mailbox area",
                address.size
            )));
        }
        let name = address.to_string();
        tracing::debug!(endpoint = %name, size = address.size, "smb endpoint created");
        Ok(Self {
            segment: Arc::new(Segment::new(address.size)),
            allocator: ArenaAllocator::new(COMMS_AREA_SIZE, address.size),
            name,
            address,
        })
    }

    /// 按端点名创建，名称格式错误时返回 `InvalidArgument`。
    pub fn from_name(name: &str) -> Result<Self> {
        Self::new(name.parse()?)
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    pub fn allocator(&self) -> &ArenaAllocator {
        &self.allocator
    }
}

impl Endpoint for SmbEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn mailbox(&self) -> MailboxId {
        self.address.mailbox
    }

    fn max_mailboxes(&self) -> MailboxId {
        self.address.max_mailboxes
    }

    fn size(&self) -> u64 {
        self.address.size
    }

    fn resource_manager(&self) -> &dyn OffsetAllocator {
        &self.allocator
    }

    fn memory(&self) -> Arc<dyn MemoryServices> {
        self.segment.clone()
    }
}

impl std::fmt::Debug for SmbEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmbEndpoint")
            .field("name", &self.name)
            .field("available", &self.allocator.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_start_after_the_mailbox_area() {
        let endpoint = SmbEndpoint::from_name("ocpi-smb-pio:node-a;65536.1.16").expect("创建端点");
        assert_eq!(endpoint.name(), "ocpi-smb-pio:node-a;65536.1.16");
        assert_eq!(endpoint.mailbox(), 1);
        let offset = endpoint.resource_manager().alloc(64, 16).expect("分配");
        assert!(offset >= COMMS_AREA_SIZE);
        assert_eq!(endpoint.memory().size(), 65536);
    }

    #[test]
    fn endpoint_must_exceed_mailbox_area() {
        assert!(SmbEndpoint::from_name("ocpi-smb-pio:tiny;4096.0.16").is_err());
        assert!(SmbEndpoint::from_name("not-an-endpoint").is_err());
    }
}
