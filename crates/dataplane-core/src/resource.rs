use std::{fmt, sync::Arc};

use crate::{
    endpoint::Endpoint,
    error::{DataplaneError, Result},
};

/// 端点 SMB 内一段已分配区间的租约，`Drop` 时归还且只归还一次。
///
/// # 教案式说明
/// - **意图（Why）**：端口按角色持有数据、状态、元数据、控制块与偏移表等多段区间，
///   建立过程中任一步失败都必须撤销已完成的分配；租约把“谁分配谁释放”收敛到所有权上。
/// - **逻辑（How）**：[`acquire`](Self::acquire) 调用端点分配器，失败时转换为
///   `NO_MORE_BUFFER` 并带上端点名；`Drop` 中检查 `released`，归还失败只记录告警。
/// - **契约（What）**：租约不可克隆；[`release`](Self::release) 显式归还并上报错误，
///   之后 `Drop` 不再重复归还。
pub struct OffsetLease {
    endpoint: Arc<dyn Endpoint>,
    offset: u64,
    size: u64,
    released: bool,
}

impl OffsetLease {
    pub fn acquire(endpoint: &Arc<dyn Endpoint>, size: u64, align: u64) -> Result<Self> {
        let offset = endpoint
            .resource_manager()
            .alloc(size, align)
            .map_err(|err| DataplaneError::no_more_buffer(endpoint.name(), size).with_cause(err))?;
        tracing::trace!(endpoint = endpoint.name(), offset, size, "offset range leased");
        Ok(Self {
            endpoint: Arc::clone(endpoint),
            offset,
            size,
            released: false,
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }

    /// 将整段区间清零。
    pub fn zero(&self) -> Result<()> {
        let zeros = vec![0u8; self.size as usize];
        self.endpoint.memory().write(self.offset, &zeros)
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.endpoint
            .resource_manager()
            .free(self.offset, self.size)
    }
}

impl Drop for OffsetLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = self.endpoint.resource_manager().free(self.offset, self.size) {
            tracing::warn!(
                endpoint = self.endpoint.name(),
                offset = self.offset,
                size = self.size,
                error = %err,
                "failed to return offset range"
            );
        }
    }
}

impl fmt::Debug for OffsetLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffsetLease")
            .field("endpoint", &self.endpoint.name())
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    use super::*;
    use crate::{
        endpoint::{MailboxId, MemoryServices, OffsetAllocator},
        error::{ErrorKind, codes},
    };

    /// 只向前分配、统计归还次数的最小端点。
    struct CountingEndpoint {
        next: AtomicU64,
        limit: u64,
        frees: AtomicUsize,
    }

    impl OffsetAllocator for CountingEndpoint {
        fn alloc(&self, size: u64, _align: u64) -> Result<u64> {
            let offset = self.next.fetch_add(size, Ordering::SeqCst);
            if offset + size > self.limit {
                return Err(DataplaneError::invalid_argument("exhausted"));
            }
            Ok(offset)
        }

        fn free(&self, _offset: u64, _size: u64) -> Result<()> {
            self.frees.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn available(&self) -> u64 {
            self.limit.saturating_sub(self.next.load(Ordering::SeqCst))
        }
    }

    struct NoMemory;

    impl MemoryServices for NoMemory {
        fn size(&self) -> u64 {
            0
        }
        fn read(&self, _offset: u64, _dst: &mut [u8]) -> Result<()> {
            Ok(())
        }
        fn write(&self, _offset: u64, _src: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    impl Endpoint for CountingEndpoint {
        fn name(&self) -> &str {
            "test:counting;64.0.1"
        }
        fn mailbox(&self) -> MailboxId {
            0
        }
        fn max_mailboxes(&self) -> MailboxId {
            1
        }
        fn size(&self) -> u64 {
            self.limit
        }
        fn resource_manager(&self) -> &dyn OffsetAllocator {
            self
        }
        fn memory(&self) -> Arc<dyn MemoryServices> {
            Arc::new(NoMemory)
        }
    }

    fn endpoint(limit: u64) -> (Arc<CountingEndpoint>, Arc<dyn Endpoint>) {
        let concrete = Arc::new(CountingEndpoint {
            next: AtomicU64::new(0),
            limit,
            frees: AtomicUsize::new(0),
        });
        let erased: Arc<dyn Endpoint> = concrete.clone();
        (concrete, erased)
    }

    #[test]
    fn drop_returns_range_exactly_once() {
        let (concrete, ep) = endpoint(64);
        let lease = OffsetLease::acquire(&ep, 16, 8).expect("分配 16 字节");
        drop(lease);
        assert_eq!(concrete.frees.load(Ordering::SeqCst), 1);

        let explicit = OffsetLease::acquire(&ep, 16, 8).expect("再次分配");
        explicit.release().expect("显式归还");
        assert_eq!(concrete.frees.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn exhaustion_names_the_endpoint() {
        let (_concrete, ep) = endpoint(32);
        let _first = OffsetLease::acquire(&ep, 32, 8).expect("占满端点");
        let err = OffsetLease::acquire(&ep, 8, 8).expect_err("端点应已耗尽");
        assert_eq!(err.code(), codes::NO_MORE_BUFFER);
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(err.context().endpoint.as_deref(), Some("test:counting;64.0.1"));
    }
}
