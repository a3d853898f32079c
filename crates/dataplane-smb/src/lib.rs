#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "dataplane-smb: 进程内共享内存端点。"]
#![doc = ""]
#![doc = "为 `dataplane-core` 的外部协作者契约提供一套同步实现：区间分配器、字节段、"]
#![doc = "名称到端点的 `Fabric` 以及逐段内存拷贝的传输服务。多个 `Transport` 共用一个"]
#![doc = "`Fabric` 即可在单进程内模拟多主机拓扑。"]

pub mod allocator;
pub mod endpoint;
pub mod fabric;
pub mod segment;
pub mod xfer;

pub use allocator::ArenaAllocator;
pub use endpoint::{PROTOCOL, SmbEndpoint};
pub use fabric::Fabric;
pub use segment::Segment;
pub use xfer::{MemcpyRequest, MemcpyServices};
