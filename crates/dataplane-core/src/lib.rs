#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "dataplane-core: 电路/端口缓冲传输引擎。"]
#![doc = ""]
#![doc = "一个电路把一个输出端口集连接到若干输入端口集；每个端口在某个端点的共享内存块（SMB）"]
#![doc = "中持有数据缓冲、状态标志、元数据槽与偏移表。电路就绪时预计算全部拷贝模板，"]
#![doc = "运行期的每次生产/消费只需查表投递。"]
#![doc = ""]
#![doc = "== 层次 =="]
#![doc = "- 布局与编码：`layout`、`descriptor`、`handshake`；"]
#![doc = "- 实体：`metadata` → `port_set` → `port` → `buffer`；"]
#![doc = "- 传输：`template`、`controller`、`circuit`、`transport`；"]
#![doc = "- 外部协作者契约：`endpoint`，由 `dataplane-smb` 等传输实现。"]

pub mod buffer;
pub mod circuit;
pub mod config;
pub mod controller;
pub mod descriptor;
pub mod distribution;
pub mod endpoint;
pub mod error;
pub(crate) mod generator;
pub mod handshake;
pub mod layout;
pub mod metadata;
pub mod port;
pub mod port_set;
pub mod resource;
pub mod template;
pub mod transport;

pub use buffer::{BufferRef, PortRef, PortSetId, UpstreamRef};
pub use circuit::{Circuit, CircuitStatus, FinalizeOutcome, ProtocolInfo, SendOutcome};
pub use config::{LoggingConfig, TransportConfig};
pub use controller::{ProduceOutcome, TransferController, TransferPattern};
pub use descriptor::{DescriptorOptions, DescriptorType, Descriptors, Role};
pub use distribution::{DataDistribution, DataPartition, DistributionKind, DistributionSubType};
pub use endpoint::{
    CopyKind, Endpoint, EndpointAddress, MailboxId, MappedRegion, MemoryServices, OffsetAllocator, XferFactory,
    XferRequest, XferServices, XferStatus,
};
pub use error::{DataplaneError, ErrorKind, Result};
pub use layout::BufferMetaData;
pub use metadata::{ConnectionMetadata, PortId, PortMetadata, PortSetMetadata};
pub use transport::{MailboxReport, Transport, TransportContext};
