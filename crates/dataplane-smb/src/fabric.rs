use std::{collections::HashMap, sync::Arc};

use dataplane_core::{
    DataplaneError, Endpoint, EndpointAddress, MailboxId, Result, XferFactory, XferServices,
};
use parking_lot::RwLock;

use crate::{
    endpoint::{PROTOCOL, SmbEndpoint},
    xfer::MemcpyServices,
};

/// 进程内“主机网络”：按名称登记端点，并为任意两个已登记端点提供拷贝服务。
///
/// # 教案式说明
/// - **意图（Why）**：多个 `Transport` 共享同一个 `Fabric` 时，彼此的端点互相可见，
///   就构成了跨主机拓扑；引擎只通过 [`XferFactory`] 看到它。
/// - **逻辑（How）**：`parking_lot::RwLock` 保护名称表与按 (源, 目标) 缓存的服务表；
///   邮箱号在整个 fabric 内唯一，重复登记直接拒绝。
/// - **契约（What）**：`endpoint` 只解析已登记的名称；未知名称返回 `InvalidArgument`。
#[derive(Default)]
pub struct Fabric {
    endpoints: RwLock<HashMap<String, Arc<SmbEndpoint>>>,
    services: RwLock<HashMap<(String, String), Arc<MemcpyServices>>>,
}

impl Fabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 创建并登记 `ocpi-smb-pio:<address>;<size>.<mailbox>.<max_mailboxes>`。
    pub fn create_endpoint(
        &self,
        address: &str,
        size: u64,
        mailbox: MailboxId,
        max_mailboxes: MailboxId,
    ) -> Result<Arc<dyn Endpoint>> {
        let address = EndpointAddress {
            protocol: PROTOCOL.to_owned(),
            address: address.to_owned(),
            size,
            mailbox,
            max_mailboxes,
        };
        // 经过一次格式化与解析，保证与端点名的校验规则一致。
        let address: EndpointAddress = address.to_string().parse()?;
        self.register(SmbEndpoint::new(address)?)
    }

    /// 按完整端点名创建并登记。
    pub fn create_named(&self, name: &str) -> Result<Arc<dyn Endpoint>> {
        self.register(SmbEndpoint::from_name(name)?)
    }

    fn register(&self, endpoint: SmbEndpoint) -> Result<Arc<dyn Endpoint>> {
        let mut endpoints = self.endpoints.write();
        if endpoints.contains_key(endpoint.name()) {
            return Err(DataplaneError::invalid_argument("endpoint is already registered")
                .with_endpoint(endpoint.name()));
        }
        if let Some(clash) = endpoints
            .values()
            .find(|other| other.mailbox() == endpoint.mailbox())
        {
            return Err(DataplaneError::invalid_argument(format!(
                "mailbox {} is already used by `{}`",
                endpoint.mailbox(),
                clash.name()
            ))
            .with_endpoint(endpoint.name()));
        }
        let endpoint = Arc::new(endpoint);
        endpoints.insert(endpoint.name().to_owned(), Arc::clone(&endpoint));
        Ok(endpoint)
    }

    /// 已登记端点的具体类型，供测试直接检查共享内存。
    pub fn smb(&self, name: &str) -> Option<Arc<SmbEndpoint>> {
        self.endpoints.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, name: &str) -> Result<Arc<SmbEndpoint>> {
        self.smb(name).ok_or_else(|| {
            DataplaneError::invalid_argument("endpoint is not registered in this fabric")
                .with_endpoint(name)
        })
    }
}

impl XferFactory for Fabric {
    fn endpoint(&self, name: &str) -> Result<Arc<dyn Endpoint>> {
        let endpoint: Arc<dyn Endpoint> = self.lookup(name)?;
        Ok(endpoint)
    }

    fn services(
        &self,
        source: &Arc<dyn Endpoint>,
        target: &Arc<dyn Endpoint>,
    ) -> Result<Arc<dyn XferServices>> {
        let key = (source.name().to_owned(), target.name().to_owned());
        if let Some(services) = self.services.read().get(&key) {
            let services: Arc<dyn XferServices> = services.clone();
            return Ok(services);
        }
        let from = self.lookup(source.name())?;
        let to = self.lookup(target.name())?;
        let services = Arc::new(MemcpyServices::new(
            source.name(),
            Arc::clone(from.segment()),
            target.name(),
            Arc::clone(to.segment()),
        ));
        self.services.write().insert(key, Arc::clone(&services));
        tracing::trace!(source = source.name(), target = target.name(), "memcpy services created");
        Ok(services)
    }
}

impl std::fmt::Debug for Fabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.endpoints.read().keys().cloned().collect();
        names.sort();
        f.debug_struct("Fabric").field("endpoints", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataplane_core::CopyKind;

    #[test]
    fn endpoints_are_resolvable_by_name() {
        let fabric = Fabric::new();
        let a = fabric.create_endpoint("node-a", 65536, 1, 16).expect("创建 a");
        assert_eq!(a.name(), "ocpi-smb-pio:node-a;65536.1.16");
        let resolved = fabric.endpoint(a.name()).expect("按名解析");
        assert_eq!(resolved.mailbox(), 1);
        assert!(fabric.endpoint("ocpi-smb-pio:ghost;65536.2.16").is_err());
    }

    #[test]
    fn duplicate_names_and_mailboxes_are_rejected() {
        let fabric = Fabric::new();
        fabric.create_endpoint("node-a", 65536, 1, 16).expect("创建 a");
        assert!(fabric.create_endpoint("node-a", 65536, 1, 16).is_err());
        assert!(fabric.create_endpoint("node-b", 65536, 1, 16).is_err());
        assert!(fabric.create_endpoint("node-c", 65536, 16, 16).is_err());
        assert_eq!(fabric.len(), 1);
    }

    #[test]
    fn services_copy_between_registered_endpoints() {
        let fabric = Fabric::new();
        let a = fabric.create_endpoint("node-a", 65536, 1, 16).expect("创建 a");
        let b = fabric.create_endpoint("node-b", 65536, 2, 16).expect("创建 b");
        a.memory().write(8192, b"payload").expect("写 a");

        let services = fabric.services(&a, &b).expect("创建服务");
        assert_eq!(services.source(), a.name());
        let mut request = services.create_request();
        request.copy(8192, 12288, 7, CopyKind::Data).expect("登记拷贝");
        request.post().expect("投递");

        let mut raw = [0u8; 7];
        b.memory().read(12288, &mut raw).expect("读 b");
        assert_eq!(&raw, b"payload");
        let again = fabric.services(&a, &b).expect("命中缓存");
        assert_eq!(again.target(), b.name());
    }
}
