//! `Fabric` 作为多个传输实例共享的“主机网络”。
//!
//! # 教案式说明
//! - **测试目标（Why）**：多个线程共用同一端点分配区间时不得重叠，归还后余量完全恢复；
//!   跨端点的拷贝服务按名称解析并被缓存复用；
//! - **测试设计（How）**：只经由 `dataplane-core` 的协作者契约（`Endpoint`、`XferFactory`）访问，
//!   与引擎看到的接口保持一致。

use std::{sync::Arc, thread};

use dataplane_core::{CopyKind, ErrorKind, XferFactory, XferStatus};
use dataplane_smb::Fabric;

#[test]
fn concurrent_allocations_never_overlap() {
    let fabric = Fabric::new();
    let endpoint = fabric
        .create_endpoint("shared", 1 << 20, 1, 16)
        .expect("创建端点");
    let before = endpoint.resource_manager().available();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let endpoint = Arc::clone(&endpoint);
            thread::spawn(move || {
                (0..32)
                    .map(|round| {
                        let size = 64 + round * 8;
                        let offset = endpoint.resource_manager().alloc(size, 16).expect("分配");
                        (offset, size)
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let mut ranges: Vec<(u64, u64)> = workers
        .into_iter()
        .flat_map(|worker| worker.join().expect("工作线程不应 panic"))
        .collect();

    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        let ((a, a_len), (b, _)) = (pair[0], pair[1]);
        assert!(a + a_len <= b, "区间 [{a}, +{a_len}) 与起点 {b} 重叠");
    }
    for (offset, size) in ranges {
        endpoint.resource_manager().free(offset, size).expect("归还");
    }
    assert_eq!(endpoint.resource_manager().available(), before);
}

#[test]
fn services_copy_between_endpoints_resolved_by_name() {
    let fabric = Fabric::new();
    let a = fabric.create_endpoint("node-a", 1 << 16, 1, 16).expect("创建 a");
    let b = fabric.create_endpoint("node-b", 1 << 16, 2, 16).expect("创建 b");
    assert_eq!(fabric.len(), 2);

    let from = a.resource_manager().alloc(32, 16).expect("a 分配");
    let to = b.resource_manager().alloc(32, 16).expect("b 分配");
    let source = a.map(from, 32).expect("映射 a");
    source.write(0, b"shared memory payload").expect("写源");

    let target = fabric.endpoint(b.name()).expect("按名称解析 b");
    let services = fabric.services(&a, &target).expect("建立拷贝服务");
    assert_eq!(services.source(), a.name());
    assert_eq!(services.target(), b.name());
    let again = fabric.services(&a, &target).expect("再次取服务");
    assert!(Arc::ptr_eq(&services, &again));

    let mut request = services.create_request();
    request.copy(from, to, 21, CopyKind::Data).expect("登记拷贝段");
    assert_eq!(request.post().expect("投递"), XferStatus::Complete);

    let mut landed = [0u8; 21];
    b.map(to, 32).expect("映射 b").read(0, &mut landed).expect("读目标");
    assert_eq!(&landed, b"shared memory payload");

    let err = fabric.endpoint("ocpi-smb-pio:missing;65536.3.16").expect_err("未登记的端点");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}
