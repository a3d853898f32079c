//! 跨主机电路：两个传输实例共享一个 `Fabric`，各自只把自己的端点视为本地。
//!
//! # 教案式说明
//! - **测试目标（Why）**：覆盖邮箱握手的完整时序、影子端口上的流控、协议字符串的搬运，
//!   以及不经邮箱的描述符交换路径；
//! - **结构安排（How）**：主机 A 持有真实输出端口，主机 B 持有真实输入端口，
//!   两端以相同电路编号建立镜像拓扑，通过 `check_mailboxes` 互为应答方。

mod support;

use dataplane_core::{
    ConnectionMetadata, DataDistribution, DescriptorType, PortMetadata, PortRef, PortSetMetadata,
    Role, SendOutcome, TransferPattern, TransportConfig, handshake::Mailbox, port::PortRole,
};
use dataplane_smb::Fabric;
use support::{Host, config, connect, host, parallel, receive, send};

fn pair(config_a: TransportConfig, config_b: TransportConfig) -> (Host, Host) {
    let fabric = Fabric::new();
    let a = host(&fabric, "host-a", 1, config_a);
    let b = host(&fabric, "host-b", 2, config_b);
    (a, b)
}

/// # 教案式说明
/// - **测试目标（Why）**：握手按“输入偏移 → 控制块 → 影子状态”的顺序完成，同一端点同一时刻只有一个在途请求；
/// - **测试设计（How）**：逐步推进两端的 `ready` 与 `check_mailboxes`，断言每一步的就绪结果与应答计数；
/// - **验收契约（What）**：B 的输入端口在 B 的邮箱被控制块请求占用期间等待，槽释放后才请求影子状态。
#[test]
fn mailbox_handshake_completes_in_order() {
    let (mut a, mut b) = pair(config(true), config(true));
    let (a_name, b_name) = (a.name(), b.name());
    a.transport
        .create_circuit(1, parallel(&a_name, &[&b_name], 2, 128))
        .expect("a 创建电路");
    b.transport
        .create_circuit(1, parallel(&a_name, &[&b_name], 2, 128))
        .expect("b 创建电路");

    // A 的影子输入向 B 请求输入偏移；B 的影子输出向 A 请求控制块，真实输入因邮箱占用而等待。
    assert!(!a.circuit(1).ready().expect("a 轮询"));
    assert!(!b.circuit(1).ready().expect("b 轮询"));
    assert!(!Mailbox::new(&b.endpoint).is_available().expect("读 b 邮箱"));

    assert_eq!(a.transport.check_mailboxes().expect("a 应答").served, 1);
    assert_eq!(b.transport.check_mailboxes().expect("b 应答").served, 1);
    assert!(Mailbox::new(&a.endpoint).is_available().expect("读 a 邮箱"));
    assert!(Mailbox::new(&b.endpoint).is_available().expect("读 b 邮箱"));

    // 控制块已到，B 的真实输入这才请求影子状态。
    assert!(!b.circuit(1).ready().expect("b 轮询"));
    assert_eq!(a.transport.check_mailboxes().expect("a 应答").served, 1);
    assert!(b.circuit(1).ready().expect("b 就绪"));
    assert!(a.circuit(1).ready().expect("a 就绪"));

    let roles = |host: &mut Host| {
        let topology = host.circuit(1).topology();
        (
            topology.port(PortRef::output(0)).expect("输出端口").role(),
            topology.port(PortRef::input(0, 0)).expect("输入端口").role(),
        )
    };
    assert_eq!(roles(&mut a), (Some(PortRole::RealOutput), Some(PortRole::ShadowInput)));
    assert_eq!(roles(&mut b), (Some(PortRole::ShadowOutput), Some(PortRole::RealInput)));
    assert_eq!(a.circuit(1).pattern(0), Some(TransferPattern::Pattern1));
}

#[test]
fn remote_consumer_paces_the_producer() {
    // 跨主机时不会零拷贝，开关打开也一样走拷贝。
    let (mut a, mut b) = pair(config(true), config(true));
    let (a_name, b_name) = (a.name(), b.name());
    for host in [&mut a, &mut b] {
        host.transport
            .create_circuit(4, parallel(&a_name, &[&b_name], 2, 64))
            .expect("创建电路");
    }
    connect(&mut a, &mut b, 4);

    assert_eq!(send(a.circuit(4), 0, b"first").1, SendOutcome::Sent);
    assert_eq!(send(a.circuit(4), 0, b"second").1, SendOutcome::Sent);
    // 两个影子状态槽都已置满，第三个缓冲只能排队。
    assert_eq!(send(a.circuit(4), 0, b"third").1, SendOutcome::Queued);
    assert_eq!(a.circuit(4).queued_transfers(), 1);
    assert_eq!(a.transport.service().expect("驱动"), 0);

    let (first, data) = receive(b.circuit(4), PortRef::input(0, 0));
    assert_eq!(data, b"first");
    assert!(!b.circuit(4).input_metadata(first).expect("读元数据").zero_copy);
    b.transport.consume(4, first).expect("归还");

    assert_eq!(a.transport.service().expect("驱动"), 1);
    assert_eq!(a.circuit(4).queued_transfers(), 0);

    let (second, data) = receive(b.circuit(4), PortRef::input(0, 0));
    assert_eq!(data, b"second");
    b.transport.consume(4, second).expect("归还");
    let (_, data) = receive(b.circuit(4), PortRef::input(0, 0));
    assert_eq!(data, b"third");
}

#[test]
fn protocol_rides_along_with_the_control_request() {
    let (mut a, mut b) = pair(config(false), config(false));
    let (a_name, b_name) = (a.name(), b.name());
    for host in [&mut a, &mut b] {
        host.transport
            .create_circuit(2, parallel(&a_name, &[&b_name], 2, 64))
            .expect("创建电路");
    }
    a.circuit(2).stage_protocol(b"stream-proto:v1").expect("暂存协议");
    b.circuit(2).reserve_protocol(64).expect("预留协议区");
    connect(&mut a, &mut b, 2);

    assert_eq!(b.circuit(2).get_protocol(), Some(b"stream-proto:v1".to_vec()));
    assert_eq!(b.circuit(2).get_protocol(), None);
    assert_eq!(a.circuit(2).get_protocol(), None);
}

#[test]
fn flow_controlled_consumer_pulls_from_the_producer() {
    let (mut a, mut b) = pair(config(false), config(false));
    let (a_name, b_name) = (a.name(), b.name());
    let meta = ConnectionMetadata::new(
        PortSetMetadata::output(2, 64, DataDistribution::parallel())
            .with_port(PortMetadata::new(0, a_name.as_str()).with_role(Role::ActiveFlowControl)),
    )
    .with_input_set(
        PortSetMetadata::input(2, 64, DataDistribution::parallel()).with_port(PortMetadata::new(1, b_name.as_str())),
    );
    for host in [&mut a, &mut b] {
        host.transport.create_circuit(3, meta.clone()).expect("创建电路");
    }
    connect(&mut a, &mut b, 3);
    assert_eq!(a.circuit(3).pattern(0), Some(TransferPattern::Pattern1Afc));
    assert_eq!(b.circuit(3).pattern(0), Some(TransferPattern::Pattern1AfcShadow));

    assert_eq!(send(a.circuit(3), 0, b"pull me").1, SendOutcome::Sent);
    assert_eq!(send(a.circuit(3), 0, b"and me").1, SendOutcome::Sent);
    assert_eq!(a.circuit(3).get_next_empty_output_buffer(0).expect("取空缓冲"), None);

    let (input, data) = receive(b.circuit(3), PortRef::input(0, 0));
    assert_eq!(data, b"pull me");
    b.circuit(3).consume(input).expect("归还");

    let freed = a
        .circuit(3)
        .get_next_empty_output_buffer(0)
        .expect("取空缓冲")
        .expect("消费者回写后输出缓冲可用");
    assert_eq!(freed.tid, 0);
}

/// # 教案式说明
/// - **测试目标（Why）**：关闭邮箱时，描述符交换可以单独完成偏移表的填写；
/// - **测试设计（How）**：生产者描述符 → 消费者描述符 → 流控描述符，三步之后两端都不发任何邮箱请求即就绪。
#[test]
fn descriptor_exchange_replaces_the_mailboxes() {
    let no_mailboxes = TransportConfig {
        use_mailboxes: false,
        ..config(false)
    };
    let (mut a, mut b) = pair(no_mailboxes.clone(), no_mailboxes);
    let (a_name, b_name) = (a.name(), b.name());
    for host in [&mut a, &mut b] {
        host.transport
            .create_circuit(5, parallel(&a_name, &[&b_name], 2, 64))
            .expect("创建电路");
    }

    let producer = a
        .circuit(5)
        .finalize_port(PortRef::output(0), None)
        .expect("生产者描述符");
    assert!(!producer.done);
    let producer = producer.send.expect("生产者应发出描述符");
    assert_eq!(producer.kind, DescriptorType::Producer);
    assert_eq!(producer.desc.n_buffers, 2);
    assert_eq!(producer.desc.oob.oep, a_name);

    let consumer = b
        .circuit(5)
        .finalize_port(PortRef::input(0, 0), Some(&producer))
        .expect("消费者描述符");
    assert!(consumer.done);
    let consumer = consumer.send.expect("消费者应发出描述符");
    assert_eq!(consumer.kind, DescriptorType::Consumer);
    b.circuit(5)
        .finish_connect(PortRef::output(0), &producer)
        .expect("应用生产者描述符");

    let flow = a
        .circuit(5)
        .finalize_port(PortRef::input(0, 0), Some(&consumer))
        .expect("影子输入完成连接");
    assert!(flow.done);
    let flow = flow.send.expect("影子输入应发出流控描述符");
    assert_eq!(flow.kind, DescriptorType::ConsumerFlowControl);
    b.circuit(5)
        .set_flow_control_descriptor(PortRef::input(0, 0), &flow)
        .expect("应用流控描述符");

    assert!(a.circuit(5).ready().expect("a 就绪"));
    assert!(b.circuit(5).ready().expect("b 就绪"));
    assert!(Mailbox::new(&a.endpoint).is_available().expect("读 a 邮箱"));
    assert!(Mailbox::new(&b.endpoint).is_available().expect("读 b 邮箱"));

    assert_eq!(send(a.circuit(5), 0, b"by descriptor").1, SendOutcome::Sent);
    assert_eq!(send(a.circuit(5), 0, b"again").1, SendOutcome::Sent);
    assert_eq!(send(a.circuit(5), 0, b"later").1, SendOutcome::Queued);
    let (input, data) = receive(b.circuit(5), PortRef::input(0, 0));
    assert_eq!(data, b"by descriptor");
    b.circuit(5).consume(input).expect("归还");
    assert_eq!(a.transport.service().expect("驱动"), 1);
}

#[test]
fn requests_for_unknown_circuits_are_rejected_and_cleared() {
    let (mut a, mut b) = pair(config(false), config(false));
    let (a_name, b_name) = (a.name(), b.name());
    b.transport
        .create_circuit(9, parallel(&a_name, &[&b_name], 2, 64))
        .expect("b 创建电路");

    assert!(!b.circuit(9).ready().expect("b 轮询"));
    assert!(!Mailbox::new(&b.endpoint).is_available().expect("读 b 邮箱"));

    let report = a.transport.check_mailboxes().expect("a 应答");
    assert_eq!(report.served, 0);
    assert_eq!(report.rejected, 1);
    assert!(Mailbox::new(&b.endpoint).is_available().expect("请求方的槽应被清空"));
    assert_eq!(a.transport.check_mailboxes().expect("再次扫描").rejected, 0);
}

/// # 教案式说明
/// - **测试目标（Why）**：两端可以任意顺序启动；请求抵达时应答方端口还没初始化，
///   请求必须留到下一轮而不是被丢弃；
/// - **测试设计（How）**：B 先轮询并发出请求，A 在自己第一次 `ready` 之前就扫描邮箱；
/// - **验收契约（What）**：这一轮计入 `deferred`、B 的槽仍被占用，随后照常握手直到两端就绪。
#[test]
fn responder_that_starts_late_defers_instead_of_dropping() {
    let (mut a, mut b) = pair(config(false), config(false));
    let (a_name, b_name) = (a.name(), b.name());
    for host in [&mut a, &mut b] {
        host.transport
            .create_circuit(1, parallel(&a_name, &[&b_name], 2, 64))
            .expect("创建电路");
    }

    assert!(!b.circuit(1).ready().expect("b 轮询"));
    let report = a.transport.check_mailboxes().expect("a 尚未初始化时扫描");
    assert_eq!((report.served, report.rejected, report.deferred), (0, 0, 1));
    assert!(!Mailbox::new(&b.endpoint).is_available().expect("读 b 邮箱"));

    connect(&mut a, &mut b, 1);
    assert_eq!(send(a.circuit(1), 0, b"late start").1, SendOutcome::Sent);
    let (_, data) = receive(b.circuit(1), PortRef::input(0, 0));
    assert_eq!(data, b"late start");
}

/// # 教案式说明
/// - **测试目标（Why）**：描述符里的基址与步长必须让影子端口算出与真实端口完全相同的偏移；
/// - **验收契约（What）**：`finish_connect(port_descriptor(..))` 之后，影子端口每个缓冲的
///   数据、元数据与状态偏移都等于真实端口的对应值。
#[test]
fn finish_connect_reproduces_the_real_port_offsets() {
    let no_mailboxes = TransportConfig {
        use_mailboxes: false,
        ..config(false)
    };
    let (mut a, mut b) = pair(no_mailboxes.clone(), no_mailboxes);
    let (a_name, b_name) = (a.name(), b.name());
    for host in [&mut a, &mut b] {
        host.transport
            .create_circuit(3, parallel(&a_name, &[&b_name], 3, 96))
            .expect("创建电路");
    }

    let producer = a
        .circuit(3)
        .finalize_port(PortRef::output(0), None)
        .expect("生产者描述符")
        .send
        .expect("生产者应发出描述符");
    assert_eq!(
        a.circuit(3).port_descriptor(PortRef::output(0), None).expect("再次生成描述符"),
        producer
    );
    b.circuit(3)
        .finish_connect(PortRef::output(0), &producer)
        .expect("应用生产者描述符");

    let consumer = b
        .circuit(3)
        .finalize_port(PortRef::input(0, 0), Some(&producer))
        .expect("消费者描述符")
        .send
        .expect("消费者应发出描述符");
    a.circuit(3)
        .finish_connect(PortRef::input(0, 0), &consumer)
        .expect("应用消费者描述符");

    assert_same_offsets(&mut a, &mut b, PortRef::output(0), 3);
    assert_same_offsets(&mut b, &mut a, PortRef::input(0, 0), 3);
}

fn assert_same_offsets(real: &mut Host, shadow: &mut Host, port: PortRef, count: usize) {
    for tid in 0..count {
        let want = real.circuit(3).topology().port(port).expect("真实端口").offsets(tid).expect("真实表项");
        let got = shadow.circuit(3).topology().port(port).expect("影子端口").offsets(tid).expect("影子表项");
        assert_eq!(got.buffer_offset, want.buffer_offset, "{port:?} 缓冲 {tid} 的数据偏移");
        assert_eq!(got.meta_data_offset, want.meta_data_offset, "{port:?} 缓冲 {tid} 的元数据偏移");
        assert_eq!(got.local_state_offset, want.local_state_offset, "{port:?} 缓冲 {tid} 的状态偏移");
    }
}
