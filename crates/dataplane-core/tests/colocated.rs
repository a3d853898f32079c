//! 同址电路：输出端口与输入端口位于同一个本地端点。
//!
//! # 教案式说明
//! - **测试目标（Why）**：验证单进程内最常见的模式 1 路径，包括拷贝与零拷贝两种配置、
//!   严格循环的缓冲顺序、就绪判定的单调性以及协议字符串的一次性领取；
//! - **结构安排（How）**：每个用例用 `support::host` 搭一个端点和一个传输实例，
//!   通过公开的电路接口收发，再从模板表与元数据检查内部约定。

mod support;

use dataplane_core::{
    ConnectionMetadata, DataDistribution, DescriptorOptions, ErrorKind, PortMetadata, PortRef,
    PortSetMetadata, Role, SendOutcome, TransferPattern,
    layout,
    template::{InputKey, LegKind, OutputKey},
};
use dataplane_smb::Fabric;
use support::{config, host, parallel, receive, send};

#[test]
fn copied_payload_and_metadata_reach_the_input() {
    let fabric = Fabric::new();
    let mut node = host(&fabric, "node-a", 0, config(false));
    let name = node.name();
    node.transport
        .create_circuit(1, parallel(&name, &[&name], 2, 64))
        .expect("创建电路");
    let circuit = node.circuit(1);
    assert!(!circuit.is_open());
    assert!(circuit.ready().expect("同址电路首轮即就绪"));
    assert_eq!(circuit.pattern(0), Some(TransferPattern::Pattern1));

    let buf = circuit
        .get_next_empty_output_buffer(0)
        .expect("取空缓冲")
        .expect("应有空闲输出缓冲");
    assert_eq!(buf.tid, 0);
    circuit.write_output(buf, b"hello").expect("写入");
    assert_eq!(
        circuit.send_output_buffer(buf, 5, 3, false).expect("发送"),
        SendOutcome::Sent
    );
    assert!(circuit.has_empty_output_buffer(0).expect("查询空缓冲"));

    let input = circuit
        .get_next_full_input_buffer(PortRef::input(0, 0))
        .expect("取满缓冲")
        .expect("应收到数据");
    assert_eq!(input.tid, 0);
    let md = circuit.input_metadata(input).expect("读元数据");
    assert_eq!(md.length, 5);
    assert_eq!(md.opcode, 3);
    assert!(!md.end_of_stream);
    assert!(!md.zero_copy);
    assert_eq!(&circuit.input_data(input).expect("读数据")[..], b"hello");
    assert_eq!(circuit.consume(input).expect("归还"), None);
    assert!(!circuit.has_full_input_buffer(PortRef::input(0, 0)).expect("查询满缓冲"));
}

/// 零拷贝时输入缓冲直接引用输出缓冲，输出缓冲要等消费后才回到空闲。
#[test]
fn zero_copy_holds_the_output_until_consumed() {
    let fabric = Fabric::new();
    let mut node = host(&fabric, "node-a", 0, config(true));
    let name = node.name();
    node.transport
        .create_circuit(1, parallel(&name, &[&name], 2, 64))
        .expect("创建电路");
    let circuit = node.circuit(1);
    assert!(circuit.ready().expect("就绪"));

    assert_eq!(send(circuit, 0, b"one").1, SendOutcome::Sent);
    assert_eq!(send(circuit, 0, b"two").1, SendOutcome::Sent);
    assert!(!circuit.has_empty_output_buffer(0).expect("查询空缓冲"));
    assert_eq!(circuit.get_next_empty_output_buffer(0).expect("取空缓冲"), None);

    let (first, data) = receive(circuit, PortRef::input(0, 0));
    assert_eq!(data, b"one");
    assert_eq!(circuit.input_metadata(first).expect("读元数据").length, 3);
    // 仍被持有的输入不会释放输出。
    assert_eq!(circuit.get_next_empty_output_buffer(0).expect("取空缓冲"), None);

    circuit.consume(first).expect("归还");
    let again = circuit
        .get_next_empty_output_buffer(0)
        .expect("取空缓冲")
        .expect("消费后输出缓冲应回到空闲");
    assert_eq!(again.tid, 0);

    let (_, data) = receive(circuit, PortRef::input(0, 0));
    assert_eq!(data, b"two");
}

#[test]
fn buffers_rotate_in_strict_circular_order() {
    let fabric = Fabric::new();
    let mut node = host(&fabric, "node-a", 0, config(false));
    let name = node.name();
    node.transport
        .create_circuit(7, parallel(&name, &[&name], 3, 32))
        .expect("创建电路");
    let circuit = node.circuit(7);
    assert!(circuit.ready().expect("就绪"));

    let mut output_tids = Vec::new();
    let mut input_tids = Vec::new();
    for round in 0u8..5 {
        let (buf, outcome) = send(circuit, 0, &[round; 4]);
        assert_eq!(outcome, SendOutcome::Sent);
        output_tids.push(buf.tid);
        let (input, data) = receive(circuit, PortRef::input(0, 0));
        assert_eq!(data, vec![round; 4]);
        input_tids.push(input.tid);
        circuit.consume(input).expect("归还");
    }
    assert_eq!(output_tids, vec![0, 1, 2, 0, 1]);
    assert_eq!(input_tids, vec![0, 1, 2, 0, 1]);
}

/// # 教案式说明
/// - **测试目标（Why）**：就绪判定单调，且未就绪时的传输调用给出可重试的 `NotReady`；
/// - **测试设计（How）**：输出端口位置先不确定，`finalize` 后就绪；`reset` 重新打开电路；
/// - **验收契约（What）**：就绪后反复轮询都为真；重置后需要再次 `finalize` 才能就绪，缓冲顺序从头开始。
#[test]
fn readiness_is_monotonic_until_reset() {
    let fabric = Fabric::new();
    let mut node = host(&fabric, "node-a", 0, config(false));
    let name = node.name();
    let meta = ConnectionMetadata::new(
        PortSetMetadata::output(2, 64, DataDistribution::parallel()).with_port(PortMetadata::unresolved(0)),
    )
    .with_input_set(
        PortSetMetadata::input(2, 64, DataDistribution::parallel()).with_port(PortMetadata::new(1, name.as_str())),
    );
    node.transport.create_circuit(3, meta).expect("创建电路");
    let circuit = node.circuit(3);

    assert!(circuit.is_open());
    assert!(!circuit.ready().expect("轮询"));
    let err = circuit
        .get_next_empty_output_buffer(0)
        .expect_err("未就绪时不能取缓冲");
    assert_eq!(err.kind(), ErrorKind::NotReady);
    assert!(err.kind().is_retryable());

    circuit.finalize(&name).expect("确定输出位置");
    assert!(!circuit.is_open());
    assert!(circuit.ready().expect("轮询"));
    assert!(circuit.ready().expect("再次轮询"));
    assert_eq!(send(circuit, 0, b"before").0.tid, 0);

    circuit.reset().expect("重置");
    assert!(!circuit.is_ready());
    assert!(!circuit.ready().expect("重置后电路重新打开"));
    circuit.finalize(&name).expect("再次确定输出位置");
    assert!(circuit.ready().expect("轮询"));
    assert_eq!(send(circuit, 0, b"after").0.tid, 0);
    let (_, data) = receive(circuit, PortRef::input(0, 0));
    assert_eq!(data, b"after");
}

#[test]
fn circuit_ids_must_be_nonzero_and_unique() {
    let fabric = Fabric::new();
    let mut node = host(&fabric, "node-a", 0, config(false));
    let name = node.name();
    let err = node
        .transport
        .create_circuit(0, parallel(&name, &[&name], 2, 64))
        .expect_err("编号 0 保留");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    node.transport
        .create_circuit(5, parallel(&name, &[&name], 2, 64))
        .expect("创建电路");
    assert!(node.transport.create_circuit(5, parallel(&name, &[&name], 2, 64)).is_err());
    assert_eq!(node.transport.circuit_ids().collect::<Vec<_>>(), vec![5]);

    node.circuit(5).attach();
    assert!(!node.transport.release_circuit(5).expect("释放一次引用"));
    assert!(node.transport.release_circuit(5).expect("释放最后一次引用"));
    assert!(node.transport.circuit(5).is_none());
}

#[test]
fn end_of_stream_is_broadcast_to_every_input_port() {
    let fabric = Fabric::new();
    let mut node = host(&fabric, "node-a", 0, config(false));
    let name = node.name();
    node.transport
        .create_circuit(2, parallel(&name, &[&name, &name], 2, 64))
        .expect("创建电路");
    let circuit = node.circuit(2);
    assert!(circuit.ready().expect("就绪"));

    let buf = circuit
        .get_next_empty_output_buffer(0)
        .expect("取空缓冲")
        .expect("应有空闲输出缓冲");
    circuit.write_output(buf, b"end").expect("写入");
    assert_eq!(
        circuit.send_output_buffer(buf, 3, 9, true).expect("发送流结束"),
        SendOutcome::Sent
    );

    for index in 0..2 {
        let (input, data) = receive(circuit, PortRef::input(0, index));
        assert_eq!(data, b"end");
        assert!(circuit.is_eos(input).expect("读流结束"));
        let md = circuit.input_metadata(input).expect("读元数据");
        assert!(md.broadcast);
        assert_eq!(md.opcode, 9);
    }
}

/// 生产者为 AFC 角色时，输出缓冲只认消费者回写的空标志。
#[test]
fn flow_controlled_output_waits_for_consumer_write_back() {
    let fabric = Fabric::new();
    let mut node = host(&fabric, "node-a", 0, config(false));
    let name = node.name();
    let meta = ConnectionMetadata::new(
        PortSetMetadata::output(2, 64, DataDistribution::parallel())
            .with_port(PortMetadata::new(0, name.as_str()).with_role(Role::ActiveFlowControl)),
    )
    .with_input_set(
        PortSetMetadata::input(2, 64, DataDistribution::parallel()).with_port(PortMetadata::new(1, name.as_str())),
    );
    node.transport.create_circuit(4, meta).expect("创建电路");
    let circuit = node.circuit(4);
    assert!(circuit.ready().expect("就绪"));
    assert_eq!(circuit.pattern(0), Some(TransferPattern::Pattern1Afc));

    assert_eq!(send(circuit, 0, b"a").1, SendOutcome::Sent);
    assert_eq!(send(circuit, 0, b"b").1, SendOutcome::Sent);
    assert_eq!(circuit.get_next_empty_output_buffer(0).expect("取空缓冲"), None);

    let (input, data) = receive(circuit, PortRef::input(0, 0));
    assert_eq!(data, b"a");
    circuit.consume(input).expect("归还");
    let freed = circuit
        .get_next_empty_output_buffer(0)
        .expect("取空缓冲")
        .expect("回写空标志后输出缓冲可用");
    assert_eq!(freed.tid, 0);
}

#[test]
fn passive_roles_only_mark_the_output_full() {
    let fabric = Fabric::new();
    let mut node = host(&fabric, "node-a", 0, config(false));
    let name = node.name();
    let meta = ConnectionMetadata::new(
        PortSetMetadata::output(1, 64, DataDistribution::parallel())
            .with_port(PortMetadata::new(0, name.as_str()).with_role(Role::Passive)),
    )
    .with_input_set(
        PortSetMetadata::input(1, 64, DataDistribution::parallel()).with_port(PortMetadata::new(1, name.as_str())),
    );
    node.transport.create_circuit(6, meta).expect("创建电路");
    let circuit = node.circuit(6);
    assert!(circuit.ready().expect("就绪"));
    assert_eq!(circuit.pattern(0), Some(TransferPattern::Pattern1Passive));

    assert_eq!(send(circuit, 0, b"peer pulls").1, SendOutcome::Sent);
    assert_eq!(circuit.get_next_empty_output_buffer(0).expect("取空缓冲"), None);
    assert!(!circuit.has_full_input_buffer(PortRef::input(0, 0)).expect("查询满缓冲"));
}

/// # 教案式说明
/// - **测试目标（Why）**：可零拷贝的同址组合只登记移交，其余组合每个目标恰好一段数据、元数据与标志；
/// - **验收契约（What）**：标志段总排在同一目标的数据段之后；同址消费模板不产生回写段。
#[test]
fn templates_carry_hand_offs_or_exactly_one_leg_per_kind() {
    let key = OutputKey {
        output_port: 0,
        output_tid: 0,
        input_port: None,
        input_tid: 1,
        broadcast: false,
    };

    let fabric = Fabric::new();
    let mut zero = host(&fabric, "node-z", 0, config(true));
    let name = zero.name();
    zero.transport
        .create_circuit(1, parallel(&name, &[&name, &name], 2, 64))
        .expect("创建电路");
    let circuit = zero.circuit(1);
    assert!(circuit.ready().expect("就绪"));
    let template = circuit.controllers()[0]
        .templates()
        .output(&key)
        .expect("应有输出模板");
    assert_eq!(template.hand_offs().len(), 2);
    for kind in [LegKind::Data, LegKind::Metadata, LegKind::Flag] {
        assert_eq!(template.count(kind), 0);
    }

    let mut copy = host(&fabric, "node-c", 1, config(false));
    let name = copy.name();
    copy.transport
        .create_circuit(1, parallel(&name, &[&name, &name], 2, 64))
        .expect("创建电路");
    let circuit = copy.circuit(1);
    assert!(circuit.ready().expect("就绪"));
    let templates = circuit.controllers()[0].templates();
    let template = templates.output(&key).expect("应有输出模板");
    assert!(template.hand_offs().is_empty());
    let kinds: Vec<LegKind> = template.legs().iter().map(|leg| leg.kind).collect();
    assert_eq!(
        kinds,
        vec![
            LegKind::Data,
            LegKind::Metadata,
            LegKind::Flag,
            LegKind::Data,
            LegKind::Metadata,
            LegKind::Flag,
        ]
    );

    let consume = templates
        .input(&InputKey {
            input_port: 1,
            input_tid: 0,
            broadcast: false,
        })
        .expect("应有消费模板");
    assert!(consume.releases_zero_copy());
    assert!(consume.legs().is_empty());
}

#[test]
fn meta_flag_option_sources_the_full_flag_from_metadata() {
    let fabric = Fabric::new();
    let mut node = host(&fabric, "node-a", 0, config(false));
    let name = node.name();
    let meta = ConnectionMetadata::new(
        PortSetMetadata::output(2, 64, DataDistribution::parallel()).with_port(PortMetadata::new(0, name.as_str())),
    )
    .with_input_set(
        PortSetMetadata::input(2, 64, DataDistribution::parallel()).with_port(
            PortMetadata::new(1, name.as_str()).with_options(DescriptorOptions::FLAG_IS_META),
        ),
    );
    node.transport.create_circuit(8, meta).expect("创建电路");
    let circuit = node.circuit(8);
    assert!(circuit.ready().expect("就绪"));

    let md_base = circuit
        .topology()
        .port(PortRef::output(0))
        .expect("输出端口")
        .offsets(0)
        .expect("偏移表")
        .meta_data_offset;
    let key = OutputKey {
        output_port: 0,
        output_tid: 0,
        input_port: None,
        input_tid: 0,
        broadcast: false,
    };
    let template = circuit.controllers()[0].templates().output(&key).expect("模板");
    let flag = template
        .legs()
        .iter()
        .find(|leg| leg.kind == LegKind::Flag)
        .expect("应有标志段");
    assert_eq!(flag.from, md_base + layout::meta::XFER_META_DATA);

    // 长度为 0 的缓冲也必须被识别为满。
    assert_eq!(send(circuit, 0, b"").1, SendOutcome::Sent);
    let (input, data) = receive(circuit, PortRef::input(0, 0));
    assert!(data.is_empty());
    assert_eq!(circuit.input_metadata(input).expect("读元数据").length, 0);
}

#[test]
fn protocol_bytes_are_handed_out_once() {
    let fabric = Fabric::new();
    let mut node = host(&fabric, "node-a", 0, config(false));
    let name = node.name();
    node.transport
        .create_circuit(9, parallel(&name, &[&name], 2, 64))
        .expect("创建电路");
    let circuit = node.circuit(9);
    circuit.stage_protocol(b"stream/test").expect("暂存协议");
    assert_eq!(circuit.protocol_info().map(|info| info.size), Some(11));
    assert!(circuit.ready().expect("就绪"));

    assert_eq!(circuit.get_protocol(), Some(b"stream/test".to_vec()));
    assert_eq!(circuit.get_protocol(), None);
}

/// # 教案式说明
/// - **测试目标（Why）**：最小的模式 1 场景，4 个 1024 字节缓冲，一个输出端口对一个输入端口；
/// - **测试设计（How）**：发送 0 号缓冲、取回并归还，再沿循环顺序取出其余空缓冲；
/// - **验收契约（What）**：发送后输入端立即可见 0 号缓冲；归还后输出端仍有空缓冲，
///   但 0 号缓冲只有在循环一圈之后才会再次被取出。
#[test]
fn four_buffer_pattern_one_wraps_before_reusing_ordinal_zero() {
    let fabric = Fabric::new();
    let mut node = host(&fabric, "node-a", 0, config(false));
    let name = node.name();
    node.transport
        .create_circuit(4, parallel(&name, &[&name], 4, 1024))
        .expect("创建电路");
    let circuit = node.circuit(4);
    assert!(circuit.ready().expect("就绪"));
    assert_eq!(circuit.pattern(0), Some(TransferPattern::Pattern1));

    let (first, outcome) = send(circuit, 0, &[0xa5; 1024]);
    assert_eq!((first.tid, outcome), (0, SendOutcome::Sent));
    assert!(circuit.has_full_input_buffer(PortRef::input(0, 0)).expect("查询满缓冲"));
    let (input, data) = receive(circuit, PortRef::input(0, 0));
    assert_eq!((input.tid, data.len()), (0, 1024));
    circuit.consume(input).expect("归还");
    assert!(circuit.has_empty_output_buffer(0).expect("查询空缓冲"));

    let mut order = Vec::new();
    for _ in 0..4 {
        let buf = circuit
            .get_next_empty_output_buffer(0)
            .expect("取空缓冲")
            .expect("应有空闲输出缓冲");
        order.push(buf.tid);
        circuit.send_output_buffer(buf, 8, 0, false).expect("发送");
        let (input, _) = receive(circuit, PortRef::input(0, 0));
        circuit.consume(input).expect("归还");
    }
    assert_eq!(order, vec![1, 2, 3, 0]);
}
