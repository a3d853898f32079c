//! 安装入口的幂等性。
//!
//! # 教案式说明
//! - **测试目标（Why）**：宿主可能在多个启动路径上调用安装，第二次调用必须报错而不是覆盖全局 Subscriber；
//! - **结构安排（How）**：同一测试进程内先以显式过滤表达式安装，再分别调用三个入口，断言均返回 `AlreadyInstalled`。

use dataplane_core::LoggingConfig;
use dataplane_otel::Error;

#[test]
fn second_install_is_rejected() {
    assert!(
        matches!(dataplane_otel::install_with_filter("dataplane_core=bogus"), Err(Error::InvalidFilter(_))),
        "非法过滤表达式应被拒绝"
    );
    assert!(!dataplane_otel::is_installed());

    dataplane_otel::install_with_filter("dataplane_core=debug").expect("首次安装应成功");
    assert!(dataplane_otel::is_installed());
    tracing::info!("dataplane-otel installed");

    assert!(matches!(dataplane_otel::install(), Err(Error::AlreadyInstalled)));
    assert!(matches!(
        dataplane_otel::install_from_config(&LoggingConfig::default()),
        Err(Error::AlreadyInstalled)
    ));
}
