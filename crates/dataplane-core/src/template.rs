//! 预计算的传输模板。
//!
//! # 模块角色（Why）
//! - 运行期的每次生产/消费只做“按键查表 + 投递”，拷贝段的地址计算全部在电路就绪时完成；
//!
//! # 核心机制（How）
//! - [`TemplateBuilder`] 按登记顺序合并拷贝段：连续指向同一 (源, 目标) 端点对的段落进同一请求，
//!   端点对变化时新开请求，因此投递顺序与登记顺序一致（数据段先于标志段）；
//! - 零拷贝移交、分片元数据预置与门控子模板由控制器在投递前后执行。
//!
//! # 契约说明（What）
//! - 模板构建后不可变；`legs()` 暴露全部拷贝段，用于检查与测试；
//! - 构建失败统一映射为 `TransportBuildFailure`，携带源与目标端点名。

use std::{collections::HashMap, fmt, sync::Arc};

use crate::{
    buffer::BufferRef,
    distribution::PartSpan,
    endpoint::{CopyKind, Endpoint, XferRequest, XferStatus},
    error::{DataplaneError, Result},
    metadata::PortId,
    transport::TransportContext,
};

/// 拷贝段在模板中的用途。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LegKind {
    Data,
    Metadata,
    Flag,
    /// 向其它输出端的影子扇出状态（顺序分布）。
    PreState,
    /// 传递端口集控制块（令牌）。
    Control,
    /// AFC 消费者从生产者拉取数据/元数据。
    Pull,
}

impl LegKind {
    fn copy_kind(self) -> CopyKind {
        match self {
            LegKind::Data | LegKind::Pull => CopyKind::Data,
            LegKind::Metadata => CopyKind::Metadata,
            LegKind::Flag | LegKind::PreState | LegKind::Control => CopyKind::Flag,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LegRecord {
    pub kind: LegKind,
    pub source: String,
    pub target: String,
    pub from: u64,
    pub to: u64,
    pub len: u64,
}

/// 同址端口之间的零拷贝移交：输入缓冲直接引用输出缓冲。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZeroCopyHandOff {
    pub output: BufferRef,
    pub input: BufferRef,
}

/// 分片发送前写入输出元数据槽的预置值（模式 4）。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresetMetadata {
    pub output: BufferRef,
    /// 目标输入端口编号，即写入的元数据列。
    pub column: usize,
    pub span: PartSpan,
    pub parts_per_whole: u32,
    pub last_transfer: bool,
}

#[derive(Default)]
pub struct TransferTemplate {
    legs: Vec<LegRecord>,
    requests: Vec<Arc<dyn XferRequest>>,
    hand_offs: Vec<ZeroCopyHandOff>,
    presets: Vec<PresetMetadata>,
    gated: Vec<TransferTemplate>,
    releases_zero_copy: bool,
}

impl TransferTemplate {
    pub fn legs(&self) -> &[LegRecord] {
        &self.legs
    }

    pub fn count(&self, kind: LegKind) -> usize {
        self.legs.iter().filter(|leg| leg.kind == kind).count()
    }

    pub fn hand_offs(&self) -> &[ZeroCopyHandOff] {
        &self.hand_offs
    }

    pub fn presets(&self) -> &[PresetMetadata] {
        &self.presets
    }

    /// 分片子模板，下标 k-1 对应第 k 次子传输。
    pub fn gated(&self) -> &[TransferTemplate] {
        &self.gated
    }

    /// 消费侧模板：同址输出端通过解除零拷贝挂接释放。
    pub fn releases_zero_copy(&self) -> bool {
        self.releases_zero_copy
    }

    pub fn is_empty(&self) -> bool {
        self.legs.is_empty() && self.hand_offs.is_empty() && self.presets.is_empty()
    }

    /// 按顺序投递全部请求，返回仍在途的请求句柄。
    pub(crate) fn post(&self) -> Result<Vec<Arc<dyn XferRequest>>> {
        let mut pending = Vec::new();
        for request in &self.requests {
            if request.post()? == XferStatus::Pending {
                pending.push(Arc::clone(request));
            }
        }
        Ok(pending)
    }
}

impl fmt::Debug for TransferTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferTemplate")
            .field("legs", &self.legs)
            .field("hand_offs", &self.hand_offs)
            .field("presets", &self.presets.len())
            .field("gated", &self.gated.len())
            .finish()
    }
}

pub struct TemplateBuilder<'a> {
    ctx: &'a TransportContext,
    legs: Vec<LegRecord>,
    requests: Vec<(String, String, Box<dyn XferRequest>)>,
    hand_offs: Vec<ZeroCopyHandOff>,
    presets: Vec<PresetMetadata>,
    gated: Vec<TransferTemplate>,
    releases_zero_copy: bool,
}

impl<'a> TemplateBuilder<'a> {
    pub fn new(ctx: &'a TransportContext) -> Self {
        Self {
            ctx,
            legs: Vec::new(),
            requests: Vec::new(),
            hand_offs: Vec::new(),
            presets: Vec::new(),
            gated: Vec::new(),
            releases_zero_copy: false,
        }
    }

    pub fn copy(
        &mut self,
        kind: LegKind,
        source: &Arc<dyn Endpoint>,
        target: &Arc<dyn Endpoint>,
        from: u64,
        to: u64,
        len: u64,
    ) -> Result<()> {
        let wrap = |err: DataplaneError| {
            DataplaneError::transport_build(source.name(), target.name(), "cannot build transfer request")
                .with_cause(err)
        };
        let same_pair = self
            .requests
            .last()
            .is_some_and(|(s, t, _)| s == source.name() && t == target.name());
        if !same_pair {
            let services = self.ctx.services(source, target).map_err(wrap)?;
            self.requests.push((
                source.name().to_owned(),
                target.name().to_owned(),
                services.create_request(),
            ));
        }
        if let Some((_, _, request)) = self.requests.last_mut() {
            request.copy(from, to, len, kind.copy_kind()).map_err(wrap)?;
        }
        self.legs.push(LegRecord {
            kind,
            source: source.name().to_owned(),
            target: target.name().to_owned(),
            from,
            to,
            len,
        });
        Ok(())
    }

    pub fn hand_off(&mut self, output: BufferRef, input: BufferRef) {
        self.hand_offs.push(ZeroCopyHandOff { output, input });
    }

    pub fn preset(&mut self, preset: PresetMetadata) {
        self.presets.push(preset);
    }

    pub fn gate(&mut self, template: TransferTemplate) {
        self.gated.push(template);
    }

    pub fn release_zero_copy(&mut self) {
        self.releases_zero_copy = true;
    }

    pub fn build(self) -> TransferTemplate {
        TransferTemplate {
            legs: self.legs,
            requests: self
                .requests
                .into_iter()
                .map(|(_, _, request)| Arc::from(request))
                .collect(),
            hand_offs: self.hand_offs,
            presets: self.presets,
            gated: self.gated,
            releases_zero_copy: self.releases_zero_copy,
        }
    }
}

/// 输出侧模板键。`input_port == None` 表示整组输入端口共用一个模板。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OutputKey {
    pub output_port: PortId,
    pub output_tid: usize,
    pub input_port: Option<PortId>,
    pub input_tid: usize,
    pub broadcast: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InputKey {
    pub input_port: PortId,
    pub input_tid: usize,
    pub broadcast: bool,
}

/// 一个 (输出端口集, 输入端口集) 组合的全部模板。
#[derive(Debug, Default)]
pub struct TemplateTable {
    pub(crate) output: HashMap<OutputKey, TransferTemplate>,
    pub(crate) input: HashMap<InputKey, TransferTemplate>,
    pub(crate) pull: HashMap<InputKey, TransferTemplate>,
}

impl TemplateTable {
    pub fn output(&self, key: &OutputKey) -> Option<&TransferTemplate> {
        self.output.get(key)
    }

    pub fn input(&self, key: &InputKey) -> Option<&TransferTemplate> {
        self.input.get(key)
    }

    pub fn pull(&self, key: &InputKey) -> Option<&TransferTemplate> {
        self.pull.get(key)
    }

    pub fn output_keys(&self) -> impl Iterator<Item = &OutputKey> {
        self.output.keys()
    }

    pub fn input_keys(&self) -> impl Iterator<Item = &InputKey> {
        self.input.keys()
    }

    pub fn len(&self) -> usize {
        self.output.len() + self.input.len() + self.pull.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
