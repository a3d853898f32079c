//! 基于内存拷贝的传输服务。
//!
//! # 模块角色（Why）
//! - 同一进程内的两个端点之间，“传输”就是段到段的字节拷贝；引擎的模板按登记顺序投递，
//!   这里逐段同步执行，投递返回时全部拷贝已完成。
//!
//! # 契约说明（What）
//! - `copy` 在登记时就做边界检查，越界的拷贝段在模板生成阶段失败；
//! - `post` 总是返回 [`XferStatus::Complete`]。

use std::sync::Arc;

use dataplane_core::{
    CopyKind, DataplaneError, MemoryServices, Result, XferRequest, XferServices, XferStatus,
};

use crate::segment::Segment;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct CopySegment {
    from: u64,
    to: u64,
    len: u64,
    kind: CopyKind,
}

/// 一对 (源, 目标) 端点之间的拷贝服务。
pub struct MemcpyServices {
    source_name: String,
    target_name: String,
    source: Arc<Segment>,
    target: Arc<Segment>,
}

impl MemcpyServices {
    pub fn new(
        source_name: impl Into<String>,
        source: Arc<Segment>,
        target_name: impl Into<String>,
        target: Arc<Segment>,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            target_name: target_name.into(),
            source,
            target,
        }
    }
}

impl XferServices for MemcpyServices {
    fn source(&self) -> &str {
        &self.source_name
    }

    fn target(&self) -> &str {
        &self.target_name
    }

    fn create_request(&self) -> Box<dyn XferRequest> {
        Box::new(MemcpyRequest {
            source: Arc::clone(&self.source),
            target: Arc::clone(&self.target),
            segments: Vec::new(),
            grouped: Vec::new(),
        })
    }
}

pub struct MemcpyRequest {
    source: Arc<Segment>,
    target: Arc<Segment>,
    segments: Vec<CopySegment>,
    grouped: Vec<Box<dyn XferRequest>>,
}

impl XferRequest for MemcpyRequest {
    fn copy(&mut self, from: u64, to: u64, len: u64, kind: CopyKind) -> Result<()> {
        let fits = |offset: u64, limit: u64| offset.checked_add(len).is_some_and(|end| end <= limit);
        if !fits(from, self.source.size()) || !fits(to, self.target.size()) {
            return Err(DataplaneError::invalid_argument(format!(
                "{kind:?} copy [{from} -> {to}, +{len}) is out of bounds"
            )));
        }
        self.segments.push(CopySegment { from, to, len, kind });
        Ok(())
    }

    fn group(&mut self, other: Box<dyn XferRequest>) -> Result<()> {
        self.grouped.push(other);
        Ok(())
    }

    fn post(&self) -> Result<XferStatus> {
        let mut scratch = Vec::new();
        for segment in &self.segments {
            scratch.resize(segment.len as usize, 0);
            self.source.read(segment.from, &mut scratch)?;
            self.target.write(segment.to, &scratch)?;
        }
        for request in &self.grouped {
            request.post()?;
        }
        tracing::trace!(segments = self.segments.len(), grouped = self.grouped.len(), "memcpy request posted");
        Ok(XferStatus::Complete)
    }

    fn status(&self) -> XferStatus {
        XferStatus::Complete
    }

    fn segment_count(&self) -> usize {
        self.segments.len()
            + self
                .grouped
                .iter()
                .map(|request| request.segment_count())
                .sum::<usize>()
    }
}
