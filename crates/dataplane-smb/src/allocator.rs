use std::sync::atomic::{AtomicU64, Ordering};

use dataplane_core::{DataplaneError, ErrorKind, OffsetAllocator, Result, error::codes};
use spin::Mutex;

/// 首次适配的区间分配器，管理 `[base, limit)`。
///
/// # 模块角色（Why）
/// - 每个端点 SMB 开头是邮箱通信区，之后才是端口可分配的缓冲/状态/元数据区间；
/// - 端口建立失败时要逐段归还，分配器必须支持任意顺序的释放与合并。
///
/// # 核心机制（How）
/// - `spin::Mutex<Vec<(offset, len)>>` 维护按偏移排序的空闲链表；
/// - 分配时找第一个能容纳对齐后区间的空闲段，切下后把前后余量放回链表；
/// - 释放时按偏移插入并与相邻空闲段合并。
///
/// # 契约说明（What）
/// - 释放的区间必须落在 `[base, limit)` 内且不与任何空闲段重叠，否则返回 `InvalidArgument`；
/// - `available()` 返回空闲字节总数，不代表最大连续块。
pub struct ArenaAllocator {
    base: u64,
    limit: u64,
    free: Mutex<Vec<(u64, u64)>>,
    available: AtomicU64,
}

impl ArenaAllocator {
    pub fn new(base: u64, limit: u64) -> Self {
        let len = limit.saturating_sub(base);
        let free = if len > 0 { vec![(base, len)] } else { Vec::new() };
        Self {
            base,
            limit,
            free: Mutex::new(free),
            available: AtomicU64::new(len),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// 空闲段数量，用于观察碎片。
    pub fn fragments(&self) -> usize {
        self.free.lock().len()
    }
}

impl OffsetAllocator for ArenaAllocator {
    fn alloc(&self, size: u64, align: u64) -> Result<u64> {
        if size == 0 || !align.is_power_of_two() {
            return Err(DataplaneError::invalid_argument(format!(
                "cannot allocate {size} bytes with alignment {align}"
            )));
        }
        let mut free = self.free.lock();
        for index in 0..free.len() {
            let (start, len) = free[index];
            let aligned = start.next_multiple_of(align);
            let head = aligned - start;
            if head.checked_add(size).is_none_or(|need| need > len) {
                continue;
            }
            let tail = len - head - size;
            free.remove(index);
            let mut at = index;
            if head > 0 {
                free.insert(at, (start, head));
                at += 1;
            }
            if tail > 0 {
                free.insert(at, (aligned + size, tail));
            }
            self.available.fetch_sub(size, Ordering::Relaxed);
            return Ok(aligned);
        }
        Err(DataplaneError::new(
            codes::NO_MORE_BUFFER,
            ErrorKind::ResourceExhausted,
            format!("no free range of {size} bytes"),
        ))
    }

    fn free(&self, offset: u64, size: u64) -> Result<()> {
        let end = offset.checked_add(size).unwrap_or(u64::MAX);
        if size == 0 || offset < self.base || end > self.limit {
            return Err(DataplaneError::invalid_argument(format!(
                "range [{offset}, +{size}) is outside the arena"
            )));
        }
        let mut free = self.free.lock();
        let index = free.partition_point(|(start, _)| *start < offset);
        let overlaps_prev = index > 0 && {
            let (start, len) = free[index - 1];
            start + len > offset
        };
        let overlaps_next = free.get(index).is_some_and(|(start, _)| *start < end);
        if overlaps_prev || overlaps_next {
            return Err(DataplaneError::invalid_argument(format!(
                "range [{offset}, +{size}) is already free"
            )));
        }
        free.insert(index, (offset, size));
        if let Some(&(next, next_len)) = free.get(index + 1)
            && next == end
        {
            free[index].1 += next_len;
            free.remove(index + 1);
        }
        if index > 0 {
            let (prev, prev_len) = free[index - 1];
            if prev + prev_len == offset {
                free[index - 1].1 += free[index].1;
                free.remove(index);
            }
        }
        self.available.fetch_add(size, Ordering::Relaxed);
        Ok(())
    }

    fn available(&self) -> u64 {
        self.available.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn allocations_respect_alignment_and_base() {
        let arena = ArenaAllocator::new(4096, 8192);
        let a = arena.alloc(10, 16).expect("首段分配");
        assert_eq!(a, 4096);
        let b = arena.alloc(8, 64).expect("对齐分配");
        assert_eq!(b % 64, 0);
        assert!(b >= a + 10);
        assert_eq!(arena.available(), 4096 - 18);
    }

    #[test]
    fn exhaustion_reports_no_more_buffer() {
        let arena = ArenaAllocator::new(0, 64);
        arena.alloc(64, 1).expect("整段分配");
        let err = arena.alloc(1, 1).expect_err("空间耗尽");
        assert_eq!(err.code(), codes::NO_MORE_BUFFER);
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }

    #[test]
    fn frees_coalesce_back_into_one_range() {
        let arena = ArenaAllocator::new(0, 300);
        let a = arena.alloc(100, 1).expect("a");
        let b = arena.alloc(100, 1).expect("b");
        let c = arena.alloc(100, 1).expect("c");
        arena.free(a, 100).expect("释放 a");
        arena.free(c, 100).expect("释放 c");
        assert_eq!(arena.fragments(), 2);
        arena.free(b, 100).expect("释放 b");
        assert_eq!(arena.fragments(), 1);
        assert_eq!(arena.alloc(300, 1).expect("合并后整段可用"), 0);
    }

    #[test]
    fn double_free_is_rejected() {
        let arena = ArenaAllocator::new(0, 128);
        let a = arena.alloc(32, 1).expect("分配");
        arena.free(a, 32).expect("首次释放");
        assert!(arena.free(a, 32).is_err());
        assert!(arena.free(200, 8).is_err());
    }

    proptest! {
        #[test]
        fn live_ranges_never_overlap(sizes in proptest::collection::vec(1u64..200, 1..40)) {
            let arena = ArenaAllocator::new(256, 256 + 4096);
            let mut live: Vec<(u64, u64)> = Vec::new();
            for (i, size) in sizes.iter().enumerate() {
                if i % 3 == 2 && !live.is_empty() {
                    let (offset, len) = live.remove(0);
                    arena.free(offset, len).expect("释放已分配区间");
                }
                if let Ok(offset) = arena.alloc(*size, 8) {
                    prop_assert_eq!(offset % 8, 0);
                    prop_assert!(offset >= 256 && offset + size <= 256 + 4096);
                    for (other, len) in &live {
                        prop_assert!(offset + size <= *other || other + len <= offset);
                    }
                    live.push((offset, *size));
                }
            }
            let used: u64 = live.iter().map(|(_, len)| len).sum();
            prop_assert_eq!(arena.available(), 4096 - used);
        }
    }
}
