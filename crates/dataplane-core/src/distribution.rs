//! 数据分布与分区：决定一个输出缓冲送往哪些输入端口、如何切片。

/// 端口集内的分布方式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DistributionKind {
    /// 每个端口都拿到整份数据（或按分区切片）。
    #[default]
    Parallel,
    /// 端口轮流拿到完整缓冲。
    Sequential,
}

/// 顺序分布时挑选目标端口的策略。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DistributionSubType {
    #[default]
    RoundRobin,
    RandomEven,
    RandomStatistical,
    FirstAvailable,
    LeastBusy,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DataPartition {
    #[default]
    Indivisible,
    /// 按固定块大小切分，第 i 块交给端口 `i % n_ports`。
    Block { part_size: u32 },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DataDistribution {
    pub kind: DistributionKind,
    pub sub_type: DistributionSubType,
    pub partition: DataPartition,
}

impl DataDistribution {
    pub const fn parallel() -> Self {
        Self {
            kind: DistributionKind::Parallel,
            sub_type: DistributionSubType::RoundRobin,
            partition: DataPartition::Indivisible,
        }
    }

    pub const fn sequential(sub_type: DistributionSubType) -> Self {
        Self {
            kind: DistributionKind::Sequential,
            sub_type,
            partition: DataPartition::Indivisible,
        }
    }

    pub const fn block(part_size: u32) -> Self {
        Self {
            kind: DistributionKind::Parallel,
            sub_type: DistributionSubType::RoundRobin,
            partition: DataPartition::Block { part_size },
        }
    }

    pub fn is_parallel(&self) -> bool {
        self.kind == DistributionKind::Parallel
    }
}

/// 一次子传输中交给某个端口的字节区间。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartSpan {
    /// 子传输序号 k。
    pub transfer: usize,
    /// 输入端口在端口集内的下标 n。
    pub port: usize,
    /// 全局分片序号 `k * n_ports + n`。
    pub sequence: u32,
    pub offset: u64,
    pub len: u64,
}

impl DataPartition {
    /// 把 `total_len` 字节交给 `n_ports` 个端口需要的子传输次数，至少为 1。
    pub fn transfer_count(&self, total_len: u64, n_ports: usize) -> usize {
        match *self {
            DataPartition::Indivisible => 1,
            DataPartition::Block { part_size } => {
                let stride = u64::from(part_size.max(1)) * n_ports.max(1) as u64;
                total_len.div_ceil(stride).max(1) as usize
            }
        }
    }

    /// 整份数据被切成的分片总数。
    pub fn parts_per_whole(&self, total_len: u64, n_ports: usize) -> u32 {
        match self {
            DataPartition::Indivisible => 1,
            DataPartition::Block { .. } => (self.transfer_count(total_len, n_ports) * n_ports) as u32,
        }
    }

    /// 切片计划：按子传输、再按端口排列。
    ///
    /// 所有分片长度之和等于 `total_len`；越过末尾的分片长度为 0。
    pub fn plan(&self, total_len: u64, n_ports: usize) -> Vec<PartSpan> {
        let count = self.transfer_count(total_len, n_ports);
        let mut spans = Vec::with_capacity(count * n_ports);
        for transfer in 0..count {
            for port in 0..n_ports {
                let sequence = (transfer * n_ports + port) as u32;
                let (offset, len) = match *self {
                    DataPartition::Indivisible => (0, total_len),
                    DataPartition::Block { part_size } => {
                        let part = u64::from(part_size.max(1));
                        let offset = u64::from(sequence) * part;
                        (offset, part.min(total_len.saturating_sub(offset)))
                    }
                };
                spans.push(PartSpan {
                    transfer,
                    port,
                    sequence,
                    offset,
                    len,
                });
            }
        }
        spans
    }
}

/// 顺序分布的候选目标。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub port: usize,
    pub tid: usize,
    pub busy_factor: u32,
}

/// 按电路编号播种的 xorshift 序列，保证同一拓扑下的随机选择可复现。
#[derive(Clone, Debug)]
pub struct XorShift(u64);

impl XorShift {
    pub fn seeded(seed: u64) -> Self {
        Self(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1)
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    pub fn below(&mut self, bound: u64) -> u64 {
        if bound == 0 { 0 } else { self.next_u64() % bound }
    }
}

/// 候选目标的选择状态：轮转游标与随机源。
#[derive(Clone, Debug)]
pub struct Selector {
    sub_type: DistributionSubType,
    cursor: usize,
    rng: XorShift,
}

impl Selector {
    pub fn new(sub_type: DistributionSubType, seed: u64) -> Self {
        Self {
            sub_type,
            cursor: 0,
            rng: XorShift::seeded(seed),
        }
    }

    /// 从非空候选中挑一个，返回其下标；不修改状态，确认发送后再调用 [`commit`](Self::commit)。
    pub fn pick(&mut self, candidates: &[Candidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let chosen = match self.sub_type {
            DistributionSubType::FirstAvailable => 0,
            DistributionSubType::RoundRobin => candidates
                .iter()
                .position(|c| c.port >= self.cursor)
                .unwrap_or(0),
            DistributionSubType::LeastBusy => candidates
                .iter()
                .enumerate()
                .min_by_key(|(_, c)| c.busy_factor)
                .map(|(idx, _)| idx)
                .unwrap_or(0),
            DistributionSubType::RandomEven => self.rng.below(candidates.len() as u64) as usize,
            DistributionSubType::RandomStatistical => {
                let max = candidates.iter().map(|c| c.busy_factor).max().unwrap_or(0);
                let weights: Vec<u64> = candidates
                    .iter()
                    .map(|c| u64::from(max - c.busy_factor) + 1)
                    .collect();
                let mut ticket = self.rng.below(weights.iter().sum());
                let mut chosen = candidates.len() - 1;
                for (idx, weight) in weights.iter().enumerate() {
                    if ticket < *weight {
                        chosen = idx;
                        break;
                    }
                    ticket -= weight;
                }
                chosen
            }
        };
        Some(chosen)
    }

    /// 记录已发往 `port`，轮转游标移到其后。
    pub fn commit(&mut self, port: usize, port_count: usize) {
        self.cursor = if port_count == 0 { 0 } else { (port + 1) % port_count };
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn block_parts_cover_the_whole(total in 0u64..10_000, part in 1u32..700, ports in 1usize..6) {
            let partition = DataPartition::Block { part_size: part };
            let plan = partition.plan(total, ports);
            let count = partition.transfer_count(total, ports);
            prop_assert_eq!(plan.len(), count * ports);
            prop_assert_eq!(plan.iter().map(|p| p.len).sum::<u64>(), total);
            for span in &plan {
                prop_assert_eq!(span.sequence as usize, span.transfer * ports + span.port);
                prop_assert!(span.len <= u64::from(part));
            }
            prop_assert_eq!(partition.parts_per_whole(total, ports) as usize, plan.len());
        }
    }

    #[test]
    fn transfer_count_rounds_up() {
        let partition = DataPartition::Block { part_size: 100 };
        assert_eq!(partition.transfer_count(1000, 3), 4);
        assert_eq!(partition.transfer_count(600, 3), 2);
        assert_eq!(partition.transfer_count(0, 3), 1);
        assert_eq!(DataPartition::Indivisible.transfer_count(1000, 3), 1);
    }

    #[test]
    fn round_robin_walks_ports_in_order() {
        let mut selector = Selector::new(DistributionSubType::RoundRobin, 1);
        let all = [
            Candidate { port: 0, tid: 0, busy_factor: 0 },
            Candidate { port: 1, tid: 0, busy_factor: 0 },
            Candidate { port: 2, tid: 0, busy_factor: 0 },
        ];
        let mut order = Vec::new();
        for _ in 0..4 {
            let idx = selector.pick(&all).expect("候选非空");
            order.push(all[idx].port);
            selector.commit(all[idx].port, all.len());
        }
        assert_eq!(order, vec![0, 1, 2, 0]);
    }

    #[test]
    fn least_busy_prefers_lowest_load() {
        let mut selector = Selector::new(DistributionSubType::LeastBusy, 1);
        let all = [
            Candidate { port: 0, tid: 1, busy_factor: 5 },
            Candidate { port: 1, tid: 0, busy_factor: 2 },
        ];
        assert_eq!(selector.pick(&all), Some(1));
    }

    #[test]
    fn random_choice_is_reproducible_per_seed() {
        let all: Vec<Candidate> = (0..4)
            .map(|port| Candidate { port, tid: 0, busy_factor: port as u32 })
            .collect();
        let mut a = Selector::new(DistributionSubType::RandomStatistical, 42);
        let mut b = Selector::new(DistributionSubType::RandomStatistical, 42);
        for _ in 0..16 {
            assert_eq!(a.pick(&all), b.pick(&all));
        }
    }
}
