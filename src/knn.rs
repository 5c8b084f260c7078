use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rayon::prelude::*;

use crate::db::{CellId, CellMetadata, CellRecord};
use crate::distance::{MetricKind, distance_unchecked};
use crate::error::{Error, Result};

/// 每个 rayon 任务处理的记录数
const CHUNK_SIZE: usize = 256;

#[derive(Debug, Clone)]
pub struct Neighbor<K> {
    pub key: K,
    pub distance: f64,
}

impl<K: Ord> PartialEq for Neighbor<K> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<K: Ord> Eq for Neighbor<K> {}

impl<K: Ord> PartialOrd for Neighbor<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// 先比较距离，距离相同时比较 key
impl<K: Ord> Ord for Neighbor<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance.total_cmp(&other.distance).then_with(|| self.key.cmp(&other.key))
    }
}

/// 保留 (距离, key) 最小的 k 个元素
///
/// 内部是一个大顶堆，堆顶是当前第 k 小的元素。结果只取决于输入的集合，
/// 与插入和合并的顺序无关，因此可以在任意分片上并行计算后再合并。
#[derive(Debug, Clone)]
pub struct TopK<K> {
    k: usize,
    heap: BinaryHeap<Neighbor<K>>,
}

impl<K: Ord> TopK<K> {
    pub fn new(k: usize) -> Self {
        Self { k, heap: BinaryHeap::with_capacity(k.min(4096) + 1) }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.k
    }

    /// 当前能接受的最大距离，未满时为无穷大
    pub fn bound(&self) -> f64 {
        match self.heap.peek() {
            Some(worst) if self.is_full() => worst.distance,
            _ => f64::INFINITY,
        }
    }

    /// 尝试插入，返回是否被保留
    pub fn push(&mut self, key: K, distance: f64) -> bool {
        if self.k == 0 {
            return false;
        }
        let candidate = Neighbor { key, distance };
        if !self.is_full() {
            self.heap.push(candidate);
            return true;
        }
        match self.heap.peek() {
            Some(worst) if candidate < *worst => {
                self.heap.pop();
                self.heap.push(candidate);
                true
            }
            _ => false,
        }
    }

    pub fn merge(self, other: Self) -> Self {
        let (mut big, small) =
            if self.heap.len() >= other.heap.len() { (self, other) } else { (other, self) };
        for n in small.heap {
            big.push(n.key, n.distance);
        }
        big
    }

    /// 按距离升序返回
    pub fn into_sorted_vec(self) -> Vec<Neighbor<K>> {
        self.heap.into_sorted_vec()
    }
}

/// 一次扫描的参数
#[derive(Debug, Clone, Copy)]
pub struct ScanParams {
    pub k: usize,
    pub metric: MetricKind,
    pub max_distance: Option<f64>,
}

impl ScanParams {
    #[inline(always)]
    pub fn admits(&self, distance: f64) -> bool {
        self.max_distance.is_none_or(|max| distance <= max)
    }
}

/// 扫描存储时保留的候选，只按 ID 排序
#[derive(Debug, Clone)]
pub struct ScannedCell {
    pub id: CellId,
    pub metadata: Option<CellMetadata>,
}

impl PartialEq for ScannedCell {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ScannedCell {}

impl PartialOrd for ScannedCell {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScannedCell {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

/// 在一批记录上并行计算距离，返回这一批的 top-k
///
/// # Arguments
///
/// * `query` - 查询向量
/// * `records` - 一个分片的记录
/// * `params` - 扫描参数
/// * `include_metadata` - 是否保留记录的附加信息
pub fn scan_records(
    query: &[f32],
    records: &[CellRecord],
    params: &ScanParams,
    include_metadata: bool,
) -> Result<TopK<ScannedCell>> {
    records
        .par_chunks(CHUNK_SIZE)
        .map(|chunk| {
            let mut top = TopK::new(params.k);
            for record in chunk {
                if record.dim() != query.len() {
                    return Err(Error::DimensionMismatch { expected: record.dim(), actual: query.len() });
                }
                let d = distance_unchecked(query, &record.vector, params.metric);
                if !params.admits(d) || d > top.bound() {
                    continue;
                }
                let metadata = if include_metadata { record.metadata.clone() } else { None };
                top.push(ScannedCell { id: record.id.clone(), metadata }, d);
            }
            Ok(top)
        })
        .try_reduce(|| TopK::new(params.k), |a, b| Ok(a.merge(b)))
}
