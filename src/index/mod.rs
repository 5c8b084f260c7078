mod kdtree;

use std::ops::Range;
use std::sync::Arc;

use crossbeam_channel::{bounded, unbounded};
use log::debug;
use ndarray::Array2;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

pub use kdtree::KdTree;
use kdtree::point_distance;

use crate::db::{CellId, CellMetadata, CellRecord};
use crate::error::{Error, Result};
use crate::knn::{ScanParams, TopK};
use crate::query::MatchResult;

/// 索引状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexState {
    /// 与存储一致
    Fresh,
    /// 存储已修改，使用前需要重建
    Stale,
}

/// 细胞群体在某个存储版本上的只读快照
///
/// 行按 CellId 升序排列，所以行号的顺序就是 ID 的顺序，
/// 距离相同时按行号比较与按 ID 比较结果一致。
#[derive(Debug)]
pub struct Snapshot {
    revision: u64,
    ids: Vec<CellId>,
    metadata: Vec<Option<CellMetadata>>,
    data: Array2<f32>,
    tree: KdTree,
}

impl Snapshot {
    /// 从全部记录构建快照
    ///
    /// # Arguments
    ///
    /// * `records` - 群体中的全部记录
    /// * `revision` - 读取记录之前的存储版本
    /// * `leaf_size` - k-d 树叶子大小
    pub fn build(mut records: Vec<CellRecord>, revision: u64, leaf_size: usize) -> Result<Self> {
        records.sort_unstable_by(|a, b| a.id.cmp(&b.id));
        let dimension = records.first().map_or(0, CellRecord::dim);

        let mut flat = Vec::with_capacity(records.len() * dimension);
        let mut ids = Vec::with_capacity(records.len());
        let mut metadata = Vec::with_capacity(records.len());
        for record in records {
            if record.dim() != dimension {
                return Err(Error::permanent(format!(
                    "cell {} has {} features, population dimension is {dimension}",
                    record.id,
                    record.dim()
                )));
            }
            flat.extend_from_slice(&record.vector);
            ids.push(record.id);
            metadata.push(record.metadata);
        }

        let data = Array2::from_shape_vec((ids.len(), dimension), flat).map_err(Error::permanent)?;
        let tree = KdTree::build(&data, leaf_size);
        debug!("构建快照: {} 个细胞, {dimension} 维, 版本 {revision}", ids.len());
        Ok(Self { revision, ids, metadata, data, tree })
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.data.ncols()
    }

    /// 使用 k-d 树搜索，度量必须支持 k-d 树
    pub fn kd_search(&self, query: &[f32], params: &ScanParams, max_leaves: Option<usize>) -> TopK<usize> {
        debug_assert!(params.metric.supports_kdtree());
        self.tree.search(&self.data, query, params, max_leaves)
    }

    /// 按分片线性扫描快照，分片分发给多个工作线程
    ///
    /// 每个分片开始前都会检查是否已取消，取消后返回 `Cancelled`，已计算的部分全部丢弃
    pub fn linear_scan(
        &self,
        query: &[f32],
        params: &ScanParams,
        shard_size: usize,
        cancel: &CancellationToken,
    ) -> Result<TopK<usize>> {
        let shard_size = shard_size.max(1);
        let shards = self.len().div_ceil(shard_size);
        let workers = num_cpus::get().clamp(1, shards.max(1));

        let top = std::thread::scope(|s| {
            let (tx, rx) = bounded::<Range<usize>>(workers * 2);
            let (result_tx, result_rx) = unbounded();

            for _ in 0..workers {
                let rx = rx.clone();
                let result_tx = result_tx.clone();
                s.spawn(move || {
                    while let Ok(rows) = rx.recv() {
                        if cancel.is_cancelled() {
                            continue;
                        }
                        if result_tx.send(self.score_rows(query, params, rows)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(rx);
            drop(result_tx);

            for start in (0..self.len()).step_by(shard_size) {
                let rows = start..(start + shard_size).min(self.len());
                if cancel.is_cancelled() || tx.send(rows).is_err() {
                    break;
                }
            }
            drop(tx);

            result_rx.into_iter().fold(TopK::new(params.k), TopK::merge)
        });

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(top)
    }

    fn score_rows(&self, query: &[f32], params: &ScanParams, rows: Range<usize>) -> TopK<usize> {
        let mut top = TopK::new(params.k);
        for row in rows {
            let d = point_distance(query, self.data.row(row), params);
            if params.admits(d) {
                top.push(row, d);
            }
        }
        top
    }

    /// 将行号转换为带排名的结果
    pub fn resolve(&self, top: TopK<usize>, include_metadata: bool) -> Vec<MatchResult> {
        top.into_sorted_vec()
            .into_iter()
            .enumerate()
            .map(|(i, n)| MatchResult {
                cell_id: self.ids[n.key].clone(),
                distance: n.distance,
                rank: i + 1,
                metadata: if include_metadata { self.metadata[n.key].clone() } else { None },
            })
            .collect()
    }
}

/// 由存储派生的内存索引，可以随时丢弃重建
///
/// 由引擎放在读写锁后面：搜索持有读锁取得快照的 Arc，重建持有写锁，
/// 所以搜索看不到构建到一半的快照。
#[derive(Debug)]
pub struct PopulationIndex {
    snapshot: Option<Arc<Snapshot>>,
    state: IndexState,
}

impl Default for PopulationIndex {
    fn default() -> Self {
        Self { snapshot: None, state: IndexState::Stale }
    }
}

impl PopulationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> IndexState {
        self.state
    }

    /// 快照是最新的并且与存储版本一致时返回快照
    pub fn current(&self, revision: u64) -> Option<Arc<Snapshot>> {
        match (&self.snapshot, self.state) {
            (Some(snapshot), IndexState::Fresh) if snapshot.revision == revision => Some(snapshot.clone()),
            _ => None,
        }
    }

    pub fn install(&mut self, snapshot: Arc<Snapshot>) {
        self.snapshot = Some(snapshot);
        self.state = IndexState::Fresh;
    }

    pub fn mark_stale(&mut self) {
        self.state = IndexState::Stale;
    }

    /// 丢弃快照
    pub fn reset(&mut self) {
        self.snapshot = None;
        self.state = IndexState::Stale;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::MetricKind;
    use crate::knn::scan_records;

    fn population() -> Vec<CellRecord> {
        (0..500)
            .map(|i| {
                let x = ((i * 7919) % 101) as f32 / 10.0;
                let y = ((i * 104729) % 97) as f32 / 10.0;
                CellRecord::new(format!("cell-{:04}", (i * 37) % 500), [x, y, (i % 5) as f32])
            })
            .collect()
    }

    #[test]
    fn test_rows_are_sorted_by_id() {
        let records = vec![
            CellRecord::new("b", [1.0]),
            CellRecord::new("a", [2.0]),
            CellRecord::new("c", [0.0]),
        ];
        let snapshot = Snapshot::build(records, 3, 4).unwrap();
        assert_eq!(snapshot.ids.iter().map(CellId::as_str).collect::<Vec<_>>(), ["a", "b", "c"]);
        assert_eq!(snapshot.data[[0, 0]], 2.0);
        assert_eq!(snapshot.revision(), 3);
        assert_eq!(snapshot.dimension(), 1);
    }

    #[test]
    fn test_inconsistent_dimensions_are_rejected() {
        let records = vec![CellRecord::new("a", [1.0]), CellRecord::new("b", [1.0, 2.0])];
        assert!(matches!(Snapshot::build(records, 0, 4), Err(Error::Store { .. })));
    }

    #[test]
    fn test_linear_scan_matches_record_scan() {
        let records = population();
        let snapshot = Snapshot::build(records.clone(), 1, 8).unwrap();
        let query = [3.3f32, 4.4, 2.0];
        for metric in MetricKind::ALL {
            let params = ScanParams { k: 20, metric, max_distance: None };
            let got = snapshot.linear_scan(&query, &params, 33, &CancellationToken::new()).unwrap();
            let got = snapshot.resolve(got, false);
            let expected = scan_records(&query, &records, &params, false).unwrap().into_sorted_vec();
            assert_eq!(got.len(), expected.len());
            for (a, b) in got.iter().zip(&expected) {
                assert_eq!(a.cell_id, b.key.id);
                assert_eq!(a.distance, b.distance);
            }
        }
    }

    #[test]
    fn test_linear_scan_column_major_rows() {
        use ndarray::ShapeBuilder;

        let mut snapshot = Snapshot::build(population(), 1, 8).unwrap();
        let params = ScanParams { k: 500, metric: MetricKind::Cosine, max_distance: None };
        let query = [1.0f32, 2.0, 3.0];
        let expected = snapshot.linear_scan(&query, &params, 64, &CancellationToken::new()).unwrap();

        let mut data = Array2::<f32>::zeros(snapshot.data.raw_dim().f());
        data.assign(&snapshot.data);
        assert!(data.row(0).as_slice().is_none());
        snapshot.data = data;
        let got = snapshot.linear_scan(&query, &params, 64, &CancellationToken::new()).unwrap();
        assert_eq!(got.len(), 500);
        assert_eq!(snapshot.resolve(got, false), snapshot.resolve(expected, false));
    }

    #[test]
    fn test_kd_search_matches_linear_scan() {
        let snapshot = Snapshot::build(population(), 1, 4).unwrap();
        let query = [5.0f32, 5.0, 1.0];
        let params = ScanParams { k: 15, metric: MetricKind::Euclidean, max_distance: Some(3.0) };
        let kd = snapshot.resolve(snapshot.kd_search(&query, &params, None), false);
        let linear =
            snapshot.resolve(snapshot.linear_scan(&query, &params, 64, &CancellationToken::new()).unwrap(), false);
        assert_eq!(kd, linear);
        assert!(kd.iter().all(|m| m.distance <= 3.0));
    }

    #[test]
    fn test_cancelled_scan_returns_error() {
        let snapshot = Snapshot::build(population(), 1, 8).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let params = ScanParams { k: 5, metric: MetricKind::Cosine, max_distance: None };
        let err = snapshot.linear_scan(&[1.0, 1.0, 1.0], &params, 16, &token).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_index_state() {
        let mut index = PopulationIndex::new();
        assert_eq!(index.state(), IndexState::Stale);
        assert!(index.current(0).is_none());

        index.install(Arc::new(Snapshot::build(vec![], 4, 8).unwrap()));
        assert_eq!(index.state(), IndexState::Fresh);
        assert!(index.current(4).is_some());
        assert!(index.current(5).is_none());

        index.mark_stale();
        assert!(index.current(4).is_none());
        index.reset();
        assert_eq!(index.state(), IndexState::Stale);
    }
}
