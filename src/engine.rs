use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use log::{debug, info, warn};
use tokio::sync::RwLock;
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;

use crate::config::{EngineConfig, SearchConfig, Strategy};
use crate::db::{CellId, CellRecord, FeatureStore, FeatureVector, SqliteStore};
use crate::distance::MetricKind;
use crate::error::{Error, Result};
use crate::index::{IndexState, PopulationIndex, Snapshot};
use crate::knn::{ScanParams, ScannedCell, TopK, scan_records};
use crate::metrics;
use crate::output::{self, OutputOptions};
use crate::query::{MatchResult, SearchQuery};
use crate::session::{SearchSession, ValidatedQuery};

/// 实际采用的搜索方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plan {
    /// 分页扫描存储
    StoreScan,
    /// 在快照上使用 k-d 树
    KdTree,
    /// 在快照上线性扫描
    SnapshotScan,
}

impl Plan {
    fn as_str(&self) -> &'static str {
        match self {
            Self::StoreScan => "scan",
            Self::KdTree => "kdtree",
            Self::SnapshotScan => "snapshot",
        }
    }
}

/// 批量导入的结果
#[derive(Debug, Default)]
pub struct IndexReport {
    /// 成功写入的记录数
    pub indexed: usize,
    /// 校验失败的记录及原因
    pub failed: Vec<(CellId, Error)>,
}

pub struct EngineBuilder<S> {
    store: S,
    config: SearchConfig,
}

impl<S: FeatureStore> EngineBuilder<S> {
    pub fn new(store: S) -> Self {
        Self { store, config: SearchConfig::default() }
    }

    pub fn config(mut self, config: SearchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn default_metric(mut self, metric: MetricKind) -> Self {
        self.config.default_metric = metric;
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.config.page_size = page_size;
        self
    }

    pub fn build(self) -> Result<CellSearchEngine<S>> {
        self.config.validate()?;
        Ok(CellSearchEngine {
            store: self.store,
            config: self.config,
            index: RwLock::new(PopulationIndex::new()),
            next_request: AtomicU64::new(1),
        })
    }
}

/// 细胞最近邻搜索引擎
///
/// 引擎拥有存储句柄和由存储派生的内存索引。所有修改都应该通过引擎进行，
/// 这样索引能及时标记为过期；直接修改存储也能被发现，因为每次使用索引前
/// 都会比较存储的版本号。
pub struct CellSearchEngine<S> {
    store: S,
    config: SearchConfig,
    index: RwLock<PopulationIndex>,
    next_request: AtomicU64,
}

impl CellSearchEngine<SqliteStore> {
    /// 打开 SQLite 存储并创建引擎
    pub async fn open(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let store = SqliteStore::open(&config.store).await?;
        EngineBuilder::new(store).config(config.search.clone()).build()
    }
}

impl<S: FeatureStore> CellSearchEngine<S> {
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// 搜索最相似的 k 个细胞
    ///
    /// # Arguments
    ///
    /// * `vector` - 查询细胞的特征向量
    /// * `k` - 返回的最大结果数
    /// * `max_distance` - 只返回距离不超过该值的细胞
    /// * `metric` - 距离度量，None 时使用配置中的默认值
    pub async fn search(
        &self,
        vector: impl Into<FeatureVector>,
        k: usize,
        max_distance: Option<f64>,
        metric: Option<MetricKind>,
    ) -> Result<Vec<MatchResult>> {
        let mut query = SearchQuery::new(vector, k);
        query.max_distance = max_distance;
        query.metric = metric;
        self.search_query(&query).await
    }

    pub async fn search_query(&self, query: &SearchQuery) -> Result<Vec<MatchResult>> {
        self.search_with_cancel(query, &CancellationToken::new()).await
    }

    /// 可以取消的搜索，取消后返回 `Cancelled`，不会返回不完整的结果
    pub async fn search_with_cancel(
        &self,
        query: &SearchQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<MatchResult>> {
        let mut session = SearchSession::new(self.next_request.fetch_add(1, Ordering::Relaxed));
        let validated = match session.validate(query, &self.config) {
            Ok(validated) => validated,
            Err(e) => {
                metrics::inc_search_failure(e.kind_name());
                return Err(e);
            }
        };

        session.begin();
        match self.execute(&validated, cancel).await {
            Ok((plan, results)) => {
                session.complete(results.len());
                metrics::observe_search(plan.as_str(), validated.metric.as_str(), session.elapsed());
                Ok(results)
            }
            Err(e) => {
                metrics::inc_search_failure(e.kind_name());
                Err(session.fail(e))
            }
        }
    }

    /// 搜索并序列化为 JSON，是否包含附加信息由查询决定
    pub async fn search_json(&self, query: &SearchQuery, pretty: bool) -> Result<String> {
        let results = self.search_query(query).await?;
        output::serialize(&results, OutputOptions { include_metadata: query.include_metadata, pretty })
    }

    async fn execute(
        &self,
        query: &ValidatedQuery,
        cancel: &CancellationToken,
    ) -> Result<(Plan, Vec<MatchResult>)> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let Some(dimension) = self.store.dimension().await? else {
            return Ok((Plan::StoreScan, vec![]));
        };
        let count = self.store.count().await?;
        if count == 0 {
            return Ok((Plan::StoreScan, vec![]));
        }
        if dimension != query.vector.dim() {
            return Err(Error::DimensionMismatch { expected: dimension, actual: query.vector.dim() });
        }

        let plan = self.plan(query, count, dimension);
        debug!("搜索计划: {} (群体 {count}, {dimension} 维, k = {})", plan.as_str(), query.k);
        let results = match plan {
            Plan::StoreScan => self.scan_store(query, cancel).await?,
            Plan::KdTree | Plan::SnapshotScan => self.search_snapshot(query, cancel).await?,
        };
        Ok((plan, results))
    }

    fn plan(&self, query: &ValidatedQuery, count: u64, dimension: usize) -> Plan {
        let use_index = match self.config.strategy {
            Strategy::Scan => false,
            Strategy::Index => true,
            Strategy::Auto => {
                query.max_leaves().is_some()
                    || (count >= self.config.index_threshold && dimension <= self.config.max_index_dimension)
            }
        };
        match (use_index, query.metric.supports_kdtree()) {
            (false, _) => Plan::StoreScan,
            (true, true) => Plan::KdTree,
            (true, false) => Plan::SnapshotScan,
        }
    }

    /// 分页读取存储，每页作为一个分片在线程池上计算
    async fn scan_store(&self, query: &ValidatedQuery, cancel: &CancellationToken) -> Result<Vec<MatchResult>> {
        let params = scan_params(query);
        let include_metadata = query.include_metadata;
        let vector: Arc<[f32]> = Arc::from(&query.vector[..]);

        let mut top = TopK::new(query.k);
        let mut scan = self.store.scan_all(self.config.page_size);
        let mut shards = 0;
        loop {
            if cancel.is_cancelled() {
                debug!("搜索在 {shards} 个分片后取消");
                return Err(Error::Cancelled);
            }
            let Some(page) = scan.next_page().await? else {
                break;
            };
            let vector = vector.clone();
            let shard =
                spawn_blocking(move || scan_records(&vector, &page, &params, include_metadata)).await??;
            top = top.merge(shard);
            shards += 1;
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        debug!("扫描了 {shards} 个分片");
        Ok(resolve_scanned(top))
    }

    async fn search_snapshot(
        &self,
        query: &ValidatedQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<MatchResult>> {
        let snapshot = self.fresh_snapshot(cancel).await?;
        if snapshot.is_empty() {
            return Ok(vec![]);
        }
        if snapshot.dimension() != query.vector.dim() {
            return Err(Error::DimensionMismatch {
                expected: snapshot.dimension(),
                actual: query.vector.dim(),
            });
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let params = scan_params(query);
        let vector = query.vector.clone();
        let max_leaves = query.max_leaves();
        let include_metadata = query.include_metadata;
        let shard_size = self.config.shard_size;
        let token = cancel.clone();
        let results = spawn_blocking(move || -> Result<Vec<MatchResult>> {
            let top = if params.metric.supports_kdtree() {
                snapshot.kd_search(&vector, &params, max_leaves)
            } else {
                snapshot.linear_scan(&vector, &params, shard_size, &token)?
            };
            Ok(snapshot.resolve(top, include_metadata))
        })
        .await??;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(results)
    }

    /// 返回与存储版本一致的快照，必要时重建
    async fn fresh_snapshot(&self, cancel: &CancellationToken) -> Result<Arc<Snapshot>> {
        let revision = self.store.revision().await?;
        if let Some(snapshot) = self.index.read().await.current(revision) {
            return Ok(snapshot);
        }

        let mut index = self.index.write().await;
        // 等待写锁期间可能已经被其它请求重建
        let revision = self.store.revision().await?;
        if let Some(snapshot) = index.current(revision) {
            return Ok(snapshot);
        }
        let snapshot = self.build_snapshot(revision, cancel).await?;
        index.install(snapshot.clone());
        Ok(snapshot)
    }

    /// 分页读取整个群体并建立快照，取消时不安装任何结果
    async fn build_snapshot(&self, revision: u64, cancel: &CancellationToken) -> Result<Arc<Snapshot>> {
        let start = Instant::now();
        let mut records = vec![];
        let mut scan = self.store.scan_all(self.config.page_size);
        loop {
            if cancel.is_cancelled() {
                debug!("重建索引在读取 {} 个细胞后取消", records.len());
                return Err(Error::Cancelled);
            }
            let Some(page) = scan.next_page().await? else {
                break;
            };
            records.extend(page);
        }
        let leaf_size = self.config.leaf_size;
        let snapshot = spawn_blocking(move || Snapshot::build(records, revision, leaf_size)).await??;
        metrics::observe_index_rebuild(start.elapsed());
        info!(
            "重建索引: {} 个细胞, 版本 {revision}, 耗时 {:.2}s",
            snapshot.len(),
            start.elapsed().as_secs_f32()
        );
        Ok(Arc::new(snapshot))
    }

    /// 立即重建索引，返回索引中的细胞数量
    pub async fn rebuild_index(&self) -> Result<usize> {
        let mut index = self.index.write().await;
        let revision = self.store.revision().await?;
        let snapshot = self.build_snapshot(revision, &CancellationToken::new()).await?;
        let len = snapshot.len();
        index.install(snapshot);
        Ok(len)
    }

    /// 索引状态，存储在引擎之外被修改时同样返回 `Stale`
    pub async fn index_state(&self) -> Result<IndexState> {
        let revision = self.store.revision().await?;
        let index = self.index.read().await;
        Ok(match index.current(revision) {
            Some(_) => IndexState::Fresh,
            None => IndexState::Stale,
        })
    }

    /// 写入一条记录
    pub async fn index_cell(&self, record: CellRecord) -> Result<()> {
        self.store.put(&record).await?;
        self.index.write().await.mark_stale();
        Ok(())
    }

    /// 批量写入记录，不合法的记录会被跳过并在报告中列出
    pub async fn index_cells(&self, records: Vec<CellRecord>) -> Result<IndexReport> {
        let results = self.store.put_many(&records).await?;
        let mut report = IndexReport::default();
        for (record, result) in records.into_iter().zip(results) {
            match result {
                Ok(()) => report.indexed += 1,
                Err(e) => {
                    warn!("跳过细胞 {}: {e}", record.id);
                    report.failed.push((record.id, e));
                }
            }
        }
        if report.indexed > 0 {
            self.index.write().await.mark_stale();
        }
        info!("导入 {} 个细胞, 失败 {} 个", report.indexed, report.failed.len());
        Ok(report)
    }

    pub async fn get_cell(&self, id: &CellId) -> Result<CellRecord> {
        self.store.get(id).await
    }

    /// 删除一个细胞，不存在时返回 `NotFound`
    pub async fn delete_cell(&self, id: &CellId) -> Result<()> {
        self.store.delete(id).await?;
        self.index.write().await.mark_stale();
        Ok(())
    }

    /// 清空群体，之后的第一条记录重新确定维数
    pub async fn clear_population(&self) -> Result<()> {
        let mut index = self.index.write().await;
        self.store.clear().await?;
        index.reset();
        Ok(())
    }

    pub async fn population_size(&self) -> Result<u64> {
        self.store.count().await
    }

    /// 释放存储连接
    pub async fn close(&self) {
        self.index.write().await.reset();
        self.store.close().await;
    }
}

fn scan_params(query: &ValidatedQuery) -> ScanParams {
    ScanParams { k: query.k, metric: query.metric, max_distance: query.max_distance }
}

fn resolve_scanned(top: TopK<ScannedCell>) -> Vec<MatchResult> {
    top.into_sorted_vec()
        .into_iter()
        .enumerate()
        .map(|(i, n)| MatchResult {
            cell_id: n.key.id,
            distance: n.distance,
            rank: i + 1,
            metadata: n.key.metadata,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    fn engine(strategy: Strategy) -> CellSearchEngine<MemoryStore> {
        let store = MemoryStore::with_records([
            CellRecord::new("A", [0.0, 0.0]),
            CellRecord::new("B", [3.0, 4.0]),
            CellRecord::new("C", [1.0, 1.0]),
        ])
        .unwrap();
        EngineBuilder::new(store).strategy(strategy).build().unwrap()
    }

    #[test]
    fn test_plan_selection() {
        let engine = engine(Strategy::Auto);
        let config = SearchConfig::default();
        let mut session = SearchSession::new(1);
        let exact = session.validate(&SearchQuery::new([0.0, 0.0], 1), &config).unwrap();
        assert_eq!(engine.plan(&exact, 10, 2), Plan::StoreScan);
        assert_eq!(engine.plan(&exact, 20_000, 2), Plan::KdTree);
        assert_eq!(engine.plan(&exact, 20_000, 64), Plan::StoreScan);

        let mut session = SearchSession::new(2);
        let cosine =
            session.validate(&SearchQuery::new([0.0, 0.0], 1).metric(MetricKind::Cosine), &config).unwrap();
        assert_eq!(engine.plan(&cosine, 50_000, 2), Plan::SnapshotScan);

        let mut session = SearchSession::new(3);
        let approximate = session.validate(&SearchQuery::new([0.0, 0.0], 1).approximate(2), &config).unwrap();
        assert_eq!(engine.plan(&approximate, 10, 2), Plan::KdTree);
    }

    #[tokio::test]
    async fn test_same_results_for_every_strategy() {
        for strategy in [Strategy::Auto, Strategy::Scan, Strategy::Index] {
            let results = engine(strategy).search([0.0, 0.0], 2, None, None).await.unwrap();
            let ids = results.iter().map(|r| r.cell_id.as_str()).collect::<Vec<_>>();
            assert_eq!(ids, ["A", "C"], "{strategy:?}");
            assert_eq!(results[0].rank, 1);
            assert_eq!(results[1].rank, 2);
        }
    }

    #[tokio::test]
    async fn test_mutations_mark_index_stale() {
        let engine = engine(Strategy::Index);
        assert_eq!(engine.index_state().await.unwrap(), IndexState::Stale);
        engine.search([0.0, 0.0], 1, None, None).await.unwrap();
        assert_eq!(engine.index_state().await.unwrap(), IndexState::Fresh);

        engine.index_cell(CellRecord::new("D", [0.1, 0.1])).await.unwrap();
        assert_eq!(engine.index_state().await.unwrap(), IndexState::Stale);
        assert_eq!(engine.rebuild_index().await.unwrap(), 4);
        assert_eq!(engine.index_state().await.unwrap(), IndexState::Fresh);
    }
}
