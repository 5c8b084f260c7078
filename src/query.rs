use serde::{Deserialize, Serialize};

use crate::db::{CellId, CellMetadata, FeatureVector};
use crate::distance::MetricKind;

/// 搜索模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// 结果与全量扫描完全一致
    #[default]
    Exact,
    /// 只访问有限个 k-d 树叶子，结果可能不是真正的最近邻
    Approximate { max_leaves: usize },
}

/// 一次搜索请求
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    /// 查询向量
    pub vector: FeatureVector,
    /// 返回的最大结果数
    pub k: usize,
    /// 只返回距离不超过该值的结果
    pub max_distance: Option<f64>,
    /// 距离度量，None 时使用配置中的默认值
    pub metric: Option<MetricKind>,
    pub mode: SearchMode,
    /// 结果中是否带上细胞的附加信息
    pub include_metadata: bool,
}

impl SearchQuery {
    pub fn new(vector: impl Into<FeatureVector>, k: usize) -> Self {
        Self {
            vector: vector.into(),
            k,
            max_distance: None,
            metric: None,
            mode: SearchMode::Exact,
            include_metadata: false,
        }
    }

    pub fn max_distance(mut self, max_distance: f64) -> Self {
        self.max_distance = Some(max_distance);
        self
    }

    pub fn metric(mut self, metric: MetricKind) -> Self {
        self.metric = Some(metric);
        self
    }

    pub fn approximate(mut self, max_leaves: usize) -> Self {
        self.mode = SearchMode::Approximate { max_leaves };
        self
    }

    pub fn with_metadata(mut self) -> Self {
        self.include_metadata = true;
        self
    }
}

/// 一条匹配结果
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub cell_id: CellId,
    /// 与查询向量的距离，非负
    pub distance: f64,
    /// 从 1 开始的排名
    pub rank: usize,
    pub metadata: Option<CellMetadata>,
}
