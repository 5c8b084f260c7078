//! 引擎配置
//!
//! 可以直接构造，也可以从 TOML 文件加载，缺省字段使用默认值：
//!
//! ```toml
//! [store]
//! path = "/data/cellsearch/cells.db"
//! table = "cell_features"
//!
//! [store.retry]
//! max_retries = 5
//!
//! [search]
//! max_k = 500
//! strategy = "auto"
//! ```

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::db::{RetryPolicy, check_table_name};
use crate::distance::MetricKind;
use crate::error::{Error, Result};

static DATA_DIR: LazyLock<PathBuf> = LazyLock::new(|| {
    ProjectDirs::from("io.github", "qupath", "cellsearch")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
});

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

impl EngineConfig {
    /// 从 TOML 文件加载配置
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.search.validate()
    }
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// 数据库文件路径
    #[serde(default = "default_database")]
    pub path: PathBuf,
    /// 保存特征向量的表名
    #[serde(default = "default_table")]
    pub table: String,
    /// 连接池大小
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// 数据库被锁定时的等待时间（毫秒）
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// 临时性错误的重试策略
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_database(),
            table: default_table(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

impl StoreConfig {
    /// 使用指定数据库文件，其余保持默认
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), ..Default::default() }
    }

    pub fn validate(&self) -> Result<()> {
        check_table_name(&self.table)?;
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be positive".into()));
        }
        Ok(())
    }
}

fn default_database() -> PathBuf {
    DATA_DIR.join("cells.db")
}

fn default_table() -> String {
    "cell_features".to_string()
}

fn default_max_connections() -> u32 {
    4
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

/// 搜索策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// 群体足够大且维数足够低时使用索引，否则全量扫描
    #[default]
    Auto,
    /// 总是全量扫描存储
    Scan,
    /// 总是使用内存索引
    Index,
}

/// 搜索配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// k 的上限，超过时拒绝请求
    #[serde(default = "default_max_k")]
    pub max_k: usize,
    /// 未指定距离时使用的度量
    #[serde(default)]
    pub default_metric: MetricKind,
    /// 搜索策略
    #[serde(default)]
    pub strategy: Strategy,
    /// 全量扫描时每页读取的记录数，每页作为一个分片计算
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// 内存索引线性扫描时每个分片的行数
    #[serde(default = "default_shard_size")]
    pub shard_size: usize,
    /// `auto` 策略下启用索引的最小群体规模
    #[serde(default = "default_index_threshold")]
    pub index_threshold: u64,
    /// `auto` 策略下启用索引的最大维数，k-d 树在高维下退化
    #[serde(default = "default_max_index_dimension")]
    pub max_index_dimension: usize,
    /// k-d 树叶子节点大小
    #[serde(default = "default_leaf_size")]
    pub leaf_size: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_k: default_max_k(),
            default_metric: MetricKind::default(),
            strategy: Strategy::default(),
            page_size: default_page_size(),
            shard_size: default_shard_size(),
            index_threshold: default_index_threshold(),
            max_index_dimension: default_max_index_dimension(),
            leaf_size: default_leaf_size(),
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("max_k", self.max_k),
            ("page_size", self.page_size),
            ("shard_size", self.shard_size),
            ("leaf_size", self.leaf_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

fn default_max_k() -> usize {
    1000
}

fn default_page_size() -> usize {
    4096
}

fn default_shard_size() -> usize {
    8192
}

fn default_index_threshold() -> u64 {
    20_000
}

fn default_max_index_dimension() -> usize {
    16
}

fn default_leaf_size() -> usize {
    32
}
