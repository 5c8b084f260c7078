use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// 细胞的唯一标识，比较时按字节序，作为相同距离时的排序依据
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(String);

impl CellId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// 由图片标识和检测序号组合出细胞 ID，格式为 `<image>#<index>`
    pub fn from_parts(image: &str, detection: u64) -> Self {
        Self(format!("{image}#{detection}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CellId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for CellId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// 细胞特征向量，同一个细胞群体中维数固定
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector(Vec<f32>);

impl FeatureVector {
    pub fn new(components: Vec<f32>) -> Self {
        Self(components)
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }

    /// 检查向量非空且所有分量都是有限值
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(Error::validation("feature vector is empty"));
        }
        if let Some(i) = self.0.iter().position(|v| !v.is_finite()) {
            return Err(Error::validation(format!(
                "feature vector component {i} is not finite: {}",
                self.0[i]
            )));
        }
        Ok(())
    }
}

impl Deref for FeatureVector {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.0
    }
}

impl From<Vec<f32>> for FeatureVector {
    fn from(v: Vec<f32>) -> Self {
        Self(v)
    }
}

impl From<&[f32]> for FeatureVector {
    fn from(v: &[f32]) -> Self {
        Self(v.to_vec())
    }
}

impl<const N: usize> From<[f32; N]> for FeatureVector {
    fn from(v: [f32; N]) -> Self {
        Self(v.to_vec())
    }
}

/// 与固定字段同处一个 JSON 对象，透传字段不能使用这些键名
pub const RESERVED_METADATA_KEYS: [&str; 6] = ["image", "x", "y", "cellId", "distance", "rank"];

/// 展示匹配结果时需要的附加信息
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CellMetadata {
    /// 细胞所在图片
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// 细胞中心 x 坐标
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    /// 细胞中心 y 坐标
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    /// 其余透传字段，按键名排序
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl CellMetadata {
    pub fn with_image(image: impl Into<String>) -> Self {
        Self { image: Some(image.into()), ..Default::default() }
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.x = Some(x);
        self.y = Some(y);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.image.is_none() && self.x.is_none() && self.y.is_none() && self.extra.is_empty()
    }

    /// 透传字段与固定字段重名时，写入的 JSON 无法再读回
    pub fn validate(&self) -> Result<()> {
        match self.extra.keys().find(|key| RESERVED_METADATA_KEYS.contains(&key.as_str())) {
            Some(key) => Err(Error::validation(format!("metadata key {key:?} is reserved"))),
            None => Ok(()),
        }
    }
}

/// 细胞记录
#[derive(Debug, Clone, PartialEq)]
pub struct CellRecord {
    /// 细胞 ID
    pub id: CellId,
    /// 特征向量
    pub vector: FeatureVector,
    /// 可选的附加信息
    pub metadata: Option<CellMetadata>,
}

impl CellRecord {
    pub fn new(id: impl Into<CellId>, vector: impl Into<FeatureVector>) -> Self {
        Self { id: id.into(), vector: vector.into(), metadata: None }
    }

    pub fn with_metadata(mut self, metadata: CellMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn dim(&self) -> usize {
        self.vector.dim()
    }
}
