use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// 距离度量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// 欧氏距离
    #[default]
    Euclidean,
    /// 曼哈顿距离
    Manhattan,
    /// 切比雪夫距离
    Chebyshev,
    /// 余弦距离，`1 - cos(a, b)`，结果在 [0, 2] 之间
    Cosine,
}

impl MetricKind {
    pub const ALL: [MetricKind; 4] = [Self::Euclidean, Self::Manhattan, Self::Chebyshev, Self::Cosine];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Euclidean => "euclidean",
            Self::Manhattan => "manhattan",
            Self::Chebyshev => "chebyshev",
            Self::Cosine => "cosine",
        }
    }

    /// 距离不小于任意单个坐标差的绝对值，可以用 k-d 树剪枝
    pub fn supports_kdtree(&self) -> bool {
        !matches!(self, Self::Cosine)
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::validation(format!("unknown distance metric: {s:?}")))
    }
}

/// 计算两个向量的距离，长度不同时返回错误
pub fn distance(a: &[f32], b: &[f32], metric: MetricKind) -> Result<f64> {
    if a.len() != b.len() {
        return Err(Error::DimensionMismatch { expected: a.len(), actual: b.len() });
    }
    Ok(distance_unchecked(a, b, metric))
}

/// 调用方需要保证 a 和 b 长度相同
#[inline(always)]
pub fn distance_unchecked(a: &[f32], b: &[f32], metric: MetricKind) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    match metric {
        MetricKind::Euclidean => euclidean(a, b),
        MetricKind::Manhattan => manhattan(a, b),
        MetricKind::Chebyshev => chebyshev(a, b),
        MetricKind::Cosine => cosine(a, b),
    }
}

#[inline(always)]
pub fn euclidean(a: &[f32], b: &[f32]) -> f64 {
    let mut sum = 0f64;
    for (x, y) in a.iter().zip(b) {
        let d = *x as f64 - *y as f64;
        sum += d * d;
    }
    sum.sqrt()
}

#[inline(always)]
pub fn manhattan(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (*x as f64 - *y as f64).abs()).sum()
}

#[inline(always)]
pub fn chebyshev(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (*x as f64 - *y as f64).abs()).fold(0.0, f64::max)
}

#[inline(always)]
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let (mut dot, mut na, mut nb) = (0f64, 0f64, 0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    // 零向量没有方向，两个都为零视为相同，只有一个为零视为正交
    match (na == 0.0, nb == 0.0) {
        (true, true) => 0.0,
        (true, false) | (false, true) => 1.0,
        _ => (1.0 - dot / (na * nb).sqrt()).clamp(0.0, 2.0),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(MetricKind::Euclidean)]
    #[case(MetricKind::Manhattan)]
    #[case(MetricKind::Chebyshev)]
    #[case(MetricKind::Cosine)]
    fn test_self_distance_is_zero(#[case] metric: MetricKind) {
        let v = [0.3f32, -1.25, 7.0, 1e-3];
        assert_eq!(distance(&v, &v, metric).unwrap(), 0.0);
    }

    #[rstest]
    #[case(MetricKind::Euclidean)]
    #[case(MetricKind::Manhattan)]
    #[case(MetricKind::Chebyshev)]
    #[case(MetricKind::Cosine)]
    fn test_distance_is_commutative(#[case] metric: MetricKind) {
        let a = [1.0f32, 2.5, -3.0];
        let b = [0.5f32, -2.0, 4.0];
        assert_eq!(distance(&a, &b, metric).unwrap(), distance(&b, &a, metric).unwrap());
    }

    #[test]
    fn test_known_values() {
        let a = [0.0f32, 0.0];
        assert_eq!(distance(&a, &[3.0, 4.0], MetricKind::Euclidean).unwrap(), 5.0);
        assert_eq!(distance(&a, &[3.0, 4.0], MetricKind::Manhattan).unwrap(), 7.0);
        assert_eq!(distance(&a, &[3.0, 4.0], MetricKind::Chebyshev).unwrap(), 4.0);
        let d = distance(&a, &[1.0, 1.0], MetricKind::Euclidean).unwrap();
        assert!((d - std::f64::consts::SQRT_2).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_edge_cases() {
        let zero = [0.0f32, 0.0];
        assert_eq!(cosine(&zero, &zero), 0.0);
        assert_eq!(cosine(&zero, &[1.0, 0.0]), 1.0);
        assert_eq!(cosine(&[1.0, 0.0], &[0.0, 1.0]), 1.0);
        assert_eq!(cosine(&[1.0, 0.0], &[-1.0, 0.0]), 2.0);
        assert_eq!(cosine(&[2.0, 2.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_dimension_mismatch() {
        let err = distance(&[1.0, 2.0], &[1.0, 2.0, 3.0], MetricKind::Euclidean).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 2, actual: 3 }));
    }

    #[test]
    fn test_parse_metric() {
        assert_eq!("cosine".parse::<MetricKind>().unwrap(), MetricKind::Cosine);
        assert_eq!("Euclidean".parse::<MetricKind>().unwrap(), MetricKind::Euclidean);
        assert!(matches!("hamming".parse::<MetricKind>(), Err(Error::Validation(_))));
    }
}
