use std::ops::Range;

use ndarray::{Array2, ArrayView1, Axis};

use crate::distance::distance_unchecked;
use crate::knn::{ScanParams, TopK};

#[derive(Debug, Clone)]
enum Node {
    Leaf { rows: Range<usize> },
    Split { axis: usize, value: f32, left: usize, right: usize },
}

/// 静态 k-d 树，节点存放在数组中，叶子保存 `order` 中的一段行号
///
/// 每次按跨度最大的维度在中位数处切分。左子树的坐标都不大于切分值，
/// 右子树的坐标都不小于切分值。
#[derive(Debug, Clone)]
pub struct KdTree {
    nodes: Vec<Node>,
    order: Vec<usize>,
}

impl KdTree {
    /// 在矩阵的所有行上建树
    pub fn build(data: &Array2<f32>, leaf_size: usize) -> Self {
        let mut tree = Self { nodes: vec![], order: (0..data.nrows()).collect() };
        if data.nrows() > 0 {
            tree.build_node(data, 0..data.nrows(), leaf_size.max(1));
        }
        tree
    }

    fn build_node(&mut self, data: &Array2<f32>, rows: Range<usize>, leaf_size: usize) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { rows: rows.clone() });
        if rows.len() <= leaf_size {
            return id;
        }

        let Some((axis, spread)) = self.widest_axis(data, &rows) else {
            return id;
        };
        // 所有点重合时无法再切分
        if spread <= 0.0 {
            return id;
        }

        let mid = rows.len() / 2;
        let slice = &mut self.order[rows.clone()];
        slice.select_nth_unstable_by(mid, |&a, &b| data[[a, axis]].total_cmp(&data[[b, axis]]));
        let value = data[[slice[mid], axis]];
        let split = rows.start + mid;

        let left = self.build_node(data, rows.start..split, leaf_size);
        let right = self.build_node(data, split..rows.end, leaf_size);
        self.nodes[id] = Node::Split { axis, value, left, right };
        id
    }

    fn widest_axis(&self, data: &Array2<f32>, rows: &Range<usize>) -> Option<(usize, f32)> {
        (0..data.ncols())
            .map(|axis| {
                let column = data.index_axis(Axis(1), axis);
                let (lo, hi) = self.order[rows.clone()]
                    .iter()
                    .map(|&row| column[row])
                    .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
                (axis, hi - lo)
            })
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// 搜索最近邻，返回行号
    ///
    /// # Arguments
    ///
    /// * `data` - 建树时使用的矩阵
    /// * `query` - 查询向量
    /// * `params` - 扫描参数，度量必须支持 k-d 树剪枝
    /// * `max_leaves` - 最多访问的叶子数，None 时为精确搜索
    pub fn search(
        &self,
        data: &Array2<f32>,
        query: &[f32],
        params: &ScanParams,
        max_leaves: Option<usize>,
    ) -> TopK<usize> {
        let mut search = Search {
            tree: self,
            data,
            query,
            params,
            top: TopK::new(params.k),
            leaves_left: max_leaves.unwrap_or(usize::MAX),
        };
        if !self.is_empty() {
            search.visit(0);
        }
        search.top
    }
}

struct Search<'a> {
    tree: &'a KdTree,
    data: &'a Array2<f32>,
    query: &'a [f32],
    params: &'a ScanParams,
    top: TopK<usize>,
    leaves_left: usize,
}

impl Search<'_> {
    /// 剪枝阈值，严格大于它的子树才会被跳过，保证距离相同的点都参与比较
    fn limit(&self) -> f64 {
        self.top.bound().min(self.params.max_distance.unwrap_or(f64::INFINITY))
    }

    fn visit(&mut self, node: usize) {
        if self.leaves_left == 0 {
            return;
        }
        let tree = self.tree;
        match &tree.nodes[node] {
            Node::Leaf { rows } => {
                self.leaves_left -= 1;
                for &row in &tree.order[rows.clone()] {
                    let point = self.data.row(row);
                    let d = point_distance(self.query, point, self.params);
                    if self.params.admits(d) {
                        self.top.push(row, d);
                    }
                }
            }
            &Node::Split { axis, value, left, right } => {
                let diff = self.query[axis] as f64 - value as f64;
                let (near, far) = if diff < 0.0 { (left, right) } else { (right, left) };
                self.visit(near);
                if diff.abs() <= self.limit() {
                    self.visit(far);
                }
            }
        }
    }
}

#[inline(always)]
pub(super) fn point_distance(query: &[f32], point: ArrayView1<f32>, params: &ScanParams) -> f64 {
    match point.as_slice() {
        Some(point) => distance_unchecked(query, point, params.metric),
        None => distance_unchecked(query, &point.to_vec(), params.metric),
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::distance::MetricKind;

    fn brute_force(data: &Array2<f32>, query: &[f32], params: &ScanParams) -> Vec<(usize, f64)> {
        let mut top = TopK::new(params.k);
        for (row, point) in data.rows().into_iter().enumerate() {
            let d = point_distance(query, point, params);
            if params.admits(d) {
                top.push(row, d);
            }
        }
        top.into_sorted_vec().into_iter().map(|n| (n.key, n.distance)).collect()
    }

    fn grid(n: usize) -> Array2<f32> {
        Array2::from_shape_fn((n * n, 2), |(row, col)| {
            if col == 0 { (row / n) as f32 } else { (row % n) as f32 }
        })
    }

    #[test]
    fn test_empty_tree() {
        let data = Array2::<f32>::zeros((0, 3));
        let tree = KdTree::build(&data, 4);
        let params = ScanParams { k: 3, metric: MetricKind::Euclidean, max_distance: None };
        assert!(tree.search(&data, &[0.0, 0.0, 0.0], &params, None).is_empty());
    }

    #[test]
    fn test_exact_search_matches_brute_force_with_ties() {
        // 网格上有大量距离相同的点
        let data = grid(12);
        let tree = KdTree::build(&data, 3);
        for metric in [MetricKind::Euclidean, MetricKind::Manhattan, MetricKind::Chebyshev] {
            for query in [[5.0f32, 5.0], [0.5, 0.5], [-3.0, 7.0], [11.0, 0.0]] {
                let params = ScanParams { k: 9, metric, max_distance: None };
                let got = tree.search(&data, &query, &params, None);
                let got = got.into_sorted_vec().into_iter().map(|n| (n.key, n.distance)).collect::<Vec<_>>();
                assert_eq!(got, brute_force(&data, &query, &params), "{metric} {query:?}");
            }
        }
    }

    #[test]
    fn test_max_distance_prunes() {
        let data = grid(10);
        let tree = KdTree::build(&data, 2);
        let params = ScanParams { k: 100, metric: MetricKind::Euclidean, max_distance: Some(1.0) };
        let got = tree.search(&data, &[4.0, 4.0], &params, None);
        assert_eq!(got.len(), 5);
    }

    #[test]
    fn test_duplicate_points() {
        let data = array![[1.0f32, 1.0], [1.0, 1.0], [1.0, 1.0], [1.0, 1.0], [2.0, 2.0]];
        let tree = KdTree::build(&data, 1);
        let params = ScanParams { k: 3, metric: MetricKind::Euclidean, max_distance: None };
        let got = tree.search(&data, &[1.0, 1.0], &params, None);
        let rows = got.into_sorted_vec().into_iter().map(|n| n.key).collect::<Vec<_>>();
        assert_eq!(rows, vec![0, 1, 2]);
    }

    #[test]
    fn test_approximate_search_visits_limited_leaves() {
        let data = grid(16);
        let tree = KdTree::build(&data, 4);
        let params = ScanParams { k: 4, metric: MetricKind::Euclidean, max_distance: None };
        let got = tree.search(&data, &[3.0, 3.0], &params, Some(1));
        assert!(got.len() <= 4);
        assert!(!got.is_empty());
    }
}
