use std::fmt;
use std::time::{Duration, Instant};

use log::debug;

use crate::config::SearchConfig;
use crate::db::FeatureVector;
use crate::distance::MetricKind;
use crate::error::{Error, Result};
use crate::query::{SearchMode, SearchQuery};

/// 请求的生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Validated,
    Executing,
    Completed,
    Failed,
}

impl RequestState {
    fn can_become(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Received, Validated)
                | (Validated, Executing)
                | (Executing, Completed)
                | (Received | Validated | Executing, Failed)
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 校验通过的请求，所有可选参数都已确定
#[derive(Debug, Clone)]
pub struct ValidatedQuery {
    pub vector: FeatureVector,
    pub k: usize,
    pub metric: MetricKind,
    pub max_distance: Option<f64>,
    pub mode: SearchMode,
    pub include_metadata: bool,
}

impl ValidatedQuery {
    pub fn max_leaves(&self) -> Option<usize> {
        match self.mode {
            SearchMode::Exact => None,
            SearchMode::Approximate { max_leaves } => Some(max_leaves),
        }
    }
}

/// 单个搜索请求的状态机，每次状态变化都会输出调试日志
#[derive(Debug)]
pub struct SearchSession {
    id: u64,
    state: RequestState,
    started: Instant,
}

impl SearchSession {
    pub fn new(id: u64) -> Self {
        debug!("请求 #{id}: {}", RequestState::Received);
        Self { id, state: RequestState::Received, started: Instant::now() }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn transition(&mut self, next: RequestState) {
        debug_assert!(self.state.can_become(next), "{} -> {next}", self.state);
        debug!("请求 #{}: {} -> {next} ({:?})", self.id, self.state, self.elapsed());
        self.state = next;
    }

    /// 校验请求，失败时进入 Failed 状态
    pub fn validate(&mut self, query: &SearchQuery, config: &SearchConfig) -> Result<ValidatedQuery> {
        match validate_query(query, config) {
            Ok(validated) => {
                self.transition(RequestState::Validated);
                Ok(validated)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    pub fn begin(&mut self) {
        self.transition(RequestState::Executing);
    }

    pub fn complete(&mut self, results: usize) {
        self.transition(RequestState::Completed);
        debug!("请求 #{}: 返回 {results} 个结果", self.id);
    }

    /// 进入 Failed 状态，原样返回错误
    pub fn fail(&mut self, error: Error) -> Error {
        debug!("请求 #{} 失败: {error}", self.id);
        self.transition(RequestState::Failed);
        error
    }
}

fn validate_query(query: &SearchQuery, config: &SearchConfig) -> Result<ValidatedQuery> {
    if query.k == 0 {
        return Err(Error::validation("k must be positive"));
    }
    if query.k > config.max_k {
        return Err(Error::validation(format!("k = {} exceeds the limit of {}", query.k, config.max_k)));
    }
    query.vector.validate()?;
    if let Some(max) = query.max_distance {
        if !max.is_finite() || max < 0.0 {
            return Err(Error::validation(format!("max distance must be finite and non-negative: {max}")));
        }
    }

    let metric = query.metric.unwrap_or(config.default_metric);
    if let SearchMode::Approximate { max_leaves } = query.mode {
        if max_leaves == 0 {
            return Err(Error::validation("approximate search must visit at least one leaf"));
        }
        if !metric.supports_kdtree() {
            return Err(Error::validation(format!("approximate search is not supported for {metric}")));
        }
    }

    Ok(ValidatedQuery {
        vector: query.vector.clone(),
        k: query.k,
        metric,
        max_distance: query.max_distance,
        mode: query.mode,
        include_metadata: query.include_metadata,
    })
}
