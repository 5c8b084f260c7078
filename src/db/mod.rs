use std::future::Future;

mod memory;
pub mod model;
mod retry;
mod sqlite;

pub use memory::MemoryStore;
pub use model::*;
pub use retry::{RetryPolicy, with_retry};
pub use sqlite::SqliteStore;
pub(crate) use sqlite::check_table_name;

use crate::error::{Error, Result};

/// 细胞特征向量的持久化存储
///
/// 存储是细胞记录唯一的写入方，所有修改在返回前都必须已经落盘，
/// 后续的搜索依赖这一点保证结果一致。
pub trait FeatureStore: Send + Sync + 'static {
    /// 插入或替换一条记录，第一条记录确定整个群体的维数
    fn put(&self, record: &CellRecord) -> impl Future<Output = Result<()>> + Send;

    /// 批量插入，返回每条记录各自的结果
    ///
    /// 只有存储本身出错时才会整体失败，单条记录不合法不影响其它记录
    fn put_many(&self, records: &[CellRecord]) -> impl Future<Output = Result<Vec<Result<()>>>> + Send {
        async move {
            let mut results = Vec::with_capacity(records.len());
            for record in records {
                match self.put(record).await {
                    Err(e @ Error::Store { .. }) => return Err(e),
                    r => results.push(r),
                }
            }
            Ok(results)
        }
    }

    /// 读取一条记录，不存在时返回 `NotFound`
    fn get(&self, id: &CellId) -> impl Future<Output = Result<CellRecord>> + Send;

    /// 删除一条记录，不存在时返回 `NotFound`
    fn delete(&self, id: &CellId) -> impl Future<Output = Result<()>> + Send;

    /// 按 ID 升序返回 `after` 之后的最多 `limit` 条记录
    fn scan_page(
        &self,
        after: Option<&CellId>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<CellRecord>>> + Send;

    /// 群体的维数，群体为空且从未确定维数时返回 None
    fn dimension(&self) -> impl Future<Output = Result<Option<usize>>> + Send;

    /// 记录数量
    fn count(&self) -> impl Future<Output = Result<u64>> + Send;

    /// 修改计数，每次写入或删除都会增加，用于判断索引是否过期
    fn revision(&self) -> impl Future<Output = Result<u64>> + Send;

    /// 清空整个群体并重置维数
    fn clear(&self) -> impl Future<Output = Result<()>> + Send;

    /// 释放底层连接
    fn close(&self) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// 返回一个按页读取全部记录的扫描器，每次调用都从头开始
    fn scan_all(&self, page_size: usize) -> RecordScan<'_, Self>
    where
        Self: Sized,
    {
        RecordScan::new(self, page_size)
    }
}

/// 惰性的全量扫描，基于 ID 的游标分页
pub struct RecordScan<'a, S> {
    store: &'a S,
    page_size: usize,
    cursor: Option<CellId>,
    done: bool,
}

impl<'a, S: FeatureStore> RecordScan<'a, S> {
    fn new(store: &'a S, page_size: usize) -> Self {
        Self { store, page_size: page_size.max(1), cursor: None, done: false }
    }

    /// 读取下一页，扫描结束时返回 None
    pub async fn next_page(&mut self) -> Result<Option<Vec<CellRecord>>> {
        if self.done {
            return Ok(None);
        }
        let page = self.store.scan_page(self.cursor.as_ref(), self.page_size).await?;
        if page.len() < self.page_size {
            self.done = true;
        }
        match page.last() {
            Some(last) => {
                self.cursor = Some(last.id.clone());
                Ok(Some(page))
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    /// 读取剩余的全部记录
    pub async fn collect_all(mut self) -> Result<Vec<CellRecord>> {
        let mut records = vec![];
        while let Some(page) = self.next_page().await? {
            records.extend(page);
        }
        Ok(records)
    }
}

/// 检查记录的向量，并与群体维数比较
pub(crate) fn check_record(record: &CellRecord, dimension: Option<usize>) -> Result<()> {
    record.vector.validate()?;
    if let Some(metadata) = &record.metadata {
        metadata.validate()?;
    }
    match dimension {
        Some(d) if d != record.dim() => Err(Error::validation(format!(
            "cell {} has {} features, population dimension is {}",
            record.id,
            record.dim(),
            d
        ))),
        _ => Ok(()),
    }
}
