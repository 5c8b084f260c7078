use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{PoisonError, RwLock};

use super::{CellId, CellRecord, FeatureStore, check_record};
use crate::error::{Error, Result};

/// 内存存储，不落盘，适合嵌入式使用和测试
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    records: BTreeMap<CellId, CellRecord>,
    dimension: Option<usize>,
    revision: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 使用一组记录初始化，任何一条不合法都会失败
    pub fn with_records(records: impl IntoIterator<Item = CellRecord>) -> Result<Self> {
        let store = Self::new();
        {
            let mut inner = store.inner.write().unwrap_or_else(PoisonError::into_inner);
            for record in records {
                inner.insert(record)?;
            }
        }
        Ok(store)
    }
}

impl MemoryInner {
    fn insert(&mut self, record: CellRecord) -> Result<()> {
        check_record(&record, self.dimension)?;
        self.dimension.get_or_insert(record.dim());
        self.records.insert(record.id.clone(), record);
        self.revision += 1;
        Ok(())
    }
}

impl FeatureStore for MemoryStore {
    async fn put(&self, record: &CellRecord) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.insert(record.clone())
    }

    async fn get(&self, id: &CellId) -> Result<CellRecord> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.records.get(id).cloned().ok_or_else(|| Error::NotFound(id.clone()))
    }

    async fn delete(&self, id: &CellId) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match inner.records.remove(id) {
            Some(_) => {
                inner.revision += 1;
                Ok(())
            }
            None => Err(Error::NotFound(id.clone())),
        }
    }

    async fn scan_page(&self, after: Option<&CellId>, limit: usize) -> Result<Vec<CellRecord>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let lower = match after {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        Ok(inner
            .records
            .range::<CellId, _>((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn dimension(&self) -> Result<Option<usize>> {
        Ok(self.inner.read().unwrap_or_else(PoisonError::into_inner).dimension)
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.inner.read().unwrap_or_else(PoisonError::into_inner).records.len() as u64)
    }

    async fn revision(&self) -> Result<u64> {
        Ok(self.inner.read().unwrap_or_else(PoisonError::into_inner).revision)
    }

    async fn clear(&self) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.records.clear();
        inner.dimension = None;
        inner.revision += 1;
        Ok(())
    }
}
