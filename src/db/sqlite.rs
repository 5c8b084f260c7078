use std::sync::LazyLock;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};
use regex::Regex;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};

use super::{CellId, CellMetadata, CellRecord, FeatureStore, FeatureVector, RetryPolicy, check_record, with_retry};
use crate::config::StoreConfig;
use crate::error::{Error, Result};

static TABLE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("failed to build regex"));

const META_DIMENSION: &str = "dimension";
const META_REVISION: &str = "revision";

type Row = (String, i64, Vec<u8>, Option<String>);

/// 表名只允许普通标识符，其余所有值都通过参数绑定传入
pub fn check_table_name(name: &str) -> Result<()> {
    if TABLE_NAME.is_match(name) {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid table name: {name:?}")))
    }
}

/// 根据表名预先生成的 SQL 语句
struct Queries {
    create_cells: String,
    create_meta: String,
    get_meta: String,
    set_meta: String,
    bump_revision: String,
    upsert: String,
    select_one: String,
    delete_one: String,
    scan_first: String,
    scan_after: String,
    count: String,
    clear_cells: String,
    clear_dimension: String,
}

impl Queries {
    fn new(table: &str) -> Self {
        let meta = format!("{table}_meta");
        Self {
            create_cells: format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    cell_id   TEXT PRIMARY KEY NOT NULL,
                    dimension INTEGER NOT NULL,
                    vector    BLOB NOT NULL,
                    metadata  TEXT
                )
                "#
            ),
            create_meta: format!(
                r#"
                CREATE TABLE IF NOT EXISTS {meta} (
                    key   TEXT PRIMARY KEY NOT NULL,
                    value INTEGER NOT NULL
                )
                "#
            ),
            get_meta: format!("SELECT value FROM {meta} WHERE key = ?"),
            set_meta: format!(
                "INSERT INTO {meta} (key, value) VALUES (?, ?) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value"
            ),
            bump_revision: format!(
                "INSERT INTO {meta} (key, value) VALUES ('{META_REVISION}', 1) \
                 ON CONFLICT(key) DO UPDATE SET value = value + 1"
            ),
            upsert: format!(
                r#"
                INSERT INTO {table} (cell_id, dimension, vector, metadata)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(cell_id) DO UPDATE SET
                    dimension = excluded.dimension,
                    vector = excluded.vector,
                    metadata = excluded.metadata
                "#
            ),
            select_one: format!(
                "SELECT cell_id, dimension, vector, metadata FROM {table} WHERE cell_id = ?"
            ),
            delete_one: format!("DELETE FROM {table} WHERE cell_id = ?"),
            scan_first: format!(
                "SELECT cell_id, dimension, vector, metadata FROM {table} \
                 ORDER BY cell_id ASC LIMIT ?"
            ),
            scan_after: format!(
                "SELECT cell_id, dimension, vector, metadata FROM {table} \
                 WHERE cell_id > ? ORDER BY cell_id ASC LIMIT ?"
            ),
            count: format!("SELECT COUNT(*) FROM {table}"),
            clear_cells: format!("DELETE FROM {table}"),
            clear_dimension: format!("DELETE FROM {meta} WHERE key = '{META_DIMENSION}'"),
        }
    }
}

/// 基于 SQLite 的细胞特征存储
///
/// 每次修改都在单独的事务中完成，WAL 模式配合 `synchronous = FULL`
/// 保证返回时数据已经持久化。
pub struct SqliteStore {
    pool: SqlitePool,
    queries: Queries,
    retry: RetryPolicy,
}

impl SqliteStore {
    /// 打开数据库，不存在时创建
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        check_table_name(&config.table)?;
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(Error::permanent)?;
            }
        }
        info!("初始化数据库连接: {}", config.path.display());

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let max_connections = config.max_connections.max(1);
        let pool = with_retry(&config.retry, "connect", || {
            let options = options.clone();
            async move {
                SqlitePoolOptions::new()
                    .max_connections(max_connections)
                    .connect_with(options)
                    .await
                    .map_err(Error::from)
            }
        })
        .await?;

        let store = Self { pool, queries: Queries::new(&config.table), retry: config.retry.clone() };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<()> {
        debug!("检查数据表");
        sqlx::query(&self.queries.create_cells).execute(&self.pool).await?;
        sqlx::query(&self.queries.create_meta).execute(&self.pool).await?;
        Ok(())
    }

    async fn get_meta(&self, conn: &mut SqliteConnection, key: &str) -> Result<Option<i64>> {
        Ok(sqlx::query_scalar::<_, i64>(&self.queries.get_meta)
            .bind(key)
            .fetch_optional(conn)
            .await?)
    }

    /// 在事务中写入一条记录，维数不匹配时返回校验错误
    async fn upsert(&self, tx: &mut Transaction<'static, Sqlite>, record: &CellRecord) -> Result<()> {
        let dimension = self.get_meta(tx, META_DIMENSION).await?.map(|d| d as usize);
        check_record(record, dimension)?;
        if dimension.is_none() {
            sqlx::query(&self.queries.set_meta)
                .bind(META_DIMENSION)
                .bind(record.dim() as i64)
                .execute(&mut **tx)
                .await?;
        }

        let metadata = record.metadata.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(&self.queries.upsert)
            .bind(record.id.as_str())
            .bind(record.dim() as i64)
            .bind(encode_vector(&record.vector))
            .bind(metadata)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn put_once(&self, record: &CellRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.upsert(&mut tx, record).await?;
        sqlx::query(&self.queries.bump_revision).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn put_many_once(&self, records: &[CellRecord]) -> Result<Vec<Result<()>>> {
        let mut tx = self.pool.begin().await?;
        let mut results = Vec::with_capacity(records.len());
        let mut written = 0;
        for record in records {
            match self.upsert(&mut tx, record).await {
                Err(e @ Error::Store { .. }) => return Err(e),
                Err(e) => results.push(Err(e)),
                Ok(()) => {
                    written += 1;
                    results.push(Ok(()));
                }
            }
        }
        if written > 0 {
            sqlx::query(&self.queries.bump_revision).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        debug!("批量写入 {written}/{} 条记录", records.len());
        Ok(results)
    }

    async fn delete_once(&self, id: &CellId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let affected =
            sqlx::query(&self.queries.delete_one).bind(id.as_str()).execute(&mut *tx).await?;
        if affected.rows_affected() == 0 {
            return Err(Error::NotFound(id.clone()));
        }
        sqlx::query(&self.queries.bump_revision).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_once(&self, id: &CellId) -> Result<CellRecord> {
        let row = sqlx::query_as::<_, Row>(&self.queries.select_one)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => decode_row(row),
            None => Err(Error::NotFound(id.clone())),
        }
    }

    async fn scan_page_once(&self, after: Option<&CellId>, limit: usize) -> Result<Vec<CellRecord>> {
        let limit = limit as i64;
        let rows = match after {
            Some(id) => {
                sqlx::query_as::<_, Row>(&self.queries.scan_after)
                    .bind(id.as_str())
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_as::<_, Row>(&self.queries.scan_first)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(decode_row).collect()
    }

    async fn clear_once(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&self.queries.clear_cells).execute(&mut *tx).await?;
        sqlx::query(&self.queries.clear_dimension).execute(&mut *tx).await?;
        sqlx::query(&self.queries.bump_revision).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn read_meta(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.pool.acquire().await?;
        self.get_meta(&mut conn, key).await
    }
}

impl FeatureStore for SqliteStore {
    async fn put(&self, record: &CellRecord) -> Result<()> {
        // 校验失败不需要占用连接
        record.vector.validate()?;
        with_retry(&self.retry, "put", || self.put_once(record)).await
    }

    async fn put_many(&self, records: &[CellRecord]) -> Result<Vec<Result<()>>> {
        with_retry(&self.retry, "put_many", || self.put_many_once(records)).await
    }

    async fn get(&self, id: &CellId) -> Result<CellRecord> {
        with_retry(&self.retry, "get", || self.get_once(id)).await
    }

    async fn delete(&self, id: &CellId) -> Result<()> {
        with_retry(&self.retry, "delete", || self.delete_once(id)).await
    }

    async fn scan_page(&self, after: Option<&CellId>, limit: usize) -> Result<Vec<CellRecord>> {
        with_retry(&self.retry, "scan", || self.scan_page_once(after, limit)).await
    }

    async fn dimension(&self) -> Result<Option<usize>> {
        let dimension = with_retry(&self.retry, "dimension", || self.read_meta(META_DIMENSION)).await?;
        Ok(dimension.map(|d| d as usize))
    }

    async fn count(&self) -> Result<u64> {
        let count = with_retry(&self.retry, "count", || async move {
            Ok::<_, Error>(
                sqlx::query_scalar::<_, i64>(&self.queries.count).fetch_one(&self.pool).await?,
            )
        })
        .await?;
        Ok(count as u64)
    }

    async fn revision(&self) -> Result<u64> {
        let revision = with_retry(&self.retry, "revision", || self.read_meta(META_REVISION)).await?;
        Ok(revision.unwrap_or(0) as u64)
    }

    async fn clear(&self) -> Result<()> {
        info!("清空细胞群体");
        with_retry(&self.retry, "clear", || self.clear_once()).await
    }

    async fn close(&self) {
        info!("关闭数据库连接");
        self.pool.close().await;
    }
}

/// 向量以小端 f32 序列存储
fn encode_vector(v: &[f32]) -> Vec<u8> {
    let mut buf = vec![0u8; v.len() * 4];
    LittleEndian::write_f32_into(v, &mut buf);
    buf
}

fn decode_vector(bytes: &[u8], dimension: i64) -> Result<Vec<f32>> {
    if dimension < 0 || bytes.len() != dimension as usize * 4 {
        return Err(Error::permanent(format!(
            "corrupt vector: {} bytes for dimension {dimension}",
            bytes.len()
        )));
    }
    let mut v = vec![0f32; dimension as usize];
    LittleEndian::read_f32_into(bytes, &mut v);
    Ok(v)
}

fn decode_row((id, dimension, vector, metadata): Row) -> Result<CellRecord> {
    let vector = FeatureVector::new(decode_vector(&vector, dimension)?);
    let metadata = metadata
        .map(|s| serde_json::from_str::<CellMetadata>(&s))
        .transpose()
        .map_err(|e| Error::permanent(format!("corrupt metadata for cell {id}: {e}")))?;
    Ok(CellRecord { id: CellId::new(id), vector, metadata })
}
