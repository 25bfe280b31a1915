// 文件: src/frcommon/db.rs
// 持久化网关 - 品种列表与周期表的读写 (SQLite + r2d2 连接池)
use crate::frcommon::models::{BucketRecord, CoinListing, ColumnValue, Interval, BUCKET_COLUMNS};
use crate::frcommon::config::DatabaseConfig;
use crate::frcommon::{AppError, Result};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{params, params_from_iter, ToSql};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, instrument};

pub type DbPool = Pool<SqliteConnectionManager>;

/// 持久化日志目标
pub const PERSISTENCE_TARGET: &str = "持久化";

/// 权威品种列表与已建表品种的差异
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolDiff {
    /// 已建表但不在权威列表中的品种
    pub removed: BTreeSet<String>,
    /// 在权威列表中但尚未建表的品种
    pub added: BTreeSet<String>,
}

impl SymbolDiff {
    /// 用同一份权威列表快照计算差异
    pub fn between(canonical: &[CoinListing], existing: &BTreeSet<String>) -> Self {
        let canonical: BTreeSet<&String> = canonical.iter().map(|c| &c.symbol).collect();
        Self {
            removed: existing
                .iter()
                .filter(|s| !canonical.contains(s))
                .cloned()
                .collect(),
            added: canonical
                .into_iter()
                .filter(|s| !existing.contains(*s))
                .cloned()
                .collect(),
        }
    }
}

/// 持久化网关契约
///
/// 所有方法都是阻塞 I/O，引擎只通过带超时的 `PersistenceClient` 调用。
pub trait PersistenceGateway: Send + Sync {
    /// 按 id 排序的权威品种列表
    fn fetch_symbol_list(&self) -> Result<Vec<CoinListing>>;

    /// 已经建好周期表的品种
    fn existing_symbols(&self) -> Result<BTreeSet<String>>;

    /// 为品种创建四个周期表
    fn provision_symbol(&self, symbol: &str) -> Result<()>;

    /// 空值合并 upsert，返回受影响行数
    fn upsert_row(&self, table: &str, columns: &[&str], values: &[ColumnValue]) -> Result<usize>;

    /// 最近 n 行，按时间倒序
    fn fetch_last_rows(&self, table: &str, n: usize) -> Result<Vec<BucketRecord>>;

    fn diff_symbols(&self) -> Result<SymbolDiff> {
        let canonical = self.fetch_symbol_list()?;
        let existing = self.existing_symbols()?;
        Ok(SymbolDiff::between(&canonical, &existing))
    }
}

impl ToSql for ColumnValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            ColumnValue::Null => ToSqlOutput::Owned(Value::Null),
            ColumnValue::Integer(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            ColumnValue::Real(v) => ToSqlOutput::Owned(Value::Real(*v)),
            ColumnValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

/// 品种名只允许 ASCII 字母数字和下划线
pub fn validate_symbol(symbol: &str) -> Result<()> {
    if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(AppError::InvalidIdentifier(format!("非法品种名: {:?}", symbol)));
    }
    Ok(())
}

/// 表名必须是 `<周期前缀><品种名>`
pub fn validate_table_name(table: &str) -> Result<()> {
    let symbol = Interval::ALL
        .iter()
        .find_map(|i| table.strip_prefix(i.table_prefix()))
        .ok_or_else(|| AppError::InvalidIdentifier(format!("非法表名: {:?}", table)))?;
    validate_symbol(symbol)
}

/// 列名必须来自固定列集合且不重复，并且包含主键列
pub fn validate_columns(columns: &[&str]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for column in columns {
        if !BUCKET_COLUMNS.contains(column) {
            return Err(AppError::InvalidIdentifier(format!("非法列名: {:?}", column)));
        }
        if !seen.insert(*column) {
            return Err(AppError::InvalidIdentifier(format!("重复列名: {:?}", column)));
        }
    }
    if !seen.contains("timestamp") {
        return Err(AppError::InvalidIdentifier("缺少主键列 timestamp".to_string()));
    }
    Ok(())
}

/// 构造空值合并 upsert 语句：已有非空值保留，空值由新值填充
pub fn build_upsert_sql(table: &str, columns: &[&str]) -> String {
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| **c != "timestamp")
        .map(|c| format!("{c} = COALESCE(\"{table}\".{c}, excluded.{c})"))
        .collect();

    let conflict_action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    format!(
        "INSERT INTO \"{}\" ({}) VALUES ({}) ON CONFLICT(timestamp) {}",
        table,
        columns.join(", "),
        placeholders.join(", "),
        conflict_action
    )
}

fn create_interval_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" (
            timestamp INTEGER PRIMARY KEY,
            datetime TEXT,
            funding_rate REAL,
            funding_rate_mean REAL,
            mark_price_mean REAL,
            index_price_mean REAL,
            oi_transaction_timestamp INTEGER,
            oi_transaction_datetime TEXT,
            open_interest REAL
        )",
        table
    )
}

/// SQLite 实现的持久化网关
#[derive(Clone)]
pub struct SqliteGateway {
    pool: DbPool,
}

impl SqliteGateway {
    /// 打开（必要时创建）数据库并初始化品种列表表
    #[instrument(skip(config), err)]
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let db_path = Path::new(&config.database_path);

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!(
            target: PERSISTENCE_TARGET,
            log_type = "low_freq",
            "使用SQLite数据库: {} (WAL={})",
            db_path.display(),
            config.enable_wal
        );

        let enable_wal = config.enable_wal;
        let manager = SqliteConnectionManager::file(db_path).with_init(move |conn| {
            if enable_wal {
                conn.execute_batch(
                    "PRAGMA journal_mode = WAL;
                     PRAGMA synchronous = NORMAL;
                     PRAGMA busy_timeout = 5000;",
                )
            } else {
                conn.execute_batch("PRAGMA busy_timeout = 5000;")
            }
        });

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .connection_timeout(Duration::from_secs(config.connection_timeout_secs.max(1)))
            .build(manager)
            .map_err(|e| {
                let pool_error = AppError::DatabaseError(format!("创建连接池失败: {}", e));
                tracing::error!(
                    message = "创建连接池失败",
                    db_path = %db_path.display(),
                    error.summary = pool_error.get_error_type_summary(),
                    error.details = %pool_error
                );
                pool_error
            })?;

        let gateway = Self { pool };
        gateway.init_schema()?;
        Ok(gateway)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("获取数据库连接失败: {}", e)))
    }

    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            "CREATE TABLE IF NOT EXISTS coins (
                id INTEGER PRIMARY KEY,
                symbol TEXT NOT NULL UNIQUE,
                pool_id INTEGER
            )",
        )?;
        debug!(target: PERSISTENCE_TARGET, "品种列表表已就绪");
        Ok(())
    }

    /// 向权威品种列表添加一个品种，已存在则忽略
    pub fn insert_symbol(&self, symbol: &str, pool_id: Option<i64>) -> Result<()> {
        validate_symbol(symbol)?;
        self.conn()?.execute(
            "INSERT OR IGNORE INTO coins (symbol, pool_id) VALUES (?1, ?2)",
            params![symbol, pool_id],
        )?;
        Ok(())
    }

    /// 从权威品种列表移除一个品种（周期表保留）
    pub fn remove_symbol(&self, symbol: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM coins WHERE symbol = ?1", params![symbol])?;
        Ok(())
    }
}

impl PersistenceGateway for SqliteGateway {
    fn fetch_symbol_list(&self) -> Result<Vec<CoinListing>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, symbol, pool_id FROM coins ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(CoinListing {
                id: row.get(0)?,
                symbol: row.get(1)?,
                pool_id: row.get(2)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(AppError::from)
    }

    fn existing_symbols(&self) -> Result<BTreeSet<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name GLOB 'oi_*'",
        )?;
        let names = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let prefix = Interval::OneMinute.table_prefix();
        let mut symbols = BTreeSet::new();
        for name in names {
            if let Some(symbol) = name?.strip_prefix(prefix) {
                symbols.insert(symbol.to_string());
            }
        }
        Ok(symbols)
    }

    #[instrument(skip(self), err)]
    fn provision_symbol(&self, symbol: &str) -> Result<()> {
        validate_symbol(symbol)
            .map_err(|e| AppError::SchemaProvisionError(format!("{}: {}", symbol, e)))?;

        let provision = || -> Result<()> {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            for interval in Interval::ALL {
                tx.execute_batch(&create_interval_table_sql(&interval.table_name(symbol)))?;
            }
            tx.commit()?;
            Ok(())
        };

        provision().map_err(|e| AppError::SchemaProvisionError(format!("{}: {}", symbol, e)))?;
        info!(target: PERSISTENCE_TARGET, log_type = "low_freq", %symbol, "✅ 品种周期表已创建");
        Ok(())
    }

    fn upsert_row(&self, table: &str, columns: &[&str], values: &[ColumnValue]) -> Result<usize> {
        validate_table_name(table)?;
        validate_columns(columns)?;
        if columns.len() != values.len() {
            return Err(AppError::PersistenceWriteError(format!(
                "列数({})与值数({})不一致",
                columns.len(),
                values.len()
            )));
        }

        let sql = build_upsert_sql(table, columns);
        let conn = self.conn()?;
        let affected = conn
            .prepare_cached(&sql)
            .and_then(|mut stmt| stmt.execute(params_from_iter(values.iter())))
            .map_err(|e| AppError::PersistenceWriteError(format!("写入 {} 失败: {}", table, e)))?;
        Ok(affected)
    }

    fn fetch_last_rows(&self, table: &str, n: usize) -> Result<Vec<BucketRecord>> {
        validate_table_name(table)?;

        let sql = format!(
            "SELECT {} FROM \"{}\" ORDER BY timestamp DESC LIMIT ?1",
            BUCKET_COLUMNS.join(", "),
            table
        );
        let conn = self.conn()?;
        let read = || -> rusqlite::Result<Vec<BucketRecord>> {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![n as i64], |row| {
                Ok(BucketRecord {
                    timestamp: row.get(0)?,
                    datetime: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    funding_rate: row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                    funding_rate_mean: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                    mark_price_mean: row.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
                    index_price_mean: row.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
                    oi_transaction_timestamp: row.get(6)?,
                    oi_transaction_datetime: row.get(7)?,
                    open_interest: row.get(8)?,
                })
            })?;
            rows.collect()
        };
        read().map_err(|e| AppError::PersistenceWriteError(format!("读取 {} 失败: {}", table, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validation() {
        assert!(validate_table_name("oi_BTCUSDT").is_ok());
        assert!(validate_table_name("oi1d_1000PEPEUSDT").is_ok());
        assert!(validate_table_name("coins").is_err());
        assert!(validate_table_name("oi_BTC\"; DROP TABLE coins; --").is_err());
        assert!(validate_table_name("oi_").is_err());

        assert!(validate_columns(&["timestamp", "funding_rate"]).is_ok());
        assert!(validate_columns(&["funding_rate"]).is_err());
        assert!(validate_columns(&["timestamp", "timestamp"]).is_err());
        assert!(validate_columns(&["timestamp", "1=1"]).is_err());
    }

    #[test]
    fn test_upsert_sql_coalesces_every_non_key_column() {
        let sql = build_upsert_sql("oi_BTCUSDT", &["timestamp", "funding_rate", "open_interest"]);
        assert_eq!(
            sql,
            "INSERT INTO \"oi_BTCUSDT\" (timestamp, funding_rate, open_interest) VALUES (?1, ?2, ?3) \
             ON CONFLICT(timestamp) DO UPDATE SET \
             funding_rate = COALESCE(\"oi_BTCUSDT\".funding_rate, excluded.funding_rate), \
             open_interest = COALESCE(\"oi_BTCUSDT\".open_interest, excluded.open_interest)"
        );
        assert!(build_upsert_sql("oi_X", &["timestamp"]).ends_with("DO NOTHING"));
    }
}
