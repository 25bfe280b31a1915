use funding_rate_server::frcommon::config::DatabaseConfig;
use funding_rate_server::frcommon::models::{BucketRecord, ColumnValue, Interval};
use funding_rate_server::frcommon::{AppError, PersistenceGateway, SqliteGateway};
use std::collections::BTreeSet;
use tempfile::TempDir;

/// SQLite 持久化网关的集成测试
#[cfg(test)]
mod tests {
    use super::*;

    fn open_gateway(dir: &TempDir) -> SqliteGateway {
        let config = DatabaseConfig {
            database_path: dir.path().join("db/funding_rate.db").to_string_lossy().into_owned(),
            pool_size: 2,
            ..Default::default()
        };
        SqliteGateway::open(&config).expect("打开测试数据库失败")
    }

    fn record(timestamp: i64, funding_rate: f64) -> BucketRecord {
        BucketRecord {
            timestamp,
            datetime: format!("ts-{}", timestamp),
            funding_rate,
            funding_rate_mean: funding_rate,
            mark_price_mean: 100.0,
            index_price_mean: 99.5,
            oi_transaction_timestamp: None,
            oi_transaction_datetime: None,
            open_interest: None,
        }
    }

    #[test]
    fn test_symbol_list_ordered_by_id() {
        let dir = TempDir::new().unwrap();
        let gateway = open_gateway(&dir);

        gateway.insert_symbol("ETHUSDT", None).unwrap();
        gateway.insert_symbol("BTCUSDT", Some(3)).unwrap();
        // 重复插入被忽略
        gateway.insert_symbol("ETHUSDT", Some(9)).unwrap();

        let list = gateway.fetch_symbol_list().unwrap();
        let symbols: Vec<&str> = list.iter().map(|c| c.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["ETHUSDT", "BTCUSDT"]);
        assert_eq!(list[0].pool_id, None);
        assert_eq!(list[1].pool_id, Some(3));
        assert!(list[0].id < list[1].id);

        assert!(matches!(
            gateway.insert_symbol("BAD SYMBOL", None),
            Err(AppError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_provision_and_diff() {
        let dir = TempDir::new().unwrap();
        let gateway = open_gateway(&dir);

        for symbol in ["AUSDT", "BUSDT", "CUSDT"] {
            gateway.insert_symbol(symbol, None).unwrap();
        }
        gateway.provision_symbol("AUSDT").unwrap();
        gateway.provision_symbol("BUSDT").unwrap();
        gateway.provision_symbol("OLDUSDT").unwrap();
        // 重复建表是幂等的
        gateway.provision_symbol("AUSDT").unwrap();

        let existing = gateway.existing_symbols().unwrap();
        assert_eq!(
            existing,
            BTreeSet::from(["AUSDT".to_string(), "BUSDT".to_string(), "OLDUSDT".to_string()])
        );

        let diff = gateway.diff_symbols().unwrap();
        assert_eq!(diff.added, BTreeSet::from(["CUSDT".to_string()]));
        assert_eq!(diff.removed, BTreeSet::from(["OLDUSDT".to_string()]));

        // 四个周期表都已创建
        for interval in Interval::ALL {
            let rows = gateway.fetch_last_rows(&interval.table_name("AUSDT"), 5).unwrap();
            assert!(rows.is_empty(), "{} 应为空表", interval);
        }

        // 从列表移除后变为下架品种，周期表保留
        gateway.remove_symbol("BUSDT").unwrap();
        let diff = gateway.diff_symbols().unwrap();
        assert_eq!(
            diff.removed,
            BTreeSet::from(["BUSDT".to_string(), "OLDUSDT".to_string()])
        );
        assert!(gateway.fetch_last_rows(&Interval::OneDay.table_name("BUSDT"), 1).is_ok());

        assert!(matches!(
            gateway.provision_symbol("X;DROP"),
            Err(AppError::SchemaProvisionError(_))
        ));
        println!("✅ 建表与差异计算测试通过");
    }

    #[test]
    fn test_upsert_keeps_stored_values_and_fills_nulls() {
        let dir = TempDir::new().unwrap();
        let gateway = open_gateway(&dir);
        gateway.provision_symbol("BTCUSDT").unwrap();
        let table = Interval::OneMinute.table_name("BTCUSDT");

        let (columns, values) = record(1_700_000_040, 0.0001).to_row();
        assert_eq!(gateway.upsert_row(&table, &columns, &values).unwrap(), 1);

        // 冲突行：funding_rate 已有值保持不变，open_interest 为空被填充
        let affected = gateway
            .upsert_row(
                &table,
                &["timestamp", "funding_rate", "open_interest"],
                &[
                    ColumnValue::Integer(1_700_000_040),
                    ColumnValue::Real(0.0002),
                    ColumnValue::Real(500.0),
                ],
            )
            .unwrap();
        assert_eq!(affected, 1);

        let rows = gateway.fetch_last_rows(&table, 1).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].funding_rate, 0.0001);
        assert_eq!(rows[0].open_interest, Some(500.0));
        assert_eq!(rows[0].datetime, "ts-1700000040");

        // 再次写入 open_interest 不会覆盖
        gateway
            .upsert_row(
                &table,
                &["timestamp", "open_interest"],
                &[ColumnValue::Integer(1_700_000_040), ColumnValue::Real(900.0)],
            )
            .unwrap();
        let rows = gateway.fetch_last_rows(&table, 1).unwrap();
        assert_eq!(rows[0].open_interest, Some(500.0));
        println!("✅ 空值合并写入测试通过");
    }

    #[test]
    fn test_partial_row_reads_nulls_as_zero() {
        let dir = TempDir::new().unwrap();
        let gateway = open_gateway(&dir);
        gateway.provision_symbol("ETHUSDT").unwrap();
        let table = Interval::FiveMinutes.table_name("ETHUSDT");

        // 只有持仓量的行，其余字段为空
        gateway
            .upsert_row(
                &table,
                &["timestamp", "open_interest"],
                &[ColumnValue::Integer(1_700_000_100), ColumnValue::Real(42.0)],
            )
            .unwrap();

        let rows = gateway.fetch_last_rows(&table, 3).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].funding_rate, 0.0);
        assert_eq!(rows[0].funding_rate_mean, 0.0);
        assert_eq!(rows[0].mark_price_mean, 0.0);
        assert_eq!(rows[0].open_interest, Some(42.0));

        // 之后的完整写入补齐空字段
        let (columns, values) = record(1_700_000_100, 0.0003).to_row();
        gateway.upsert_row(&table, &columns, &values).unwrap();
        let rows = gateway.fetch_last_rows(&table, 3).unwrap();
        assert_eq!(rows[0].funding_rate, 0.0003);
        assert_eq!(rows[0].mark_price_mean, 100.0);
        assert_eq!(rows[0].open_interest, Some(42.0));
    }

    #[test]
    fn test_fetch_last_rows_newest_first() {
        let dir = TempDir::new().unwrap();
        let gateway = open_gateway(&dir);
        gateway.provision_symbol("SOLUSDT").unwrap();
        let table = Interval::FiveMinutes.table_name("SOLUSDT");

        for k in 0..15 {
            let (columns, values) = record(1_700_000_100 + k * 300, k as f64).to_row();
            gateway.upsert_row(&table, &columns, &values).unwrap();
        }

        let rows = gateway.fetch_last_rows(&table, 12).unwrap();
        assert_eq!(rows.len(), 12);
        assert_eq!(rows[0].timestamp, 1_700_000_100 + 14 * 300);
        assert_eq!(rows[11].timestamp, 1_700_000_100 + 3 * 300);
        assert!(rows.windows(2).all(|w| w[0].timestamp > w[1].timestamp));
    }

    #[test]
    fn test_rejects_untrusted_identifiers() {
        let dir = TempDir::new().unwrap();
        let gateway = open_gateway(&dir);
        gateway.provision_symbol("BTCUSDT").unwrap();

        let values = [ColumnValue::Integer(1), ColumnValue::Real(1.0)];
        assert!(matches!(
            gateway.upsert_row("coins", &["timestamp", "funding_rate"], &values),
            Err(AppError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            gateway.upsert_row("oi_BTCUSDT", &["timestamp", "symbol"], &values),
            Err(AppError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            gateway.upsert_row("oi_BTCUSDT", &["timestamp", "funding_rate"], &values[..1]),
            Err(AppError::PersistenceWriteError(_))
        ));
        assert!(gateway.fetch_last_rows("oi_BTC USDT", 1).is_err());

        // 品种列表不受影响
        assert!(gateway.fetch_symbol_list().unwrap().is_empty());
    }
}
