//! 资金费率聚合系统的数据模型

use std::fmt;

/// 聚合周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Interval {
    OneMinute,
    FiveMinutes,
    OneHour,
    OneDay,
}

impl Interval {
    pub const ALL: [Interval; 4] = [
        Interval::OneMinute,
        Interval::FiveMinutes,
        Interval::OneHour,
        Interval::OneDay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::OneMinute => "1m",
            Interval::FiveMinutes => "5m",
            Interval::OneHour => "1h",
            Interval::OneDay => "1d",
        }
    }

    /// 周期长度（秒）
    pub fn seconds(&self) -> i64 {
        match self {
            Interval::OneMinute => 60,
            Interval::FiveMinutes => 300,
            Interval::OneHour => 3_600,
            Interval::OneDay => 86_400,
        }
    }

    /// 每个品种每个周期一张表，表名 = 前缀 + 品种名
    pub fn table_prefix(&self) -> &'static str {
        match self {
            Interval::OneMinute => "oi_",
            Interval::FiveMinutes => "oi5m_",
            Interval::OneHour => "oi1h_",
            Interval::OneDay => "oi1d_",
        }
    }

    pub fn table_name(&self, symbol: &str) -> String {
        format!("{}{}", self.table_prefix(), symbol)
    }

    pub(crate) fn bit(&self) -> u8 {
        match self {
            Interval::OneMinute => 0b0001,
            Interval::FiveMinutes => 0b0010,
            Interval::OneHour => 0b0100,
            Interval::OneDay => 0b1000,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 品种状态。品种不会被删除，只会被标记为下架
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolStatus {
    Active,
    Delisted,
}

/// 权威品种列表中的一行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinListing {
    pub id: i64,
    pub symbol: String,
    pub pool_id: Option<i64>,
}

/// 单条原始行情（时间为秒级时间戳）
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub symbol: String,
    pub event_time: i64,
    pub transaction_time: i64,
    pub funding_rate: f64,
    pub mark_price: f64,
    pub index_price: f64,
}

/// 一条入站消息解码后的结果，作为引擎的原子处理单元
#[derive(Debug, Clone, Default)]
pub struct TickBatch {
    pub ticks: Vec<Tick>,
    /// 解码失败被丢弃的元素数量
    pub malformed: usize,
}

/// 一个品种在一个时间桶内的汇总记录
///
/// `funding_rate` 是窗口内最后观测到的值，不是均值；
/// 三个 `*_mean` 字段才是窗口均值。
#[derive(Debug, Clone, PartialEq)]
pub struct BucketRecord {
    pub timestamp: i64,
    pub datetime: String,
    pub funding_rate: f64,
    pub funding_rate_mean: f64,
    pub mark_price_mean: f64,
    pub index_price_mean: f64,
    pub oi_transaction_timestamp: Option<i64>,
    pub oi_transaction_datetime: Option<String>,
    pub open_interest: Option<f64>,
}

/// 所有周期表共用的列
pub const BUCKET_COLUMNS: [&str; 9] = [
    "timestamp",
    "datetime",
    "funding_rate",
    "funding_rate_mean",
    "mark_price_mean",
    "index_price_mean",
    "oi_transaction_timestamp",
    "oi_transaction_datetime",
    "open_interest",
];

/// 写入时绑定的参数值
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<Option<i64>> for ColumnValue {
    fn from(v: Option<i64>) -> Self {
        v.map_or(ColumnValue::Null, ColumnValue::Integer)
    }
}

impl From<Option<f64>> for ColumnValue {
    fn from(v: Option<f64>) -> Self {
        v.map_or(ColumnValue::Null, ColumnValue::Real)
    }
}

impl From<Option<String>> for ColumnValue {
    fn from(v: Option<String>) -> Self {
        v.map_or(ColumnValue::Null, ColumnValue::Text)
    }
}

impl BucketRecord {
    /// 转换为 upsert 所需的列名与参数
    pub fn to_row(&self) -> (Vec<&'static str>, Vec<ColumnValue>) {
        let values = vec![
            ColumnValue::Integer(self.timestamp),
            ColumnValue::Text(self.datetime.clone()),
            ColumnValue::Real(self.funding_rate),
            ColumnValue::Real(self.funding_rate_mean),
            ColumnValue::Real(self.mark_price_mean),
            ColumnValue::Real(self.index_price_mean),
            self.oi_transaction_timestamp.into(),
            self.oi_transaction_datetime.clone().into(),
            self.open_interest.into(),
        ];
        (BUCKET_COLUMNS.to_vec(), values)
    }
}
