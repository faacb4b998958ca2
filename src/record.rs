//! Record types flowing through the pipeline and the column schema shared by
//! every storage sink.
//!
//! [`Record`] is the raw post delivered by the crawler. Sinks never inspect it
//! field by field; they go through [`COLUMNS`] and [`Record::column_values`],
//! which are kept in lockstep so that the delimited-file header, the relational
//! table definitions and the upsert statements all agree on one ordering.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Version of the stored column layout. Bump whenever [`COLUMNS`] changes.
pub const SCHEMA_VERSION: u32 = 1;

/// One scraped post as produced by the crawler.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Record {
    pub id: String,
    pub bid: String,
    pub user_id: String,
    #[serde(alias = "screen_name")]
    pub username: String,
    pub text: String,
    pub article_url: String,
    pub location: String,
    pub at_users: String,
    pub topics: String,
    pub reposts_count: i64,
    pub comments_count: i64,
    pub attitudes_count: i64,
    pub created_at: String,
    pub source: String,
    pub pics: Vec<String>,
    pub video_url: Option<String>,
    pub retweet_id: Option<String>,
    pub ip: String,
    pub user_authentication: String,
    pub vip_type: String,
    pub vip_level: i64,
    /// Search term that produced this record. Not a stored column.
    pub keyword: String,
}

/// The curated per-user view kept by the latest-per-user store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FilteredRecord {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub blessing_message: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub keyword: String,
    /// Fields written by other tools; carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FilteredRecord {
    /// Projects a record onto the curated view, using an already normalized message.
    pub fn from_record(record: &Record, blessing_message: String) -> Self {
        FilteredRecord {
            user_id: record.user_id.clone(),
            username: record.username.clone(),
            blessing_message,
            created_at: record.created_at.clone(),
            keyword: record.keyword.clone(),
            extra: Map::new(),
        }
    }
}

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Bounded text, `varchar(n)` on servers that need a length.
    Text(u16),
    Integer,
    DateTime,
}

/// A stored column: its SQL/document name, delimited-file header and type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub header: &'static str,
    pub kind: ColumnKind,
}

const fn col(name: &'static str, header: &'static str, kind: ColumnKind) -> Column {
    Column { name, header, kind }
}

/// Number of stored columns.
pub const COLUMN_COUNT: usize = 21;

/// The stored columns, in output order. `id` is always first and is the key.
pub const COLUMNS: [Column; COLUMN_COUNT] = [
    col("id", "id", ColumnKind::Text(20)),
    col("bid", "bid", ColumnKind::Text(12)),
    col("user_id", "user_id", ColumnKind::Text(20)),
    col("screen_name", "用户昵称", ColumnKind::Text(30)),
    col("text", "微博正文", ColumnKind::Text(2000)),
    col("article_url", "头条文章url", ColumnKind::Text(100)),
    col("location", "发布位置", ColumnKind::Text(100)),
    col("at_users", "艾特用户", ColumnKind::Text(1000)),
    col("topics", "话题", ColumnKind::Text(200)),
    col("reposts_count", "转发数", ColumnKind::Integer),
    col("comments_count", "评论数", ColumnKind::Integer),
    col("attitudes_count", "点赞数", ColumnKind::Integer),
    col("created_at", "发布时间", ColumnKind::DateTime),
    col("source", "发布工具", ColumnKind::Text(30)),
    col("pics", "微博图片url", ColumnKind::Text(3000)),
    col("video_url", "微博视频url", ColumnKind::Text(1000)),
    col("retweet_id", "retweet_id", ColumnKind::Text(20)),
    col("ip", "ip", ColumnKind::Text(100)),
    col("user_authentication", "user_authentication", ColumnKind::Text(100)),
    col("vip_type", "会员类型", ColumnKind::Text(50)),
    col("vip_level", "会员等级", ColumnKind::Integer),
];

/// A single stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
}

impl FieldValue {
    /// Renders the value as a delimited-file cell.
    pub fn to_cell(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Integer(n) => n.to_string(),
        }
    }
}

impl Record {
    /// Values for every entry of [`COLUMNS`], in the same order.
    pub fn column_values(&self) -> [FieldValue; COLUMN_COUNT] {
        use FieldValue::{Integer, Text};
        [
            Text(self.id.clone()),
            Text(self.bid.clone()),
            Text(self.user_id.clone()),
            Text(self.username.clone()),
            Text(self.text.clone()),
            Text(self.article_url.clone()),
            Text(self.location.clone()),
            Text(self.at_users.clone()),
            Text(self.topics.clone()),
            Integer(self.reposts_count),
            Integer(self.comments_count),
            Integer(self.attitudes_count),
            Text(self.created_at.clone()),
            Text(self.source.clone()),
            Text(self.pics.join(",")),
            Text(self.video_url.clone().unwrap_or_default()),
            Text(self.retweet_id.clone().unwrap_or_default()),
            Text(self.ip.clone()),
            Text(self.user_authentication.clone()),
            Text(self.vip_type.clone()),
            Integer(self.vip_level),
        ]
    }
}

/// Header row for delimited-file output.
pub fn header_row() -> Vec<&'static str> {
    COLUMNS.iter().map(|c| c.header).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn schema_starts_with_key_and_has_unique_names() {
        assert_eq!(COLUMNS[0].name, "id");
        let mut names: Vec<_> = COLUMNS.iter().map(|c| c.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), COLUMN_COUNT);
    }

    #[test]
    fn column_values_follow_schema_order() {
        let record = Record {
            id: "4980000000000001".into(),
            username: "云朵".into(),
            pics: vec!["https://a/1.jpg".into(), "https://a/2.jpg".into()],
            vip_level: 6,
            ..Default::default()
        };
        let values = record.column_values();
        assert_eq!(values[0], FieldValue::Text("4980000000000001".into()));
        assert_eq!(values[3], FieldValue::Text("云朵".into()));
        assert_eq!(
            values[14],
            FieldValue::Text("https://a/1.jpg,https://a/2.jpg".into())
        );
        assert_eq!(values[15], FieldValue::Text(String::new()));
        assert_eq!(values[20], FieldValue::Integer(6));
    }

    #[test]
    fn record_accepts_screen_name_and_missing_fields() {
        let record: Record = serde_json::from_value(json!({
            "id": "1",
            "screen_name": "小云",
            "reposts_count": 3
        }))
        .unwrap();
        assert_eq!(record.username, "小云");
        assert_eq!(record.reposts_count, 3);
        assert!(record.pics.is_empty());
        assert_eq!(record.video_url, None);
    }

    #[test]
    fn filtered_record_keeps_unknown_fields() {
        let raw = json!({
            "user_id": "42",
            "username": "u",
            "blessing_message": "生日快乐",
            "created_at": "2025-12-17 10:00",
            "keyword": "k",
            "avatar": "https://img/a.png"
        });
        let parsed: FilteredRecord = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(parsed.extra.get("avatar"), Some(&json!("https://img/a.png")));
        assert_eq!(serde_json::to_value(&parsed).unwrap(), raw);
    }
}
