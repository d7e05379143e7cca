//! Canonical record model and relational table descriptors for notesync.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "notesync-core";

/// Column filled by the backfill pass.
pub const ENRICHMENT_COLUMN: &str = "description";

/// Upstream content source. Each source owns one document collection and one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Short-post keyword search.
    Xhs,
    /// Public-account article listings.
    Gzh,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Xhs => "xhs",
            SourceKind::Gzh => "gzh",
        }
    }

    pub fn default_collection(&self) -> &'static str {
        match self {
            SourceKind::Xhs => "xhs_notes",
            SourceKind::Gzh => "gzh_notes",
        }
    }

    /// Only short posts are dropped when their title is blank.
    pub fn discards_blank_titles(&self) -> bool {
        matches!(self, SourceKind::Xhs)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishTimeKind {
    Absolute,
    MonthDay,
    HoursAgo,
    /// The upstream text matched no known format; `at` is the parse time.
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishTime {
    pub at: DateTime<Utc>,
    pub kind: PublishTimeKind,
}

impl PublishTime {
    pub fn is_fallback(&self) -> bool {
        self.kind == PublishTimeKind::Fallback
    }
}

/// Normalized short post from the keyword search source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XhsNote {
    pub id: String,
    pub title: String,
    pub user_nickname: Option<String>,
    pub user_avatar: Option<String>,
    pub user_id: Option<String>,
    pub liked_count: Option<i64>,
    pub collected_count: Option<i64>,
    pub comment_count: Option<i64>,
    pub shared_count: Option<i64>,
    pub cover_url: Option<String>,
    pub publish_time: Option<DateTime<Utc>>,
    /// Raw upstream time text, kept only when it could not be parsed.
    pub publish_time_raw: Option<String>,
    /// Preview image URLs as served upstream.
    pub image_arr: Vec<String>,
    /// Offloaded copies of `image_arr`; failed uploads are omitted.
    pub image_arr_new: Vec<String>,
    pub synced: bool,
}

/// Normalized public-account article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GzhArticle {
    pub id: String,
    pub title: String,
    pub digest: Option<String>,
    /// The account ghid, under the same field name short posts use for their author.
    pub user_nickname: String,
    pub account_id: String,
    pub content_url: Option<String>,
    pub source_url: Option<String>,
    pub cover_url: Option<String>,
    pub publish_time: Option<DateTime<Utc>>,
    pub is_original: bool,
    pub synced: bool,
    pub description: Option<String>,
}

/// Shared contract between the extractors and the persistence layer.
pub trait CanonicalRecord: Serialize + Clone + Send + Sync + 'static {
    fn source() -> SourceKind;
    fn table_schema() -> &'static TableSchema;
    /// Natural key; dedup and upsert idempotency hinge on it.
    fn id(&self) -> &str;
    fn title(&self) -> &str;
    fn to_row(&self) -> RelationalRow;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    BigInt,
    Boolean,
    TextArray,
    Timestamptz,
}

impl ColumnType {
    pub fn sql(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::BigInt => "BIGINT",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::TextArray => "TEXT[]",
            ColumnType::Timestamptz => "TIMESTAMPTZ",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub column_type: ColumnType,
    pub modifier: &'static str,
}

impl ColumnDef {
    pub const fn new(name: &'static str, column_type: ColumnType) -> Self {
        Self {
            name,
            column_type,
            modifier: "",
        }
    }

    pub const fn with_modifier(self, modifier: &'static str) -> Self {
        Self {
            name: self.name,
            column_type: self.column_type,
            modifier,
        }
    }
}

/// Static description of one source table; all SQL text is rendered from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSchema {
    pub name: &'static str,
    pub key_column: &'static str,
    pub columns: &'static [ColumnDef],
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn create_table_sql(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(|c| {
                if c.modifier.is_empty() {
                    format!("{} {}", c.name, c.column_type.sql())
                } else {
                    format!("{} {} {}", c.name, c.column_type.sql(), c.modifier)
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("CREATE TABLE IF NOT EXISTS {} ({})", self.name, columns)
    }

    pub fn insert_ignore_sql(&self, columns: &[&str]) -> String {
        let placeholders = (1..=columns.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO NOTHING",
            self.name,
            columns.join(", "),
            placeholders,
            self.key_column
        )
    }

    pub fn select_column_sql(&self, column: &str) -> String {
        format!(
            "SELECT {} FROM {} WHERE {} = $1 LIMIT 1",
            column, self.name, self.key_column
        )
    }

    pub fn update_column_sql(&self, column: &str) -> String {
        format!(
            "UPDATE {} SET {} = $1 WHERE {} = $2",
            self.name, column, self.key_column
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(Option<String>),
    BigInt(Option<i64>),
    Boolean(bool),
    TextArray(Vec<String>),
    Timestamptz(Option<DateTime<Utc>>),
}

impl SqlValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(v) => v.as_deref(),
            _ => None,
        }
    }
}

/// Ordered column/value pairs for one insert statement.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RelationalRow {
    values: Vec<(&'static str, SqlValue)>,
}

impl RelationalRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: &'static str, value: SqlValue) -> Self {
        self.set(column, value);
        self
    }

    pub fn set(&mut self, column: &'static str, value: SqlValue) {
        match self.values.iter_mut().find(|(c, _)| *c == column) {
            Some(slot) => slot.1 = value,
            None => self.values.push((column, value)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.values
            .iter()
            .find(|(c, _)| *c == column)
            .map(|(_, v)| v)
    }

    pub fn columns(&self) -> Vec<&'static str> {
        self.values.iter().map(|(c, _)| *c).collect()
    }

    pub fn values(&self) -> impl Iterator<Item = &SqlValue> {
        self.values.iter().map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

pub static XHS_NOTES_TABLE: TableSchema = TableSchema {
    name: "xhs_notes",
    key_column: "id",
    columns: &[
        ColumnDef::new("id", ColumnType::Text).with_modifier("PRIMARY KEY"),
        ColumnDef::new("title", ColumnType::Text),
        ColumnDef::new("user_nickname", ColumnType::Text),
        ColumnDef::new("user_avatar", ColumnType::Text),
        ColumnDef::new("user_id", ColumnType::Text),
        ColumnDef::new("liked_count", ColumnType::BigInt),
        ColumnDef::new("collected_count", ColumnType::BigInt),
        ColumnDef::new("comment_count", ColumnType::BigInt),
        ColumnDef::new("shared_count", ColumnType::BigInt),
        ColumnDef::new("cover_url", ColumnType::Text),
        ColumnDef::new("publish_time", ColumnType::Timestamptz),
        ColumnDef::new("publish_time_raw", ColumnType::Text),
        ColumnDef::new("image_arr", ColumnType::TextArray),
        ColumnDef::new("image_arr_new", ColumnType::TextArray),
        ColumnDef::new("synced", ColumnType::Boolean).with_modifier("DEFAULT FALSE"),
    ],
};

pub static GZH_NOTES_TABLE: TableSchema = TableSchema {
    name: "gzh_notes",
    key_column: "id",
    columns: &[
        ColumnDef::new("id", ColumnType::Text).with_modifier("PRIMARY KEY"),
        ColumnDef::new("title", ColumnType::Text),
        ColumnDef::new("digest", ColumnType::Text),
        ColumnDef::new("user_nickname", ColumnType::Text),
        ColumnDef::new("account_id", ColumnType::Text),
        ColumnDef::new("content_url", ColumnType::Text),
        ColumnDef::new("source_url", ColumnType::Text),
        ColumnDef::new("cover_url", ColumnType::Text),
        ColumnDef::new("publish_time", ColumnType::Timestamptz),
        ColumnDef::new("is_original", ColumnType::Boolean),
        ColumnDef::new("synced", ColumnType::Boolean).with_modifier("DEFAULT FALSE"),
        ColumnDef::new(ENRICHMENT_COLUMN, ColumnType::Text),
    ],
};

fn text(value: &str) -> SqlValue {
    SqlValue::Text(Some(value.to_string()))
}

fn opt_text(value: &Option<String>) -> SqlValue {
    SqlValue::Text(value.clone())
}

impl CanonicalRecord for XhsNote {
    fn source() -> SourceKind {
        SourceKind::Xhs
    }

    fn table_schema() -> &'static TableSchema {
        &XHS_NOTES_TABLE
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn to_row(&self) -> RelationalRow {
        RelationalRow::new()
            .with("id", text(&self.id))
            .with("title", text(&self.title))
            .with("user_nickname", opt_text(&self.user_nickname))
            .with("user_avatar", opt_text(&self.user_avatar))
            .with("user_id", opt_text(&self.user_id))
            .with("liked_count", SqlValue::BigInt(self.liked_count))
            .with("collected_count", SqlValue::BigInt(self.collected_count))
            .with("comment_count", SqlValue::BigInt(self.comment_count))
            .with("shared_count", SqlValue::BigInt(self.shared_count))
            .with("cover_url", opt_text(&self.cover_url))
            .with("publish_time", SqlValue::Timestamptz(self.publish_time))
            .with("publish_time_raw", opt_text(&self.publish_time_raw))
            .with("image_arr", SqlValue::TextArray(self.image_arr.clone()))
            .with("image_arr_new", SqlValue::TextArray(self.image_arr_new.clone()))
            .with("synced", SqlValue::Boolean(self.synced))
    }
}

impl CanonicalRecord for GzhArticle {
    fn source() -> SourceKind {
        SourceKind::Gzh
    }

    fn table_schema() -> &'static TableSchema {
        &GZH_NOTES_TABLE
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn to_row(&self) -> RelationalRow {
        RelationalRow::new()
            .with("id", text(&self.id))
            .with("title", text(&self.title))
            .with("digest", opt_text(&self.digest))
            .with("user_nickname", text(&self.user_nickname))
            .with("account_id", text(&self.account_id))
            .with("content_url", opt_text(&self.content_url))
            .with("source_url", opt_text(&self.source_url))
            .with("cover_url", opt_text(&self.cover_url))
            .with("publish_time", SqlValue::Timestamptz(self.publish_time))
            .with("is_original", SqlValue::Boolean(self.is_original))
            .with("synced", SqlValue::Boolean(self.synced))
            .with(ENRICHMENT_COLUMN, opt_text(&self.description))
    }
}
