//! Upstream API fetch client, document/relational store handles and media offload for notesync.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use mongodb::bson::{self, doc, Document};
use notesync_core::{RelationalRow, SqlValue, TableSchema};
use reqwest::header;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{Postgres, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "notesync-storage";

pub const DEFAULT_API_BASE_URL: &str = "https://api.tikhub.io";

/// Envelope `code` the upstream uses for success.
pub const API_SUCCESS_CODE: i64 = 200;

/// Identifier field the document store assigns; it has no relational column.
pub const DOCUMENT_ID_FIELD: &str = "_id";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub bearer_token: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            bearer_token: None,
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// One GET against the upstream API: a path below the base URL plus query pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiRequest {
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            query: Vec::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiEnvelope {
    pub code: i64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: JsonValue,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("api code {code} for {path}: {message}")]
    ApiCode {
        code: i64,
        path: String,
        message: String,
    },
    #[error("invalid response body from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn get_json(&self, request: &ApiRequest) -> Result<ApiEnvelope, FetchError>;
}

/// Authenticated JSON client for one upstream credential. Ambient proxies are ignored.
#[derive(Debug)]
pub struct ApiFetcher {
    client: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl ApiFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .no_proxy()
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            bearer_token: config.bearer_token,
        })
    }

    pub fn url_for(&self, request: &ApiRequest) -> String {
        format!("{}/{}", self.base_url, request.path.trim_start_matches('/'))
    }

    async fn fetch_envelope(
        &self,
        url: &str,
        request: &ApiRequest,
    ) -> Result<ApiEnvelope, FetchError> {
        let mut builder = self
            .client
            .get(url)
            .query(&request.query)
            .header(header::ACCEPT, "application/json");
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }

        let resp = builder.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        let body = resp.bytes().await?;
        let envelope: ApiEnvelope =
            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                path: request.path.clone(),
                source,
            })?;
        if envelope.code != API_SUCCESS_CODE {
            return Err(FetchError::ApiCode {
                code: envelope.code,
                path: request.path.clone(),
                message: envelope.message.unwrap_or_default(),
            });
        }

        debug!(bytes = body.len(), "fetched upstream response");
        Ok(envelope)
    }
}

#[async_trait]
impl PageFetcher for ApiFetcher {
    async fn get_json(&self, request: &ApiRequest) -> Result<ApiEnvelope, FetchError> {
        let url = self.url_for(request);
        let span = info_span!("http_fetch", path = %request.path);
        self.fetch_envelope(&url, request).instrument(span).await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("mongodb: {0}")]
    Mongo(#[from] mongodb::error::Error),
    #[error("bson encoding: {0}")]
    Bson(#[from] bson::ser::Error),
    #[error("postgres: {0}")]
    Postgres(#[from] sqlx::Error),
    #[error("{0}")]
    Message(String),
}

/// Equality filter on a single document field.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentFilter {
    pub field: String,
    pub equals: JsonValue,
}

impl DocumentFilter {
    pub fn eq(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self {
            field: field.into(),
            equals: value.into(),
        }
    }

    fn matches(&self, document: &JsonValue) -> bool {
        document.get(&self.field) == Some(&self.equals)
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Bulk insert; returns the number of documents written.
    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<JsonValue>,
    ) -> Result<usize, StoreError>;

    /// Sets the fields of `patch` on the first matching document; returns the match count.
    async fn update_one(
        &self,
        collection: &str,
        filter: &DocumentFilter,
        patch: JsonValue,
    ) -> Result<u64, StoreError>;

    async fn list_collections(&self) -> Result<Vec<String>, StoreError>;
}

pub struct MongoDocumentStore {
    database: mongodb::Database,
}

impl MongoDocumentStore {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, StoreError> {
        let client = mongodb::Client::with_uri_str(uri).await?;
        Ok(Self {
            database: client.database(database),
        })
    }
}

fn to_bson_document(value: &JsonValue) -> Result<Document, StoreError> {
    if !value.is_object() {
        return Err(StoreError::Message(format!(
            "expected a JSON object document, got {value}"
        )));
    }
    Ok(bson::to_document(value)?)
}

#[async_trait]
impl DocumentStore for MongoDocumentStore {
    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<JsonValue>,
    ) -> Result<usize, StoreError> {
        if documents.is_empty() {
            return Ok(0);
        }
        let docs = documents
            .iter()
            .map(to_bson_document)
            .collect::<Result<Vec<_>, _>>()?;
        let result = self
            .database
            .collection::<Document>(collection)
            .insert_many(docs)
            .await?;
        Ok(result.inserted_ids.len())
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &DocumentFilter,
        patch: JsonValue,
    ) -> Result<u64, StoreError> {
        let mut filter_doc = Document::new();
        filter_doc.insert(filter.field.clone(), bson::to_bson(&filter.equals)?);
        let set = to_bson_document(&patch)?;
        let result = self
            .database
            .collection::<Document>(collection)
            .update_one(filter_doc, doc! { "$set": set })
            .await?;
        Ok(result.matched_count)
    }

    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.database.list_collection_names().await?)
    }
}

/// Process-local document store; assigns `_id` the way the real store does.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: Mutex<BTreeMap<String, Vec<JsonValue>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn documents(&self, collection: &str) -> Vec<JsonValue> {
        self.collections
            .lock()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<JsonValue>,
    ) -> Result<usize, StoreError> {
        let mut prepared = Vec::with_capacity(documents.len());
        for mut document in documents {
            let Some(object) = document.as_object_mut() else {
                return Err(StoreError::Message(format!(
                    "expected a JSON object document, got {document}"
                )));
            };
            object
                .entry(DOCUMENT_ID_FIELD)
                .or_insert_with(|| JsonValue::String(Uuid::new_v4().to_string()));
            prepared.push(document);
        }
        let count = prepared.len();
        let mut map = self.collections.lock().await;
        map.entry(collection.to_string()).or_default().extend(prepared);
        Ok(count)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &DocumentFilter,
        patch: JsonValue,
    ) -> Result<u64, StoreError> {
        let JsonValue::Object(fields) = patch else {
            return Err(StoreError::Message("update patch must be a JSON object".to_string()));
        };
        let mut map = self.collections.lock().await;
        let Some(document) = map
            .get_mut(collection)
            .and_then(|docs| docs.iter_mut().find(|d| filter.matches(d)))
        else {
            return Ok(0);
        };
        if let Some(object) = document.as_object_mut() {
            object.extend(fields);
        }
        Ok(1)
    }

    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.collections.lock().await.keys().cloned().collect())
    }
}

#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// `CREATE TABLE IF NOT EXISTS`; safe to call before every batch.
    async fn ensure_table(&self, schema: &TableSchema) -> Result<(), StoreError>;

    /// Insert with `ON CONFLICT (key) DO NOTHING`. Returns `false` when the key already existed.
    async fn insert_ignore(
        &self,
        schema: &TableSchema,
        row: &RelationalRow,
    ) -> Result<bool, StoreError>;

    async fn fetch_text(
        &self,
        schema: &TableSchema,
        id: &str,
        column: &str,
    ) -> Result<Option<String>, StoreError>;

    /// Field-level update keyed by id; returns rows affected.
    async fn update_text(
        &self,
        schema: &TableSchema,
        id: &str,
        column: &str,
        value: &str,
    ) -> Result<u64, StoreError>;
}

fn check_row(schema: &TableSchema, row: &RelationalRow) -> Result<(), StoreError> {
    if let Some(unknown) = row.columns().into_iter().find(|c| !schema.has_column(c)) {
        return Err(StoreError::Message(format!(
            "column {unknown} is not part of table {}",
            schema.name
        )));
    }
    if row.get(schema.key_column).and_then(SqlValue::as_text).is_none() {
        return Err(StoreError::Message(format!(
            "row for table {} has no {} value",
            schema.name, schema.key_column
        )));
    }
    Ok(())
}

fn check_column(schema: &TableSchema, column: &str) -> Result<&'static str, StoreError> {
    schema
        .columns
        .iter()
        .find(|c| c.name == column)
        .map(|c| c.name)
        .ok_or_else(|| {
            StoreError::Message(format!("column {column} is not part of table {}", schema.name))
        })
}

/// Postgres handle owning a single dedicated connection.
#[derive(Debug, Clone)]
pub struct PgRelationalStore {
    pool: PgPool,
}

impl PgRelationalStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &SqlValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        SqlValue::Text(v) => query.bind(v.clone()),
        SqlValue::BigInt(v) => query.bind(*v),
        SqlValue::Boolean(v) => query.bind(*v),
        SqlValue::TextArray(v) => query.bind(v.clone()),
        SqlValue::Timestamptz(v) => query.bind(*v),
    }
}

#[async_trait]
impl RelationalStore for PgRelationalStore {
    async fn ensure_table(&self, schema: &TableSchema) -> Result<(), StoreError> {
        sqlx::query(&schema.create_table_sql())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_ignore(
        &self,
        schema: &TableSchema,
        row: &RelationalRow,
    ) -> Result<bool, StoreError> {
        check_row(schema, row)?;
        let sql = schema.insert_ignore_sql(&row.columns());
        let mut query = sqlx::query(&sql);
        for value in row.values() {
            query = bind_value(query, value);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn fetch_text(
        &self,
        schema: &TableSchema,
        id: &str,
        column: &str,
    ) -> Result<Option<String>, StoreError> {
        let column = check_column(schema, column)?;
        let row = sqlx::query(&schema.select_column_sql(column))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.try_get::<Option<String>, _>(0)?),
            None => Ok(None),
        }
    }

    async fn update_text(
        &self,
        schema: &TableSchema,
        id: &str,
        column: &str,
        value: &str,
    ) -> Result<u64, StoreError> {
        let column = check_column(schema, column)?;
        let result = sqlx::query(&schema.update_column_sql(column))
            .bind(value)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Process-local relational store with the same key-conflict semantics as the Postgres table.
#[derive(Debug, Default)]
pub struct MemoryRelationalStore {
    tables: Mutex<BTreeMap<&'static str, BTreeMap<String, RelationalRow>>>,
}

impl MemoryRelationalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn row(&self, table: &str, id: &str) -> Option<RelationalRow> {
        self.tables
            .lock()
            .await
            .get(table)
            .and_then(|rows| rows.get(id))
            .cloned()
    }

    pub async fn row_count(&self, table: &str) -> usize {
        self.tables
            .lock()
            .await
            .get(table)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

fn missing_table(schema: &TableSchema) -> StoreError {
    StoreError::Message(format!("relation \"{}\" does not exist", schema.name))
}

#[async_trait]
impl RelationalStore for MemoryRelationalStore {
    async fn ensure_table(&self, schema: &TableSchema) -> Result<(), StoreError> {
        self.tables.lock().await.entry(schema.name).or_default();
        Ok(())
    }

    async fn insert_ignore(
        &self,
        schema: &TableSchema,
        row: &RelationalRow,
    ) -> Result<bool, StoreError> {
        check_row(schema, row)?;
        let id = row
            .get(schema.key_column)
            .and_then(SqlValue::as_text)
            .unwrap_or_default()
            .to_string();
        let mut tables = self.tables.lock().await;
        let rows = tables.get_mut(schema.name).ok_or_else(|| missing_table(schema))?;
        if rows.contains_key(&id) {
            return Ok(false);
        }
        rows.insert(id, row.clone());
        Ok(true)
    }

    async fn fetch_text(
        &self,
        schema: &TableSchema,
        id: &str,
        column: &str,
    ) -> Result<Option<String>, StoreError> {
        let column = check_column(schema, column)?;
        let tables = self.tables.lock().await;
        let rows = tables.get(schema.name).ok_or_else(|| missing_table(schema))?;
        Ok(rows
            .get(id)
            .and_then(|row| row.get(column))
            .and_then(SqlValue::as_text)
            .map(ToString::to_string))
    }

    async fn update_text(
        &self,
        schema: &TableSchema,
        id: &str,
        column: &str,
        value: &str,
    ) -> Result<u64, StoreError> {
        let column = check_column(schema, column)?;
        let mut tables = self.tables.lock().await;
        let rows = tables.get_mut(schema.name).ok_or_else(|| missing_table(schema))?;
        match rows.get_mut(id) {
            Some(row) => {
                row.set(column, SqlValue::Text(Some(value.to_string())));
                Ok(1)
            }
            None => Ok(0),
        }
    }
}

#[derive(Debug, Error)]
pub enum OffloadError {
    #[error("media offload is not configured")]
    Disabled,
    #[error("offload request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[async_trait]
pub trait MediaOffload: Send + Sync {
    /// Copies the media at `source_url` to object storage and returns its public URL.
    async fn upload(&self, source_url: &str) -> Result<String, OffloadError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledMediaOffload;

#[async_trait]
impl MediaOffload for DisabledMediaOffload {
    async fn upload(&self, _source_url: &str) -> Result<String, OffloadError> {
        Err(OffloadError::Disabled)
    }
}

#[derive(Debug, Clone)]
pub struct MediaOffloadConfig {
    pub upload_base_url: String,
    pub public_base_url: String,
    pub token: Option<String>,
    pub key_prefix: String,
    pub timeout: Duration,
}

/// Downloads media and PUTs it to an object-store endpoint under a content-hash key.
#[derive(Debug)]
pub struct HttpMediaOffload {
    client: reqwest::Client,
    config: MediaOffloadConfig,
}

impl HttpMediaOffload {
    pub fn new(config: MediaOffloadConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(config.timeout)
            .build()
            .context("building offload client")?;
        Ok(Self { client, config })
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn object_key(&self, bytes: &[u8]) -> String {
        let prefix = self.config.key_prefix.trim_matches('/');
        let hash = Self::sha256_hex(bytes);
        if prefix.is_empty() {
            format!("{hash}.jpg")
        } else {
            format!("{prefix}/{hash}.jpg")
        }
    }
}

#[async_trait]
impl MediaOffload for HttpMediaOffload {
    async fn upload(&self, source_url: &str) -> Result<String, OffloadError> {
        let resp = self.client.get(source_url).send().await?;
        if !resp.status().is_success() {
            return Err(OffloadError::HttpStatus {
                status: resp.status().as_u16(),
                url: source_url.to_string(),
            });
        }
        let bytes = resp.bytes().await?;
        let key = self.object_key(&bytes);

        let upload_url = format!(
            "{}/{}",
            self.config.upload_base_url.trim_end_matches('/'),
            key
        );
        let mut put = self
            .client
            .put(&upload_url)
            .header(header::CONTENT_TYPE, "image/jpeg")
            .body(bytes.to_vec());
        if let Some(token) = &self.config.token {
            put = put.bearer_auth(token);
        }
        let stored = put.send().await?;
        if !stored.status().is_success() {
            return Err(OffloadError::HttpStatus {
                status: stored.status().as_u16(),
                url: upload_url,
            });
        }

        debug!(source_url, key = %key, bytes = bytes.len(), "offloaded media");
        Ok(format!(
            "{}/{}",
            self.config.public_base_url.trim_end_matches('/'),
            key
        ))
    }
}
