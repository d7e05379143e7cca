use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use notesync_adapters::{
    GzhArticleAdapter, XhsSearchAdapter, GZH_ARTICLE_DETAIL_PATH, GZH_ARTICLE_LIST_PATH,
};
use notesync_core::{RelationalRow, SqlValue, TableSchema, GZH_NOTES_TABLE, XHS_NOTES_TABLE};
use notesync_storage::{
    ApiEnvelope, ApiRequest, DisabledMediaOffload, DocumentFilter, DocumentStore, FetchError,
    MediaOffload, MemoryDocumentStore, MemoryRelationalStore, OffloadError, PageFetcher,
    RelationalStore, StoreError,
};
use notesync_sync::{DriverSettings, Scraper, SourceDriver, StoreHandles};
use serde_json::{json, Value as JsonValue};

type Responder = Box<dyn Fn(&ApiRequest) -> Result<ApiEnvelope, FetchError> + Send + Sync>;

struct ScriptedFetcher {
    responder: Responder,
    calls: Mutex<Vec<ApiRequest>>,
}

impl ScriptedFetcher {
    fn new(
        responder: impl Fn(&ApiRequest) -> Result<ApiEnvelope, FetchError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls_to(&self, path: &str) -> Vec<ApiRequest> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn get_json(&self, request: &ApiRequest) -> Result<ApiEnvelope, FetchError> {
        self.calls.lock().unwrap().push(request.clone());
        (self.responder)(request)
    }
}

fn ok(data: JsonValue) -> Result<ApiEnvelope, FetchError> {
    Ok(ApiEnvelope {
        code: 200,
        message: None,
        data,
    })
}

fn api_error(request: &ApiRequest) -> Result<ApiEnvelope, FetchError> {
    Err(FetchError::ApiCode {
        code: 429,
        path: request.path.clone(),
        message: "rate limited".to_string(),
    })
}

fn page_of(request: &ApiRequest) -> u32 {
    request
        .query_value("page")
        .and_then(|p| p.parse().ok())
        .unwrap_or(0)
}

fn article(id: &str, title: &str) -> JsonValue {
    json!({
        "comment_topic_id": id,
        "Title": title,
        "Digest": format!("digest {id}"),
        "ContentUrl": format!("https://mp.weixin.qq.com/s/{id}"),
        "send_time": 1_725_179_400,
        "IsOriginal": 0
    })
}

fn gzh_page(items: Vec<JsonValue>, has_next_page: bool) -> Result<ApiEnvelope, FetchError> {
    ok(json!({"list": items, "has_next_page": has_next_page}))
}

fn detail(text: &str) -> Result<ApiEnvelope, FetchError> {
    ok(json!({"content": {"article": {"full_text": text}}}))
}

fn note(id: &str, title: &str, images: &[&str]) -> JsonValue {
    let image_list = images
        .iter()
        .map(|url| json!({"info_list": [{"image_scene": "WB_PRV", "url": url}]}))
        .collect::<Vec<_>>();
    json!({
        "id": id,
        "note_card": {
            "display_title": title,
            "user": {"nick_name": "builder"},
            "interact_info": {"liked_count": "12"},
            "image_list": image_list,
            "corner_tag_info": [{"type": "publish_time", "text": "2024-09-01"}]
        }
    })
}

fn settings(collection: &str, pages: u32) -> DriverSettings {
    DriverSettings {
        collection: collection.to_string(),
        pages,
        page_delay: Duration::ZERO,
    }
}

fn handles(
    documents: Arc<dyn DocumentStore>,
    relational: Arc<dyn RelationalStore>,
    media: Arc<dyn MediaOffload>,
) -> StoreHandles {
    StoreHandles {
        documents,
        relational,
        media,
    }
}

struct MemoryStores {
    documents: Arc<MemoryDocumentStore>,
    relational: Arc<MemoryRelationalStore>,
}

impl MemoryStores {
    fn new() -> Self {
        Self {
            documents: Arc::new(MemoryDocumentStore::new()),
            relational: Arc::new(MemoryRelationalStore::new()),
        }
    }

    fn handles(&self) -> StoreHandles {
        handles(
            self.documents.clone(),
            self.relational.clone(),
            Arc::new(DisabledMediaOffload),
        )
    }
}

fn gzh_driver(
    fetcher: Arc<ScriptedFetcher>,
    stores: StoreHandles,
    pages: u32,
) -> SourceDriver<GzhArticleAdapter> {
    SourceDriver::new(GzhArticleAdapter, fetcher, stores, settings("gzh_notes", pages))
}

fn text_of(row: &RelationalRow, column: &str) -> Option<String> {
    row.get(column)
        .and_then(SqlValue::as_text)
        .map(ToString::to_string)
}

#[tokio::test]
async fn pagination_stops_when_upstream_has_no_more_pages() {
    let fetcher = ScriptedFetcher::new(|_| gzh_page(vec![article("a1", "t")], false));
    let stores = MemoryStores::new();
    let driver = gzh_driver(fetcher.clone(), stores.handles(), 5);

    let report = driver.scrape_key("gh_1").await.unwrap();
    assert_eq!(report.pages_fetched, 1);
    assert_eq!(fetcher.calls_to(GZH_ARTICLE_LIST_PATH).len(), 1);
    assert_eq!(stores.relational.row_count("gzh_notes").await, 1);
}

#[tokio::test]
async fn pagination_is_bounded_by_the_page_budget() {
    let fetcher = ScriptedFetcher::new(|request| {
        if request.path == GZH_ARTICLE_DETAIL_PATH {
            return detail("body");
        }
        let page = page_of(request);
        gzh_page(vec![article(&format!("p{page}"), "t")], true)
    });
    let stores = MemoryStores::new();
    let driver = gzh_driver(fetcher.clone(), stores.handles(), 3);

    let report = driver.scrape_key("gh_1").await.unwrap();
    let pages = fetcher
        .calls_to(GZH_ARTICLE_LIST_PATH)
        .iter()
        .map(page_of)
        .collect::<Vec<_>>();
    assert_eq!(pages, vec![1, 2, 3]);
    assert_eq!(report.pages_fetched, 3);
    assert_eq!(report.persist.rows_inserted, 3);
}

#[tokio::test(start_paused = true)]
async fn pages_are_spaced_by_the_page_delay() {
    let fetcher = ScriptedFetcher::new(|request| {
        let page = page_of(request);
        gzh_page(vec![article(&format!("p{page}"), "t")], true)
    });
    let stores = MemoryStores::new();
    let driver = SourceDriver::new(
        GzhArticleAdapter,
        fetcher,
        stores.handles(),
        DriverSettings {
            collection: "gzh_notes".to_string(),
            pages: 3,
            page_delay: Duration::from_secs(1),
        },
    );

    let started = tokio::time::Instant::now();
    let run = driver.fetch_pages("gh_1").await;
    assert_eq!(run.pages_fetched, 3);
    assert_eq!(started.elapsed(), Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn single_page_runs_do_not_wait() {
    let fetcher = ScriptedFetcher::new(|_| gzh_page(vec![article("a1", "t")], false));
    let stores = MemoryStores::new();
    let driver = SourceDriver::new(
        GzhArticleAdapter,
        fetcher.clone(),
        stores.handles(),
        DriverSettings {
            collection: "gzh_notes".to_string(),
            pages: 5,
            page_delay: Duration::from_secs(1),
        },
    );

    let started = tokio::time::Instant::now();
    let run = driver.fetch_pages("gh_1").await;
    assert_eq!(run.pages_fetched, 1);
    assert_eq!(fetcher.calls_to(GZH_ARTICLE_LIST_PATH).len(), 1);
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test]
async fn upstream_error_stops_pagination_but_keeps_earlier_pages() {
    let fetcher = ScriptedFetcher::new(|request| match (request.path.as_str(), page_of(request)) {
        (GZH_ARTICLE_LIST_PATH, 1) => gzh_page(vec![article("a1", "t"), article("a2", "t")], true),
        (GZH_ARTICLE_LIST_PATH, _) => api_error(request),
        _ => detail("body"),
    });
    let stores = MemoryStores::new();
    let driver = gzh_driver(fetcher.clone(), stores.handles(), 10);

    let report = driver.scrape_key("gh_1").await.unwrap();
    assert_eq!(fetcher.calls_to(GZH_ARTICLE_LIST_PATH).len(), 2);
    assert_eq!(report.pages_fetched, 1);
    assert!(report.fetch_error.as_deref().unwrap_or_default().contains("429"));
    assert_eq!(stores.relational.row_count("gzh_notes").await, 2);
}

#[tokio::test]
async fn duplicate_ids_within_a_run_keep_the_first_payload() {
    let fetcher = ScriptedFetcher::new(|request| {
        if request.path == GZH_ARTICLE_DETAIL_PATH {
            return detail("body");
        }
        gzh_page(
            vec![article("dup", "first"), article("dup", "second"), article("dup", "third")],
            false,
        )
    });
    let stores = MemoryStores::new();
    let driver = gzh_driver(fetcher, stores.handles(), 1);

    let report = driver.scrape_key("gh_1").await.unwrap();
    assert_eq!(report.duplicates, 2);

    let documents = stores.documents.documents("gzh_notes").await;
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0]["title"], "first");

    let row = stores.relational.row("gzh_notes", "dup").await.unwrap();
    assert_eq!(text_of(&row, "title").as_deref(), Some("first"));
}

#[tokio::test]
async fn repeated_runs_leave_one_row_per_id() {
    let fetcher = ScriptedFetcher::new(|request| {
        if request.path == GZH_ARTICLE_DETAIL_PATH {
            return detail("body");
        }
        gzh_page(vec![article("a1", "t"), article("a2", "t")], false)
    });
    let stores = MemoryStores::new();
    let driver = gzh_driver(fetcher, stores.handles(), 1);

    let first = driver.scrape_key("gh_1").await.unwrap();
    let second = driver.scrape_key("gh_1").await.unwrap();
    assert_eq!(first.persist.rows_inserted, 2);
    assert_eq!(second.persist.rows_inserted, 0);
    assert_eq!(second.persist.rows_existing, 2);
    assert_eq!(stores.relational.row_count("gzh_notes").await, 2);
    // The document store has no natural-key constraint across runs.
    assert_eq!(stores.documents.documents("gzh_notes").await.len(), 4);
}

/// Rejects inserts for one id and delegates everything else.
struct RejectingRelational {
    inner: MemoryRelationalStore,
    reject_id: &'static str,
}

#[async_trait]
impl RelationalStore for RejectingRelational {
    async fn ensure_table(&self, schema: &TableSchema) -> Result<(), StoreError> {
        self.inner.ensure_table(schema).await
    }

    async fn insert_ignore(
        &self,
        schema: &TableSchema,
        row: &RelationalRow,
    ) -> Result<bool, StoreError> {
        if row.get("id").and_then(SqlValue::as_text) == Some(self.reject_id) {
            return Err(StoreError::Message("value too long for type".to_string()));
        }
        self.inner.insert_ignore(schema, row).await
    }

    async fn fetch_text(
        &self,
        schema: &TableSchema,
        id: &str,
        column: &str,
    ) -> Result<Option<String>, StoreError> {
        self.inner.fetch_text(schema, id, column).await
    }

    async fn update_text(
        &self,
        schema: &TableSchema,
        id: &str,
        column: &str,
        value: &str,
    ) -> Result<u64, StoreError> {
        self.inner.update_text(schema, id, column, value).await
    }
}

#[tokio::test]
async fn one_failing_row_does_not_abort_its_siblings() {
    let fetcher = ScriptedFetcher::new(|request| {
        if request.path == GZH_ARTICLE_DETAIL_PATH {
            return detail("body");
        }
        gzh_page(vec![article("A", "a"), article("B", "b"), article("C", "c")], false)
    });
    let relational = Arc::new(RejectingRelational {
        inner: MemoryRelationalStore::new(),
        reject_id: "B",
    });
    let documents = Arc::new(MemoryDocumentStore::new());
    let driver = gzh_driver(
        fetcher,
        handles(documents.clone(), relational.clone(), Arc::new(DisabledMediaOffload)),
        1,
    );

    let report = driver.scrape_key("gh_1").await.unwrap();
    assert_eq!(report.persist.rows_inserted, 2);
    assert_eq!(report.persist.rows_failed, 1);
    assert!(relational.inner.row("gzh_notes", "A").await.is_some());
    assert!(relational.inner.row("gzh_notes", "B").await.is_none());
    assert!(relational.inner.row("gzh_notes", "C").await.is_some());
    assert_eq!(documents.documents("gzh_notes").await.len(), 3);
}

struct UnreachableDocuments;

#[async_trait]
impl DocumentStore for UnreachableDocuments {
    async fn insert_many(
        &self,
        _collection: &str,
        _documents: Vec<JsonValue>,
    ) -> Result<usize, StoreError> {
        Err(StoreError::Message("server selection timeout".to_string()))
    }

    async fn update_one(
        &self,
        _collection: &str,
        _filter: &DocumentFilter,
        _patch: JsonValue,
    ) -> Result<u64, StoreError> {
        Err(StoreError::Message("server selection timeout".to_string()))
    }

    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        Err(StoreError::Message("server selection timeout".to_string()))
    }
}

#[tokio::test]
async fn document_store_outage_does_not_block_relational_writes() {
    let fetcher = ScriptedFetcher::new(|request| {
        if request.path == GZH_ARTICLE_DETAIL_PATH {
            return detail("full article");
        }
        gzh_page(vec![article("a1", "t")], false)
    });
    let relational = Arc::new(MemoryRelationalStore::new());
    let driver = gzh_driver(
        fetcher,
        handles(Arc::new(UnreachableDocuments), relational.clone(), Arc::new(DisabledMediaOffload)),
        1,
    );

    let report = driver.scrape_key("gh_1").await.unwrap();
    assert!(report.persist.document_error.is_some());
    assert_eq!(report.persist.rows_inserted, 1);
    assert_eq!(report.backfill.filled, 1);
    let row = relational.row("gzh_notes", "a1").await.unwrap();
    assert_eq!(text_of(&row, "description").as_deref(), Some("full article"));
}

#[tokio::test]
async fn backfill_fetches_each_detail_once() {
    let fetcher = ScriptedFetcher::new(|request| {
        if request.path == GZH_ARTICLE_DETAIL_PATH {
            let url = request.query_value("url").unwrap_or_default();
            return detail(&format!("text of {url}"));
        }
        gzh_page(vec![article("a1", "t"), article("a2", "t")], false)
    });
    let stores = MemoryStores::new();
    let driver = gzh_driver(fetcher.clone(), stores.handles(), 1);

    let first = driver.scrape_key("gh_1").await.unwrap();
    let second = driver.scrape_key("gh_1").await.unwrap();
    assert_eq!(first.backfill.filled, 2);
    assert_eq!(second.backfill.filled, 0);
    assert_eq!(second.backfill.already_present, 2);
    assert_eq!(fetcher.calls_to(GZH_ARTICLE_DETAIL_PATH).len(), 2);

    let row = stores.relational.row("gzh_notes", "a1").await.unwrap();
    assert_eq!(
        text_of(&row, "description").as_deref(),
        Some("text of https://mp.weixin.qq.com/s/a1")
    );
    let documents = stores.documents.documents("gzh_notes").await;
    let enriched = documents.iter().find(|d| d["id"] == "a1").unwrap();
    assert_eq!(enriched["description"], "text of https://mp.weixin.qq.com/s/a1");
}

#[tokio::test]
async fn failed_backfill_is_isolated_and_retried_next_run() {
    let fetcher = ScriptedFetcher::new(|request| {
        if request.path == GZH_ARTICLE_DETAIL_PATH {
            return match request.query_value("url") {
                Some(url) if url.ends_with("/bad") => api_error(request),
                Some(url) if url.ends_with("/empty") => detail("   "),
                _ => detail("fine"),
            };
        }
        let mut no_link = article("nolink", "t");
        no_link["ContentUrl"] = JsonValue::Null;
        gzh_page(
            vec![article("bad", "t"), article("empty", "t"), article("good", "t"), no_link],
            false,
        )
    });
    let stores = MemoryStores::new();
    let driver = gzh_driver(fetcher.clone(), stores.handles(), 1);

    let report = driver.scrape_key("gh_1").await.unwrap();
    assert_eq!(report.backfill.failed, 2);
    assert_eq!(report.backfill.filled, 1);
    assert_eq!(report.backfill.no_detail, 1);
    let empty = stores.relational.row("gzh_notes", "empty").await.unwrap();
    assert_eq!(text_of(&empty, "description"), None);

    driver.scrape_key("gh_1").await.unwrap();
    let detail_urls = fetcher
        .calls_to(GZH_ARTICLE_DETAIL_PATH)
        .iter()
        .filter_map(|r| r.query_value("url").map(ToString::to_string))
        .collect::<Vec<_>>();
    let count = |suffix: &str| detail_urls.iter().filter(|u| u.ends_with(suffix)).count();
    assert_eq!(count("/bad"), 2);
    assert_eq!(count("/empty"), 2);
    assert_eq!(count("/good"), 1);
}

#[tokio::test]
async fn blank_titles_are_dropped_for_short_posts_only() {
    let xhs_fetcher = ScriptedFetcher::new(|_| {
        ok(json!({"items": [note("n1", "kept", &[]), note("n2", "  ", &[])], "has_more": false}))
    });
    let xhs_stores = MemoryStores::new();
    let xhs = SourceDriver::new(
        XhsSearchAdapter,
        xhs_fetcher,
        xhs_stores.handles(),
        settings("xhs_notes", 1),
    );
    let report = xhs.scrape_key("moc").await.unwrap();
    assert_eq!(report.discarded, 1);
    assert!(xhs_stores.relational.row(XHS_NOTES_TABLE.name, "n1").await.is_some());
    assert!(xhs_stores.relational.row(XHS_NOTES_TABLE.name, "n2").await.is_none());
    assert_eq!(xhs_stores.documents.documents("xhs_notes").await.len(), 1);

    let gzh_fetcher = ScriptedFetcher::new(|request| {
        if request.path == GZH_ARTICLE_DETAIL_PATH {
            return detail("body");
        }
        gzh_page(vec![article("g1", "kept"), article("g2", "")], false)
    });
    let gzh_stores = MemoryStores::new();
    let gzh = gzh_driver(gzh_fetcher, gzh_stores.handles(), 1);
    let report = gzh.scrape_key("gh_1").await.unwrap();
    assert_eq!(report.discarded, 0);
    assert!(gzh_stores.relational.row(GZH_NOTES_TABLE.name, "g2").await.is_some());
}

struct PickyOffload;

#[async_trait]
impl MediaOffload for PickyOffload {
    async fn upload(&self, source_url: &str) -> Result<String, OffloadError> {
        if source_url.ends_with("broken.jpg") {
            return Err(OffloadError::HttpStatus {
                status: 404,
                url: source_url.to_string(),
            });
        }
        let name = source_url.rsplit('/').next().unwrap_or_default();
        Ok(format!("https://cdn.example.test/xhs_images/{name}"))
    }
}

#[tokio::test]
async fn offload_failures_keep_the_record_and_its_source_urls() {
    let fetcher = ScriptedFetcher::new(|_| {
        ok(json!({
            "items": [note("n1", "t", &["https://img/ok.jpg", "https://img/broken.jpg"])],
            "has_more": false
        }))
    });
    let stores = MemoryStores::new();
    let driver = SourceDriver::new(
        XhsSearchAdapter,
        fetcher,
        handles(stores.documents.clone(), stores.relational.clone(), Arc::new(PickyOffload)),
        settings("xhs_notes", 1),
    );
    driver.scrape_key("moc").await.unwrap();

    let row = stores.relational.row("xhs_notes", "n1").await.unwrap();
    assert_eq!(
        row.get("image_arr"),
        Some(&SqlValue::TextArray(vec![
            "https://img/ok.jpg".to_string(),
            "https://img/broken.jpg".to_string()
        ]))
    );
    assert_eq!(
        row.get("image_arr_new"),
        Some(&SqlValue::TextArray(vec![
            "https://cdn.example.test/xhs_images/ok.jpg".to_string()
        ]))
    );
    let documents = stores.documents.documents("xhs_notes").await;
    assert_eq!(documents[0]["image_arr_new"], json!(["https://cdn.example.test/xhs_images/ok.jpg"]));
    assert!(documents[0].get("_id").is_some());
}

#[tokio::test]
async fn scrape_all_moves_past_failing_keys() {
    let fetcher = ScriptedFetcher::new(|request| {
        if request.path == GZH_ARTICLE_DETAIL_PATH {
            return detail("body");
        }
        match request.query_value("ghid") {
            Some("gh_down") => api_error(request),
            Some(ghid) => gzh_page(vec![article(&format!("{ghid}-1"), "t")], false),
            None => api_error(request),
        }
    });
    let stores = MemoryStores::new();
    let driver = gzh_driver(fetcher.clone(), stores.handles(), 1);

    let keys = vec![
        "gh_down".to_string(),
        String::new(),
        "gh_up".to_string(),
        "gh_also_up".to_string(),
    ];
    driver.scrape_all(&keys).await;

    assert_eq!(fetcher.calls_to(GZH_ARTICLE_LIST_PATH).len(), 3);
    assert!(stores.relational.row("gzh_notes", "gh_up-1").await.is_some());
    assert!(stores.relational.row("gzh_notes", "gh_also_up-1").await.is_some());
    assert_eq!(stores.relational.row_count("gzh_notes").await, 2);
}
