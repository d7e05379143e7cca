//! Source adapter contracts + extractors for the short-post search and public-account sources.

use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, Utc};
use notesync_core::{
    CanonicalRecord, GzhArticle, PublishTime, PublishTimeKind, SourceKind, XhsNote,
};
use notesync_storage::{ApiRequest, MediaOffload};
use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "notesync-adapters";

pub const XHS_SEARCH_PATH: &str = "/api/v1/xiaohongshu/web_v2/fetch_search_notes";
pub const GZH_ARTICLE_LIST_PATH: &str = "/api/v1/wechat_mp/web/fetch_mp_article_list";
pub const GZH_ARTICLE_DETAIL_PATH: &str = "/api/v1/wechat_mp/web/fetch_mp_article_detail_json";

const HOURS_AGO_MARKER: &str = "小时前";
const PREVIEW_IMAGE_SCENE: &str = "WB_PRV";
const PUBLISH_TIME_TAG: &str = "publish_time";

static FULL_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{2})-(\d{2})$").expect("static regex"));
static MONTH_DAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{2})-(\d{2})$").expect("static regex"));
static DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)").expect("static regex"));

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("missing required field {0}")]
    MissingField(&'static str),
    #[error("malformed item: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One listing page as reported by the upstream.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ListingPage {
    pub items: Vec<JsonValue>,
    pub has_more: bool,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    type Record: CanonicalRecord;

    fn source(&self) -> SourceKind {
        Self::Record::source()
    }

    fn listing_request(&self, key: &str, page: u32) -> ApiRequest;

    /// Reads the item list and the continuation flag out of the envelope's `data`.
    fn parse_listing(&self, data: &JsonValue) -> ListingPage;

    fn extract(
        &self,
        key: &str,
        item: &JsonValue,
        now: DateTime<Utc>,
    ) -> Result<Self::Record, AdapterError>;

    async fn offload_media(&self, _record: &mut Self::Record, _offload: &dyn MediaOffload) {}

    /// Second, detail-level request used by the backfill pass. `None` means nothing to backfill.
    fn detail_request(&self, _record: &Self::Record) -> Option<ApiRequest> {
        None
    }

    fn parse_detail(&self, _data: &JsonValue) -> Option<String> {
        None
    }
}

/// Result of running an adapter's extractor over one page of raw items.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractOutcome<R> {
    pub records: Vec<R>,
    pub discarded: usize,
    pub failed: usize,
}

/// Extracts every item, isolating malformed ones and applying the source's blank-title rule.
pub fn extract_items<A: SourceAdapter>(
    adapter: &A,
    key: &str,
    items: &[JsonValue],
    now: DateTime<Utc>,
) -> ExtractOutcome<A::Record> {
    let discards_blank = adapter.source().discards_blank_titles();
    let mut outcome = ExtractOutcome {
        records: Vec::with_capacity(items.len()),
        discarded: 0,
        failed: 0,
    };
    for (index, item) in items.iter().enumerate() {
        match adapter.extract(key, item, now) {
            Ok(record) if discards_blank && record.title().trim().is_empty() => {
                debug!(source = %adapter.source(), id = record.id(), "discarding item with blank title");
                outcome.discarded += 1;
            }
            Ok(record) => outcome.records.push(record),
            Err(err) => {
                warn!(source = %adapter.source(), key, index, error = %err, "skipping malformed item");
                outcome.failed += 1;
            }
        }
    }
    outcome
}

fn midnight_utc(year: i32, month: u32, day: u32) -> Option<DateTime<Utc>> {
    NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
}

fn capture_u32(caps: &regex::Captures<'_>, index: usize) -> Option<u32> {
    caps.get(index)?.as_str().parse().ok()
}

/// Parses upstream publish-time text: `YYYY-MM-DD`, `MM-DD` (current year) or `N小时前`.
/// Anything else resolves to `now` with [`PublishTimeKind::Fallback`].
pub fn parse_publish_time(text: &str, now: DateTime<Utc>) -> PublishTime {
    let text = text.trim();

    if let Some(caps) = FULL_DATE.captures(text) {
        let year = caps.get(1).and_then(|m| m.as_str().parse::<i32>().ok());
        let at = year.and_then(|y| midnight_utc(y, capture_u32(&caps, 2)?, capture_u32(&caps, 3)?));
        return match at {
            Some(at) => PublishTime {
                at,
                kind: PublishTimeKind::Absolute,
            },
            None => fallback_time(text, now),
        };
    }

    if let Some(caps) = MONTH_DAY.captures(text) {
        let at = capture_u32(&caps, 1)
            .zip(capture_u32(&caps, 2))
            .and_then(|(month, day)| midnight_utc(now.year(), month, day));
        return match at {
            Some(at) => PublishTime {
                at,
                kind: PublishTimeKind::MonthDay,
            },
            None => fallback_time(text, now),
        };
    }

    if text.contains(HOURS_AGO_MARKER) {
        let at = DIGITS
            .captures(text)
            .and_then(|caps| caps.get(1)?.as_str().parse::<i64>().ok())
            .and_then(TimeDelta::try_hours)
            .and_then(|delta| now.checked_sub_signed(delta));
        if let Some(at) = at {
            return PublishTime {
                at,
                kind: PublishTimeKind::HoursAgo,
            };
        }
    }

    fallback_time(text, now)
}

fn fallback_time(text: &str, now: DateTime<Utc>) -> PublishTime {
    warn!(text, "unrecognized publish time; using fetch time");
    PublishTime {
        at: now,
        kind: PublishTimeKind::Fallback,
    }
}

/// Engagement counters arrive as numbers or display strings such as `"1.2万"` or `"10+"`.
pub fn parse_count(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(finite_count)),
        JsonValue::String(s) => {
            let text = s.trim().trim_end_matches('+').trim();
            if let Some(tens_of_thousands) = text.strip_suffix('万') {
                let value = tens_of_thousands.trim().parse::<f64>().ok()?;
                finite_count(value * 10_000.0)
            } else {
                text.parse::<i64>().ok()
            }
        }
        _ => None,
    }
}

fn finite_count(value: f64) -> Option<i64> {
    let rounded = value.round();
    (rounded.is_finite() && rounded >= i64::MIN as f64 && rounded < i64::MAX as f64)
        .then_some(rounded as i64)
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn text_or_none(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Natural keys show up as strings or bare numbers depending on the endpoint.
fn key_string(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) => text_or_none(Some(s.clone())),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn json_array(value: &JsonValue, key: &str) -> Vec<JsonValue> {
    value
        .get(key)
        .and_then(JsonValue::as_array)
        .cloned()
        .unwrap_or_default()
}

fn json_flag(value: &JsonValue, key: &str) -> bool {
    value.get(key).and_then(JsonValue::as_bool).unwrap_or(false)
}

#[derive(Debug, Deserialize)]
struct RawXhsItem {
    #[serde(default)]
    id: Option<JsonValue>,
    #[serde(default, deserialize_with = "null_as_default")]
    note_card: RawNoteCard,
}

#[derive(Debug, Default, Deserialize)]
struct RawNoteCard {
    #[serde(default)]
    display_title: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    user: RawXhsUser,
    #[serde(default, deserialize_with = "null_as_default")]
    interact_info: RawInteractInfo,
    #[serde(default, deserialize_with = "null_as_default")]
    cover: RawCover,
    #[serde(default, deserialize_with = "null_as_default")]
    image_list: Vec<RawImage>,
    #[serde(default, deserialize_with = "null_as_default")]
    corner_tag_info: Vec<RawCornerTag>,
}

#[derive(Debug, Default, Deserialize)]
struct RawXhsUser {
    #[serde(default)]
    nick_name: Option<String>,
    #[serde(default)]
    nickname: Option<String>,
    #[serde(default)]
    avatar: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawInteractInfo {
    #[serde(default)]
    liked_count: Option<JsonValue>,
    #[serde(default)]
    collected_count: Option<JsonValue>,
    #[serde(default)]
    comment_count: Option<JsonValue>,
    #[serde(default)]
    shared_count: Option<JsonValue>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCover {
    #[serde(default)]
    url_default: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawImage {
    #[serde(default, deserialize_with = "null_as_default")]
    info_list: Vec<RawImageInfo>,
}

#[derive(Debug, Default, Deserialize)]
struct RawImageInfo {
    #[serde(default)]
    image_scene: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCornerTag {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

fn count_of(value: &Option<JsonValue>) -> Option<i64> {
    value.as_ref().and_then(parse_count)
}

/// Keyword search over short posts.
#[derive(Debug, Clone, Copy, Default)]
pub struct XhsSearchAdapter;

#[async_trait]
impl SourceAdapter for XhsSearchAdapter {
    type Record = XhsNote;

    fn listing_request(&self, key: &str, page: u32) -> ApiRequest {
        ApiRequest::new(XHS_SEARCH_PATH)
            .param("keywords", key)
            .param("page", page)
            .param("sort_type", "general")
            .param("note_type", 0)
    }

    fn parse_listing(&self, data: &JsonValue) -> ListingPage {
        ListingPage {
            items: json_array(data, "items"),
            has_more: json_flag(data, "has_more"),
        }
    }

    fn extract(
        &self,
        _key: &str,
        item: &JsonValue,
        now: DateTime<Utc>,
    ) -> Result<XhsNote, AdapterError> {
        let raw = RawXhsItem::deserialize(item)?;
        let id = key_string(raw.id.as_ref()).ok_or(AdapterError::MissingField("id"))?;
        let card = raw.note_card;

        let image_arr = card
            .image_list
            .iter()
            .filter_map(|image| {
                image
                    .info_list
                    .iter()
                    .find(|info| info.image_scene.as_deref() == Some(PREVIEW_IMAGE_SCENE))
                    .and_then(|info| text_or_none(info.url.clone()))
            })
            .collect::<Vec<_>>();

        let publish_text = card
            .corner_tag_info
            .iter()
            .find(|tag| tag.kind.as_deref() == Some(PUBLISH_TIME_TAG))
            .and_then(|tag| text_or_none(tag.text.clone()));
        let (publish_time, publish_time_raw) = match publish_text {
            Some(text) => {
                let parsed = parse_publish_time(&text, now);
                (Some(parsed.at), parsed.is_fallback().then_some(text))
            }
            None => (None, None),
        };

        Ok(XhsNote {
            id,
            title: card.display_title.unwrap_or_default().trim().to_string(),
            user_nickname: text_or_none(card.user.nick_name).or(text_or_none(card.user.nickname)),
            user_avatar: text_or_none(card.user.avatar),
            user_id: text_or_none(card.user.user_id),
            liked_count: count_of(&card.interact_info.liked_count),
            collected_count: count_of(&card.interact_info.collected_count),
            comment_count: count_of(&card.interact_info.comment_count),
            shared_count: count_of(&card.interact_info.shared_count),
            cover_url: text_or_none(card.cover.url_default),
            publish_time,
            publish_time_raw,
            image_arr,
            image_arr_new: Vec::new(),
            synced: false,
        })
    }

    async fn offload_media(&self, record: &mut XhsNote, offload: &dyn MediaOffload) {
        let mut uploaded = Vec::with_capacity(record.image_arr.len());
        for url in &record.image_arr {
            match offload.upload(url).await {
                Ok(stored) => uploaded.push(stored),
                Err(err) => {
                    warn!(id = %record.id, url = %url, error = %err, "image offload failed; keeping source url only");
                }
            }
        }
        record.image_arr_new = uploaded;
    }
}

#[derive(Debug, Deserialize)]
struct RawGzhArticle {
    #[serde(default)]
    comment_topic_id: Option<JsonValue>,
    #[serde(rename = "Title", default)]
    title: Option<String>,
    #[serde(rename = "Digest", default)]
    digest: Option<String>,
    #[serde(rename = "ContentUrl", default)]
    content_url: Option<String>,
    #[serde(rename = "SourceUrl", default)]
    source_url: Option<String>,
    #[serde(rename = "CoverImgUrl", default)]
    cover_url: Option<String>,
    #[serde(default)]
    send_time: Option<JsonValue>,
    #[serde(rename = "IsOriginal", default)]
    is_original: Option<JsonValue>,
}

fn epoch_seconds(value: Option<&JsonValue>) -> Option<DateTime<Utc>> {
    let seconds = match value? {
        JsonValue::Number(n) => n.as_i64()?,
        JsonValue::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    DateTime::from_timestamp(seconds, 0)
}

fn truthy(value: Option<&JsonValue>) -> bool {
    match value {
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::Number(n)) => n.as_i64().is_some_and(|v| v != 0),
        Some(JsonValue::String(s)) => matches!(s.trim(), "1" | "true"),
        _ => false,
    }
}

/// Article listings for one public account (keyed by ghid), with full-text backfill.
#[derive(Debug, Clone, Copy, Default)]
pub struct GzhArticleAdapter;

#[async_trait]
impl SourceAdapter for GzhArticleAdapter {
    type Record = GzhArticle;

    fn listing_request(&self, key: &str, page: u32) -> ApiRequest {
        ApiRequest::new(GZH_ARTICLE_LIST_PATH)
            .param("ghid", key)
            .param("page", page)
    }

    fn parse_listing(&self, data: &JsonValue) -> ListingPage {
        ListingPage {
            items: json_array(data, "list"),
            has_more: json_flag(data, "has_next_page"),
        }
    }

    fn extract(
        &self,
        key: &str,
        item: &JsonValue,
        _now: DateTime<Utc>,
    ) -> Result<GzhArticle, AdapterError> {
        let raw = RawGzhArticle::deserialize(item)?;
        let id = key_string(raw.comment_topic_id.as_ref())
            .ok_or(AdapterError::MissingField("comment_topic_id"))?;

        Ok(GzhArticle {
            id,
            title: raw.title.unwrap_or_default().trim().to_string(),
            digest: text_or_none(raw.digest),
            user_nickname: key.to_string(),
            account_id: key.to_string(),
            content_url: text_or_none(raw.content_url),
            source_url: text_or_none(raw.source_url),
            cover_url: text_or_none(raw.cover_url),
            publish_time: epoch_seconds(raw.send_time.as_ref()),
            is_original: truthy(raw.is_original.as_ref()),
            synced: false,
            description: None,
        })
    }

    fn detail_request(&self, record: &GzhArticle) -> Option<ApiRequest> {
        let url = record.content_url.as_deref()?;
        Some(ApiRequest::new(GZH_ARTICLE_DETAIL_PATH).param("url", url))
    }

    fn parse_detail(&self, data: &JsonValue) -> Option<String> {
        json_str(data, &["content", "article", "full_text"])
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(ToString::to_string)
    }
}
