//! Parsing of the JSON documents the external tool writes.
//!
//! Root-level problems (unreadable file, invalid JSON, wrong shape) are
//! errors for the whole artifact. Individual items are converted one at a
//! time so a single bad item can be skipped by the caller.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

use crate::error::ArtifactError;

const SITE_ORIGIN: &str = "https://www.reddit.com";

#[derive(Debug, Clone, PartialEq)]
pub struct ParentItem {
    pub natural_key: String,
    pub subject: Option<String>,
    pub title: String,
    pub body: Option<String>,
    pub url: Option<String>,
    pub permalink: Option<String>,
    pub author: Option<String>,
    pub created_utc: Option<String>,
    pub score: i64,
    pub upvote_ratio: Option<f64>,
    pub num_comments: i64,
    pub link_flair_text: Option<String>,
    pub distinguished: Option<String>,
    pub is_nsfw: bool,
    pub is_spoiler: bool,
    pub is_stickied: bool,
    pub is_locked: bool,
    pub is_self: bool,
    pub is_original_content: bool,
}

impl ParentItem {
    pub fn from_value(value: &Value) -> Result<Self, ArtifactError> {
        let object = value
            .as_object()
            .ok_or_else(|| ArtifactError::Item("item is not an object".to_string()))?;

        let natural_key = required_str(object, "id")?;
        let title = required_str(object, "title")?;

        Ok(Self {
            created_utc: timestamp_field(object, "created_utc", &natural_key)?,
            natural_key,
            subject: optional_str(object, "subreddit"),
            title,
            body: optional_str(object, "selftext"),
            url: optional_str(object, "url"),
            permalink: optional_str(object, "permalink"),
            author: optional_str(object, "author"),
            score: int_field(object, "score"),
            upvote_ratio: object.get("upvote_ratio").and_then(Value::as_f64),
            num_comments: int_field(object, "num_comments"),
            link_flair_text: optional_str(object, "link_flair_text"),
            distinguished: optional_str(object, "distinguished"),
            is_nsfw: bool_field(object, "nsfw"),
            is_spoiler: bool_field(object, "spoiler"),
            is_stickied: bool_field(object, "stickied"),
            is_locked: bool_field(object, "locked"),
            is_self: bool_field(object, "is_self"),
            is_original_content: bool_field(object, "is_original_content"),
        })
    }

    /// Absolute URL of the item's discussion page, used to scrape its children.
    pub fn canonical_url(&self) -> Option<String> {
        let permalink = self.permalink.as_deref()?.trim();
        if permalink.is_empty() {
            return None;
        }
        if permalink.starts_with("http://") || permalink.starts_with("https://") {
            Some(permalink.to_string())
        } else if permalink.starts_with('/') {
            Some(format!("{}{}", SITE_ORIGIN, permalink))
        } else {
            Some(format!("{}/{}", SITE_ORIGIN, permalink))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChildItem {
    pub natural_key: String,
    pub body: String,
    pub author: Option<String>,
    pub created_utc: Option<String>,
    pub score: i64,
    /// Raw parent reference: `t3_<parent item>` for top level, `t1_<child>` otherwise.
    pub parent_ref: Option<String>,
    /// Natural key of the top-level child this one descends from; `None` at top level.
    pub root_ref: Option<String>,
    pub depth: u32,
    pub link_ref: Option<String>,
    pub distinguished: Option<String>,
    pub is_submitter: bool,
    pub is_stickied: bool,
    pub is_edited: bool,
}

impl ChildItem {
    fn from_value(value: &Value, depth: u32, root_ref: Option<String>) -> Result<Self, ArtifactError> {
        let object = value
            .as_object()
            .ok_or_else(|| ArtifactError::Item("comment is not an object".to_string()))?;

        let natural_key = required_str(object, "id")?;
        let body = required_str(object, "body")?;

        let is_edited = match object.get("edited") {
            None | Some(Value::Null) | Some(Value::Bool(false)) => false,
            Some(_) => true,
        };

        Ok(Self {
            created_utc: timestamp_field(object, "created_utc", &natural_key)?,
            natural_key,
            body,
            author: optional_str(object, "author"),
            score: int_field(object, "score"),
            parent_ref: optional_str(object, "parent_id"),
            root_ref,
            depth,
            link_ref: optional_str(object, "link_id"),
            distinguished: optional_str(object, "distinguished"),
            is_submitter: bool_field(object, "is_submitter"),
            is_stickied: bool_field(object, "stickied"),
            is_edited,
        })
    }
}

/// Root of a parent artifact: the raw item list, converted lazily.
#[derive(Debug)]
pub struct ParentArtifact {
    pub path: PathBuf,
    pub items: Vec<Value>,
}

impl ParentArtifact {
    pub fn read(path: &Path) -> Result<Self, ArtifactError> {
        let root = read_json(path)?;
        let items = match root {
            Value::Array(items) => items,
            Value::Object(mut object) => match object.remove("data") {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(ArtifactError::Shape {
                        path: path.to_path_buf(),
                        reason: "expected a `data` array".to_string(),
                    })
                }
            },
            _ => {
                return Err(ArtifactError::Shape {
                    path: path.to_path_buf(),
                    reason: "expected an array or an object with `data`".to_string(),
                })
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            items,
        })
    }

    /// Each item converted independently, keeping position for logging.
    pub fn parse_items(&self) -> impl Iterator<Item = (usize, Result<ParentItem, ArtifactError>)> + '_ {
        self.items
            .iter()
            .enumerate()
            .map(|(index, value)| (index, ParentItem::from_value(value)))
    }
}

/// Root of a child artifact: the scraped URL and the flattened reply tree.
#[derive(Debug)]
pub struct ChildArtifact {
    pub path: PathBuf,
    pub url: Option<String>,
    pub parent_permalink: Option<String>,
    pub comments: Vec<Result<ChildItem, ArtifactError>>,
}

impl ChildArtifact {
    pub fn read(path: &Path) -> Result<Self, ArtifactError> {
        let root = read_json(path)?;
        let shape_error = |reason: &str| ArtifactError::Shape {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        let object = root
            .as_object()
            .ok_or_else(|| shape_error("expected an object"))?;
        let url = object
            .get("scrape_settings")
            .and_then(|settings| settings.get("url"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let data = object
            .get("data")
            .and_then(Value::as_object)
            .ok_or_else(|| shape_error("expected a `data` object"))?;
        let parent_permalink = data
            .get("submission_metadata")
            .and_then(|meta| meta.get("permalink"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let comments = data
            .get("comments")
            .and_then(Value::as_array)
            .ok_or_else(|| shape_error("expected a `data.comments` array"))?;

        Ok(Self {
            path: path.to_path_buf(),
            url,
            parent_permalink,
            comments: flatten_comments(comments),
        })
    }
}

/// Reads only `scrape_settings.url` from a child artifact, for locating.
pub fn child_artifact_url(path: &Path) -> Option<String> {
    let root = read_json(path).ok()?;
    root.get("scrape_settings")?
        .get("url")?
        .as_str()
        .map(str::to_string)
}

/// Flattens nested `replies` depth-first. When the document carries no
/// nesting, depth and root are rebuilt from the `parent_id` chain.
fn flatten_comments(comments: &[Value]) -> Vec<Result<ChildItem, ArtifactError>> {
    let nested = comments
        .iter()
        .any(|c| c.get("replies").and_then(Value::as_array).is_some_and(|r| !r.is_empty()));

    let mut flat = Vec::new();
    if nested {
        for comment in comments {
            walk_nested(comment, 0, None, &mut flat);
        }
    } else {
        flat.extend(comments.iter().map(|c| ChildItem::from_value(c, 0, None)));
        resolve_flat_threading(&mut flat);
    }
    flat
}

fn walk_nested(
    value: &Value,
    depth: u32,
    root: Option<String>,
    out: &mut Vec<Result<ChildItem, ArtifactError>>,
) {
    let item = ChildItem::from_value(value, depth, root.clone());
    // A rejected top-level comment still anchors its thread when it has an id.
    let next_root = match (&root, &item) {
        (Some(root), _) => Some(root.clone()),
        (None, Ok(item)) => Some(item.natural_key.clone()),
        (None, Err(_)) => value
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string),
    };
    out.push(item);

    if let Some(replies) = value.get("replies").and_then(Value::as_array) {
        for reply in replies {
            walk_nested(reply, depth + 1, next_root.clone(), out);
        }
    }
}

fn resolve_flat_threading(items: &mut [Result<ChildItem, ArtifactError>]) {
    let parents: HashMap<String, Option<String>> = items
        .iter()
        .filter_map(|item| item.as_ref().ok())
        .map(|item| (item.natural_key.clone(), item.parent_ref.clone()))
        .collect();

    for item in items.iter_mut().flatten() {
        let mut depth = 0;
        let mut root = None;
        let mut current = item.parent_ref.clone();
        // Bounded walk; a malformed cycle stops at the item count.
        while let Some(reference) = current.take() {
            let Some(parent_key) = reference.strip_prefix("t1_") else {
                break;
            };
            depth += 1;
            root = Some(parent_key.to_string());
            if depth as usize > parents.len() {
                break;
            }
            current = parents.get(parent_key).cloned().flatten();
        }
        item.depth = depth;
        item.root_ref = root;
    }
}

/// Natural key of a parent item from its discussion URL (`…/comments/<key>/…`).
pub fn natural_key_from_url(url: &str) -> Option<String> {
    let (_, rest) = url.split_once("/comments/")?;
    let key = rest.split('/').next()?.trim();
    (!key.is_empty()).then(|| key.to_string())
}

fn read_json(path: &Path) -> Result<Value, ArtifactError> {
    let content = std::fs::read_to_string(path).map_err(|e| ArtifactError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    serde_json::from_str(&content).map_err(|e| ArtifactError::Json {
        path: path.to_path_buf(),
        source: e,
    })
}

fn required_str(object: &serde_json::Map<String, Value>, key: &str) -> Result<String, ArtifactError> {
    match object.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(ArtifactError::Item(format!("missing or empty `{}`", key))),
    }
}

fn optional_str(object: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    object
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn int_field(object: &serde_json::Map<String, Value>, key: &str) -> i64 {
    object
        .get(key)
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
        .unwrap_or(0)
}

fn bool_field(object: &serde_json::Map<String, Value>, key: &str) -> bool {
    object.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn timestamp_field(
    object: &serde_json::Map<String, Value>,
    key: &str,
    item: &str,
) -> Result<Option<String>, ArtifactError> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => normalize_timestamp(value)
            .map(|dt| Some(crate::db::format_timestamp(dt)))
            .ok_or_else(|| {
                ArtifactError::Item(format!("item {}: unparseable `{}`: {}", item, key, value))
            }),
    }
}

/// Accepts RFC 3339, `YYYY-MM-DDTHH:MM:SS`, `YYYY-MM-DD HH:MM:SS` (naive
/// values are UTC) or a Unix epoch number.
pub fn normalize_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let secs = n.as_f64()?;
            Utc.timestamp_opt(secs.trunc() as i64, 0).single()
        }
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"]
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
                .map(|naive| naive.and_utc())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(dir: &Path, name: &str, value: &Value) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, serde_json::to_string_pretty(value).unwrap()).unwrap();
        path
    }

    #[test]
    fn test_parent_item_fields() {
        let item = ParentItem::from_value(&json!({
            "id": "abc123",
            "title": "Hello",
            "subreddit": "rust",
            "permalink": "/r/rust/comments/abc123/hello/",
            "url": "https://example.com",
            "author": "ferris",
            "created_utc": "2026-03-01 12:30:00",
            "score": 42,
            "upvote_ratio": 0.97,
            "num_comments": 7,
            "nsfw": false,
            "stickied": true
        }))
        .unwrap();

        assert_eq!(item.natural_key, "abc123");
        assert_eq!(item.created_utc.as_deref(), Some("2026-03-01T12:30:00Z"));
        assert_eq!(item.score, 42);
        assert!(item.is_stickied);
        assert!(!item.is_nsfw);
        assert_eq!(
            item.canonical_url().as_deref(),
            Some("https://www.reddit.com/r/rust/comments/abc123/hello/")
        );
    }

    #[test]
    fn test_parent_item_requires_id_and_title() {
        assert!(ParentItem::from_value(&json!({"title": "x"})).is_err());
        assert!(ParentItem::from_value(&json!({"id": "x"})).is_err());
        assert!(ParentItem::from_value(&json!("nope")).is_err());
        assert!(ParentItem::from_value(&json!({"id": "x", "title": "t", "created_utc": "yesterday"})).is_err());
    }

    #[test]
    fn test_parent_artifact_shapes() {
        let dir = tempfile::TempDir::new().unwrap();
        let bare = write(dir.path(), "bare.json", &json!([{"id": "a", "title": "A"}]));
        let wrapped = write(
            dir.path(),
            "wrapped.json",
            &json!({"scrape_settings": {}, "data": [{"id": "a", "title": "A"}, {"id": "b", "title": "B"}]}),
        );
        let wrong = write(dir.path(), "wrong.json", &json!({"data": {"x": 1}}));

        assert_eq!(ParentArtifact::read(&bare).unwrap().items.len(), 1);
        assert_eq!(ParentArtifact::read(&wrapped).unwrap().items.len(), 2);
        assert!(matches!(
            ParentArtifact::read(&wrong),
            Err(ArtifactError::Shape { .. })
        ));
    }

    #[test]
    fn test_parent_artifact_invalid_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            ParentArtifact::read(&path),
            Err(ArtifactError::Json { .. })
        ));
    }

    #[test]
    fn test_child_artifact_flat_threading() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write(
            dir.path(),
            "comments.json",
            &json!({
                "scrape_settings": {"url": "https://www.reddit.com/r/rust/comments/p1/x/"},
                "data": {
                    "submission_metadata": {"permalink": "/r/rust/comments/p1/x/"},
                    "comments": [
                        {"id": "c1", "body": "top", "parent_id": "t3_p1", "link_id": "t3_p1"},
                        {"id": "c2", "body": "reply", "parent_id": "t1_c1", "link_id": "t3_p1"},
                        {"id": "c3", "body": "deeper", "parent_id": "t1_c2", "link_id": "t3_p1", "edited": 1700000000}
                    ]
                }
            }),
        );

        let artifact = ChildArtifact::read(&path).unwrap();
        assert_eq!(
            artifact.url.as_deref(),
            Some("https://www.reddit.com/r/rust/comments/p1/x/")
        );
        let comments: Vec<ChildItem> = artifact.comments.into_iter().map(Result::unwrap).collect();
        assert_eq!(comments[0].depth, 0);
        assert_eq!(comments[0].root_ref, None);
        assert_eq!(comments[1].depth, 1);
        assert_eq!(comments[1].root_ref.as_deref(), Some("c1"));
        assert_eq!(comments[2].depth, 2);
        assert_eq!(comments[2].root_ref.as_deref(), Some("c1"));
        assert!(comments[2].is_edited);
    }

    #[test]
    fn test_child_artifact_nested_replies() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write(
            dir.path(),
            "nested.json",
            &json!({
                "scrape_settings": {"url": "u"},
                "data": {
                    "comments": [
                        {"id": "c1", "body": "top", "parent_id": "t3_p1", "replies": [
                            {"id": "c2", "body": "r1", "parent_id": "t1_c1", "replies": [
                                {"id": "c3", "body": "r2", "parent_id": "t1_c2"}
                            ]},
                            {"body": "missing id"}
                        ]},
                        {"id": "c4", "body": "second top", "parent_id": "t3_p1"}
                    ]
                }
            }),
        );

        let artifact = ChildArtifact::read(&path).unwrap();
        assert_eq!(artifact.comments.len(), 5);
        let ok: Vec<&ChildItem> = artifact.comments.iter().filter_map(|c| c.as_ref().ok()).collect();
        assert_eq!(ok.len(), 4);
        let c3 = ok.iter().find(|c| c.natural_key == "c3").unwrap();
        assert_eq!(c3.depth, 2);
        assert_eq!(c3.root_ref.as_deref(), Some("c1"));
        let c4 = ok.iter().find(|c| c.natural_key == "c4").unwrap();
        assert_eq!(c4.depth, 0);
    }

    #[test]
    fn test_rejected_top_comment_keeps_thread_root() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write(
            dir.path(),
            "broken-top.json",
            &json!({
                "scrape_settings": {"url": "u"},
                "data": {
                    "comments": [
                        {"id": "c1", "parent_id": "t3_p1", "replies": [
                            {"id": "c2", "body": "r1", "parent_id": "t1_c1", "replies": [
                                {"id": "c3", "body": "r2", "parent_id": "t1_c2"}
                            ]}
                        ]}
                    ]
                }
            }),
        );

        let artifact = ChildArtifact::read(&path).unwrap();
        assert_eq!(artifact.comments.len(), 3);
        assert!(artifact.comments[0].is_err());
        let ok: Vec<&ChildItem> = artifact.comments.iter().filter_map(|c| c.as_ref().ok()).collect();
        assert_eq!(ok.len(), 2);
        for reply in ok {
            assert_eq!(reply.root_ref.as_deref(), Some("c1"), "{}", reply.natural_key);
        }
        let c3 = artifact.comments[2].as_ref().unwrap();
        assert_eq!(c3.depth, 2);
    }

    #[test]
    fn test_natural_key_from_url() {
        assert_eq!(
            natural_key_from_url("https://www.reddit.com/r/rust/comments/abc123/title/").as_deref(),
            Some("abc123")
        );
        assert_eq!(natural_key_from_url("https://example.com/x"), None);
    }

    #[test]
    fn test_normalize_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
        assert_eq!(normalize_timestamp(&json!("2026-03-01T12:30:00Z")), Some(expected));
        assert_eq!(normalize_timestamp(&json!("2026-03-01T12:30:00")), Some(expected));
        assert_eq!(normalize_timestamp(&json!("2026-03-01 12:30:00")), Some(expected));
        assert_eq!(normalize_timestamp(&json!(expected.timestamp())), Some(expected));
        assert_eq!(normalize_timestamp(&json!(true)), None);
    }
}
