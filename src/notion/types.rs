//! Notion API types and conversion into cached items
//!
//! Wire types mirror the Notion JSON; [`UpstreamItem`] is the stable, typed
//! shape that gets serialized into the cache.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A typed property value.
///
/// Notion has many property types; they collapse onto the five shapes the
/// consumer needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    String(String),
    Number(f64),
    Bool(bool),
    Select(Option<String>),
    List(Vec<String>),
}

impl PropertyValue {
    /// Convert a raw Notion property object (`{"type": "...", "<type>": ...}`).
    ///
    /// Returns None for property types the cache does not carry.
    pub fn from_raw(raw: &Value) -> Option<Self> {
        let kind = raw.get("type")?.as_str()?;
        let body = raw.get(kind).unwrap_or(&Value::Null);

        match kind {
            "title" | "rich_text" => Some(PropertyValue::String(plain_text(body))),
            "url" | "email" | "phone_number" => Some(PropertyValue::String(
                body.as_str().unwrap_or_default().to_string(),
            )),
            "date" => Some(PropertyValue::String(
                body.get("start")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            )),
            "number" => body.as_f64().map(PropertyValue::Number),
            "checkbox" => Some(PropertyValue::Bool(body.as_bool().unwrap_or(false))),
            "select" | "status" => Some(PropertyValue::Select(
                body.get("name").and_then(Value::as_str).map(String::from),
            )),
            "multi_select" => Some(PropertyValue::List(
                body.as_array()
                    .map(|options| {
                        options
                            .iter()
                            .filter_map(|o| o.get("name").and_then(Value::as_str))
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default(),
            )),
            _ => None,
        }
    }

    /// Text view of string-ish values
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            PropertyValue::Select(s) => s.as_deref(),
            _ => None,
        }
    }
}

/// One content block of a page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    /// Notion block type ("paragraph", "heading_1", "code", ...)
    pub kind: String,
    /// Concatenated plain text of the block's rich text
    pub text: String,
    /// Language of a code block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// One record from the upstream database.
///
/// Attributes use a BTreeMap so serialization is deterministic; the cache's
/// change detection hashes the serialized bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamItem {
    pub id: String,
    pub last_modified_at: DateTime<Utc>,
    pub attributes: BTreeMap<String, PropertyValue>,
    #[serde(default)]
    pub content_blocks: Vec<Block>,
}

impl UpstreamItem {
    /// Value of the select property that classifies the item
    pub fn kind(&self, type_field: &str) -> Option<&str> {
        match self.attributes.get(type_field)? {
            PropertyValue::Select(name) => name.as_deref(),
            _ => None,
        }
    }

    /// Display title: the "Name" property, or the id when it is missing
    pub fn title(&self) -> &str {
        self.attributes
            .get("Name")
            .and_then(PropertyValue::as_text)
            .filter(|t| !t.is_empty())
            .unwrap_or(self.id.as_str())
    }

    /// The "Description" property, empty when absent
    pub fn description(&self) -> &str {
        self.attributes
            .get("Description")
            .and_then(PropertyValue::as_text)
            .unwrap_or_default()
    }
}

/// Page object as returned by the database query and page endpoints
#[derive(Debug, Deserialize)]
pub struct RawPage {
    pub id: String,
    pub last_edited_time: DateTime<Utc>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl From<RawPage> for UpstreamItem {
    fn from(page: RawPage) -> Self {
        let attributes = page
            .properties
            .iter()
            .filter_map(|(name, raw)| PropertyValue::from_raw(raw).map(|v| (name.clone(), v)))
            .collect();

        UpstreamItem {
            id: page.id,
            last_modified_at: page.last_edited_time,
            attributes,
            content_blocks: Vec::new(),
        }
    }
}

/// Block object from the block children endpoint
#[derive(Debug, Deserialize)]
pub struct RawBlock {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl From<RawBlock> for Block {
    fn from(raw: RawBlock) -> Self {
        let body = raw.rest.get(&raw.kind).unwrap_or(&Value::Null);
        let language = if raw.kind == "code" {
            body.get("language")
                .and_then(Value::as_str)
                .map(String::from)
        } else {
            None
        };

        Block {
            text: plain_text(body.get("rich_text").unwrap_or(&Value::Null)),
            id: raw.id,
            kind: raw.kind,
            language,
        }
    }
}

/// Request body for the database query endpoint
#[derive(Debug, Default, Serialize)]
pub struct QueryRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_cursor: Option<String>,
}

/// One page of a paginated list response
#[derive(Debug, Deserialize)]
pub struct ListResponse<T> {
    pub results: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

impl<T> ListResponse<T> {
    /// Cursor for the next page, or None at end of stream.
    ///
    /// A missing cursor ends the stream even when `has_more` claims otherwise.
    pub fn continuation(&self) -> Option<&str> {
        if self.has_more {
            self.next_cursor.as_deref()
        } else {
            None
        }
    }
}

/// Concatenate `plain_text` across a rich text array
fn plain_text(rich_text: &Value) -> String {
    rich_text
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("plain_text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_page_properties() {
        let json = r#"{
            "object": "page",
            "id": "a1b2",
            "created_time": "2024-01-01T00:00:00.000Z",
            "last_edited_time": "2024-03-05T10:20:00.000Z",
            "properties": {
                "Name": {"id": "title", "type": "title", "title": [
                    {"plain_text": "Code "}, {"plain_text": "Review"}
                ]},
                "Type": {"id": "x", "type": "select", "select": {"name": "prompt"}},
                "Tags": {"id": "y", "type": "multi_select", "multi_select": [
                    {"name": "rust"}, {"name": "review"}
                ]},
                "Priority": {"id": "z", "type": "number", "number": 2},
                "Done": {"id": "w", "type": "checkbox", "checkbox": true},
                "Owner": {"id": "p", "type": "people", "people": []}
            }
        }"#;
        let page: RawPage = serde_json::from_str(json).unwrap();
        let item = UpstreamItem::from(page);

        assert_eq!(item.id, "a1b2");
        assert_eq!(item.title(), "Code Review");
        assert_eq!(item.kind("Type"), Some("prompt"));
        assert_eq!(
            item.attributes.get("Tags"),
            Some(&PropertyValue::List(vec!["rust".into(), "review".into()]))
        );
        assert_eq!(item.attributes.get("Priority"), Some(&PropertyValue::Number(2.0)));
        assert_eq!(item.attributes.get("Done"), Some(&PropertyValue::Bool(true)));
        // people is not carried
        assert!(!item.attributes.contains_key("Owner"));
    }

    #[test]
    fn test_empty_select_has_no_kind() {
        let raw = serde_json::json!({"type": "select", "select": null});
        let value = PropertyValue::from_raw(&raw).unwrap();
        assert_eq!(value, PropertyValue::Select(None));
    }

    #[test]
    fn test_title_falls_back_to_id() {
        let item = UpstreamItem {
            id: "page-1".to_string(),
            last_modified_at: Utc::now(),
            attributes: BTreeMap::new(),
            content_blocks: Vec::new(),
        };
        assert_eq!(item.title(), "page-1");
        assert_eq!(item.description(), "");
    }

    #[test]
    fn test_block_conversion() {
        let json = r#"{
            "object": "block",
            "id": "b1",
            "type": "code",
            "code": {
                "language": "python",
                "rich_text": [{"plain_text": "print('hi')"}]
            }
        }"#;
        let block = Block::from(serde_json::from_str::<RawBlock>(json).unwrap());
        assert_eq!(block.kind, "code");
        assert_eq!(block.text, "print('hi')");
        assert_eq!(block.language.as_deref(), Some("python"));

        let divider: RawBlock =
            serde_json::from_str(r#"{"id": "b2", "type": "divider", "divider": {}}"#).unwrap();
        let divider = Block::from(divider);
        assert_eq!(divider.text, "");
        assert_eq!(divider.language, None);
    }

    #[test]
    fn test_continuation_guards_missing_cursor() {
        let json = r#"{"results": [], "has_more": true, "next_cursor": null}"#;
        let resp: ListResponse<RawPage> = serde_json::from_str(json).unwrap();
        assert_eq!(resp.continuation(), None);

        let json = r#"{"results": [], "has_more": false, "next_cursor": "abc"}"#;
        let resp: ListResponse<RawPage> = serde_json::from_str(json).unwrap();
        assert_eq!(resp.continuation(), None);

        let json = r#"{"results": [], "has_more": true, "next_cursor": "abc"}"#;
        let resp: ListResponse<RawPage> = serde_json::from_str(json).unwrap();
        assert_eq!(resp.continuation(), Some("abc"));
    }

    #[test]
    fn test_query_request_omits_empty_cursor() {
        assert_eq!(serde_json::to_string(&QueryRequest::default()).unwrap(), "{}");
        let req = QueryRequest {
            start_cursor: Some("c1".to_string()),
        };
        assert_eq!(serde_json::to_string(&req).unwrap(), r#"{"start_cursor":"c1"}"#);
    }

    #[test]
    fn test_cached_shape_is_stable() {
        let mut attributes = BTreeMap::new();
        attributes.insert("Type".to_string(), PropertyValue::Select(Some("resource".into())));
        let item = UpstreamItem {
            id: "p".to_string(),
            last_modified_at: "2024-03-05T10:20:00Z".parse().unwrap(),
            attributes,
            content_blocks: Vec::new(),
        };
        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains(r#""Type":{"type":"select","value":"resource"}"#));
        let back: UpstreamItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back, item);
    }
}
