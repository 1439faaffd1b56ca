use serde::{Deserialize, Serialize};

/// Media kind reported by the Immich API. Only images can be classified;
/// everything else is rejected as unsupported without ever being retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AssetKind {
    Image,
    Video,
    Audio,
    #[serde(other)]
    Other,
}

/// An Immich asset as returned by the metadata search endpoint.
///
/// The search response may or may not include the `tags` array depending on
/// server version. `None` means "unknown", not "untagged" — the processor only
/// treats the processed-marker check as authoritative when tags are present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: AssetKind,
    #[serde(default)]
    pub original_file_name: String,
    #[serde(default)]
    pub tags: Option<Vec<Tag>>,
}

impl Asset {
    /// Whether this asset already carries the given marker tag.
    /// Returns `false` when the search response omitted the tag list.
    pub fn has_tag_named(&self, name: &str) -> bool {
        match &self.tags {
            Some(tags) => tags.iter().any(|t| t.name.eq_ignore_ascii_case(name)),
            None => false,
        }
    }
}

/// An Immich tag. Names are library-scoped; identity is case-insensitive
/// for lookup but the original casing is preserved on creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// A single label/confidence pair produced by a classification strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct TagPrediction {
    pub name: String,
    pub confidence: f32,
}

/// Body for `PUT /api/tags/assets`. Idempotent on the server side:
/// re-applying an already-present tag is not an error.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkTagRequest {
    pub asset_ids: Vec<String>,
    pub tag_ids: Vec<String>,
}

/// Body for `POST /api/tags`.
#[derive(Debug, Serialize)]
pub struct CreateTagRequest {
    pub name: String,
}

/// Identity of the account behind an API key, used in health output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}
