//! ZAI image-generation wire types.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZaiImageRequest {
    pub model: String,
    pub prompt: String,
    /// `standard` or `hd`.
    pub quality: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    pub watermark_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZaiImageResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    pub data: Vec<ZaiImage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZaiImage {
    pub url: String,
}
