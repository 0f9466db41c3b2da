//! Jina-specific wire types: the embeddings `task` dialect and rerank.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum JinaTask {
    #[default]
    #[serde(rename = "text-matching")]
    TextMatching,
    #[serde(rename = "retrieval.query")]
    RetrievalQuery,
    #[serde(rename = "retrieval.passage")]
    RetrievalPassage,
    #[serde(rename = "separation")]
    Separation,
    #[serde(rename = "classification")]
    Classification,
    #[serde(rename = "none")]
    None,
}

impl JinaTask {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "" | "text-matching" => Some(Self::TextMatching),
            "retrieval.query" => Some(Self::RetrievalQuery),
            "retrieval.passage" => Some(Self::RetrievalPassage),
            "separation" => Some(Self::Separation),
            "classification" => Some(Self::Classification),
            "none" => Some(Self::None),
            _ => Option::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TextMatching => "text-matching",
            Self::RetrievalQuery => "retrieval.query",
            Self::RetrievalPassage => "retrieval.passage",
            Self::Separation => "separation",
            Self::Classification => "classification",
            Self::None => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankRequest {
    pub model: String,
    pub query: String,
    pub documents: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_n: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_documents: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub results: Vec<RerankResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<RerankUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankResult {
    pub index: u32,
    pub relevance_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<RerankDocument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankDocument {
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RerankUsage {
    pub total_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_task_defaults_to_text_matching() {
        assert_eq!(JinaTask::parse(""), Some(JinaTask::TextMatching));
        assert_eq!(JinaTask::parse("retrieval.query"), Some(JinaTask::RetrievalQuery));
        assert_eq!(JinaTask::parse("summarize"), None);
    }
}
