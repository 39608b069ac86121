//! Citation sources collected from tool output, and the post-hoc
//! correlation of sources against the final response text.

use serde::{Deserialize, Serialize};

/// One source surfaced by a tool (search hit, fetched page, document).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitationSource {
    pub id: String,
    pub url: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// A source plus whether the final response actually referenced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    #[serde(flatten)]
    pub source: CitationSource,
    pub cited: bool,
}

/// The citation block attached to a finished stream / assistant message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CitationData {
    pub citations: Vec<Citation>,
}

impl CitationData {
    pub fn is_empty(&self) -> bool {
        self.citations.is_empty()
    }

    /// Sources the response referenced.
    pub fn cited(&self) -> impl Iterator<Item = &CitationSource> {
        self.citations
            .iter()
            .filter(|c| c.cited)
            .map(|c| &c.source)
    }
}

/// Correlate collected sources with the final response text.
///
/// Duplicate urls collapse to the first occurrence. A source counts as
/// cited when the text contains its url, or a `[n]` marker matching its
/// 1-based position in collection order. Uncited sources are retained
/// (flagged `cited: false`) so channels can still render a source list.
pub fn correlate(sources: &[CitationSource], text: &str) -> CitationData {
    let mut seen_urls: Vec<&str> = Vec::new();
    let mut citations = Vec::new();

    for source in sources {
        if seen_urls.contains(&source.url.as_str()) {
            continue;
        }
        seen_urls.push(&source.url);

        let marker = format!("[{}]", seen_urls.len());
        let cited = text.contains(&source.url) || text.contains(&marker);
        citations.push(Citation {
            source: source.clone(),
            cited,
        });
    }

    CitationData { citations }
}
