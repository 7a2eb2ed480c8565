//! Citation data from an outside parser, used as a tie-breaker only.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SignalError;
use crate::geometry::BBox;

/// Citations and references reported by a third-party parser for one paper.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorroboratingSignal {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub spans: Vec<SignalSpan>,
    #[serde(default)]
    pub references: Vec<SignalReference>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalSpan {
    pub page_num: u32,
    #[serde(default)]
    pub bbox: Option<BBox>,
    pub text: String,
    /// Index into [`CorroboratingSignal::references`].
    #[serde(default)]
    pub reference: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalReference {
    #[serde(default)]
    pub number: Option<u32>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub doi: Option<String>,
    #[serde(default)]
    pub raw_text: Option<String>,
}

impl CorroboratingSignal {
    pub fn from_json(json: &str) -> Result<Self, SignalError> {
        let mut signal: Self = serde_json::from_str(json)?;
        signal.sanitize()?;
        Ok(signal)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, SignalError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Drop dangling reference indices. A signal with spans but no
    /// references at all cannot corroborate anything and is rejected.
    fn sanitize(&mut self) -> Result<(), SignalError> {
        if !self.spans.is_empty() && self.references.is_empty() {
            return Err(SignalError::Invalid("spans present but no references".into()));
        }
        let count = self.references.len();
        let mut dropped = 0usize;
        for span in &mut self.spans {
            if span.reference.is_some_and(|idx| idx >= count) {
                span.reference = None;
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!(dropped, references = count, "signal spans point past the reference list");
        }
        Ok(())
    }

    /// Signal spans on `page_num` that point at a reference.
    pub fn spans_on_page(&self, page_num: u32) -> impl Iterator<Item = &SignalSpan> {
        self.spans
            .iter()
            .filter(move |s| s.page_num == page_num && s.reference.is_some())
    }

    pub fn reference_of(&self, span: &SignalSpan) -> Option<&SignalReference> {
        span.reference.and_then(|idx| self.references.get(idx))
    }
}
