//! Per-request record of which source was asked for what, and how it went.

use serde::Serialize;

use crate::models::{ProviderId, TimeRange};

/// Why a source was not asked for a subrange.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "reason", rename_all = "camelCase")]
pub enum SkipReason {
    /// Archive not published yet for this subrange.
    NewerThanCutoff,

    /// The request deadline passed before the call finished.
    DeadlineExceeded,

    /// The gap is larger than the repair threshold.
    GapTooLarge { bars: usize, threshold: usize },

    /// Gap lies inside a range served from cache and was repaired when stored.
    ServedFromCache,
}

/// Record of a single source attempt during a fetch.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceAttempt {
    pub source_id: ProviderId,
    pub range: TimeRange,
    pub skipped: Option<SkipReason>,
    pub error: Option<String>,
    /// Bars returned (zero for skips and errors without partial data).
    pub bars: usize,
    pub success: bool,
}

/// Diagnostics for one `get_bars` call.
#[derive(Clone, Debug, Default, Serialize)]
pub struct FetchDiagnostics {
    pub attempts: Vec<SourceAttempt>,
}

impl FetchDiagnostics {
    pub fn new() -> Self {
        Self {
            attempts: Vec::new(),
        }
    }

    pub fn record_skip(&mut self, source_id: ProviderId, range: TimeRange, reason: SkipReason) {
        self.attempts.push(SourceAttempt {
            source_id,
            range,
            skipped: Some(reason),
            error: None,
            bars: 0,
            success: false,
        });
    }

    pub fn record_error(&mut self, source_id: ProviderId, range: TimeRange, error: String, bars: usize) {
        self.attempts.push(SourceAttempt {
            source_id,
            range,
            skipped: None,
            error: Some(error),
            bars,
            success: false,
        });
    }

    pub fn record_success(&mut self, source_id: ProviderId, range: TimeRange, bars: usize) {
        self.attempts.push(SourceAttempt {
            source_id,
            range,
            skipped: None,
            error: None,
            bars,
            success: true,
        });
    }

    /// Summary for logging/debugging.
    pub fn summary(&self) -> String {
        if self.attempts.is_empty() {
            return "no source calls".to_string();
        }
        self.attempts
            .iter()
            .map(|a| {
                if a.success {
                    format!("{}{}: SUCCESS ({} bars)", a.source_id, a.range, a.bars)
                } else if let Some(skip) = &a.skipped {
                    format!("{}{}: SKIPPED ({:?})", a.source_id, a.range, skip)
                } else if let Some(err) = &a.error {
                    format!("{}{}: ERROR ({})", a.source_id, a.range, err)
                } else {
                    format!("{}{}: UNKNOWN", a.source_id, a.range)
                }
            })
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    /// Calls that actually reached a source (skips excluded).
    pub fn calls_to(&self, source_id: &str) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.source_id == source_id && a.skipped.is_none())
            .count()
    }

    /// Get all errors.
    pub fn errors(&self) -> Vec<(&ProviderId, &str)> {
        self.attempts
            .iter()
            .filter_map(|a| a.error.as_ref().map(|e| (&a.source_id, e.as_str())))
            .collect()
    }
}
