use std::{collections::BTreeMap, fmt, str::FromStr};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{
    analyze::AnalysisHints,
    entities::{ToolId, ZoneType},
    error::ProcessingError,
};

mod history;

pub use history::{PerformanceLedger, PerformanceSnapshot, ToolStats};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStrategy {
    #[default]
    Auto,
    Fast,
    Balanced,
    Accurate,
}

impl ProcessingStrategy {
    /// Upper bound on candidate tools per zone, `None` when unbounded.
    pub fn max_candidates(&self) -> Option<usize> {
        match self {
            ProcessingStrategy::Fast => Some(1),
            ProcessingStrategy::Balanced => Some(3),
            ProcessingStrategy::Auto | ProcessingStrategy::Accurate => None,
        }
    }
}

impl fmt::Display for ProcessingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessingStrategy::Auto => "auto",
            ProcessingStrategy::Fast => "fast",
            ProcessingStrategy::Balanced => "balanced",
            ProcessingStrategy::Accurate => "accurate",
        };
        f.write_str(s)
    }
}

impl FromStr for ProcessingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(ProcessingStrategy::Auto),
            "fast" => Ok(ProcessingStrategy::Fast),
            "balanced" => Ok(ProcessingStrategy::Balanced),
            "accurate" => Ok(ProcessingStrategy::Accurate),
            other => Err(format!("unknown processing strategy '{other}'")),
        }
    }
}

/// One compatible tool for a zone type. Entries without a rank are ranked by
/// their position in the list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ToolEntryRepr")]
pub struct ToolEntry {
    pub tool: ToolId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<u32>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ToolEntryRepr {
    Name(ToolId),
    Full {
        tool: ToolId,
        #[serde(default)]
        rank: Option<u32>,
    },
}

impl From<ToolEntryRepr> for ToolEntry {
    fn from(value: ToolEntryRepr) -> Self {
        match value {
            ToolEntryRepr::Name(tool) => ToolEntry { tool, rank: None },
            ToolEntryRepr::Full { tool, rank } => ToolEntry { tool, rank },
        }
    }
}

impl ToolEntry {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: ToolId::new(tool),
            rank: None,
        }
    }

    pub fn ranked(tool: impl Into<String>, rank: u32) -> Self {
        Self {
            tool: ToolId::new(tool),
            rank: Some(rank),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompatibilityMatrix(BTreeMap<ZoneType, Vec<ToolEntry>>);

impl Default for CompatibilityMatrix {
    fn default() -> Self {
        let list = |tools: &[&str]| tools.iter().map(|t| ToolEntry::new(*t)).collect::<Vec<_>>();
        Self(BTreeMap::from([
            (
                ZoneType::Text,
                list(&["unstructured", "tesseract", "paddle", "textract"]),
            ),
            (ZoneType::Table, list(&["textract", "layoutlm", "unstructured"])),
            (ZoneType::Diagram, list(&["layoutlm", "paddle"])),
            (
                ZoneType::Mixed,
                list(&["unstructured", "layoutlm", "textract", "tesseract"]),
            ),
        ]))
    }
}

impl CompatibilityMatrix {
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    pub fn with_entries(mut self, zone_type: ZoneType, entries: Vec<ToolEntry>) -> Self {
        self.0.insert(zone_type, entries);
        self
    }

    pub fn remove(&mut self, zone_type: ZoneType) -> Option<Vec<ToolEntry>> {
        self.0.remove(&zone_type)
    }

    pub fn entries(&self, zone_type: ZoneType) -> Option<&[ToolEntry]> {
        self.0.get(&zone_type).map(Vec::as_slice)
    }

    /// Every tool named anywhere in the matrix.
    pub fn tools(&self) -> impl Iterator<Item = &ToolId> {
        self.0.values().flatten().map(|e| &e.tool).unique()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignmentConfig {
    /// History below this many attempts is not used for pruning.
    pub min_history_attempts: u64,
    /// Drop tools whose success rate is below this value. Disabled when unset.
    pub prune_below_success_rate: Option<f32>,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            min_history_attempts: 5,
            prune_below_success_rate: None,
        }
    }
}

/// Builds the ordered candidate list for a zone.
#[derive(Debug, Clone, Copy)]
pub struct ToolAssigner<'a> {
    pub matrix: &'a CompatibilityMatrix,
    pub config: &'a AssignmentConfig,
    pub strategy: ProcessingStrategy,
}

impl<'a> ToolAssigner<'a> {
    pub fn new(
        matrix: &'a CompatibilityMatrix,
        config: &'a AssignmentConfig,
        strategy: ProcessingStrategy,
    ) -> Self {
        Self {
            matrix,
            config,
            strategy,
        }
    }

    /// Returns at least one tool, ordered by preference.
    ///
    /// `only` restricts the candidates to the named tools and disables pruning.
    #[instrument(skip_all, fields(zone_type = %hints.zone_type))]
    pub fn assign(
        &self,
        hints: &AnalysisHints,
        history: &PerformanceSnapshot,
        only: Option<&[ToolId]>,
    ) -> Result<Vec<ToolId>, ProcessingError> {
        let zone_type = hints.zone_type;
        let entries = self
            .matrix
            .entries(zone_type)
            .ok_or(ProcessingError::Configuration { zone_type })?;

        let ranked = rank_candidates(entries, zone_type, history);

        let candidates = match only {
            Some(only) => ranked
                .into_iter()
                .filter(|tool| only.contains(tool))
                .collect::<Vec<_>>(),
            None if hints.degraded => ranked,
            None => self.prune(ranked, zone_type, history),
        };

        if candidates.is_empty() {
            return Err(ProcessingError::Configuration { zone_type });
        }
        tracing::debug!(
            "assigned {} candidate tools: [{}]",
            candidates.len(),
            candidates.iter().join(", ")
        );
        Ok(candidates)
    }

    fn prune(
        &self,
        ranked: Vec<ToolId>,
        zone_type: ZoneType,
        history: &PerformanceSnapshot,
    ) -> Vec<ToolId> {
        let mut kept = match self.config.prune_below_success_rate {
            Some(min_rate) => {
                let kept = ranked
                    .iter()
                    .filter(|tool| match history.stats(tool, zone_type) {
                        Some(s) if s.attempts >= self.config.min_history_attempts => {
                            s.success_rate() >= min_rate
                        }
                        _ => true,
                    })
                    .cloned()
                    .collect::<Vec<_>>();
                // never prune down to nothing
                if kept.is_empty() {
                    ranked
                } else {
                    kept
                }
            }
            None => ranked,
        };
        if let Some(max) = self.strategy.max_candidates() {
            kept.truncate(max);
        }
        kept
    }
}

/// Orders matrix entries by rank, then by historical success within a rank.
/// Tools without history follow tools with history in the same rank and keep
/// their matrix order.
pub fn rank_candidates(
    entries: &[ToolEntry],
    zone_type: ZoneType,
    history: &PerformanceSnapshot,
) -> Vec<ToolId> {
    let mut ranked = entries
        .iter()
        .enumerate()
        .unique_by(|(_, e)| e.tool.clone())
        .map(|(pos, e)| {
            let rank = e.rank.unwrap_or(pos as u32);
            let rate = history
                .stats(&e.tool, zone_type)
                .filter(|s| s.attempts > 0)
                .map(|s| s.success_rate());
            (rank, rate, &e.tool)
        })
        .collect::<Vec<_>>();

    // sort_by is stable, equal keys keep matrix order
    ranked.sort_by(|a, b| {
        a.0.cmp(&b.0).then_with(|| match (a.1, b.1) {
            (Some(ra), Some(rb)) => rb.total_cmp(&ra),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        })
    });
    ranked.into_iter().map(|(_, _, tool)| tool.clone()).collect()
}
