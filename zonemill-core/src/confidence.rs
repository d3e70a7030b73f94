use std::collections::HashMap;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{
    analyze::AnalysisHints,
    entities::{
        ConfidenceScore, ConfidenceSignals, ExtractionContent, ImageDescriptor, RawExtraction,
        ToolId, Zone, ZoneType,
    },
    error::ConfigError,
};

/// Characters commonly produced by OCR on noise and smudges.
const OCR_NOISE_CHARS: &[char] = &['@', '#', '%', '|', '~', '`'];

/// Average word length range considered natural text.
const PLAUSIBLE_WORD_LEN: (f32, f32) = (2f32, 10f32);

/// Completeness when nothing tells how much content to expect.
const UNKNOWN_EXPECTATION_COMPLETENESS: f32 = 0.75;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    pub tool_weight: f32,
    pub structural_weight: f32,
    pub completeness_weight: f32,
    /// Upper bound on the normalized tool weight.
    pub max_tool_weight: f32,
    /// Structural score below which the total is scaled down linearly.
    pub gate_knee: f32,
    /// Stands in for the tool signal when a tool reports no confidence.
    pub default_prior: f32,
    pub tool_priors: HashMap<ToolId, f32>,
    /// Multiplier on the structural signal when content kind and zone type disagree.
    pub type_mismatch_factor: f32,
    /// Expected non-whitespace characters per 1000 square units, used without text hints.
    pub chars_per_kilo_area: f32,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            tool_weight: 0.4,
            structural_weight: 0.35,
            completeness_weight: 0.25,
            max_tool_weight: 0.6,
            gate_knee: 0.5,
            default_prior: 0.5,
            tool_priors: HashMap::new(),
            type_mismatch_factor: 0.6,
            chars_per_kilo_area: 2.0,
        }
    }
}

impl ConfidenceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let raw = [self.tool_weight, self.structural_weight, self.completeness_weight];
        if raw.iter().any(|w| !w.is_finite() || *w < 0f32) {
            return Err(ConfigError::InvalidWeights(
                "weights must be finite and non-negative".into(),
            ));
        }
        if raw.iter().sum::<f32>() <= 0f32 {
            return Err(ConfigError::InvalidWeights("weights sum to zero".into()));
        }
        if !(self.max_tool_weight > 0f32 && self.max_tool_weight < 1f32) {
            return Err(ConfigError::InvalidWeights(format!(
                "max_tool_weight must be in (0, 1), got {}",
                self.max_tool_weight
            )));
        }
        if !(self.gate_knee > 0f32 && self.gate_knee <= 1f32) {
            return Err(ConfigError::InvalidWeights(format!(
                "gate_knee must be in (0, 1], got {}",
                self.gate_knee
            )));
        }
        let unit = |v: f32| (0f32..=1f32).contains(&v);
        if !unit(self.default_prior) || !self.tool_priors.values().all(|p| unit(*p)) {
            return Err(ConfigError::InvalidWeights("priors must be in [0, 1]".into()));
        }
        if !unit(self.type_mismatch_factor) {
            return Err(ConfigError::InvalidWeights(
                "type_mismatch_factor must be in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Normalized signal weights, summing to 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Weights {
    pub tool: f32,
    pub structural: f32,
    pub completeness: f32,
}

impl Weights {
    /// Normalizes and caps the tool weight, handing the excess to the other
    /// signals in proportion.
    pub fn from_config(config: &ConfidenceConfig) -> Self {
        let sum = config.tool_weight + config.structural_weight + config.completeness_weight;
        let (mut tool, mut structural, mut completeness) = if sum > 0f32 && sum.is_finite() {
            (
                config.tool_weight / sum,
                config.structural_weight / sum,
                config.completeness_weight / sum,
            )
        } else {
            (1f32 / 3f32, 1f32 / 3f32, 1f32 / 3f32)
        };

        let cap = config.max_tool_weight.clamp(f32::EPSILON, 1f32 - f32::EPSILON);
        if tool > cap {
            let excess = tool - cap;
            tool = cap;
            let others = structural + completeness;
            if others > 0f32 {
                structural += excess * structural / others;
                completeness += excess * completeness / others;
            } else {
                structural += excess / 2f32;
                completeness += excess / 2f32;
            }
        }
        Self {
            tool,
            structural,
            completeness,
        }
    }
}

#[inline]
fn unit(v: f32) -> f32 {
    if v.is_finite() {
        v.clamp(0f32, 1f32)
    } else {
        0f32
    }
}

/// Weighted sum of the signals, scaled down when the structural signal is
/// below `gate_knee`. Non-decreasing in every signal, always in [0, 1].
pub fn combine(signals: &ConfidenceSignals, weights: &Weights, gate_knee: f32) -> f32 {
    let tool = unit(signals.tool);
    let structural = unit(signals.structural);
    let completeness = unit(signals.completeness);

    let sum = weights.tool * tool + weights.structural * structural + weights.completeness * completeness;
    let gate = if gate_knee > 0f32 {
        (structural / gate_knee).min(1f32)
    } else {
        1f32
    };
    unit(sum * gate)
}

fn text_plausibility(text: &str) -> f32 {
    let total = text.chars().count();
    if total == 0 {
        return 0f32;
    }
    let printable = text
        .chars()
        .filter(|c| !c.is_control() || c.is_whitespace())
        .count() as f32
        / total as f32;

    let visible = text.chars().filter(|c| !c.is_whitespace()).count();
    if visible == 0 {
        return 0f32;
    }
    let noise = text.chars().filter(|c| OCR_NOISE_CHARS.contains(c)).count() as f32 / visible as f32;
    let noise_score = (1f32 - 2f32 * noise).max(0f32);

    let words = text.split_whitespace().collect::<Vec<_>>();
    let avg_len = words.iter().map(|w| w.chars().count()).sum::<usize>() as f32 / words.len() as f32;
    let word_score = if avg_len < PLAUSIBLE_WORD_LEN.0 {
        avg_len / PLAUSIBLE_WORD_LEN.0
    } else if avg_len > PLAUSIBLE_WORD_LEN.1 {
        PLAUSIBLE_WORD_LEN.1 / avg_len
    } else {
        1f32
    };

    0.4 * printable + 0.3 * noise_score + 0.3 * word_score
}

fn table_plausibility(rows: &[Vec<String>], hints: &AnalysisHints) -> f32 {
    let cells = rows.iter().map(|r| r.len()).sum::<usize>();
    if rows.is_empty() || cells == 0 {
        return 0f32;
    }
    let empty = rows
        .iter()
        .flatten()
        .filter(|c| c.trim().is_empty())
        .count();
    if empty == cells {
        return 0f32;
    }
    let fill = 1f32 - empty as f32 / cells as f32;

    let (modal_columns, modal_rows) = rows
        .iter()
        .map(|r| r.len())
        .counts()
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .unwrap_or((0, 0));
    let consistency = modal_rows as f32 / rows.len() as f32;

    let ratio = |a: usize, b: usize| {
        let (lo, hi) = (a.min(b), a.max(b));
        if hi == 0 {
            0f32
        } else {
            lo as f32 / hi as f32
        }
    };
    let agreement = if hints.estimated_rows >= 2 && hints.estimated_columns >= 2 {
        (ratio(rows.len(), hints.estimated_rows) + ratio(modal_columns, hints.estimated_columns))
            / 2f32
    } else {
        1f32
    };

    0.4 * consistency + 0.35 * fill + 0.25 * agreement
}

fn image_plausibility(descriptor: &ImageDescriptor) -> f32 {
    let mut score = 0f32;
    if descriptor
        .description
        .as_deref()
        .is_some_and(|d| !d.trim().is_empty())
    {
        score += 0.4;
    }
    if descriptor.width > 0 && descriptor.height > 0 {
        score += 0.3;
    }
    if !descriptor.labels.is_empty() {
        score += 0.2;
    }
    if descriptor.format.is_some() {
        score += 0.1;
    }
    score
}

fn kind_matches(zone_type: ZoneType, content: &ExtractionContent) -> bool {
    matches!(
        (zone_type, content),
        (ZoneType::Mixed, _)
            | (ZoneType::Text, ExtractionContent::Text { .. })
            | (ZoneType::Table, ExtractionContent::Table { .. })
            | (ZoneType::Diagram, ExtractionContent::Image { .. })
    )
}

/// Scores each raw extraction exactly once.
#[derive(Debug, Clone)]
pub struct ConfidenceEngine {
    config: ConfidenceConfig,
    weights: Weights,
}

impl Default for ConfidenceEngine {
    fn default() -> Self {
        Self::new(ConfidenceConfig::default())
    }
}

impl ConfidenceEngine {
    pub fn new(config: ConfidenceConfig) -> Self {
        let weights = Weights::from_config(&config);
        Self { config, weights }
    }

    pub fn weights(&self) -> &Weights {
        &self.weights
    }

    pub fn prior(&self, tool: &ToolId) -> f32 {
        self.config
            .tool_priors
            .get(tool)
            .copied()
            .unwrap_or(self.config.default_prior)
    }

    fn malformed(extraction: &RawExtraction, zone: &Zone) -> Option<String> {
        if extraction.zone_id != zone.id {
            return Some(format!(
                "extraction for zone {} scored against zone {}",
                extraction.zone_id, zone.id
            ));
        }
        if let Some(c) = extraction.metadata.reported_confidence {
            if !(0f32..=1f32).contains(&c) {
                return Some(format!("reported confidence {c} outside [0, 1]"));
            }
        }
        if let Some(b) = extraction.metadata.content_bounds {
            if ![b.x, b.y, b.width, b.height].iter().all(|v| v.is_finite()) {
                return Some("non-finite content bounds".to_owned());
            }
        }
        None
    }

    fn structural(&self, extraction: &RawExtraction, hints: &AnalysisHints) -> f32 {
        let base = match &extraction.content {
            ExtractionContent::Text { text } => text_plausibility(text),
            ExtractionContent::Table { rows } => table_plausibility(rows, hints),
            ExtractionContent::Image { descriptor } => image_plausibility(descriptor),
        };
        if kind_matches(hints.zone_type, &extraction.content) {
            base
        } else {
            base * self.config.type_mismatch_factor
        }
    }

    fn completeness(&self, extraction: &RawExtraction, hints: &AnalysisHints, zone: &Zone) -> f32 {
        let length = match &extraction.content {
            ExtractionContent::Image { descriptor } => {
                if descriptor.description.is_some() || !descriptor.labels.is_empty() {
                    1f32
                } else {
                    0.5
                }
            }
            content => {
                let extracted = content.char_count() as f32;
                match hints.expected_chars.filter(|n| *n > 0) {
                    Some(expected) => {
                        let r = extracted / expected as f32;
                        if r <= 1f32 {
                            r
                        } else {
                            // more than expected usually means hallucinated or duplicated text
                            (1f32 - (r - 1f32) / 2f32).max(0f32)
                        }
                    }
                    None if zone.bounds.is_valid() => {
                        let expected = zone.bounds.area() / 1000f32 * self.config.chars_per_kilo_area;
                        if expected > 0f32 {
                            (extracted / expected).min(1f32)
                        } else {
                            UNKNOWN_EXPECTATION_COMPLETENESS
                        }
                    }
                    None if extracted > 0f32 => UNKNOWN_EXPECTATION_COMPLETENESS,
                    None => 0f32,
                }
            }
        };

        match extraction.metadata.content_bounds {
            Some(bounds) if zone.bounds.is_valid() => {
                let coverage = unit(zone.bounds.intersection(&bounds) / zone.bounds.area());
                0.7 * unit(length) + 0.3 * coverage
            }
            _ => unit(length),
        }
    }

    #[instrument(skip_all, fields(tool = %extraction.tool, attempt = extraction.attempt_index))]
    pub fn score(&self, extraction: &RawExtraction, hints: &AnalysisHints, zone: &Zone) -> ConfidenceScore {
        if let Some(reason) = Self::malformed(extraction, zone) {
            tracing::warn!("malformed extraction scored 0: {reason}");
            return ConfidenceScore::zero(reason);
        }

        let reported = extraction.metadata.reported_confidence;
        let signals = ConfidenceSignals {
            tool: unit(reported.unwrap_or_else(|| self.prior(&extraction.tool))),
            structural: unit(self.structural(extraction, hints)),
            completeness: self.completeness(extraction, hints, zone),
        };
        let value = combine(&signals, &self.weights, self.config.gate_knee);
        tracing::debug!(
            "confidence {value:.3} (tool={:.2} structural={:.2} completeness={:.2})",
            signals.tool,
            signals.structural,
            signals.completeness
        );

        ConfidenceScore {
            value,
            signals,
            reported,
            reason: None,
        }
    }
}
