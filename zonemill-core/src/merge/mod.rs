use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{
    entities::{MergeStrategy, MergedResult, RunID, ThresholdDecision, ZoneID},
    error::ConfigError,
    fallback::AttemptRecord,
};

pub mod equivalence;

pub use equivalence::equivalent;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Confidence added per corroborating tool with equivalent content.
    pub corroboration_bonus: f32,
    /// Cap on the total corroboration bonus.
    pub max_bonus: f32,
    /// Minimum normalized Sørensen–Dice similarity for text to be equivalent.
    pub text_similarity: f32,
    /// Minimum share of agreeing cells for same-shape tables to be equivalent.
    pub table_cell_agreement: f32,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            corroboration_bonus: 0.05,
            max_bonus: 0.1,
            text_similarity: 0.9,
            table_cell_agreement: 0.9,
        }
    }
}

impl MergeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("merge.corroboration_bonus", self.corroboration_bonus),
            ("merge.max_bonus", self.max_bonus),
            ("merge.text_similarity", self.text_similarity),
            ("merge.table_cell_agreement", self.table_cell_agreement),
        ];
        for (field, value) in fields {
            if !(0f32..=1f32).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    field,
                    message: format!("{value} not in [0, 1]"),
                });
            }
        }
        Ok(())
    }
}

/// Picks the finalized result for a zone from its attempts.
///
/// Returns `None` when no attempt was accepted or borderline.
#[instrument(skip_all, fields(zone_id = %zone_id))]
pub fn merge_attempts(
    run_id: RunID,
    zone_id: ZoneID,
    attempts: &[AttemptRecord],
    config: &MergeConfig,
) -> Option<MergedResult> {
    let accepted = attempts
        .iter()
        .filter(|r| r.decision == ThresholdDecision::Accept && r.extraction().is_some())
        .collect::<Vec<_>>();

    let (primary, final_confidence, contributing, corroborating, strategy) = match accepted.as_slice() {
        [] => {
            let best = attempts
                .iter()
                .filter(|r| r.decision == ThresholdDecision::Borderline && r.extraction().is_some())
                .fold(None, |best: Option<&AttemptRecord>, r| match best {
                    Some(b) if b.score.value >= r.score.value => Some(b),
                    _ => Some(r),
                })?;
            (
                best,
                best.score.value,
                vec![best.tool.clone()],
                vec![],
                MergeStrategy::BestEffortBorderline,
            )
        }
        [only] => (
            *only,
            only.score.value,
            vec![only.tool.clone()],
            vec![],
            MergeStrategy::SingleAccept,
        ),
        many => {
            // highest score wins, earliest attempt on ties
            let primary = many
                .iter()
                .copied()
                .reduce(|best, r| {
                    if r.score.value > best.score.value
                        || (r.score.value == best.score.value && r.attempt_index < best.attempt_index)
                    {
                        r
                    } else {
                        best
                    }
                })?;
            let content = &primary.extraction()?.content;
            let others = many
                .iter()
                .filter(|r| r.attempt_index != primary.attempt_index)
                .collect::<Vec<_>>();
            let agreeing = others
                .iter()
                .filter(|r| {
                    r.extraction()
                        .is_some_and(|raw| equivalent(content, &raw.content, config))
                })
                .map(|r| r.tool.clone())
                .collect::<Vec<_>>();
            let corroborating = others.iter().map(|r| r.tool.clone()).collect::<Vec<_>>();

            if agreeing.is_empty() {
                (
                    primary,
                    primary.score.value,
                    vec![primary.tool.clone()],
                    corroborating,
                    MergeStrategy::BestAccept,
                )
            } else {
                let bonus = (config.corroboration_bonus * agreeing.len() as f32).min(config.max_bonus);
                let boosted = (primary.score.value + bonus).min(1f32);
                let mut contributing = vec![primary.tool.clone()];
                contributing.extend(agreeing);
                (
                    primary,
                    boosted,
                    contributing,
                    corroborating,
                    MergeStrategy::CorroboratedAccept,
                )
            }
        }
    };

    let raw = primary.extraction()?;
    tracing::debug!(
        "merged with {strategy} from {} at confidence {final_confidence:.3}",
        primary.tool
    );
    Some(MergedResult {
        run_id,
        zone_id,
        content: raw.content.clone(),
        final_confidence,
        contributing_tools: contributing,
        corroborating_tools: corroborating,
        merge_strategy: strategy,
        created_at: Utc::now(),
    })
}
