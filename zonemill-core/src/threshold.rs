use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};

use crate::{
    entities::{DocumentID, ThresholdDecision, ZoneType},
    error::ConfigError,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub reject_below: f32,
    pub accept_above: f32,
}

impl Thresholds {
    /// Requires `0 <= reject_below <= accept_above <= 1`.
    pub fn new(reject_below: f32, accept_above: f32) -> Result<Self, ConfigError> {
        Self::checked("*", reject_below, accept_above)
    }

    fn checked(label: &str, reject_below: f32, accept_above: f32) -> Result<Self, ConfigError> {
        let in_unit = |v: f32| (0f32..=1f32).contains(&v);
        if !in_unit(reject_below) || !in_unit(accept_above) || reject_below > accept_above {
            return Err(ConfigError::InvalidThresholds {
                zone_type: label.to_owned(),
                reject_below,
                accept_above,
            });
        }
        Ok(Self {
            reject_below,
            accept_above,
        })
    }

    #[inline]
    pub fn classify(&self, value: f32) -> ThresholdDecision {
        if value.is_nan() || value < self.reject_below {
            ThresholdDecision::Reject
        } else if value >= self.accept_above {
            ThresholdDecision::Accept
        } else {
            ThresholdDecision::Borderline
        }
    }
}

pub fn default_thresholds() -> HashMap<ZoneType, Thresholds> {
    HashMap::from([
        (
            ZoneType::Text,
            Thresholds {
                reject_below: 0.5,
                accept_above: 0.85,
            },
        ),
        (
            ZoneType::Table,
            Thresholds {
                reject_below: 0.4,
                accept_above: 0.8,
            },
        ),
        (
            ZoneType::Diagram,
            Thresholds {
                reject_below: 0.3,
                accept_above: 0.7,
            },
        ),
        (
            ZoneType::Mixed,
            Thresholds {
                reject_below: 0.45,
                accept_above: 0.8,
            },
        ),
    ])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdSource {
    Default,
    DocumentOverride,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveThreshold {
    pub zone_type: ZoneType,
    pub thresholds: Thresholds,
    pub source: ThresholdSource,
}

/// Runtime-adjustable threshold table. Readers get copies, so an update only
/// affects attempts that start after it.
#[derive(Debug)]
pub struct ThresholdManager {
    defaults: RwLock<HashMap<ZoneType, Thresholds>>,
    overrides: RwLock<HashMap<DocumentID, HashMap<ZoneType, Thresholds>>>,
}

impl Default for ThresholdManager {
    fn default() -> Self {
        Self::new(default_thresholds())
    }
}

impl ThresholdManager {
    pub fn new(configured: HashMap<ZoneType, Thresholds>) -> Self {
        let mut defaults = default_thresholds();
        defaults.extend(configured);
        Self {
            defaults: RwLock::new(defaults),
            overrides: RwLock::new(HashMap::new()),
        }
    }

    pub fn thresholds_for(&self, document: DocumentID, zone_type: ZoneType) -> Thresholds {
        let overridden = self
            .overrides
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&document)
            .and_then(|m| m.get(&zone_type).copied());
        if let Some(t) = overridden {
            return t;
        }
        self.defaults
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&zone_type)
            .copied()
            .unwrap_or(Thresholds {
                reject_below: 0.5,
                accept_above: 0.85,
            })
    }

    pub fn set_threshold(
        &self,
        zone_type: ZoneType,
        reject_below: f32,
        accept_above: f32,
    ) -> Result<(), ConfigError> {
        let thresholds = Thresholds::checked(zone_type.as_str(), reject_below, accept_above)?;
        self.defaults
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(zone_type, thresholds);
        tracing::info!(
            "default thresholds for {zone_type} set to reject<{reject_below} accept>={accept_above}"
        );
        Ok(())
    }

    pub fn set_document_threshold(
        &self,
        document: DocumentID,
        zone_type: ZoneType,
        reject_below: f32,
        accept_above: f32,
    ) -> Result<(), ConfigError> {
        let thresholds = Thresholds::checked(zone_type.as_str(), reject_below, accept_above)?;
        self.overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(document)
            .or_default()
            .insert(zone_type, thresholds);
        tracing::info!(
            "thresholds for {zone_type} in document {document} set to reject<{reject_below} accept>={accept_above}"
        );
        Ok(())
    }

    pub fn clear_document_overrides(&self, document: DocumentID) {
        self.overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&document);
    }

    /// Active table for `document`, one entry per zone type, with where each value comes from.
    pub fn effective_thresholds(&self, document: DocumentID) -> Vec<EffectiveThreshold> {
        let overrides = self
            .overrides
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&document)
            .cloned()
            .unwrap_or_default();

        ZoneType::ALL
            .iter()
            .map(|&zone_type| match overrides.get(&zone_type) {
                Some(&thresholds) => EffectiveThreshold {
                    zone_type,
                    thresholds,
                    source: ThresholdSource::DocumentOverride,
                },
                None => EffectiveThreshold {
                    zone_type,
                    thresholds: self.thresholds_for(document, zone_type),
                    source: ThresholdSource::Default,
                },
            })
            .collect()
    }
}
