use std::{fs::File, io::BufReader, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use zonemill_core::{
    entities::{ZoneID, ZoneType},
    extract::replay::Recording,
    DocumentInput,
};

/// A detected document plus the tool outputs recorded for its zones.
#[derive(Debug, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(flatten)]
    pub document: DocumentInput,
    #[serde(default)]
    pub recordings: Vec<Recording>,
}

impl Manifest {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path).with_context(|| format!("can't open manifest {}", path.display()))?;
        let manifest: Manifest = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("invalid manifest {}", path.display()))?;

        let unknown = manifest
            .recordings
            .iter()
            .filter(|r| !manifest.has_zone(r.zone_id))
            .count();
        if unknown > 0 {
            tracing::warn!("{unknown} recordings refer to zones missing from the manifest");
        }
        Ok(manifest)
    }

    fn has_zone(&self, zone_id: ZoneID) -> bool {
        self.document.zones.iter().any(|z| z.id == zone_id)
    }
}

/// Parses `type=reject:accept`, e.g. `table=0.4:0.8`.
pub fn parse_threshold(s: &str) -> Result<(ZoneType, f32, f32), String> {
    let (zone_type, bounds) = s
        .split_once('=')
        .ok_or_else(|| format!("expected type=reject:accept, got '{s}'"))?;
    let (reject, accept) = bounds
        .split_once(':')
        .ok_or_else(|| format!("expected reject:accept, got '{bounds}'"))?;
    let zone_type = zone_type.parse::<ZoneType>()?;
    let reject = reject
        .trim()
        .parse::<f32>()
        .map_err(|e| format!("invalid reject bound '{reject}': {e}"))?;
    let accept = accept
        .trim()
        .parse::<f32>()
        .map_err(|e| format!("invalid accept bound '{accept}': {e}"))?;
    Ok((zone_type, reject, accept))
}
