use itertools::Itertools;

use super::MergeConfig;
use crate::entities::{ExtractionContent, ImageDescriptor};

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .join(" ")
}

fn text_similarity(a: &str, b: &str) -> f64 {
    let (a, b) = (normalize(a), normalize(b));
    if a.is_empty() && b.is_empty() {
        return 1f64;
    }
    strsim::sorensen_dice(&a, &b)
}

fn tables_agree(a: &[Vec<String>], b: &[Vec<String>], min_agreement: f32) -> bool {
    if a.len() != b.len() || a.iter().zip(b).any(|(ra, rb)| ra.len() != rb.len()) {
        return false;
    }
    let cells = a.iter().map(|r| r.len()).sum::<usize>();
    if cells == 0 {
        return true;
    }
    let agreeing = a
        .iter()
        .zip(b)
        .flat_map(|(ra, rb)| ra.iter().zip(rb))
        .filter(|(ca, cb)| normalize(ca) == normalize(cb))
        .count();
    agreeing as f32 / cells as f32 >= min_agreement
}

fn images_agree(a: &ImageDescriptor, b: &ImageDescriptor, config: &MergeConfig) -> bool {
    if a.width != b.width || a.height != b.height {
        return false;
    }
    match (&a.description, &b.description) {
        (Some(da), Some(db)) => text_similarity(da, db) >= config.text_similarity as f64,
        (None, None) => {
            let la = a.labels.iter().map(|l| l.to_lowercase()).sorted().collect::<Vec<_>>();
            let lb = b.labels.iter().map(|l| l.to_lowercase()).sorted().collect::<Vec<_>>();
            la == lb
        }
        _ => false,
    }
}

/// Whether two extractions carry the same content. Symmetric in its arguments.
pub fn equivalent(a: &ExtractionContent, b: &ExtractionContent, config: &MergeConfig) -> bool {
    use ExtractionContent::*;
    match (a, b) {
        (Text { text: ta }, Text { text: tb }) => {
            text_similarity(ta, tb) >= config.text_similarity as f64
        }
        (Table { rows: ra }, Table { rows: rb }) => {
            tables_agree(ra, rb, config.table_cell_agreement)
        }
        (Image { descriptor: da }, Image { descriptor: db }) => images_agree(da, db, config),
        (Table { .. }, Text { .. }) | (Text { .. }, Table { .. }) => {
            text_similarity(&a.as_plain_text(), &b.as_plain_text()) >= config.text_similarity as f64
        }
        _ => false,
    }
}
