use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::entities::{BBox, GraphicElement, GraphicKind, PageContent, TextSpan, Zone, ZoneType};

mod grid;

use grid::{count_delimited_lines, count_rulings, estimate_grid};

/// Share of the page height that counts as header or footer band.
const EDGE_BAND: f32 = 0.15;

/// Graphic count at which the count term of visual complexity saturates.
const COMPLEXITY_GRAPHIC_SATURATION: f32 = 20f32;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Upstream types with at least this confidence are never replaced.
    pub trusted_type_confidence: f32,
    /// Share of a span or graphic area that must fall inside the zone.
    pub inclusion_ratio: f32,
    /// Row clustering tolerance as a fraction of the median span height.
    pub row_tolerance: f32,
    /// Column clustering tolerance as a fraction of the zone width.
    pub column_tolerance: f32,
    pub table_regularity: f32,
    pub min_delimited_lines: usize,
    pub diagram_complexity: f32,
    pub diagram_max_text_coverage: f32,
    pub mixed_complexity: f32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            trusted_type_confidence: 0.8,
            inclusion_ratio: 0.5,
            row_tolerance: 0.5,
            column_tolerance: 0.03,
            table_regularity: 0.6,
            min_delimited_lines: 2,
            diagram_complexity: 0.5,
            diagram_max_text_coverage: 0.15,
            mixed_complexity: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeSource {
    /// Upstream type kept.
    Upstream,
    /// Type inferred from zone content.
    Inferred,
    /// Degraded analysis with no upstream type: the broadest type is assumed.
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionClass {
    Header,
    UpperBody,
    MiddleBody,
    LowerBody,
    Footer,
}

impl PositionClass {
    pub fn classify(zone: &BBox, page_height: f32) -> Option<Self> {
        if !(page_height > 0f32) || !zone.is_valid() {
            return None;
        }
        let top = zone.y / page_height;
        let bottom = zone.y1() / page_height;
        let center = zone.center().1 / page_height;
        let class = if bottom <= EDGE_BAND {
            PositionClass::Header
        } else if top >= 1f32 - EDGE_BAND {
            PositionClass::Footer
        } else if center < 0.3 {
            PositionClass::UpperBody
        } else if center > 0.7 {
            PositionClass::LowerBody
        } else {
            PositionClass::MiddleBody
        };
        Some(class)
    }
}

/// Features of one zone, computed fresh on every analysis pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisHints {
    pub zone_type: ZoneType,
    pub type_source: TypeSource,
    pub inferred_type: Option<ZoneType>,
    /// Non-whitespace characters per 1000 square units of zone area.
    pub text_density: f32,
    pub text_coverage: f32,
    pub regularity: f32,
    pub estimated_rows: usize,
    pub estimated_columns: usize,
    pub ruling_lines: usize,
    pub delimited_lines: usize,
    pub visual_complexity: f32,
    pub expected_chars: Option<usize>,
    pub expected_words: Option<usize>,
    pub position: Option<PositionClass>,
    pub degraded: bool,
    pub degraded_reason: Option<String>,
}

impl AnalysisHints {
    /// Hints for a zone that could not be analysed. Downstream treats them as
    /// "try every compatible tool".
    pub fn degraded(zone: &Zone, reason: impl Into<String>) -> Self {
        let (zone_type, type_source) = match zone.zone_type {
            Some(t) => (t, TypeSource::Upstream),
            None => (ZoneType::Mixed, TypeSource::Fallback),
        };
        Self {
            zone_type,
            type_source,
            inferred_type: None,
            text_density: 0f32,
            text_coverage: 0f32,
            regularity: 0f32,
            estimated_rows: 0,
            estimated_columns: 0,
            ruling_lines: 0,
            delimited_lines: 0,
            visual_complexity: 0f32,
            expected_chars: None,
            expected_words: None,
            position: None,
            degraded: true,
            degraded_reason: Some(reason.into()),
        }
    }
}

fn is_inside(bounds: &BBox, zone: &BBox, ratio: f32) -> bool {
    if bounds.area() > 0f32 {
        bounds.coverage_by(zone) > ratio
    } else {
        // rules and hairlines have no area
        let (cx, cy) = bounds.center();
        cx >= zone.x && cx <= zone.x1() && cy >= zone.y && cy <= zone.y1()
    }
}

fn visual_complexity(graphics: &[&GraphicElement], zone: &BBox) -> f32 {
    if graphics.is_empty() {
        return 0f32;
    }
    let covered: f32 = graphics
        .iter()
        .filter(|g| g.kind != GraphicKind::Line)
        .map(|g| g.bounds.intersection(zone))
        .sum();
    let area_term = (covered / zone.area()).min(1f32);
    let count_term = (graphics.len() as f32 / COMPLEXITY_GRAPHIC_SATURATION).min(1f32);
    (0.6 * area_term + 0.4 * count_term).clamp(0f32, 1f32)
}

/// Computes features and a resolved type for `zone`.
///
/// Never fails: missing or inconsistent input produces degraded hints.
#[instrument(skip_all, fields(zone_id = %zone.id, page = zone.page))]
pub fn analyze_zone(zone: &Zone, page: Option<&PageContent>, config: &AnalyzerConfig) -> AnalysisHints {
    let Some(page) = page else {
        tracing::debug!("no page content for zone");
        return AnalysisHints::degraded(zone, "page content missing");
    };
    if !zone.bounds.is_valid() {
        return AnalysisHints::degraded(zone, "invalid zone geometry");
    }
    if !(page.width.is_finite() && page.height.is_finite() && page.width > 0f32 && page.height > 0f32) {
        return AnalysisHints::degraded(zone, "invalid page geometry");
    }

    let bounds = &zone.bounds;
    let spans: Vec<&TextSpan> = page
        .text_spans
        .iter()
        .filter(|s| s.bounds.is_valid() && is_inside(&s.bounds, bounds, config.inclusion_ratio))
        .collect();
    let graphics: Vec<&GraphicElement> = page
        .graphics
        .iter()
        .filter(|g| {
            [g.bounds.x, g.bounds.y, g.bounds.width, g.bounds.height]
                .iter()
                .all(|v| v.is_finite())
                && is_inside(&g.bounds, bounds, config.inclusion_ratio)
        })
        .collect();

    if spans.is_empty() && graphics.is_empty() {
        return AnalysisHints::degraded(zone, "zone holds no content");
    }

    let chars: usize = spans
        .iter()
        .map(|s| s.text.chars().filter(|c| !c.is_whitespace()).count())
        .sum();
    let words: usize = spans.iter().map(|s| s.text.split_whitespace().count()).sum();
    let text_coverage = (spans
        .iter()
        .map(|s| s.bounds.intersection(bounds))
        .sum::<f32>()
        / bounds.area())
    .clamp(0f32, 1f32);
    let text_density = chars as f32 / (bounds.area() / 1000f32);

    let grid = estimate_grid(&spans, bounds, config.row_tolerance, config.column_tolerance);
    let rulings = count_rulings(&graphics, bounds);
    let delimited_lines = count_delimited_lines(&spans);
    let complexity = visual_complexity(&graphics, bounds);

    let aligned_table =
        grid.rows >= 2 && grid.columns >= 2 && grid.regularity >= config.table_regularity;
    let inferred = if aligned_table
        || rulings.is_grid()
        || delimited_lines >= config.min_delimited_lines
    {
        ZoneType::Table
    } else if spans.is_empty() {
        ZoneType::Diagram
    } else if complexity >= config.diagram_complexity
        && text_coverage < config.diagram_max_text_coverage
    {
        ZoneType::Diagram
    } else if complexity >= config.mixed_complexity {
        if text_coverage >= config.diagram_max_text_coverage {
            ZoneType::Mixed
        } else {
            ZoneType::Diagram
        }
    } else {
        ZoneType::Text
    };

    let upstream_trusted = match (zone.zone_type, zone.type_confidence) {
        (Some(_), None) => true,
        (Some(_), Some(c)) => c >= config.trusted_type_confidence,
        (None, _) => false,
    };
    let (zone_type, type_source) = match zone.zone_type {
        Some(t) if upstream_trusted => (t, TypeSource::Upstream),
        _ => (inferred, TypeSource::Inferred),
    };
    tracing::debug!(
        "zone analysed as {zone_type} ({type_source:?}): rows={} cols={} regularity={:.2} rulings={} complexity={complexity:.2}",
        grid.rows,
        grid.columns,
        grid.regularity,
        rulings.total()
    );

    AnalysisHints {
        zone_type,
        type_source,
        inferred_type: Some(inferred),
        text_density,
        text_coverage,
        regularity: grid.regularity,
        estimated_rows: grid.rows,
        estimated_columns: grid.columns,
        ruling_lines: rulings.total(),
        delimited_lines,
        visual_complexity: complexity,
        expected_chars: (!spans.is_empty()).then_some(chars),
        expected_words: (!spans.is_empty()).then_some(words),
        position: PositionClass::classify(bounds, page.height),
        degraded: false,
        degraded_reason: None,
    }
}
