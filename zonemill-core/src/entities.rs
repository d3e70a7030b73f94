use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};
use uuid::Uuid;

pub type ZoneID = Uuid;
pub type DocumentID = Uuid;
pub type RunID = Uuid;
pub type PageNumber = u32;

const ZONEMILL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Rectangle in page-space units, origin at the top-left corner of the page.
#[derive(Debug, Default, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    #[inline(always)]
    pub fn x1(&self) -> f32 {
        self.x + self.width
    }

    #[inline(always)]
    pub fn y1(&self) -> f32 {
        self.y + self.height
    }

    #[inline(always)]
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2f32, self.y + self.height / 2f32)
    }

    #[inline(always)]
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    #[inline(always)]
    pub fn aspect_ratio(&self) -> f32 {
        if self.height > 0f32 {
            self.width / self.height
        } else {
            0f32
        }
    }

    /// Finite coordinates and a strictly positive area.
    pub fn is_valid(&self) -> bool {
        [self.x, self.y, self.width, self.height]
            .iter()
            .all(|v| v.is_finite())
            && self.width > 0f32
            && self.height > 0f32
    }

    #[inline(always)]
    fn overlap_x(&self, other: &Self) -> f32 {
        f32::max(0f32, f32::min(self.x1(), other.x1()) - f32::max(self.x, other.x))
    }

    #[inline(always)]
    fn overlap_y(&self, other: &Self) -> f32 {
        f32::max(0f32, f32::min(self.y1(), other.y1()) - f32::max(self.y, other.y))
    }

    #[inline(always)]
    pub fn contains(&self, other: &Self) -> bool {
        other.x >= self.x && other.y >= self.y && other.x1() <= self.x1() && other.y1() <= self.y1()
    }

    #[inline(always)]
    pub fn intersection(&self, other: &Self) -> f32 {
        self.overlap_x(other) * self.overlap_y(other)
    }

    #[inline(always)]
    fn union(&self, other: &Self) -> f32 {
        other.area() + self.area() - self.intersection(other)
    }

    #[inline(always)]
    pub fn iou(&self, other: &Self) -> f32 {
        let union = self.union(other);
        if union > 0f32 {
            self.intersection(other) / union
        } else {
            0f32
        }
    }

    /// Share of `self` that lies inside `other`.
    #[inline(always)]
    pub fn coverage_by(&self, other: &Self) -> f32 {
        let area = self.area();
        if area > 0f32 {
            self.intersection(other) / area
        } else {
            0f32
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneType {
    Text,
    Table,
    Diagram,
    Mixed,
}

impl ZoneType {
    pub const ALL: [ZoneType; 4] = [
        ZoneType::Text,
        ZoneType::Table,
        ZoneType::Diagram,
        ZoneType::Mixed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneType::Text => "text",
            ZoneType::Table => "table",
            ZoneType::Diagram => "diagram",
            ZoneType::Mixed => "mixed",
        }
    }
}

impl fmt::Display for ZoneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ZoneType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "text" => Ok(ZoneType::Text),
            "table" => Ok(ZoneType::Table),
            "diagram" | "figure" | "image" => Ok(ZoneType::Diagram),
            "mixed" => Ok(ZoneType::Mixed),
            other => Err(format!("unknown zone type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneStatus {
    Pending,
    Processing,
    Completed,
    Error,
    ManualOverride,
}

impl ZoneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneStatus::Pending => "pending",
            ZoneStatus::Processing => "processing",
            ZoneStatus::Completed => "completed",
            ZoneStatus::Error => "error",
            ZoneStatus::ManualOverride => "manual_override",
        }
    }
}

impl fmt::Display for ZoneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Zone {
    pub id: ZoneID,
    pub document_id: DocumentID,
    /// 1-based page index.
    pub page: PageNumber,
    pub bounds: BBox,
    /// Provisional type from upstream detection, if any.
    #[serde(default, rename = "type")]
    pub zone_type: Option<ZoneType>,
    /// Upstream detector's confidence in `zone_type`.
    #[serde(default)]
    pub type_confidence: Option<f32>,
    #[serde(default = "default_zone_status")]
    pub status: ZoneStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_zone_status() -> ZoneStatus {
    ZoneStatus::Pending
}

impl Zone {
    pub fn new(document_id: DocumentID, page: PageNumber, bounds: BBox) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            document_id,
            page,
            bounds,
            zone_type: None,
            type_confidence: None,
            status: ZoneStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_type(mut self, zone_type: ZoneType, confidence: f32) -> Self {
        self.zone_type = Some(zone_type);
        self.type_confidence = Some(confidence);
        self
    }

    pub(crate) fn set_status(&mut self, status: ZoneStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TextSpan {
    pub text: String,
    pub bounds: BBox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphicKind {
    Line,
    Rect,
    Curve,
    Image,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GraphicElement {
    pub kind: GraphicKind,
    pub bounds: BBox,
}

/// Raw content of one page as handed over by upstream detection.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PageContent {
    pub page: PageNumber,
    pub width: f32,
    pub height: f32,
    #[serde(default)]
    pub text_spans: Vec<TextSpan>,
    #[serde(default)]
    pub graphics: Vec<GraphicElement>,
}

/// Tool identifier, normalized to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(from = "String")]
pub struct ToolId(String);

impl ToolId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ToolId {
    fn from(value: String) -> Self {
        ToolId::new(value)
    }
}

impl From<&str> for ToolId {
    fn from(value: &str) -> Self {
        ToolId::new(value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ImageDescriptor {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub format: Option<String>,
}

/// Tool-native representation of an extracted zone.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionContent {
    Text { text: String },
    Table { rows: Vec<Vec<String>> },
    Image { descriptor: ImageDescriptor },
}

impl ExtractionContent {
    pub fn kind(&self) -> &'static str {
        match self {
            ExtractionContent::Text { .. } => "text",
            ExtractionContent::Table { .. } => "table",
            ExtractionContent::Image { .. } => "image",
        }
    }

    /// Flattened textual view, rows separated by newlines and cells by tabs.
    pub fn as_plain_text(&self) -> String {
        match self {
            ExtractionContent::Text { text } => text.clone(),
            ExtractionContent::Table { rows } => rows
                .iter()
                .map(|row| row.join("\t"))
                .collect::<Vec<_>>()
                .join("\n"),
            ExtractionContent::Image { descriptor } => {
                let mut out = descriptor.description.clone().unwrap_or_default();
                for label in descriptor.labels.iter() {
                    if !out.is_empty() {
                        out.push(' ');
                    }
                    out.push_str(label);
                }
                out
            }
        }
    }

    pub fn char_count(&self) -> usize {
        match self {
            ExtractionContent::Table { rows } => rows
                .iter()
                .flat_map(|r| r.iter())
                .map(|cell| cell.trim().chars().count())
                .sum(),
            _ => self
                .as_plain_text()
                .chars()
                .filter(|c| !c.is_whitespace())
                .count(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ToolMetadata {
    #[serde(with = "serde_millis", default)]
    pub duration: Duration,
    /// Confidence reported by the tool itself, if it reports one.
    #[serde(default)]
    pub reported_confidence: Option<f32>,
    /// Region the tool claims its content came from.
    #[serde(default)]
    pub content_bounds: Option<BBox>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Output of one tool invocation for one zone. Never mutated after creation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawExtraction {
    pub tool: ToolId,
    pub content: ExtractionContent,
    pub metadata: ToolMetadata,
    pub zone_id: ZoneID,
    pub attempt_index: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, Serialize)]
pub struct ConfidenceSignals {
    pub tool: f32,
    pub structural: f32,
    pub completeness: f32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ConfidenceScore {
    pub value: f32,
    pub signals: ConfidenceSignals,
    #[serde(default)]
    pub reported: Option<f32>,
    /// Set when the extraction could not be scored normally.
    #[serde(default)]
    pub reason: Option<String>,
}

impl ConfidenceScore {
    pub fn zero(reason: impl Into<String>) -> Self {
        Self {
            value: 0f32,
            signals: ConfidenceSignals::default(),
            reported: None,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdDecision {
    Accept,
    Borderline,
    Reject,
}

impl fmt::Display for ThresholdDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThresholdDecision::Accept => "accept",
            ThresholdDecision::Borderline => "borderline",
            ThresholdDecision::Reject => "reject",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    SingleAccept,
    BestAccept,
    CorroboratedAccept,
    BestEffortBorderline,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::SingleAccept => "single-accept",
            MergeStrategy::BestAccept => "best-accept",
            MergeStrategy::CorroboratedAccept => "corroborated-accept",
            MergeStrategy::BestEffortBorderline => "best-effort-borderline",
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finalized output for one zone in one processing run.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MergedResult {
    pub run_id: RunID,
    pub zone_id: ZoneID,
    pub content: ExtractionContent,
    pub final_confidence: f32,
    /// Primary tool first, then corroborating tools.
    pub contributing_tools: Vec<ToolId>,
    #[serde(default)]
    pub corroborating_tools: Vec<ToolId>,
    pub merge_strategy: MergeStrategy,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RunMetadata {
    #[serde(with = "serde_millis")]
    pub processing_duration: Duration,
    pub zonemill_version: String,
}

impl RunMetadata {
    pub fn new(processing_duration: Duration) -> Self {
        Self {
            processing_duration,
            zonemill_version: ZONEMILL_VERSION.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intersection() {
        let bbox1 = BBox::new(0.0, 0.0, 2.0, 2.0);
        let bbox2 = BBox::new(1.0, 1.0, 2.0, 2.0);
        let bbox3 = BBox::new(2.0, 2.0, 2.0, 2.0);
        let bbox4 = BBox::new(3.0, 3.0, 2.0, 2.0); // No overlap
        let bbox5 = BBox::new(-1.0, -1.0, 2.0, 2.0); // Negative coordinates
        let bbox6 = BBox::new(0.5, 0.5, 1.0, 1.0); // Inside bbox1

        assert_eq!(bbox1.intersection(&bbox3), 0.0);
        assert_eq!(bbox1.intersection(&bbox4), 0.0);
        assert_eq!(bbox5.intersection(&bbox1), 1.0);

        assert_eq!(bbox1.intersection(&bbox2), 1.0);
        assert_eq!(bbox1.intersection(&bbox6), bbox6.area());

        assert_eq!(bbox1.intersection(&bbox1), bbox1.area());
    }

    #[test]
    fn test_iou() {
        let bbox1 = BBox::new(0.0, 0.0, 2.0, 2.0);
        let bbox2 = BBox::new(1.0, 1.0, 2.0, 2.0);
        let bbox4 = BBox::new(3.0, 3.0, 2.0, 2.0);
        let bbox6 = BBox::new(0.5, 0.5, 1.0, 1.0);

        assert_eq!(bbox1.iou(&bbox1), 1.0);
        assert_eq!(bbox1.iou(&bbox4), 0.0);
        assert_eq!(bbox1.iou(&bbox2), 1.0 / 7.0);
        assert_eq!(bbox1.iou(&bbox6), bbox6.area() / bbox1.area());
        // degenerate boxes don't divide by zero
        assert_eq!(BBox::default().iou(&BBox::default()), 0.0);
    }

    #[test]
    fn test_coverage_and_validity() {
        let zone = BBox::new(0.0, 0.0, 10.0, 10.0);
        let half_in = BBox::new(5.0, 0.0, 10.0, 10.0);
        assert_eq!(half_in.coverage_by(&zone), 0.5);
        assert!(zone.contains(&BBox::new(1.0, 1.0, 2.0, 2.0)));
        assert!(zone.is_valid());
        assert!(!BBox::new(0.0, 0.0, 0.0, 4.0).is_valid());
        assert!(!BBox::new(f32::NAN, 0.0, 1.0, 1.0).is_valid());
    }

    #[test]
    fn test_zone_type_parse() {
        assert_eq!("Table".parse::<ZoneType>(), Ok(ZoneType::Table));
        assert_eq!("figure".parse::<ZoneType>(), Ok(ZoneType::Diagram));
        assert!("footer".parse::<ZoneType>().is_err());
    }

    #[test]
    fn test_content_char_count() {
        let table = ExtractionContent::Table {
            rows: vec![
                vec!["a".into(), " bc ".into()],
                vec!["".into(), "d".into()],
            ],
        };
        assert_eq!(table.char_count(), 4);
        assert_eq!(table.as_plain_text(), "a\t bc \n\td");
        let text = ExtractionContent::Text {
            text: "hello world".into(),
        };
        assert_eq!(text.char_count(), 10);
    }
}
