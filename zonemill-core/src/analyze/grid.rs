use itertools::Itertools;

use crate::entities::{BBox, GraphicElement, GraphicKind, TextSpan};

/// Minimum share of the zone extent a line must cover to count as a ruling line.
const MIN_RULING_EXTENT: f32 = 0.3;

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub(crate) struct GridEstimate {
    pub rows: usize,
    pub columns: usize,
    pub regularity: f32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Rulings {
    pub horizontal: usize,
    pub vertical: usize,
}

impl Rulings {
    pub fn total(&self) -> usize {
        self.horizontal + self.vertical
    }

    pub fn is_grid(&self) -> bool {
        self.horizontal >= 2 && self.vertical >= 2
    }
}

fn median(values: &mut [f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f32::total_cmp);
    Some(values[values.len() / 2])
}

/// Groups spans into visual rows by vertical centre.
pub(crate) fn cluster_rows<'a>(spans: &[&'a TextSpan], tolerance_ratio: f32) -> Vec<Vec<&'a TextSpan>> {
    let mut heights = spans
        .iter()
        .map(|s| s.bounds.height)
        .filter(|h| *h > 0f32)
        .collect::<Vec<_>>();
    let tolerance = median(&mut heights).unwrap_or(1f32) * tolerance_ratio;

    let mut rows: Vec<(f32, Vec<&'a TextSpan>)> = Vec::new();
    for span in spans
        .iter()
        .copied()
        .sorted_by(|a, b| a.bounds.center().1.total_cmp(&b.bounds.center().1))
    {
        let cy = span.bounds.center().1;
        match rows.last_mut() {
            Some((row_cy, members)) if (cy - *row_cy).abs() <= tolerance => {
                members.push(span);
                *row_cy = members.iter().map(|s| s.bounds.center().1).sum::<f32>()
                    / members.len() as f32;
            }
            _ => rows.push((cy, vec![span])),
        }
    }
    rows.into_iter().map(|(_, members)| members).collect()
}

/// Estimates a row/column grid from span alignment.
///
/// Columns are clusters of span left edges that are shared by at least two rows.
/// Regularity is the share of rows holding the modal cell count, weighted by the
/// share of spans whose left edge falls on a column.
pub(crate) fn estimate_grid(
    spans: &[&TextSpan],
    zone: &BBox,
    row_tolerance: f32,
    column_tolerance: f32,
) -> GridEstimate {
    if spans.is_empty() {
        return GridEstimate::default();
    }
    let rows = cluster_rows(spans, row_tolerance);
    let tolerance = zone.width * column_tolerance;

    let mut edges: Vec<(f32, usize)> = Vec::new();
    for span in spans.iter().sorted_by(|a, b| a.bounds.x.total_cmp(&b.bounds.x)) {
        match edges.last_mut() {
            Some((x, count)) if span.bounds.x - *x <= tolerance => *count += 1,
            _ => edges.push((span.bounds.x, 1)),
        }
    }
    let min_support = rows.len().min(2);
    let supported = edges
        .iter()
        .filter(|(_, count)| *count >= min_support)
        .collect::<Vec<_>>();
    let aligned_spans: usize = supported.iter().map(|(_, count)| count).sum();

    let columns = if rows.len() == 1 {
        rows[0].len()
    } else {
        supported.len()
    };

    let modal_rows = rows
        .iter()
        .map(|r| r.len())
        .counts()
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(_, n)| n)
        .unwrap_or(0);
    let row_consistency = modal_rows as f32 / rows.len() as f32;
    let alignment = aligned_spans as f32 / spans.len() as f32;

    GridEstimate {
        rows: rows.len(),
        columns,
        regularity: (row_consistency * alignment).clamp(0f32, 1f32),
    }
}

pub(crate) fn count_rulings(graphics: &[&GraphicElement], zone: &BBox) -> Rulings {
    let mut rulings = Rulings::default();
    for g in graphics.iter().filter(|g| g.kind == GraphicKind::Line) {
        if g.bounds.width >= g.bounds.height {
            if g.bounds.width >= zone.width * MIN_RULING_EXTENT {
                rulings.horizontal += 1;
            }
        } else if g.bounds.height >= zone.height * MIN_RULING_EXTENT {
            rulings.vertical += 1;
        }
    }
    rulings
}

/// Number of text lines split into at least two cells by `|` or tabs.
pub(crate) fn count_delimited_lines(spans: &[&TextSpan]) -> usize {
    spans
        .iter()
        .flat_map(|s| s.text.lines())
        .filter(|line| {
            let cells = if line.contains('\t') {
                line.split('\t').filter(|c| !c.trim().is_empty()).count()
            } else if line.contains('|') {
                line.split('|').filter(|c| !c.trim().is_empty()).count()
            } else {
                0
            };
            cells >= 2
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(text: &str, x: f32, y: f32, w: f32) -> TextSpan {
        TextSpan {
            text: text.to_owned(),
            bounds: BBox::new(x, y, w, 10.0),
        }
    }

    #[test]
    fn test_grid_from_aligned_cells() {
        let spans = (0..3)
            .flat_map(|r| {
                (0..3).map(move |c| span("cell", 10.0 + c as f32 * 60.0, 10.0 + r as f32 * 20.0, 40.0))
            })
            .collect::<Vec<_>>();
        let refs = spans.iter().collect::<Vec<_>>();
        let zone = BBox::new(0.0, 0.0, 200.0, 80.0);

        let grid = estimate_grid(&refs, &zone, 0.5, 0.03);
        assert_eq!(grid.rows, 3);
        assert_eq!(grid.columns, 3);
        assert_eq!(grid.regularity, 1.0);
    }

    #[test]
    fn test_prose_has_single_column() {
        let spans = (0..4)
            .map(|r| span("some running text here", 10.0, 10.0 + r as f32 * 14.0, 180.0))
            .collect::<Vec<_>>();
        let refs = spans.iter().collect::<Vec<_>>();
        let zone = BBox::new(0.0, 0.0, 200.0, 80.0);

        let grid = estimate_grid(&refs, &zone, 0.5, 0.03);
        assert_eq!(grid.rows, 4);
        assert_eq!(grid.columns, 1);
    }

    #[test]
    fn test_rulings() {
        let zone = BBox::new(0.0, 0.0, 100.0, 100.0);
        let lines = [
            BBox::new(0.0, 0.0, 100.0, 0.5),
            BBox::new(0.0, 50.0, 100.0, 0.5),
            BBox::new(0.0, 0.0, 0.5, 100.0),
            BBox::new(50.0, 0.0, 0.5, 100.0),
            BBox::new(10.0, 10.0, 5.0, 0.5), // too short
        ]
        .into_iter()
        .map(|bounds| GraphicElement {
            kind: GraphicKind::Line,
            bounds,
        })
        .collect::<Vec<_>>();
        let refs = lines.iter().collect::<Vec<_>>();
        let rulings = count_rulings(&refs, &zone);
        assert_eq!(rulings, Rulings { horizontal: 2, vertical: 2 });
        assert!(rulings.is_grid());
    }

    #[test]
    fn test_delimited_lines() {
        let spans = [
            span("a | b | c", 0.0, 0.0, 10.0),
            span("1\t2", 0.0, 10.0, 10.0),
            span("plain | ", 0.0, 20.0, 10.0),
        ];
        let refs = spans.iter().collect::<Vec<_>>();
        assert_eq!(count_delimited_lines(&refs), 2);
    }
}
