use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use colored::*;
use serde::Serialize;
use zonemill_core::{
    entities::{MergedResult, Zone},
    orchestrator::{RunHistory, ZoneOutcome, ZoneSummary},
    threshold::EffectiveThreshold,
    DocumentReport, DocumentStatus, EnhancedOrchestrator,
};

#[derive(Debug, Serialize)]
struct ZoneResults {
    zone: Zone,
    merged: Option<MergedResult>,
    runs: Vec<RunHistory>,
}

#[derive(Debug, Serialize)]
struct ResultsFile<'a> {
    report: &'a DocumentReport,
    summary: ZoneSummary,
    thresholds: Vec<EffectiveThreshold>,
    zones: Vec<ZoneResults>,
}

pub fn sanitize_doc_name(doc_name: &str) -> String {
    doc_name
        .chars()
        .filter_map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                Some(c)
            } else if c.is_whitespace() {
                None
            } else {
                Some('-')
            }
        })
        .collect::<String>()
}

fn recreate_result_dir(result_dir: &Path) -> anyhow::Result<PathBuf> {
    if let Some(parent) = result_dir.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if std::fs::create_dir(result_dir).is_err() {
        std::fs::remove_dir_all(result_dir)?;
        std::fs::create_dir(result_dir)?;
    }
    Ok(result_dir.to_owned())
}

/// Writes `<doc>-results/<doc>.json` under `output_dir` (or the working directory).
pub fn save_results(
    orchestrator: &EnhancedOrchestrator,
    report: &DocumentReport,
    output_dir: Option<&PathBuf>,
) -> anyhow::Result<PathBuf> {
    let doc_name = sanitize_doc_name(&report.name);
    let result_dir_name = format!("{doc_name}-results");
    let res_dir_path = match output_dir {
        Some(p) => recreate_result_dir(&p.join(&result_dir_name))?,
        None => recreate_result_dir(&PathBuf::from(format!("./{result_dir_name}")))?,
    };

    let zones = orchestrator
        .zones(report.document_id)?
        .into_iter()
        .map(|zone| ZoneResults {
            merged: orchestrator.merged_result(zone.id),
            runs: orchestrator.run_histories(zone.id),
            zone,
        })
        .collect();
    let results = ResultsFile {
        report,
        summary: orchestrator.zone_summary(report.document_id)?,
        thresholds: orchestrator.effective_thresholds(report.document_id)?,
        zones,
    };

    let file_out = res_dir_path.join(format!("{doc_name}.json"));
    let file = File::create(&file_out)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &results)?;
    writer.flush()?;

    println!(
        "{} Results saved in: {}",
        "✓".green().bold(),
        res_dir_path.display().to_string().cyan().underline()
    );
    Ok(file_out)
}

pub fn print_summary(report: &DocumentReport) {
    let status = match report.status {
        DocumentStatus::Completed => report.status.to_string().green().bold(),
        DocumentStatus::PartiallyCompleted => report.status.to_string().yellow().bold(),
        DocumentStatus::Failed => report.status.to_string().red().bold(),
        _ => report.status.to_string().normal(),
    };
    println!("{} {} {status}", "ℹ".blue().bold(), report.name.bold());

    let stats = &report.stats;
    println!(
        "  {} accepted, {} failed, {} incomplete, {} skipped of {} zones",
        stats.completed.to_string().green(),
        stats.failed.to_string().red(),
        stats.incomplete.to_string().yellow(),
        stats.skipped,
        stats.total_zones
    );
    if let Some(avg) = stats.average_confidence {
        println!(
            "  average confidence {avg:.3}, success rate {:.0}%",
            stats.success_rate * 100.0
        );
    }
    if report.timed_out {
        println!("  {} document budget exhausted", "!".yellow().bold());
    } else if report.cancelled {
        println!("  {} cancelled", "!".yellow().bold());
    }

    for zone in report
        .zones
        .iter()
        .filter(|z| matches!(z.outcome, ZoneOutcome::Exhausted | ZoneOutcome::ConfigurationError))
    {
        println!(
            "  {} zone {}: {}",
            "✗".red(),
            zone.zone_id,
            zone.error.as_deref().unwrap_or("no result")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_doc_name() {
        assert_eq!(sanitize_doc_name("Annual report 2024.pdf"), "Annualreport2024-pdf");
        assert_eq!(sanitize_doc_name("q3_summary-v2"), "q3_summary-v2");
    }
}
