//! CSV run reports
//!
//! Two files per run, both RFC 4180 quoted:
//! - `<slug>_rarity_results.csv`: one row per ranked item, best rank first
//! - `<slug>_trait_rarity.csv`: one row per attribute pair, rarest first

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::application::sync_orchestrator::{RunReport, RunReportExporter};
use crate::domain::item::Item;

pub struct CsvReportExporter {
    output_dir: PathBuf,
}

impl CsvReportExporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

/// Collection slugs may carry path separators; keep file names flat.
fn file_stem(collection: &str) -> String {
    collection
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect()
}

fn push_cell(out: &mut String, cell: &str) {
    if cell.contains([',', '"', '\n', '\r']) {
        out.push('"');
        for c in cell.chars() {
            if c == '"' {
                out.push('"');
            }
            out.push(c);
        }
        out.push('"');
    } else {
        out.push_str(cell);
    }
}

fn push_row<'a>(out: &mut String, cells: impl IntoIterator<Item = &'a str>) {
    for (i, cell) in cells.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        push_cell(out, cell);
    }
    out.push_str("\r\n");
}

fn describe_attributes(item: Option<&&Item>) -> String {
    item.map(|item| {
        item.attributes
            .iter()
            .map(|a| format!("{}: {}", a.name, a.value))
            .collect::<Vec<_>>()
            .join("; ")
    })
    .unwrap_or_default()
}

pub(crate) fn render_results(report: &RunReport<'_>) -> String {
    let by_id: HashMap<&str, &Item> = report
        .items
        .iter()
        .map(|item| (item.item_id.as_str(), item))
        .collect();

    let mut rarities: Vec<_> = report.rarities.iter().collect();
    rarities.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.token_id.cmp(&b.token_id)));

    let mut out = String::new();
    push_row(&mut out, ["token_id", "rarity_rank", "rarity_score", "traits"]);
    for rarity in rarities {
        let traits = describe_attributes(by_id.get(rarity.item_id.as_str()));
        push_row(
            &mut out,
            [
                rarity.token_id.as_str(),
                rarity.rank.to_string().as_str(),
                format!("{:.4}", rarity.score).as_str(),
                traits.as_str(),
            ],
        );
    }
    out
}

pub(crate) fn render_traits(report: &RunReport<'_>) -> String {
    let mut rows: Vec<_> = report.table.iter().collect();
    rows.sort_by(|a, b| {
        b.2.rarity_score
            .total_cmp(&a.2.rarity_score)
            .then_with(|| a.0.cmp(b.0))
            .then_with(|| a.1.cmp(b.1))
    });

    let mut out = String::new();
    push_row(
        &mut out,
        ["trait_type", "trait_value", "count", "percentage", "rarity_score"],
    );
    for (name, value, stat) in rows {
        push_row(
            &mut out,
            [
                name,
                value,
                stat.count.to_string().as_str(),
                format!("{:.2}", stat.percentage).as_str(),
                format!("{:.4}", stat.rarity_score).as_str(),
            ],
        );
    }
    out
}

impl RunReportExporter for CsvReportExporter {
    fn export(&self, report: &RunReport<'_>) -> std::io::Result<Vec<PathBuf>> {
        fs::create_dir_all(&self.output_dir)?;
        let stem = file_stem(report.collection);

        let results_path = self.output_dir.join(format!("{stem}_rarity_results.csv"));
        fs::write(&results_path, render_results(report))?;

        let traits_path = self.output_dir.join(format!("{stem}_trait_rarity.csv"));
        fs::write(&traits_path, render_traits(report))?;

        info!(
            collection = report.collection,
            results = %results_path.display(),
            traits = %traits_path.display(),
            "Rarity reports written"
        );
        Ok(vec![results_path, traits_path])
    }
}
