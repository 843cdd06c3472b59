//! Result-table writers and the markdown experiment report.

pub mod visualization;

use std::{
    fmt::Write as _,
    fs::{self, File},
    io::{BufWriter, Write},
    path::Path,
};

use serde::Serialize;
use serde_json::Value;

use crate::{
    error::Result,
    evaluation::{
        BootstrapRow, MethodSummaryRow, error_analysis::ErrorRow, localization::LocalizationRow,
        robustness::RobustnessRow, statistics::ComparisonRow,
    },
};

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Writes serializable rows as CSV with a header taken from the field names.
pub fn write_csv<T: Serialize, P: AsRef<Path>>(path: P, rows: &[T]) -> Result<()> {
    let path = path.as_ref();
    ensure_parent(path)?;
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    log::debug!("Wrote {} rows to {}", rows.len(), path.display());
    Ok(())
}

pub fn write_json<T: Serialize + ?Sized, P: AsRef<Path>>(path: P, value: &T) -> Result<()> {
    let path = path.as_ref();
    ensure_parent(path)?;
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

fn format_cell(value: &Value) -> String {
    match value {
        Value::Null => "nan".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match (n.as_u64(), n.as_i64(), n.as_f64()) {
            (Some(u), _, _) => u.to_string(),
            (None, Some(i), _) => i.to_string(),
            (None, None, Some(f)) => format!("{f:.4}"),
            _ => n.to_string(),
        },
        Value::String(s) => s.replace('|', "\\|"),
        other => other.to_string().replace('|', "\\|"),
    }
}

/// Renders rows as a GitHub markdown table, columns in field order.
pub fn markdown_table<T: Serialize>(rows: &[T]) -> String {
    let objects: Vec<serde_json::Map<String, Value>> = rows
        .iter()
        .filter_map(|row| match serde_json::to_value(row) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        })
        .collect();
    let Some(first) = objects.first() else {
        return "_No data_".to_string();
    };

    let headers: Vec<&String> = first.keys().collect();
    let mut out = String::new();
    let _ = writeln!(out, "| {} |", headers.iter().map(|h| h.as_str()).collect::<Vec<_>>().join(" | "));
    let _ = writeln!(out, "|{}|", vec!["---"; headers.len()].join("|"));
    for object in &objects {
        let cells: Vec<String> = headers
            .iter()
            .map(|h| object.get(*h).map(format_cell).unwrap_or_default())
            .collect();
        let _ = writeln!(out, "| {} |", cells.join(" | "));
    }
    out.trim_end().to_string()
}

/// Everything the markdown report renders.
#[derive(Debug, Clone, Copy)]
pub struct ExperimentReport<'a> {
    pub experiment_name: &'a str,
    pub assumptions: &'a [&'a str],
    pub summary: &'a [MethodSummaryRow],
    pub bootstrap: &'a [BootstrapRow],
    pub robustness: &'a [RobustnessRow],
    pub localization: &'a [LocalizationRow],
    pub statistics: &'a [ComparisonRow],
    pub errors: &'a [ErrorRow],
}

impl ExperimentReport<'_> {
    pub fn to_markdown(&self) -> String {
        let mut lines = vec![format!("# Experiment Report: {}", self.experiment_name), String::new()];

        lines.push("## Assumptions".into());
        lines.extend(
            self.assumptions
                .iter()
                .enumerate()
                .map(|(i, item)| format!("{}. {}", i + 1, item)),
        );
        lines.push(String::new());

        let sections = [
            ("Main Metrics (Test Split)", markdown_table(self.summary)),
            ("Bootstrap Confidence Interval", markdown_table(self.bootstrap)),
            ("Robustness Metrics", markdown_table(self.robustness)),
            ("Localization Metrics", markdown_table(self.localization)),
            ("Statistical Comparison", markdown_table(self.statistics)),
            ("Error Analysis (Top FP/FN)", markdown_table(self.errors)),
        ];
        for (title, table) in sections {
            lines.push(format!("## {title}"));
            lines.push(table);
            lines.push(String::new());
        }

        lines.push("## Notes".into());
        lines.push("- Improvements are empirical under the current datasets and perturbation settings.".into());
        lines.push("- Thresholds were selected on the validation split only.".into());
        lines.push(String::new());
        lines.join("\n")
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        ensure_parent(path)?;
        fs::write(path, self.to_markdown())?;
        log::info!("Wrote experiment report to {}", path.display());
        Ok(())
    }
}
