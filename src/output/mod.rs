//! Result presentation: console table and optional CSV export.

pub mod format;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;

use crate::roles::orchestrator::BenchReport;
use format::format_duration;

const HEADERS: [&str; 7] = ["Configuration", "QoS", "Min", "Max", "Avg", "P95", "P99"];

pub enum OutputWriter {
    Stdout,
    Csv { path: String, file: tokio::fs::File },
}

impl OutputWriter {
    pub fn new_stdout() -> Self {
        OutputWriter::Stdout
    }

    pub async fn new_csv(path: String) -> Result<Self> {
        let file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("creating CSV output {}", path))?;
        Ok(OutputWriter::Csv { path, file })
    }

    pub async fn write_report(&mut self, report: &BenchReport) -> Result<()> {
        match self {
            OutputWriter::Stdout => {
                print!("{}", render_table(report));
                Ok(())
            }
            OutputWriter::Csv { path, file } => {
                file.write_all(render_csv(report).as_bytes())
                    .await
                    .with_context(|| format!("writing CSV output {}", path))?;
                file.flush().await?;
                Ok(())
            }
        }
    }
}

/// One row per (target, QoS); the target name is only printed on its first row.
pub fn render_table(report: &BenchReport) -> String {
    let mut rows: Vec<[String; 7]> = Vec::new();
    for outcome in &report.outcomes {
        for (i, batch) in outcome.batches.iter().enumerate() {
            let s = &batch.summary;
            rows.push([
                if i == 0 {
                    outcome.target.name.clone()
                } else {
                    String::new()
                },
                batch.qos.to_string(),
                format_duration(s.min),
                format_duration(s.max),
                format_duration(s.mean),
                format_duration(s.p95),
                format_duration(s.p99),
            ]);
        }
    }

    let mut widths = HEADERS.map(|h| h.chars().count());
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row.iter()) {
            *w = (*w).max(cell.chars().count());
        }
    }

    let line = |cells: &[String]| -> String {
        let body: Vec<String> = cells
            .iter()
            .zip(widths.iter())
            .map(|(c, &w)| format!(" {:<w$} ", c, w = w))
            .collect();
        format!("|{}|\n", body.join("|"))
    };

    let mut out = String::new();
    out.push_str(&line(&HEADERS.map(String::from)[..]));
    let sep: Vec<String> = widths.iter().map(|&w| "-".repeat(w + 2)).collect();
    out.push_str(&format!("|{}|\n", sep.join("|")));
    for row in &rows {
        out.push_str(&line(&row[..]));
    }

    for outcome in &report.outcomes {
        if let Some(e) = &outcome.failure {
            out.push_str(&format!("FAILED {}: {}\n", outcome.target.name, e));
        }
        if let Some(e) = &outcome.teardown_error {
            out.push_str(&format!("teardown {}: {}\n", outcome.target.name, e));
        }
    }
    out
}

pub fn csv_header() -> &'static str {
    "run_id,target,qos,expected,samples,dropped,min_ns,max_ns,mean_ns,p95_ns,p99_ns,batch_ns"
}

pub fn render_csv(report: &BenchReport) -> String {
    let mut out = String::from(csv_header());
    out.push('\n');
    for outcome in &report.outcomes {
        for batch in &outcome.batches {
            let s = &batch.summary;
            out.push_str(&format!(
                "{},{},{},{},{},{},{},{},{},{},{},{}\n",
                csv_field(&report.run_id),
                csv_field(&outcome.target.name),
                batch.qos.level(),
                report.count,
                s.count,
                batch.malformed,
                s.min.as_nanos(),
                s.max.as_nanos(),
                s.mean.as_nanos(),
                s.p95.as_nanos(),
                s.p99.as_nanos(),
                batch.elapsed.as_nanos()
            ));
        }
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
