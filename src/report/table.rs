//! Plain-text result tables for the console.

use console::{Alignment, pad_str, style};

use crate::orchestrator::{TIME_FORMAT, TestCaseRecord, TestSetSummary};
use crate::testcase::TestStatus;

const NAME_WIDTH: usize = 30;
const HEADERS: [&str; 6] = ["ID", "Name", "Status", "Start Time", "End Time", "Total Time"];

/// Renders one table per testset.
pub fn render_tables(summaries: &[TestSetSummary], colored: bool) -> String {
    let mut out = String::new();
    for summary in summaries {
        out.push_str(&render_table(&summary.testset_name, &summary.testcases, colored));
        out.push('\n');
    }
    out
}

fn render_table(testset: &str, records: &[TestCaseRecord], colored: bool) -> String {
    let rows: Vec<[String; 6]> = records
        .iter()
        .map(|r| {
            [
                r.id.to_string(),
                r.name.clone(),
                r.status.to_string(),
                r.started.format(TIME_FORMAT).to_string(),
                r.finished.format(TIME_FORMAT).to_string(),
                format_elapsed(r.elapsed()),
            ]
        })
        .collect();

    let mut widths = HEADERS.map(str::len);
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            let len = if i == 1 {
                wrap(cell, NAME_WIDTH).iter().map(|l| l.chars().count()).max().unwrap_or(0)
            } else {
                cell.chars().count()
            };
            widths[i] = widths[i].max(len);
        }
    }

    let separator = format!(
        "+{}+\n",
        widths
            .iter()
            .map(|w| "-".repeat(w + 2))
            .collect::<Vec<_>>()
            .join("+")
    );

    let mut out = format!("Testset: {testset}\n");
    out.push_str(&separator);
    out.push_str(&line(&HEADERS.map(str::to_string), &widths));
    out.push_str(&separator);

    for (row, record) in rows.iter().zip(records) {
        let name_lines = wrap(&row[1], NAME_WIDTH);
        for (n, name) in name_lines.iter().enumerate() {
            let mut cells: [String; 6] = Default::default();
            cells[1] = name.clone();
            if n == 0 {
                cells[0] = row[0].clone();
                cells[2] = if colored {
                    colorize(record.status, &row[2])
                } else {
                    row[2].clone()
                };
                cells[3] = row[3].clone();
                cells[4] = row[4].clone();
                cells[5] = row[5].clone();
            }
            out.push_str(&line(&cells, &widths));
        }
    }
    out.push_str(&separator);
    out
}

fn line(cells: &[String; 6], widths: &[usize; 6]) -> String {
    let padded: Vec<String> = cells
        .iter()
        .zip(widths)
        .map(|(cell, w)| pad_str(cell, *w, Alignment::Left, None).into_owned())
        .collect();
    format!("| {} |\n", padded.join(" | "))
}

fn colorize(status: TestStatus, text: &str) -> String {
    match status {
        TestStatus::Passed => style(text).green().to_string(),
        TestStatus::Failed => style(text).red().to_string(),
        TestStatus::NotRun => style(text).yellow().to_string(),
    }
}

/// Splits text into lines of at most `width` characters, breaking at
/// whitespace where possible.
fn wrap(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        let mut word = word.to_string();
        while word.chars().count() > width {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            let head: String = word.chars().take(width).collect();
            word = word.chars().skip(width).collect();
            lines.push(head);
        }
        let needed = if current.is_empty() {
            word.chars().count()
        } else {
            current.chars().count() + 1 + word.chars().count()
        };
        if needed > width && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
        }
        if !word.is_empty() {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(&word);
        }
    }
    if !current.is_empty() || lines.is_empty() {
        lines.push(current);
    }
    lines
}

fn format_elapsed(elapsed: chrono::Duration) -> String {
    let secs = elapsed.num_seconds().max(0);
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
