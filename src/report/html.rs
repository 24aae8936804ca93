//! HTML run report.
//!
//! The report opens with a summary block (job, CommServ, timing, counts),
//! lists failed run-level operations, then renders one table per testset
//! with the columns ID, Name, Client, Status, Start, End and Summary. A run
//! without any records renders a short "no results" page instead of empty
//! tables.

use std::fmt::Display;
use std::path::Path;

use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};

use super::ReportError;
use crate::orchestrator::{Counts, RunOutcome, TIME_FORMAT, TestCaseRecord};
use crate::testcase::TestStatus;

const HEADERS: [&str; 7] = ["ID", "Name", "Client", "Status", "Start", "End", "Summary"];

const STYLE: &str = "body { font-family: Calibri, Arial, sans-serif; font-size: 14px; }
table { border-collapse: collapse; margin-bottom: 16px; }
th, td { border: 1px solid #999; padding: 4px 8px; text-align: left; }
th { background: #dde4ee; }
td.PASSED { color: #1a7f37; font-weight: bold; }
td.FAILED { color: #cf222e; font-weight: bold; }
td.NOT_RUN { color: #9a6700; font-weight: bold; }";

fn render_err(e: impl Display) -> ReportError {
    ReportError::Render(e.to_string())
}

struct Html {
    writer: Writer<Vec<u8>>,
}

impl Html {
    fn new() -> Self {
        Self {
            writer: Writer::new_with_indent(Vec::new(), b' ', 2),
        }
    }

    fn open(&mut self, tag: &str, attrs: &[(&str, &str)]) -> Result<(), ReportError> {
        let mut start = BytesStart::new(tag);
        for attr in attrs {
            start.push_attribute(*attr);
        }
        self.writer
            .write_event(Event::Start(start))
            .map_err(render_err)
    }

    fn close(&mut self, tag: &str) -> Result<(), ReportError> {
        self.writer
            .write_event(Event::End(BytesEnd::new(tag)))
            .map_err(render_err)
    }

    fn text(&mut self, text: &str) -> Result<(), ReportError> {
        self.writer
            .write_event(Event::Text(BytesText::new(text)))
            .map_err(render_err)
    }

    fn element(&mut self, tag: &str, attrs: &[(&str, &str)], text: &str) -> Result<(), ReportError> {
        self.open(tag, attrs)?;
        self.text(text)?;
        self.close(tag)
    }

    fn finish(self) -> Result<String, ReportError> {
        String::from_utf8(self.writer.into_inner()).map_err(render_err)
    }
}

/// Renders the HTML report of a finished run.
pub fn render_html(outcome: &RunOutcome) -> Result<String, ReportError> {
    let mut html = Html::new();
    html.open("html", &[])?;

    html.open("head", &[])?;
    html.writer
        .write_event(Event::Empty(BytesStart::new("meta").with_attributes([("charset", "utf-8")])))
        .map_err(render_err)?;
    html.element("title", &[], "Automation Report")?;
    html.element("style", &[], STYLE)?;
    html.close("head")?;

    html.open("body", &[])?;
    html.element("h2", &[], "Automation Report")?;
    write_summary(&mut html, outcome)?;

    if !outcome.operation_failures.is_empty() {
        html.element("h3", &[], "Failed operations")?;
        html.open("table", &[])?;
        html.open("tr", &[])?;
        for header in ["Operation", "Status", "Reason"] {
            html.element("th", &[], header)?;
        }
        html.close("tr")?;
        for failure in &outcome.operation_failures {
            html.open("tr", &[])?;
            html.element("td", &[], &failure.operation)?;
            html.element("td", &[("class", failure.status.as_str())], failure.status.as_str())?;
            html.element("td", &[], &failure.reason)?;
            html.close("tr")?;
        }
        html.close("table")?;
    }

    let has_records = outcome.records.values().any(|records| !records.is_empty());
    if has_records {
        for (testset, records) in &outcome.records {
            if records.is_empty() {
                continue;
            }
            html.element("h3", &[], testset)?;
            write_testset_table(&mut html, records)?;
        }
    } else {
        html.element("p", &[], "No testcases were executed in this run.")?;
    }

    html.close("body")?;
    html.close("html")?;

    let body = html.finish()?;
    Ok(format!("<!DOCTYPE html>\n{body}\n"))
}

fn write_summary(html: &mut Html, outcome: &RunOutcome) -> Result<(), ReportError> {
    let counts = Counts::of(outcome.records.values().flatten());
    let overall = if outcome.exit_code() == 0 {
        TestStatus::Passed
    } else {
        TestStatus::Failed
    };

    let rows: Vec<(&str, String)> = vec![
        ("Job ID", outcome.job.clone()),
        (
            "CommServ",
            outcome.commserv.clone().unwrap_or_else(|| "-".to_string()),
        ),
        (
            "Version",
            outcome.version.clone().unwrap_or_else(|| "-".to_string()),
        ),
        ("Start Time", outcome.started.format(TIME_FORMAT).to_string()),
        ("End Time", outcome.finished.format(TIME_FORMAT).to_string()),
        ("Total", counts.total.to_string()),
        ("Passed", counts.passed.to_string()),
        ("Failed", counts.failed.to_string()),
    ];

    html.open("table", &[("class", "summary")])?;
    for (label, value) in &rows {
        html.open("tr", &[])?;
        html.element("th", &[], label)?;
        html.element("td", &[], value)?;
        html.close("tr")?;
    }
    html.open("tr", &[])?;
    html.element("th", &[], "Result")?;
    html.element("td", &[("class", overall.as_str())], overall.as_str())?;
    html.close("tr")?;
    html.close("table")
}

fn write_testset_table(html: &mut Html, records: &[TestCaseRecord]) -> Result<(), ReportError> {
    html.open("table", &[])?;
    html.open("tr", &[])?;
    for header in HEADERS {
        html.element("th", &[], header)?;
    }
    html.close("tr")?;

    for record in records {
        html.open("tr", &[])?;
        html.element("td", &[], &record.id.to_string())?;
        match &record.url {
            Some(url) => {
                html.open("td", &[])?;
                html.element("a", &[("href", url)], &record.name)?;
                html.close("td")?;
            }
            None => html.element("td", &[], &record.name)?,
        }
        html.element("td", &[], &record.client_name)?;
        html.element("td", &[("class", record.status.as_str())], record.status.as_str())?;
        html.element("td", &[], &record.started.format(TIME_FORMAT).to_string())?;
        html.element("td", &[], &record.finished.format(TIME_FORMAT).to_string())?;
        html.element("td", &[], &record.summary)?;
        html.close("tr")?;
    }

    html.close("table")
}

/// Writes the report, creating the parent directory if needed.
pub fn write_html(path: &Path, html: &str) -> Result<(), ReportError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| ReportError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(path, html).map_err(|source| ReportError::Write {
        path: path.to_path_buf(),
        source,
    })
}
