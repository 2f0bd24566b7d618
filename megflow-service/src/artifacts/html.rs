// HTML Reports
// Static summaries of a run and of per-subject BEM surfaces

use crate::execution::{NodeStatus, RunReport};

use std::fmt::Write as _;
use std::path::Path;

const STYLE: &str = "body{font-family:sans-serif;margin:2em}\
table{border-collapse:collapse}\
td,th{border:1px solid #ccc;padding:4px 8px;text-align:left}\
.completed{color:#2e7d32}.failed{color:#c62828}.skipped,.cancelled{color:#9e9e9e}";

/// Escape text for inclusion in HTML element content or attribute values
pub fn html_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{title}</title>\n<style>{STYLE}</style>\n</head>\n<body>\n<h1>{title}</h1>\n{body}</body>\n</html>\n",
        title = html_escape(title),
    )
}

/// One table per execution context, one row per node instance
pub fn render_run_report(report: &RunReport) -> String {
    let mut body = String::new();
    let outcome = if report.success() { "succeeded" } else { "failed" };
    let _ = writeln!(
        body,
        "<p>{} instances, {} nodes: {} completed, {} failed, {} skipped, {} cancelled. Run {} in {:.1}s.</p>",
        report.instances.len(),
        report.total_nodes(),
        report.count(NodeStatus::Completed),
        report.count(NodeStatus::Failed),
        report.count(NodeStatus::Skipped),
        report.count(NodeStatus::Cancelled),
        outcome,
        report.duration_secs,
    );

    for instance in &report.instances {
        let _ = writeln!(body, "<h2>{}</h2>", html_escape(&instance.context.to_string()));
        body.push_str("<table>\n<tr><th>unit</th><th>status</th><th>duration</th><th>detail</th></tr>\n");
        for node in &instance.nodes {
            let detail = match (&node.failure, &node.reason) {
                (Some(failure), _) => format!("{}: {}", failure.kind, failure.message),
                (None, Some(reason)) => reason.clone(),
                (None, None) => String::new(),
            };
            let _ = writeln!(
                body,
                "<tr><td>{}</td><td class=\"{status}\">{status}</td><td>{:.1}s</td><td><pre>{}</pre></td></tr>",
                html_escape(&node.unit),
                node.duration_secs,
                html_escape(&detail),
                status = node.status,
            );
        }
        body.push_str("</table>\n");
    }

    page(&format!("{} run report", report.workflow), &body)
}

/// Summary of the BEM meshes copied for one subject
pub fn bem_report_html(subject: &str, surfaces: &[impl AsRef<Path>]) -> String {
    let mut body = String::new();
    body.push_str("<table>\n<tr><th>surface</th><th>size</th><th>path</th></tr>\n");
    for surface in surfaces {
        let path = surface.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let size = std::fs::metadata(path)
            .map(|m| format!("{} bytes", m.len()))
            .unwrap_or_else(|_| "missing".to_string());
        let _ = writeln!(
            body,
            "<tr><td>{}</td><td>{}</td><td>{}</td></tr>",
            html_escape(&name),
            size,
            html_escape(&path.display().to_string()),
        );
    }
    body.push_str("</table>\n");

    page(&format!("BEM surfaces for {}", subject), &body)
}
