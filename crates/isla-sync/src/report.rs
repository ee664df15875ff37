use anyhow::{Context, Result};
use isla_core::{Run, Step};
use isla_storage::RunLedger;

fn duration_cell(ms: Option<i64>) -> String {
    ms.map(|ms| format!("{ms} ms")).unwrap_or_else(|| "-".to_string())
}

fn step_line(step: &Step) -> String {
    let mut line = format!(
        "| {} | {} | {} |",
        step.step_name,
        step.status,
        duration_cell(step.duration_ms())
    );
    if let Some(error) = &step.error_message {
        line.push_str(&format!(" {} |", error.replace('|', "\\|")));
    } else {
        line.push_str("  |");
    }
    line
}

fn run_header(run: &Run) -> Vec<String> {
    let mut lines = vec![
        format!("## Run `{}`", run.id),
        format!("- dataset: {}", run.pipeline_name),
        format!("- status: {}", run.status),
        format!("- started: {}", run.started_at.to_rfc3339()),
        format!("- duration: {}", duration_cell(run.duration_ms())),
    ];
    if let Some(step) = run.metadata.get("failed_step").and_then(|v| v.as_str()) {
        lines.push(format!("- failed step: {step}"));
    }
    if let Some(error) = run.metadata.get("error").and_then(|v| v.as_str()) {
        lines.push(format!("- error: {error}"));
    }
    lines
}

/// Most recent `limit` runs and their steps as Markdown.
pub async fn report_runs_markdown(ledger: &dyn RunLedger, limit: usize) -> Result<String> {
    let runs = ledger.list_runs(limit.max(1)).await.context("listing runs")?;
    let mut lines = vec!["# ISLA Runs".to_string(), String::new()];
    if runs.is_empty() {
        lines.push("No runs recorded.".to_string());
        return Ok(lines.join("\n"));
    }

    for run in runs {
        let steps = ledger
            .list_steps(run.id)
            .await
            .with_context(|| format!("listing steps of run {}", run.id))?;
        lines.extend(run_header(&run));
        lines.push(String::new());
        lines.push("| step | status | duration | error |".to_string());
        lines.push("|---|---|---|---|".to_string());
        lines.extend(steps.iter().map(step_line));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
