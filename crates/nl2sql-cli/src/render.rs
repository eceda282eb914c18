use nl2sql_client::{Message, Role, Row, StageStep, StepStatus, format_elapsed};

/// Turns successive step snapshots into progress lines, one per change.
#[derive(Debug, Default)]
pub struct ProgressPrinter {
    seen: Vec<StepStatus>,
}

impl ProgressPrinter {
    pub fn update(&mut self, steps: &[StageStep], now_ms: u64) -> Vec<String> {
        if steps.len() < self.seen.len() {
            self.seen.clear();
        }
        let mut lines = Vec::new();
        for (idx, step) in steps.iter().enumerate() {
            match self.seen.get(idx).copied() {
                Some(status) if status == step.status => continue,
                Some(_) => self.seen[idx] = step.status,
                None => self.seen.push(step.status),
            }
            lines.push(step_line(step, now_ms));
        }
        lines
    }
}

pub fn step_line(step: &StageStep, now_ms: u64) -> String {
    let marker = match step.status {
        StepStatus::Running => "…",
        StepStatus::Completed => "✓",
        StepStatus::Failed => "✗",
    };
    match step.status {
        StepStatus::Running => format!("{marker} {}", step.display_label),
        _ => format!(
            "{marker} {} ({})",
            step.display_label,
            format_elapsed(step.elapsed_at(now_ms))
        ),
    }
}

pub fn message_block(message: &Message) -> String {
    let speaker = match message.role {
        Role::User => "you",
        Role::Assistant => "assistant",
    };
    let mut out = format!("{speaker}: {}", message.content);
    if let Some(rows) = message.rows.as_deref() {
        out.push('\n');
        out.push_str(&table(rows));
    }
    out
}

fn cell(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Plain-text table of result rows; columns follow first appearance.
pub fn table(rows: &[Row]) -> String {
    if rows.is_empty() {
        return "(no rows)".to_string();
    }
    let mut columns: Vec<&str> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !columns.contains(&key.as_str()) {
                columns.push(key);
            }
        }
    }
    let cells: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|c| row.get(*c).map(cell).unwrap_or_default())
                .collect()
        })
        .collect();
    let widths: Vec<usize> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| {
            cells
                .iter()
                .map(|r| r[i].chars().count())
                .chain(std::iter::once(c.chars().count()))
                .max()
                .unwrap_or_default()
        })
        .collect();

    let line = |values: Vec<&str>| {
        values
            .iter()
            .zip(&widths)
            .map(|(v, w)| format!("{v:<width$}", width = *w))
            .collect::<Vec<_>>()
            .join(" | ")
            .trim_end()
            .to_string()
    };
    let mut out = vec![line(columns.clone())];
    out.push(
        widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-"),
    );
    for row in &cells {
        out.push(line(row.iter().map(String::as_str).collect()));
    }
    out.join("\n")
}
