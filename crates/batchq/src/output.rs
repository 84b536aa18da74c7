use cli_table::{Cell, CellStruct, Color, ColorChoice, Style, Table, print_stdout};

use crate::queue::{JobState, QueueSummary};

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Outputs {
    /// Human readable table.
    #[default]
    Cli,
    Json,
}

pub fn print_summary(summary: &QueueSummary, output: Outputs) -> crate::Result<()> {
    match output {
        Outputs::Cli => {
            let header = vec![
                "Id".cell().bold(true),
                "Name".cell().bold(true),
                "State".cell().bold(true),
                "Failed attempts".cell().bold(true),
                "Backend id".cell().bold(true),
                "Submitted".cell().bold(true),
                "Error".cell().bold(true),
            ];
            let table = summary_rows(summary)
                .table()
                .title(header)
                .color_choice(ColorChoice::Auto);
            print_stdout(table)?;
        }
        Outputs::Json => {
            println!("{}", format_json(summary)?);
        }
    }
    Ok(())
}

fn summary_rows(summary: &QueueSummary) -> Vec<Vec<CellStruct>> {
    summary
        .jobs
        .iter()
        .map(|job| {
            vec![
                job.id.cell(),
                job.name.as_str().cell(),
                state_cell(job.state),
                job.attempt_count.cell(),
                job.backend_handle.as_deref().unwrap_or("").cell(),
                job.submitted_at
                    .map(|time| time.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default()
                    .cell(),
                job.error.as_deref().unwrap_or("").cell(),
            ]
        })
        .collect()
}

fn state_cell(state: JobState) -> CellStruct {
    let color = match state {
        JobState::NotSubmitted | JobState::Submitted => Color::Cyan,
        JobState::Running => Color::Yellow,
        JobState::Done => Color::Green,
        JobState::Failed => Color::Red,
        JobState::Killed => Color::Magenta,
    };
    state.to_string().cell().foreground_color(Some(color))
}

fn format_json(summary: &QueueSummary) -> crate::Result<String> {
    Ok(serde_json::to_string_pretty(summary)?)
}
