pub mod backup;
pub mod cluster;
pub mod serve;

use colored::Colorize;
use comfy_table::{Table, presets::UTF8_FULL};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::time::Duration;
use tandem_core::cluster::Machine;

#[derive(Debug, Clone)]
pub struct OutputContext {
    pub json: bool,
    pub verbose: bool,
}

/// Creates a spinner with the given message
///
/// Hidden in JSON mode so stdout stays machine-readable.
pub fn create_spinner(message: &str, output: &OutputContext) -> ProgressBar {
    if output.json {
        return ProgressBar::hidden();
    }
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
        .template("{spinner:.cyan} {msg}")
    {
        spinner.set_style(style);
    }
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

impl OutputContext {
    pub fn print_table(&self, columns: &[&str], rows: Vec<Vec<String>>) {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(columns);
        for row in rows {
            table.add_row(row);
        }
        println!("{table}");
    }

    pub fn print_json<T: Serialize>(&self, data: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(data)?);
        Ok(())
    }

    pub fn print_machines(&self, machines: &[Machine]) -> anyhow::Result<()> {
        if self.json {
            return self.print_json(&machines);
        }
        let rows = machines
            .iter()
            .map(|m| {
                vec![
                    m.machine_id.to_string(),
                    m.server.clone(),
                    format!("{:?}", m.role).to_lowercase(),
                    m.last_committed_tx.to_string(),
                    m.effective_backup_port().to_string(),
                ]
            })
            .collect();
        self.print_table(
            &["Machine", "Server", "Role", "Last tx", "Backup port"],
            rows,
        );
        Ok(())
    }

    pub fn print_success(&self, message: &str) {
        if !self.json {
            println!("{} {}", "✓".green(), message);
        }
    }

    pub fn print_error(&self, message: &str) {
        eprintln!("{} {}", "✗".red(), message);
    }

    pub fn print_info(&self, message: &str) {
        if !self.json {
            println!("{} {}", "ℹ".blue(), message);
        }
    }
}
