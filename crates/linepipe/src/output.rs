use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct FrameOutput<'a> {
    sequence: u64,
    child_pid: Option<u32>,
    line_count: usize,
    lines: &'a [String],
    timestamp: String,
}

/// Print one received frame. `sequence` counts from 1.
pub fn print_frame(lines: &[String], sequence: u64, child_pid: Option<u32>, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = FrameOutput {
                sequence,
                child_pid,
                line_count: lines.len(),
                lines,
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec![format!("FRAME {sequence}"), "LINE".to_string()]);
            for (index, line) in lines.iter().enumerate() {
                table.add_row(vec![(index + 1).to_string(), line.clone()]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let pid = child_pid.map_or_else(|| "-".to_string(), |pid| pid.to_string());
            println!("frame={sequence} lines={} child={pid}", lines.len());
            for line in lines {
                println!("  {line}");
            }
        }
        OutputFormat::Raw => print_raw(lines),
    }
}

/// Payload lines only, newline-terminated, nothing else.
pub fn print_raw(lines: &[String]) {
    let mut out = std::io::stdout().lock();
    for line in lines {
        let _ = writeln!(out, "{line}");
    }
    let _ = out.flush();
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
