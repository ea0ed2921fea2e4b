use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
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

/// Result of one `call`.
#[derive(Debug, Serialize)]
pub struct CallOutput {
    pub endpoint: String,
    pub method: String,
    pub codec: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub trace_id: String,
    pub elapsed_ms: u128,
    pub reply: serde_json::Value,
}

/// Printed once by `serve` after the listener is bound.
#[derive(Debug, Serialize)]
pub struct ListeningOutput {
    pub event: &'static str,
    pub endpoint: String,
    pub methods: Vec<String>,
    pub workers: usize,
    pub handle_timeout_ms: u128,
}

pub fn print_call(out: &CallOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(out),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["METHOD", "ENDPOINT", "CODEC", "ELAPSED", "REPLY"])
                .add_row(vec![
                    out.method.clone(),
                    out.endpoint.clone(),
                    out.codec.clone(),
                    format!("{}ms", out.elapsed_ms),
                    out.reply.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let reply = serde_json::to_string_pretty(&out.reply)
                .unwrap_or_else(|_| out.reply.to_string());
            println!(
                "{} @ {} ({}, {}ms)",
                out.method, out.endpoint, out.codec, out.elapsed_ms
            );
            println!("{reply}");
        }
    }
}

pub fn print_listening(out: &ListeningOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(out),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["ENDPOINT", "WORKERS", "HANDLE TIMEOUT", "METHODS"])
                .add_row(vec![
                    out.endpoint.clone(),
                    out.workers.to_string(),
                    format!("{}ms", out.handle_timeout_ms),
                    out.methods.join("\n"),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("listening on {} ({} workers)", out.endpoint, out.workers);
            for method in &out.methods {
                println!("  {method}");
            }
        }
    }
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}
