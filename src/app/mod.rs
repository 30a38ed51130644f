pub mod cli;
pub mod serve;

use crate::config::{load_global_settings, load_settings, Settings};
use crate::intent;
use crate::runtime::{JsonLinesSink, ProcessExecutor};
use cli::{help_text, parse_cli_options, parse_cli_verb, CliOptions, CliVerb};
use std::io::{self, BufReader};
use std::sync::Arc;

pub fn run_cli(args: Vec<String>) -> Result<String, String> {
    let Some((verb, rest)) = args.split_first() else {
        return Ok(help_text());
    };
    let options = parse_cli_options(rest)?;

    match parse_cli_verb(verb) {
        CliVerb::Serve => cmd_serve(&options),
        CliVerb::Parse => cmd_parse(&options),
        CliVerb::CheckConfig => cmd_check_config(&options),
        CliVerb::Help => Ok(help_text()),
        CliVerb::Unknown => Err(format!("unknown command `{verb}`\n\n{}", help_text())),
    }
}

fn settings_for(options: &CliOptions) -> Result<Settings, String> {
    match &options.config_path {
        Some(path) => load_settings(path),
        None => load_global_settings(),
    }
    .map_err(|e| e.to_string())
}

fn cmd_parse(options: &CliOptions) -> Result<String, String> {
    if options.positional.is_empty() {
        return Err("usage: runbridge parse <text>".to_string());
    }
    let parsed = intent::parse(&options.positional.join(" "));
    serde_json::to_string_pretty(&parsed).map_err(|e| e.to_string())
}

fn cmd_check_config(options: &CliOptions) -> Result<String, String> {
    let settings = settings_for(options)?;
    Ok(format!(
        "settings ok: backend={} capacity={} workers={} jobs={}",
        settings.queue.backend,
        settings.queue.capacity,
        settings.workers.count,
        settings.jobs.len()
    ))
}

fn cmd_serve(options: &CliOptions) -> Result<String, String> {
    let settings = settings_for(options)?;
    let executor = Arc::new(ProcessExecutor::new(settings.jobs.clone()));
    let sink = Arc::new(JsonLinesSink::new(io::stdout()));
    let summary = serve::serve(
        &settings,
        BufReader::new(io::stdin()),
        executor,
        sink,
    )?;
    Ok(format!(
        "received {} message(s), rejected {}",
        summary.received, summary.rejected
    ))
}
