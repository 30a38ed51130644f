use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliVerb {
    Serve,
    Parse,
    CheckConfig,
    Help,
    Unknown,
}

pub fn parse_cli_verb(input: &str) -> CliVerb {
    match input {
        "serve" => CliVerb::Serve,
        "parse" => CliVerb::Parse,
        "check-config" => CliVerb::CheckConfig,
        "help" | "--help" | "-h" => CliVerb::Help,
        _ => CliVerb::Unknown,
    }
}

pub fn cli_help_lines() -> Vec<String> {
    vec![
        "Usage: runbridge <command> [--config <path>]".to_string(),
        String::new(),
        "Commands:".to_string(),
        "  serve          Read chat messages from stdin, write replies to stdout".to_string(),
        "  parse <text>   Show how a chat message is interpreted".to_string(),
        "  check-config   Load and validate the settings file".to_string(),
        "  help           Show this help".to_string(),
        String::new(),
        "Settings default to ~/.runbridge/config.yaml (override with RUNBRIDGE_CONFIG)."
            .to_string(),
    ]
}

pub fn help_text() -> String {
    cli_help_lines().join("\n")
}

/// Flags shared by every command. Anything that is not a flag is kept as a
/// positional argument.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliOptions {
    pub config_path: Option<PathBuf>,
    pub positional: Vec<String>,
}

pub fn parse_cli_options(args: &[String]) -> Result<CliOptions, String> {
    let mut options = CliOptions::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let value = iter
                .next()
                .ok_or_else(|| "`--config` requires a path".to_string())?;
            options.config_path = Some(PathBuf::from(value));
        } else if let Some(value) = arg.strip_prefix("--config=") {
            if value.is_empty() {
                return Err("`--config` requires a path".to_string());
            }
            options.config_path = Some(PathBuf::from(value));
        } else if arg.starts_with("--") {
            return Err(format!("unknown flag `{arg}`"));
        } else {
            options.positional.push(arg.clone());
        }
    }
    Ok(options)
}
