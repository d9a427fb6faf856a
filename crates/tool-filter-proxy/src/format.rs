//! Output formatting for `--list-tools`.

use anyhow::Result;
use clap::ValueEnum;
use mcp_filter::Tool;

const DESCRIPTION_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Names,
}

/// Render the tool list in the requested format.
pub fn format_tools_list(tools: &[Tool], format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(format_table(tools)),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(tools)?),
        OutputFormat::Names => Ok(tools
            .iter()
            .map(|t| t.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")),
    }
}

fn format_table(tools: &[Tool]) -> String {
    if tools.is_empty() {
        return "No tools available.".to_string();
    }

    let name_width = tools
        .iter()
        .map(|t| t.name.len())
        .max()
        .unwrap_or(0)
        .max("NAME".len());

    let mut out = format!("{:<name_width$}  DESCRIPTION\n", "NAME");
    for tool in tools {
        let description = tool
            .description
            .as_deref()
            .map(summarize_description)
            .unwrap_or_default();
        out.push_str(&format!("{:<name_width$}  {}\n", tool.name, description));
    }
    out
}

/// First line of the description, truncated to a fixed width.
fn summarize_description(description: &str) -> String {
    let first_line = description.lines().next().unwrap_or("");
    if first_line.chars().count() <= DESCRIPTION_LIMIT {
        return first_line.to_string();
    }
    let truncated: String = first_line.chars().take(DESCRIPTION_LIMIT - 3).collect();
    format!("{}...", truncated)
}

/// Render a command line for log messages, quoting arguments that need it.
pub fn format_command_display(command: &str, args: &[String]) -> String {
    std::iter::once(command)
        .chain(args.iter().map(String::as_str))
        .map(|part| {
            if part.is_empty() || part.contains(char::is_whitespace) || part.contains('"') {
                format!("\"{}\"", part.replace('"', "\\\""))
            } else {
                part.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
