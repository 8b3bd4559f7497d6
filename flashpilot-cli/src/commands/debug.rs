//! Debug command: run auxiliary tools around a debug session.
//!
//! The arguments form one command string. `;` separates groups that run one
//! after another; inside a group, `&` separates commands that are started in
//! the background, except the last one which runs to completion with its
//! output shown.

use anyhow::Result;
use flashpilot::{CommandLine, CommandRunner, Verbosity};
use log::{debug, info};

use crate::CliError;

/// One command of the debug script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Segment {
    pub(crate) text: String,
    pub(crate) background: bool,
}

/// Split the joined arguments into segments.
pub(crate) fn split_segments(args: &[String]) -> Vec<Segment> {
    let script = args.join(" ");
    let mut segments = Vec::new();
    for group in script.split(';') {
        let parts: Vec<&str> = group.split('&').collect();
        let last = parts.len() - 1;
        for (i, part) in parts.into_iter().enumerate() {
            let text = part.trim();
            if text.is_empty() {
                continue;
            }
            segments.push(Segment {
                text: text.to_string(),
                background: i < last,
            });
        }
    }
    segments
}

/// Split a command into words with POSIX shell quoting rules.
pub(crate) fn tokenize(command: &str) -> Result<Vec<String>, CliError> {
    shell_words::split(command)
        .map_err(|e| CliError::Usage(format!("cannot parse \"{command}\": {e}")))
}

/// Debug command implementation.
pub(crate) fn cmd_debug<R: CommandRunner>(runner: &mut R, args: &[String]) -> Result<()> {
    let segments = split_segments(args);
    if segments.is_empty() {
        return Err(CliError::Usage("no command given".to_string()).into());
    }

    for segment in &segments {
        info!("command: {}", segment.text);
        let command = CommandLine::from_argv(tokenize(&segment.text)?)?;
        debug!("{command:?}");

        let result = if segment.background {
            runner.run_background(&command)
        } else {
            runner
                .run(&command, None, Verbosity::Verbose)
                .into_result()
                .map(|_| ())
        };
        result.map_err(|e| {
            anyhow::Error::new(e).context(CliError::CommandFailed(segment.text.clone()))
        })?;
    }
    Ok(())
}
