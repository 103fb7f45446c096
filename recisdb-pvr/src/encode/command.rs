//! Encode command templates.
//!
//! A mode's `cmd` is split into arguments (double quotes group words) and
//! `%INPUT%` / `%OUTPUT%` are substituted per argument, so paths containing
//! spaces stay a single argument.

use std::path::Path;

use pvr_types::Program;

use super::pool::ProcessSpec;

const INPUT_TOKEN: &str = "%INPUT%";
const OUTPUT_TOKEN: &str = "%OUTPUT%";

/// Split a command line into arguments.
pub fn split_command(cmd: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for c in cmd.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        args.push(current);
    }
    args
}

/// Everything needed to build the process for one job.
pub struct CommandContext<'a> {
    pub job_id: u64,
    pub recorded_id: i64,
    pub mode: &'a str,
    pub input: &'a Path,
    pub output: Option<&'a Path>,
    pub program: Option<&'a Program>,
}

/// Expand `template` into a process spec with job metadata in the
/// environment.
pub fn build_process(template: &str, ctx: &CommandContext<'_>) -> Option<ProcessSpec> {
    let input = ctx.input.to_string_lossy();
    let output = ctx
        .output
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut args = split_command(template)
        .into_iter()
        .map(|arg| arg.replace(INPUT_TOKEN, &input).replace(OUTPUT_TOKEN, &output));
    let program = args.next()?;
    let args = args.collect();

    let mut env = vec![
        ("RECORDED".to_string(), input.to_string()),
        ("INPUT".to_string(), input.to_string()),
        ("OUTPUT".to_string(), output.clone()),
        ("JOB_ID".to_string(), ctx.job_id.to_string()),
        ("RECORDED_ID".to_string(), ctx.recorded_id.to_string()),
        ("MODE".to_string(), ctx.mode.to_string()),
    ];
    if let Some(program) = ctx.program {
        env.extend([
            ("PROGRAM_ID".to_string(), program.id.to_string()),
            ("CHANNEL_ID".to_string(), program.channel_id.to_string()),
            ("CHANNEL_TYPE".to_string(), program.channel_type.as_str().to_string()),
            ("NAME".to_string(), program.name.clone()),
            (
                "DESCRIPTION".to_string(),
                program.description.clone().unwrap_or_default(),
            ),
            ("START_AT".to_string(), program.start_at.to_string()),
            ("END_AT".to_string(), program.end_at.to_string()),
            ("DURATION".to_string(), program.duration_ms().to_string()),
        ]);
    }

    Some(ProcessSpec { program, args, env })
}
