use std::path::Path;
use std::process::Output;

use bstr::ByteSlice;
use tokio::process::Command;

/// Builds a command out of a program and its arguments.
pub fn create_command<S: AsRef<str>>(arguments: &[S], workdir: Option<&Path>) -> Command {
    let (program, args) = match arguments.split_first() {
        Some((program, args)) => (program.as_ref(), args),
        None => ("", arguments),
    };
    let mut command = Command::new(program);
    command.args(args.iter().map(|arg| arg.as_ref()));
    if let Some(workdir) = workdir {
        command.current_dir(workdir);
    }
    command
}

/// Fails if the command did not finish successfully.
pub fn check_command_output(output: Output) -> anyhow::Result<Output> {
    let status = output.status;
    if !status.success() {
        return Err(anyhow::anyhow!(
            "Exit code: {}\nStderr: {}\nStdout: {}",
            status.code().unwrap_or(-1),
            output.stderr.to_str_lossy().trim(),
            output.stdout.to_str_lossy().trim()
        ));
    }
    Ok(output)
}

pub fn stdout_str(output: &Output, program: &str) -> anyhow::Result<String> {
    output
        .stdout
        .to_str()
        .map(|stdout| stdout.trim().to_string())
        .map_err(|e| anyhow::anyhow!("Invalid UTF-8 {program} output: {e:?}"))
}

/// Quotes `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Formats a command line for logging and for remote execution.
pub fn shell_command_line<S: AsRef<str>>(arguments: &[S]) -> String {
    arguments
        .iter()
        .map(|arg| shell_quote(arg.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
