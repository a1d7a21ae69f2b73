//! Executable resolution for spawned MCP servers

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

/// Program and arguments ready to hand to `Command`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Resolve `command` against the PATH of the environment the child will see.
///
/// On Windows, batch files go through `cmd.exe` and extensionless scripts
/// through the interpreter named on their shebang line.
pub fn resolve_command(
    command: &str,
    args: Vec<String>,
    env: &BTreeMap<String, String>,
) -> ResolvedCommand {
    let program = search_path(command, env).unwrap_or_else(|| PathBuf::from(command));

    if !cfg!(windows) {
        return ResolvedCommand { program, args };
    }

    if is_batch_file(&program) {
        return wrap_in_cmd(program, args);
    }

    if program.extension().is_none() {
        if let Some(interpreter) = read_shebang(&program) {
            return run_through_interpreter(interpreter, program, args);
        }
    }

    ResolvedCommand { program, args }
}

fn search_path(command: &str, env: &BTreeMap<String, String>) -> Option<PathBuf> {
    let path_var = env
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("PATH"))
        .map(|(_, value)| value.as_str());
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

    match which::which_in(command, path_var, cwd) {
        Ok(path) => Some(path),
        Err(e) => {
            tracing::debug!(command = %command, error = %e, "Executable not found on PATH");
            None
        }
    }
}

fn is_batch_file(program: &Path) -> bool {
    program
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("cmd") || ext.eq_ignore_ascii_case("bat"))
}

/// `cmd.exe /d /s /c <script> <args...>`
pub fn wrap_in_cmd(script: PathBuf, args: Vec<String>) -> ResolvedCommand {
    let mut wrapped = vec![
        "/d".to_string(),
        "/s".to_string(),
        "/c".to_string(),
        script.to_string_lossy().into_owned(),
    ];
    wrapped.extend(args);
    ResolvedCommand {
        program: PathBuf::from("cmd.exe"),
        args: wrapped,
    }
}

fn run_through_interpreter(
    interpreter: Vec<String>,
    script: PathBuf,
    args: Vec<String>,
) -> ResolvedCommand {
    let mut words = interpreter.into_iter();
    let Some(program) = words.next() else {
        return ResolvedCommand {
            program: script,
            args,
        };
    };

    let mut all_args: Vec<String> = words.collect();
    all_args.push(script.to_string_lossy().into_owned());
    all_args.extend(args);
    ResolvedCommand {
        program: PathBuf::from(program),
        args: all_args,
    }
}

fn read_shebang(path: &Path) -> Option<Vec<String>> {
    let file = std::fs::File::open(path).ok()?;
    let mut first_line = String::new();
    BufReader::new(file).take(256).read_line(&mut first_line).ok()?;
    parse_shebang(&first_line)
}

/// Interpreter words from a `#!` line; `/usr/bin/env` is dropped so the
/// interpreter is found on PATH instead.
pub fn parse_shebang(line: &str) -> Option<Vec<String>> {
    let rest = line.strip_prefix("#!")?.trim();
    let mut words: Vec<String> = rest.split_whitespace().map(str::to_string).collect();

    let is_env = words
        .first()
        .and_then(|first| Path::new(first).file_name())
        .is_some_and(|name| name == "env");
    if is_env {
        words.remove(0);
        if words.first().is_some_and(|w| w == "-S") {
            words.remove(0);
        }
    } else if let Some(first) = words.first_mut() {
        // Unix interpreter paths mean nothing on Windows; use the bare name
        if let Some(name) = Path::new(first.as_str()).file_name() {
            *first = name.to_string_lossy().into_owned();
        }
    }

    if words.is_empty() {
        None
    } else {
        Some(words)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shebang_env() {
        assert_eq!(
            parse_shebang("#!/usr/bin/env node\n"),
            Some(vec!["node".to_string()])
        );
        assert_eq!(
            parse_shebang("#!/usr/bin/env -S deno run --allow-net"),
            Some(vec![
                "deno".to_string(),
                "run".to_string(),
                "--allow-net".to_string()
            ])
        );
    }

    #[test]
    fn test_parse_shebang_direct_interpreter() {
        assert_eq!(
            parse_shebang("#!/usr/bin/python3 -u"),
            Some(vec!["python3".to_string(), "-u".to_string()])
        );
        assert_eq!(parse_shebang("print('no shebang')"), None);
        assert_eq!(parse_shebang("#!"), None);
    }

    #[test]
    fn test_wrap_in_cmd() {
        let resolved = wrap_in_cmd(PathBuf::from("npx.cmd"), vec!["-y".to_string()]);
        assert_eq!(resolved.program, PathBuf::from("cmd.exe"));
        assert_eq!(resolved.args, vec!["/d", "/s", "/c", "npx.cmd", "-y"]);
    }

    #[test]
    fn test_run_through_interpreter_appends_script() {
        let resolved = run_through_interpreter(
            vec!["node".to_string()],
            PathBuf::from("server"),
            vec!["--port".to_string(), "1".to_string()],
        );
        assert_eq!(resolved.program, PathBuf::from("node"));
        assert_eq!(resolved.args, vec!["server", "--port", "1"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_uses_merged_path() {
        let env = BTreeMap::from([("PATH".to_string(), "/bin:/usr/bin".to_string())]);

        let resolved = resolve_command("sh", vec!["-c".to_string()], &env);
        assert!(resolved.program.is_absolute());
        assert!(resolved.program.ends_with("sh"));

        let missing = resolve_command("definitely-not-a-real-binary", Vec::new(), &env);
        assert_eq!(missing.program, PathBuf::from("definitely-not-a-real-binary"));
    }
}
