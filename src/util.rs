use blake3::Hash;
use glob::{Pattern, glob};
use std::process::{Output, Stdio};
use std::{
    collections::HashSet,
    fs,
    io::Error as IoError,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command as TokioCommand;
use tracing::{debug, warn};

use crate::error::{CommandError, FileError};

/// How a subprocess is launched.
#[derive(Debug, Clone)]
pub enum CommandLine {
    /// Passed to `sh -c` (or `cmd /C` on Windows).
    Shell(String),
    /// Program followed by its arguments, no shell involved.
    Argv(Vec<String>),
}

pub fn parse_timeout(timeout_str: Option<&str>, default_timeout: Option<&str>) -> Option<Duration> {
    let timeout_to_parse = timeout_str.or(default_timeout)?;

    if timeout_to_parse == "0" || timeout_to_parse.is_empty() {
        return None;
    }

    match timeout_to_parse.parse::<humantime::Duration>() {
        Ok(duration) => Some(duration.into()),
        Err(e) => {
            warn!(
                "Invalid timeout format '{}': {}. Use duration format like '5m', '30s', '1h30m'",
                timeout_to_parse, e
            );
            None
        }
    }
}

pub fn is_glob_pattern(path: &str) -> bool {
    path.contains('*') || path.contains('?') || path.contains('[')
}

/// Expands declared paths into the sorted set of files they cover.
///
/// Glob patterns expand to matching files, directories expand recursively,
/// missing paths are left out.
pub fn expand_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>, FileError> {
    let mut result = Vec::new();
    let mut seen = HashSet::new();

    for path in paths {
        let path_str = path.to_string_lossy();

        let candidates = if is_glob_pattern(&path_str) {
            expand_single_glob(&path_str)?
        } else if path.is_dir() {
            walk_dir(path)?
        } else if path.exists() {
            vec![path.clone()]
        } else {
            debug!("Path '{}' does not exist, nothing to expand", path.display());
            Vec::new()
        };

        for candidate in candidates {
            if candidate.is_file() && seen.insert(candidate.clone()) {
                result.push(candidate);
            }
        }
    }

    result.sort();
    Ok(result)
}

/// Every file below `dir`, in sorted order.
pub fn walk_dir(dir: &Path) -> Result<Vec<PathBuf>, FileError> {
    let pattern = format!("{}/**/*", Pattern::escape(&dir.to_string_lossy()));
    let mut files: Vec<PathBuf> = expand_single_glob(&pattern)?
        .into_iter()
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    Ok(files)
}

fn expand_single_glob(pattern: &str) -> Result<Vec<PathBuf>, FileError> {
    let glob_paths = glob(pattern)?;
    glob_paths
        .collect::<Result<Vec<_>, _>>()
        .map_err(FileError::from)
}

/// Content hash over the files covered by `paths`, including their names.
pub fn hash_files(paths: &[PathBuf]) -> Result<Hash, FileError> {
    let expanded_files = expand_paths(paths)?;

    if expanded_files.is_empty() {
        return Ok(blake3::hash(b""));
    }

    let mut hasher = blake3::Hasher::new();

    for file_path in &expanded_files {
        let contents = fs::read(file_path).map_err(|e| FileError::io(file_path, e))?;
        let path_str = file_path.to_string_lossy();

        let mut entry = blake3::Hasher::new();
        entry.update(format!("{}:{}", path_str.len(), path_str).as_bytes());
        entry.update(&contents);
        hasher.update(entry.finalize().as_bytes());
    }

    Ok(hasher.finalize())
}

fn build_command(command: &CommandLine) -> Result<TokioCommand, CommandError> {
    let cmd = match command {
        CommandLine::Shell(line) if cfg!(target_os = "windows") => {
            let mut c = TokioCommand::new("cmd");
            c.args(["/C", line.as_str()]);
            c
        }
        CommandLine::Shell(line) => {
            let mut c = TokioCommand::new("sh");
            c.args(["-c", line.as_str()]);
            c
        }
        CommandLine::Argv(argv) => {
            let (program, args) = argv.split_first().ok_or(CommandError::Empty)?;
            let mut c = TokioCommand::new(program);
            c.args(args);
            c
        }
    };
    Ok(cmd)
}

/// Copies `pipe` into a buffer, mirroring it to `sink` when streaming.
async fn pump<R, W>(pipe: Option<R>, mut sink: W, stream_output: bool) -> Result<Vec<u8>, CommandError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut collected: Vec<u8> = Vec::new();
    let Some(mut pipe) = pipe else {
        return Ok(collected);
    };

    let mut buf = [0u8; 8192];
    loop {
        let n = pipe.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..n]);
        if stream_output {
            sink.write_all(&buf[..n]).await?;
        }
    }
    if stream_output {
        sink.flush().await?;
    }
    Ok(collected)
}

pub async fn run_command_with_timeout(
    command: &CommandLine,
    working_dir: Option<&Path>,
    timeout: Option<Duration>,
    stream_output: bool,
) -> Result<Output, CommandError> {
    let mut cmd = build_command(command)?;

    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }

    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .kill_on_drop(true);

    debug!("Spawning {:?}", command);
    let mut child = cmd.spawn()?;

    let stdout_handle = tokio::spawn(pump(child.stdout.take(), tokio::io::stdout(), stream_output));
    let stderr_handle = tokio::spawn(pump(child.stderr.take(), tokio::io::stderr(), stream_output));

    let status = match timeout {
        Some(duration) => {
            tokio::select! {
                result = child.wait() => result?,
                _ = tokio::time::sleep(duration) => {
                    if let Err(kill_err) = child.kill().await {
                        warn!("Failed to kill timed-out process: {}", kill_err);
                    }
                    let _ = child.wait().await;
                    return Err(CommandError::Timeout);
                }
            }
        }
        None => child.wait().await?,
    };

    let stdout = stdout_handle.await.map_err(IoError::other)??;
    let stderr = stderr_handle.await.map_err(IoError::other)??;

    Ok(Output {
        status,
        stdout,
        stderr,
    })
}

/// Removes files and directories, globs included. Returns what was removed.
pub fn remove_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>, FileError> {
    let mut removed = Vec::new();

    for path in paths {
        let path_str = path.to_string_lossy();
        let targets = if is_glob_pattern(&path_str) {
            expand_single_glob(&path_str)?
        } else {
            vec![path.clone()]
        };

        for target in targets {
            if !target.exists() {
                continue;
            }

            let result = if target.is_dir() {
                fs::remove_dir_all(&target)
            } else {
                fs::remove_file(&target)
            };

            match result {
                Ok(()) => {
                    debug!("Removed: {}", target.display());
                    removed.push(target);
                }
                Err(e) => return Err(FileError::io(target, e)),
            }
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_falls_back_to_default_and_zero_disables() {
        assert_eq!(
            parse_timeout(None, Some("30s")),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            parse_timeout(Some("1m"), Some("30s")),
            Some(Duration::from_secs(60))
        );
        assert_eq!(parse_timeout(Some("0"), Some("30s")), None);
        assert_eq!(parse_timeout(Some("soon"), None), None);
    }

    #[test]
    fn expands_directories_recursively_and_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src/nested")).unwrap();
        fs::write(dir.path().join("src/Main.elm"), "main").unwrap();
        fs::write(dir.path().join("src/nested/View.elm"), "view").unwrap();

        let files = expand_paths(&[dir.path().join("src"), dir.path().join("missing")]).unwrap();

        assert_eq!(
            files,
            vec![
                dir.path().join("src/Main.elm"),
                dir.path().join("src/nested/View.elm"),
            ]
        );
    }

    #[test]
    fn hash_changes_with_content_only() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("index.html");
        fs::write(&file, "<html></html>").unwrap();

        let first = hash_files(std::slice::from_ref(&file)).unwrap();
        fs::write(&file, "<html></html>").unwrap();
        assert_eq!(first, hash_files(std::slice::from_ref(&file)).unwrap());

        fs::write(&file, "<html><body></body></html>").unwrap();
        assert_ne!(first, hash_files(std::slice::from_ref(&file)).unwrap());
    }

    #[test]
    fn removes_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("build");
        fs::create_dir_all(build.join("resources")).unwrap();
        fs::write(build.join("resources/app.js"), "js").unwrap();
        let loose = dir.path().join("elm.js");
        fs::write(&loose, "js").unwrap();

        let removed = remove_paths(&[build.clone(), loose.clone(), dir.path().join("gone")]).unwrap();

        assert_eq!(removed, vec![build.clone(), loose.clone()]);
        assert!(!build.exists());
        assert!(!loose.exists());
    }

    #[tokio::test]
    async fn captures_output_and_status() {
        let output = run_command_with_timeout(
            &CommandLine::Shell("echo out; echo err >&2; exit 3".to_string()),
            None,
            None,
            false,
        )
        .await
        .unwrap();

        assert_eq!(output.status.code(), Some(3));
        assert_eq!(String::from_utf8_lossy(&output.stdout), "out\n");
        assert_eq!(String::from_utf8_lossy(&output.stderr), "err\n");
    }

    #[tokio::test]
    async fn times_out_long_commands() {
        let result = run_command_with_timeout(
            &CommandLine::Shell("sleep 5".to_string()),
            None,
            Some(Duration::from_millis(100)),
            false,
        )
        .await;

        assert!(matches!(result, Err(CommandError::Timeout)));
    }
}
