//! Whisper CLI invocation
//!
//! One child process per job. The CLI is asked to write `<base>.txt`
//! next to a temp base path; when it does not, its stdout is salvaged by
//! stripping timestamp and progress lines. A hard 5-minute timeout sends
//! SIGTERM and escalates to SIGKILL after 5 seconds.

use crate::llm::graceful_kill;
use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Per-job transcription budget.
pub const TRANSCRIBE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Grace between SIGTERM and SIGKILL on timeout.
const TIMEOUT_KILL_GRACE: Duration = Duration::from_secs(5);
/// Budget for the start-up `--help` probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Locate the whisper CLI: explicit configured path first, then PATH.
pub fn locate_cli(configured: Option<&str>) -> Result<PathBuf> {
    if let Some(path) = configured {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        bail!("configured whisper CLI not found at {}", path.display());
    }

    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        for name in ["whisper-cli", "whisper-cpp", "main"] {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    bail!("whisper CLI not found on PATH (set WHISPER_CLI_PATH)")
}

/// Verify the CLI answers a short help invocation.
pub async fn probe_cli(cli: &Path) -> Result<()> {
    let child = Command::new(cli)
        .arg("--help")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("Failed to spawn {}", cli.display()))?;
    let output = tokio::time::timeout(PROBE_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| anyhow!("whisper CLI did not answer --help within {:?}", PROBE_TIMEOUT))??;
    // Some builds exit non-zero on --help; spawning and exiting at all
    // is the signal we need.
    let _ = output.status;
    Ok(())
}

/// Whether ffmpeg is available for transcoding unsupported containers.
pub async fn probe_ffmpeg() -> bool {
    match Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => tokio::time::timeout(PROBE_TIMEOUT, child.wait_with_output())
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false),
        Err(_) => false,
    }
}

/// Transcode to the 16 kHz mono PCM WAV the CLI expects. Returns the
/// side-file path; the caller removes it after transcription.
pub async fn transcode_to_wav(input: &Path, output: &Path) -> Result<()> {
    let status = Command::new("ffmpeg")
        .arg("-y")
        .arg("-i")
        .arg(input)
        .args(["-ar", "16000", "-ac", "1", "-f", "wav"])
        .arg(output)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .context("Failed to spawn ffmpeg")?;
    if !status.success() {
        bail!("ffmpeg exited with {}", status);
    }
    Ok(())
}

/// Arguments for one transcription run.
#[derive(Debug, Clone)]
pub struct TranscribeRequest<'a> {
    pub audio: &'a Path,
    pub model: &'a Path,
    pub language: Option<&'a str>,
    pub threads: u32,
}

/// Run the CLI and return the trimmed transcript.
pub async fn run_cli(cli: &Path, req: &TranscribeRequest<'_>) -> Result<String> {
    let base = req.audio.with_extension("transcript");

    let mut command = Command::new(cli);
    command
        .arg("-f")
        .arg(req.audio)
        .arg("-m")
        .arg(req.model)
        .args(["-l", req.language.unwrap_or("auto")])
        .arg("-otxt")
        .arg("-of")
        .arg(&base)
        .arg("--no-timestamps")
        .args(["-t", &req.threads.to_string()])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to spawn {}", cli.display()))?;

    // Drain both pipes while waiting so a chatty CLI can never dead-lock
    // on a full pipe buffer.
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let drain = tokio::spawn(async move {
        use tokio::io::AsyncReadExt;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut stdout).await;
        }
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut stderr).await;
        }
        (stdout, stderr)
    });

    let status = match tokio::time::timeout(TRANSCRIBE_TIMEOUT, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            graceful_kill(&mut child, TIMEOUT_KILL_GRACE).await;
            drain.abort();
            return Err(anyhow!(
                "transcription exceeded {:?} and was killed",
                TRANSCRIBE_TIMEOUT
            ));
        }
    };

    let (stdout_bytes, stderr_bytes) = drain.await.unwrap_or_default();

    if !status.success() {
        let stderr_tail = tail_of(&String::from_utf8_lossy(&stderr_bytes), 400);
        bail!("whisper CLI exited with {}: {}", status, stderr_tail);
    }

    // Preferred path: the .txt side-file.
    let txt_path = PathBuf::from(format!("{}.txt", base.display()));
    if txt_path.exists() {
        let text = tokio::fs::read_to_string(&txt_path)
            .await
            .with_context(|| format!("Failed to read {}", txt_path.display()))?;
        let _ = tokio::fs::remove_file(&txt_path).await;
        return Ok(text.trim().to_string());
    }

    // Fallback: salvage stdout.
    let stdout = String::from_utf8_lossy(&stdout_bytes);
    let text = parse_cli_stdout(&stdout);
    if text.is_empty() {
        bail!("whisper CLI produced no transcript (no side-file, empty stdout)");
    }
    Ok(text)
}

/// Strip `[00:00:00.000 --> 00:00:02.500]` prefixes and progress noise
/// from the CLI's stdout stream.
pub fn parse_cli_stdout(stdout: &str) -> String {
    let timestamp =
        Regex::new(r"^\s*\[\d{2}:\d{2}:\d{2}[.,]\d{3}\s*-->\s*\d{2}:\d{2}:\d{2}[.,]\d{3}\]\s*")
            .expect("static regex");

    let mut lines = Vec::new();
    for line in stdout.lines() {
        let line = timestamp.replace(line, "");
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // Progress and diagnostics all start with the module prefix
        // (whisper_..., main:, system_info:).
        if line.starts_with("whisper_")
            || line.starts_with("main:")
            || line.starts_with("system_info:")
            || line.starts_with("output_")
        {
            continue;
        }
        lines.push(line.to_string());
    }
    lines.join(" ").trim().to_string()
}

fn tail_of(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    if count <= max_chars {
        return s.trim().to_string();
    }
    s.chars().skip(count - max_chars).collect::<String>().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdout_parser_strips_timestamps_and_noise() {
        let raw = "\
whisper_init_from_file: loading model\n\
main: processing audio\n\
[00:00:00.000 --> 00:00:02.500] Hola equipo,\n\
[00:00:02.500 --> 00:00:05.000] revisemos la migración.\n\
output_txt: saving output\n";
        assert_eq!(
            parse_cli_stdout(raw),
            "Hola equipo, revisemos la migración."
        );
    }

    #[test]
    fn stdout_parser_handles_plain_lines() {
        assert_eq!(parse_cli_stdout("  hello world  \n"), "hello world");
        assert_eq!(parse_cli_stdout(""), "");
    }

    #[test]
    fn locate_prefers_configured_path() {
        let dir = tempfile::tempdir().unwrap();
        let cli = dir.path().join("whisper-cli");
        std::fs::write(&cli, b"#!/bin/sh\n").unwrap();
        let found = locate_cli(Some(cli.to_str().unwrap())).unwrap();
        assert_eq!(found, cli);
    }

    #[test]
    fn locate_fails_on_bogus_configured_path() {
        assert!(locate_cli(Some("/nonexistent/whisper")).is_err());
    }

    #[test]
    fn tail_keeps_the_end() {
        assert_eq!(tail_of("abcdef", 3), "def");
        assert_eq!(tail_of("ab", 3), "ab");
    }
}
