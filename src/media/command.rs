//! Builders for external tool invocations.
//!
//! [`ToolCommand`] runs any binary (manim, ffmpeg, ffprobe, edge-tts) with a
//! hard timeout and captured output. [`FfmpegArgs`] assembles the ffmpeg
//! argument list for multi-input jobs so the argument layout can be unit
//! tested without spawning anything.

use crate::error::MediaError;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Default command timeout: 10 minutes.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Output captured from a tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: ExitStatus,
    /// Captured standard output (lossy UTF-8).
    pub stdout: String,
    /// Captured standard error (lossy UTF-8).
    pub stderr: String,
}

/// A builder for one external process run.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    current_dir: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            current_dir: None,
        }
    }

    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = d;
        self
    }

    pub fn current_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Short program name used in errors and logs.
    pub fn tool_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    /// Run to completion.
    ///
    /// Non-zero exit, spawn failure and timeout are all errors. The child is
    /// killed when the timeout fires.
    pub async fn execute(&self) -> Result<ToolOutput, MediaError> {
        let tool = self.tool_name();
        let program = resolve_tool(&self.program)?;

        let mut cmd = Command::new(&program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.current_dir {
            cmd.current_dir(dir);
        }

        debug!("{} {}", tool, self.args.join(" "));

        let child = cmd.spawn().map_err(|e| MediaError::Spawn {
            tool: tool.clone(),
            detail: e.to_string(),
        })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(MediaError::Spawn {
                    tool,
                    detail: format!("I/O error waiting for process: {e}"),
                })
            }
            Err(_elapsed) => {
                return Err(MediaError::Timeout {
                    tool,
                    secs: self.timeout.as_secs(),
                })
            }
        };

        let out = ToolOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };

        if !out.status.success() {
            return Err(MediaError::Failed {
                tool,
                status: out.status.to_string(),
                stderr: tail(&out.stderr, 2000),
            });
        }

        Ok(out)
    }
}

/// Resolve bare program names on `PATH`; explicit paths are taken as-is.
pub fn resolve_tool(program: &Path) -> Result<PathBuf, MediaError> {
    if program.components().count() > 1 {
        return Ok(program.to_path_buf());
    }
    which::which(program).map_err(|_| MediaError::ToolNotFound {
        tool: program.to_string_lossy().to_string(),
    })
}

/// Keep the last `max` bytes of a log, on a char boundary.
fn tail(s: &str, max: usize) -> String {
    let s = s.trim();
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    format!("…{}", &s[start..])
}

/// Argument list for one ffmpeg run with any number of inputs.
#[derive(Debug, Clone, Default)]
pub struct FfmpegArgs {
    inputs: Vec<PathBuf>,
    output_args: Vec<String>,
}

impl FfmpegArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(mut self, path: impl AsRef<Path>) -> Self {
        self.inputs.push(path.as_ref().to_path_buf());
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    pub fn filter_complex(self, graph: impl Into<String>) -> Self {
        self.arg("-filter_complex").arg(graph)
    }

    pub fn video_filter(self, filter: impl Into<String>) -> Self {
        self.arg("-vf").arg(filter)
    }

    pub fn map(self, spec: impl Into<String>) -> Self {
        self.arg("-map").arg(spec)
    }

    pub fn video_codec(self, codec: impl Into<String>) -> Self {
        self.arg("-c:v").arg(codec)
    }

    /// H.264 with a pixel format every player accepts.
    pub fn h264(self) -> Self {
        self.video_codec("libx264").arg("-pix_fmt").arg("yuv420p")
    }

    pub fn audio_codec(self, codec: impl Into<String>) -> Self {
        self.arg("-c:a").arg(codec)
    }

    /// AAC at the given sample rate.
    pub fn aac(self, sample_rate: u32) -> Self {
        self.audio_codec("aac")
            .arg("-b:a")
            .arg("192k")
            .arg("-ar")
            .arg(sample_rate.to_string())
    }

    pub fn no_audio(self) -> Self {
        self.arg("-an")
    }

    pub fn shortest(self) -> Self {
        self.arg("-shortest")
    }

    pub fn faststart(self) -> Self {
        self.arg("-movflags").arg("+faststart")
    }

    /// Final argument vector: `-y -v error -i … <output args> <output>`.
    pub fn build(&self, output: impl AsRef<Path>) -> Vec<String> {
        let mut args = vec!["-y".to_string(), "-v".to_string(), "error".to_string()];
        for input in &self.inputs {
            args.push("-i".to_string());
            args.push(input.to_string_lossy().to_string());
        }
        args.extend(self.output_args.iter().cloned());
        args.push(output.as_ref().to_string_lossy().to_string());
        args
    }
}
