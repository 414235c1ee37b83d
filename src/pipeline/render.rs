//! External renderer driver.
//!
//! The generated sketch is written into a sketch folder and the configured
//! renderer is spawned on it. The process is polled until it exits, the
//! target frame count appears, or the wall-clock timeout elapses (in which
//! case its whole process group is killed).

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::model::CodeModel;
use super::prompt::{build_prompt, clean_code, feedback_prompt, sketch_template, validate_code};
use super::{Artifact, GenerationError, GenerationRequest, Orchestrator};
use crate::compute::frames::{FrameDir, FrameSource, list_frames};
use crate::schema::{FailureReason, RenderConfig};

/// How a polled wait ended.
#[derive(Debug)]
pub(crate) enum WaitOutcome {
    Exited(ExitStatus),
    /// The early-stop condition held while the process was still running.
    Satisfied,
    /// The process was killed after the timeout.
    TimedOut,
}

/// Poll `child` every `poll` until it exits, `done()` returns true, or
/// `timeout` elapses.
pub(crate) fn wait_with_timeout<F: FnMut() -> bool>(
    child: &mut Child,
    timeout: Duration,
    poll: Duration,
    mut done: F,
) -> io::Result<WaitOutcome> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(WaitOutcome::Exited(status));
        }
        if done() {
            return Ok(WaitOutcome::Satisfied);
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            kill_group(child);
            child.wait()?;
            return Ok(WaitOutcome::TimedOut);
        }
        thread::sleep(poll.min(timeout - elapsed));
    }
}

/// Start `command` as the leader of a new process group so a timeout can
/// take down everything it spawns.
pub(crate) fn own_process_group(command: &mut Command) -> &mut Command {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    command
}

/// Kill the process group led by `child`, falling back to the child alone.
fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        match Command::new("kill")
            .args(["-KILL", "--", &group])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => return,
            Ok(status) => debug!("kill {} exited with {}", group, status),
            Err(e) => debug!("kill {} failed: {}", group, e),
        }
    }
    if let Err(e) = child.kill() {
        warn!("Failed to kill process {}: {}", child.id(), e);
    }
}

fn count_frames(dir: &Path) -> usize {
    list_frames(dir).map(|f| f.len()).unwrap_or(0)
}

/// Lines of renderer output that mention an error, or the tail of the log.
fn error_excerpt(log: &str) -> String {
    let errors: Vec<&str> = log
        .lines()
        .filter(|l| l.to_ascii_lowercase().contains("error"))
        .collect();
    let lines: Vec<&str> = if errors.is_empty() {
        log.lines().collect()
    } else {
        errors
    };
    let start = lines.len().saturating_sub(5);
    lines[start..].join("\n")
}

/// Generates sketch code with a [`CodeModel`] and renders it with an
/// external program.
pub struct ProcessingOrchestrator {
    render: RenderConfig,
    max_dimension: u32,
    model: Box<dyn CodeModel>,
}

impl ProcessingOrchestrator {
    pub fn new(render: RenderConfig, max_dimension: u32, model: Box<dyn CodeModel>) -> Self {
        Self {
            render,
            max_dimension,
            model,
        }
    }

    /// Frame directory for a pattern version.
    pub fn frames_dir(&self, version: u64) -> PathBuf {
        self.render.renders_dir.join(format!("render_v{}", version))
    }

    fn sketch_dir(&self, version: u64) -> PathBuf {
        self.render.sketch_dir.join(format!("prism_v{}", version))
    }

    fn attempt(
        &mut self,
        request: &GenerationRequest,
        prompt: &str,
    ) -> Result<Artifact, (GenerationError, Option<String>)> {
        let raw = self
            .model
            .generate_code(&request.model, prompt)
            .map_err(|e| (e, None))?;
        let code = clean_code(&raw);
        if let Err(e) = validate_code(&code) {
            return Err((e, Some(code)));
        }

        match self.render_sketch(&code, request.version) {
            Ok(frames) => {
                let location = Some(frames.dir().to_path_buf());
                Ok(Artifact::animation(
                    Box::new(frames),
                    self.render.frame_rate,
                    self.render.target_frames,
                    location,
                ))
            }
            Err(e) => Err((e, Some(code))),
        }
    }

    fn render_sketch(&self, code: &str, version: u64) -> Result<FrameDir, GenerationError> {
        let io_err = |what: &str, e: io::Error| GenerationError::compile(format!("{}: {}", what, e));

        let frames_dir = std::path::absolute(self.frames_dir(version))
            .map_err(|e| io_err("resolving render directory", e))?;
        if frames_dir.exists() {
            fs::remove_dir_all(&frames_dir).map_err(|e| io_err("clearing old frames", e))?;
        }
        fs::create_dir_all(&frames_dir).map_err(|e| io_err("creating render directory", e))?;

        let sketch_dir = std::path::absolute(self.sketch_dir(version))
            .map_err(|e| io_err("resolving sketch directory", e))?;
        fs::create_dir_all(&sketch_dir).map_err(|e| io_err("creating sketch directory", e))?;
        let sketch_file = sketch_dir.join(format!("prism_v{}.pde", version));
        fs::write(&sketch_file, sketch_template(code, &frames_dir, &self.render))
            .map_err(|e| io_err("writing sketch", e))?;

        let log_path = sketch_dir.join("render.log");
        let log = File::create(&log_path).map_err(|e| io_err("creating render log", e))?;
        let log_err = log.try_clone().map_err(|e| io_err("creating render log", e))?;

        let sketch = sketch_dir.to_string_lossy();
        let output = frames_dir.to_string_lossy();
        let args: Vec<String> = self
            .render
            .args
            .iter()
            .map(|a| a.replace("{sketch}", &sketch).replace("{output}", &output))
            .collect();

        debug!("Rendering v{}: {} {:?}", version, self.render.program, args);
        let mut child = own_process_group(&mut Command::new(&self.render.program))
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| io_err(&format!("starting {}", self.render.program), e))?;

        let timeout = Duration::from_secs(self.render.timeout_secs);
        let poll = Duration::from_secs(self.render.poll_interval_secs.max(1));
        let target = self.render.target_frames;

        let outcome = wait_with_timeout(&mut child, timeout, poll, || {
            let n = count_frames(&frames_dir);
            debug!("v{}: {}/{} frames", version, n, target);
            n >= target
        })
        .map_err(|e| io_err("waiting for renderer", e))?;

        let read_log = || fs::read_to_string(&log_path).unwrap_or_default();
        match outcome {
            WaitOutcome::Exited(status) if !status.success() => {
                return Err(GenerationError::compile(format!(
                    "renderer exited with {}: {}",
                    status,
                    error_excerpt(&read_log())
                )));
            }
            WaitOutcome::Exited(_) => {}
            WaitOutcome::Satisfied => {
                // The sketch exits on its own after the last frame.
                if let Ok(WaitOutcome::TimedOut) = wait_with_timeout(&mut child, poll, poll, || false) {
                    debug!("v{}: renderer stopped after completing all frames", version);
                }
            }
            WaitOutcome::TimedOut => {
                return Err(GenerationError::timeout(format!(
                    "render exceeded {}s with {} of {} frames",
                    self.render.timeout_secs,
                    count_frames(&frames_dir),
                    target
                )));
            }
        }

        let frames = FrameDir::open(&frames_dir, self.max_dimension)
            .map_err(|e| GenerationError::invalid(e.to_string()))?;
        if frames.frame_count() == 0 {
            let log = read_log();
            let detail = if log.trim().is_empty() {
                "no frames were generated and no error was reported".to_string()
            } else {
                error_excerpt(&log)
            };
            return Err(GenerationError::invalid(detail));
        }
        if frames.frame_count() < target {
            warn!(
                "v{}: renderer produced {} of {} frames",
                version,
                frames.frame_count(),
                target
            );
        }
        Ok(frames)
    }
}

impl Orchestrator for ProcessingOrchestrator {
    fn generate(&mut self, request: &GenerationRequest) -> Result<Artifact, GenerationError> {
        let base = build_prompt(&request.techniques, &self.render);
        let mut prompt = base.clone();
        let mut last_error = None;

        for attempt in 1..=self.render.max_attempts.max(1) {
            match self.attempt(request, &prompt) {
                Ok(artifact) => {
                    info!("v{} rendered on attempt {}", request.version, attempt);
                    return Ok(artifact);
                }
                Err((error, code)) => {
                    warn!(
                        "v{} attempt {}/{} failed: {}",
                        request.version, attempt, self.render.max_attempts, error
                    );
                    if error.reason == FailureReason::Timeout {
                        return Err(error);
                    }
                    prompt = feedback_prompt(&base, &error, code.as_deref());
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| GenerationError::invalid("no generation attempts made")))
    }
}
