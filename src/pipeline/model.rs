//! Model selection and code-producing model backends.

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use log::debug;
use rand::Rng;

use super::GenerationError;
use super::render::{WaitOutcome, own_process_group, wait_with_timeout};
use crate::compute::evolution::weighted_index;
use crate::schema::{ModelConfig, ModelEntry, ModelSelection};

/// Picks one model per cycle.
#[derive(Debug, Clone)]
pub struct ModelSelector {
    models: Vec<ModelEntry>,
    selection: ModelSelection,
}

impl ModelSelector {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            models: config.available.clone(),
            selection: config.selection.clone(),
        }
    }

    /// Fixed model, or a weighted draw over the catalog.
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        if let ModelSelection::Fixed(name) = &self.selection {
            return name.clone();
        }
        let weights: Vec<f32> = self.models.iter().map(|m| m.weight).collect();
        weighted_index(&weights, rng)
            .and_then(|i| self.models.get(i))
            .map(|m| m.name.clone())
            .unwrap_or_else(|| "default".to_string())
    }
}

/// Something that turns a prompt into sketch code.
pub trait CodeModel {
    fn generate_code(&mut self, model: &str, prompt: &str) -> Result<String, GenerationError>;
}

/// Runs an external command per request: the prompt goes to stdin, the
/// model name to `PRISM_MODEL`, and the code comes back on stdout.
#[derive(Debug, Clone)]
pub struct CommandModel {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandModel {
    /// `command` is the program followed by its arguments.
    pub fn new(command: &[String], timeout: Duration) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
        })
    }
}

impl CodeModel for CommandModel {
    fn generate_code(&mut self, model: &str, prompt: &str) -> Result<String, GenerationError> {
        let mut child = own_process_group(&mut Command::new(&self.program))
            .args(&self.args)
            .env("PRISM_MODEL", model)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| GenerationError::api(format!("failed to start {}: {}", self.program, e)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_reader = thread::spawn(move || read_all(stdout));
        let err_reader = thread::spawn(move || read_all(stderr));

        if let Some(mut stdin) = child.stdin.take()
            && let Err(e) = stdin.write_all(prompt.as_bytes())
        {
            debug!("Model command closed stdin early: {}", e);
        }

        let poll = Duration::from_millis(100);
        let status = match wait_with_timeout(&mut child, self.timeout, poll, || false) {
            Ok(WaitOutcome::Exited(status)) => status,
            Ok(WaitOutcome::TimedOut | WaitOutcome::Satisfied) => {
                return Err(GenerationError::timeout(format!(
                    "model {} did not answer within {:?}",
                    model, self.timeout
                )));
            }
            Err(e) => return Err(GenerationError::api(format!("waiting for model: {}", e))),
        };

        let code = out_reader.join().unwrap_or_default();
        let errors = err_reader.join().unwrap_or_default();
        if !status.success() {
            return Err(GenerationError::api(format!(
                "model {} exited with {}: {}",
                model,
                status,
                errors.trim()
            )));
        }
        if code.trim().is_empty() {
            return Err(GenerationError::invalid(format!("model {} returned no code", model)));
        }
        Ok(code)
    }
}

fn read_all<R: Read>(source: Option<R>) -> String {
    let mut buffer = String::new();
    if let Some(mut source) = source
        && let Err(e) = source.read_to_string(&mut buffer)
    {
        debug!("Failed to read model output: {}", e);
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::evolution::SelectionRng;

    #[test]
    fn test_fixed_model() {
        let config = ModelConfig {
            selection: ModelSelection::Fixed("o1".to_string()),
            ..ModelConfig::default()
        };
        let selector = ModelSelector::new(&config);
        let mut rng = SelectionRng::new(1);
        for _ in 0..10 {
            assert_eq!(selector.pick(rng.rng()), "o1");
        }
    }

    #[test]
    fn test_weighted_models_all_reachable() {
        let selector = ModelSelector::new(&ModelConfig::default());
        let mut rng = SelectionRng::new(2);
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..300 {
            seen.insert(selector.pick(rng.rng()));
        }
        assert_eq!(seen.len(), 3);
    }

    #[cfg(unix)]
    #[test]
    fn test_command_model_round_trip() {
        let command = vec!["cat".to_string()];
        let mut model = CommandModel::new(&command, Duration::from_secs(10)).unwrap();
        let code = model.generate_code("4o", "void runSketch(float progress) {}").unwrap();
        assert_eq!(code, "void runSketch(float progress) {}");
    }

    #[cfg(unix)]
    #[test]
    fn test_command_model_failure_is_api_error() {
        let command = vec!["false".to_string()];
        let mut model = CommandModel::new(&command, Duration::from_secs(10)).unwrap();
        let err = model.generate_code("4o", "prompt").unwrap_err();
        assert_eq!(err.reason, crate::schema::FailureReason::ApiError);
        assert!(CommandModel::new(&[], Duration::from_secs(1)).is_none());
    }
}
