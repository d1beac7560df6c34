//! Recording fake executor for tests.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use vpsforge_common::error::{ForgeError, Result};

use crate::command::{CommandExecutor, CommandSpec, ExecOutput};

type Responder = Arc<dyn Fn(&CommandSpec) -> Option<Result<ExecOutput>> + Send + Sync>;

/// Executor that records every command and answers from scripted rules.
///
/// Rules are consulted newest first; the first rule returning `Some`
/// decides the outcome. Commands no rule matches succeed with empty
/// output.
#[derive(Clone, Default)]
pub struct RecordingExecutor {
    calls: Arc<Mutex<Vec<CommandSpec>>>,
    rules: Arc<Mutex<Vec<Responder>>>,
}

impl RecordingExecutor {
    /// Creates an executor where every command succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a custom rule.
    pub fn respond_with<F>(&self, rule: F)
    where
        F: Fn(&CommandSpec) -> Option<Result<ExecOutput>> + Send + Sync + 'static,
    {
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(rule));
    }

    /// Answers commands whose rendered line contains `needle` with `output`.
    pub fn respond_when(&self, needle: impl Into<String>, output: ExecOutput) {
        let needle = needle.into();
        self.respond_with(move |spec| {
            spec.to_string()
                .contains(&needle)
                .then(|| Ok(output.clone()))
        });
    }

    /// Fails commands whose rendered line contains `needle` with exit 1.
    pub fn fail_when(&self, needle: impl Into<String>, stderr: impl Into<String>) {
        self.respond_when(needle, ExecOutput::failed(1, stderr));
    }

    /// Makes commands whose rendered line contains `needle` time out.
    pub fn timeout_when(&self, needle: impl Into<String>) {
        let needle = needle.into();
        self.respond_with(move |spec| {
            let line = spec.to_string();
            line.contains(&needle).then(|| {
                Err(ForgeError::Timeout {
                    operation: line,
                    after: spec.time_budget(),
                })
            })
        });
    }

    /// Every command seen so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Rendered (secret-masked) lines of every command seen so far.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.calls().iter().map(ToString::to_string).collect()
    }

    /// Number of recorded commands whose line contains `needle`.
    #[must_use]
    pub fn count_matching(&self, needle: &str) -> usize {
        self.lines().iter().filter(|l| l.contains(needle)).count()
    }
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn run(&self, spec: &CommandSpec) -> Result<ExecOutput> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(spec.clone());
        let rules = self
            .rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for rule in rules.iter().rev() {
            if let Some(outcome) = rule(spec) {
                return outcome;
            }
        }
        Ok(ExecOutput::default())
    }
}
