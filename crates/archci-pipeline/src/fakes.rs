//! In-memory command executor for pipeline tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use archci_core::{ArchCiError, Result};
use async_trait::async_trait;

use crate::executor::{CommandExecutor, CommandOutput};
use crate::step::CommandLine;

#[derive(Debug, Clone)]
enum Scripted {
    Output(CommandOutput),
    SpawnError(String),
}

/// Records every command and answers from a per-program script. Programs
/// without a script succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    calls: Mutex<Vec<(CommandLine, Option<PathBuf>)>>,
    script: Mutex<HashMap<String, Scripted>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `program` with `output`.
    pub fn respond(&self, program: &str, output: CommandOutput) {
        self.script
            .lock()
            .unwrap()
            .insert(program.to_string(), Scripted::Output(output));
    }

    /// Make `program` succeed and print `stdout`.
    pub fn print(&self, program: &str, stdout: &str) {
        self.respond(
            program,
            CommandOutput {
                exit_code: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        );
    }

    /// Make `program` exit with `code`.
    pub fn fail(&self, program: &str, code: i32) {
        self.respond(
            program,
            CommandOutput {
                exit_code: code,
                stdout: String::new(),
                stderr: format!("{program} failed"),
            },
        );
    }

    /// Make `program` impossible to run.
    pub fn fail_to_spawn(&self, program: &str) {
        self.script.lock().unwrap().insert(
            program.to_string(),
            Scripted::SpawnError(format!("{program}: not found")),
        );
    }

    pub fn calls(&self) -> Vec<CommandLine> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(cmd, _)| cmd.clone())
            .collect()
    }

    /// Working directories passed alongside each call.
    pub fn working_dirs(&self) -> Vec<Option<PathBuf>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, dir)| dir.clone())
            .collect()
    }

    /// Programs in call order.
    pub fn programs(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.program).collect()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn run(&self, command: &CommandLine, cwd: Option<&Path>) -> Result<CommandOutput> {
        self.calls
            .lock()
            .unwrap()
            .push((command.clone(), cwd.map(Path::to_path_buf)));
        match self.script.lock().unwrap().get(&command.program) {
            Some(Scripted::Output(out)) => Ok(out.clone()),
            Some(Scripted::SpawnError(reason)) => Err(ArchCiError::StepFailed {
                step: command.program.clone(),
                reason: reason.clone(),
            }),
            None => Ok(CommandOutput::default()),
        }
    }
}
