use std::path::PathBuf;
use std::process::Stdio;

use relay_core::{BackendError, ExecuteRequest};
use secrecy::ExposeSecret;
use tokio::process::{Child, Command};

use crate::config::EngineConfig;

const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Argument list for one engine invocation.
#[derive(Clone, Debug)]
pub struct EngineCommand {
    program: String,
    args: Vec<String>,
    working_directory: PathBuf,
    pipe_stdin: bool,
}

impl EngineCommand {
    /// Flags shared by every channel.
    pub fn new(config: &EngineConfig, request: &ExecuteRequest) -> Self {
        let mut args = config.launcher_args.clone();
        args.extend(["--output-format", "stream-json", "--verbose"].map(String::from));
        args.push("--max-turns".into());
        args.push(config.max_turns.to_string());

        if let Some(model) = request.model.as_ref().or(config.default_model.as_ref()) {
            args.push("--model".into());
            args.push(model.clone());
        }

        if request.continue_session {
            match &request.session_id {
                Some(id) => {
                    args.push("--resume".into());
                    args.push(id.clone());
                }
                None => args.push("--continue".into()),
            }
        }

        if !config.allowed_tools.is_empty() {
            args.push("--allowedTools".into());
            args.push(config.allowed_tools.join(","));
        }
        if !config.disallowed_tools.is_empty() {
            args.push("--disallowedTools".into());
            args.push(config.disallowed_tools.join(","));
        }

        Self {
            program: config.cli_path.clone(),
            args,
            working_directory: request.working_directory.clone(),
            pipe_stdin: false,
        }
    }

    /// One-shot prompt on the command line.
    pub fn with_prompt(mut self, prompt: &str) -> Self {
        self.args.push("-p".into());
        self.args.push(prompt.to_string());
        self
    }

    /// Prompt delivered as a JSON message on stdin.
    pub fn with_streamed_input(mut self) -> Self {
        self.args.push("-p".into());
        self.args.push("--input-format".into());
        self.args.push("stream-json".into());
        self.pipe_stdin = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn spawn(&self, config: &EngineConfig) -> Result<Child, BackendError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.working_directory)
            .stdin(if self.pipe_stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(key) = &config.api_key {
            cmd.env(API_KEY_ENV, key.0.expose_secret());
        }

        cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BackendError::Spawn(format!("engine CLI not found: {}", self.program))
            } else {
                BackendError::Spawn(format!("{}: {e}", self.program))
            }
        })
    }
}
