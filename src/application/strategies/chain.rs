//! Fallback chains and dependency installation shared by the repository-backed strategies.

use std::path::Path;

use crate::{
    config::{InstallCommands, METHOD_PLACEHOLDER},
    core::{
        domain::LogSink,
        error::{Error, Result},
        ports::{CommandRunner, CommandSpec},
    },
};

/// Single-quotes `raw` for `sh`/`bash`.
pub fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// Substitutes the quoted method into a chain template.
pub fn render(template: &str, method: &str) -> String {
    template.replace(METHOD_PLACEHOLDER, &shell_quote(method))
}

/// One prioritized list of invocation commands, bound to a checkout.
pub struct FallbackChain<'a> {
    pub runner: &'a dyn CommandRunner,
    pub image: &'a str,
    pub workdir: &'a Path,
    pub templates: &'a [String],
}

impl FallbackChain<'_> {
    /// Tries each command in order until one exits zero.
    ///
    /// A sandbox that cannot start aborts the chain immediately: the remaining
    /// commands would hit the same wall.
    pub async fn run(&self, method: &str, sink: &LogSink) -> Result<()> {
        for template in self.templates {
            let command = render(template, method);
            sink.stdout(format!("Trying: {command}"));
            let spec = CommandSpec {
                image: self.image.to_string(),
                workdir: self.workdir.to_path_buf(),
                command: command.clone(),
            };
            match self.runner.run(&spec, sink).await {
                Ok(_) => {
                    sink.stdout(format!("{command} succeeded"));
                    return Ok(());
                }
                Err(err @ Error::ProcessSpawnFailed(_)) => return Err(err),
                Err(err) => sink.stdout(format!("{command} failed: {err}")),
            }
        }
        sink.stdout(format!("No test command succeeded for: {method}"));
        Err(Error::MethodExecutionFailed {
            method: method.to_string(),
        })
    }
}

/// Picks the install command from the lockfile present, or `None` without a `package.json`.
pub fn install_command<'a>(dir: &Path, install: &'a InstallCommands) -> Option<&'a str> {
    if !dir.join("package.json").exists() {
        return None;
    }
    let command = if dir.join("pnpm-lock.yaml").exists() {
        &install.pnpm
    } else if dir.join("yarn.lock").exists() {
        &install.yarn
    } else if dir.join("package-lock.json").exists() {
        &install.npm_ci
    } else {
        &install.npm_install
    };
    Some(command.as_str())
}

/// Installs dependencies once per checkout. A failed install is logged and the run continues.
pub async fn install_dependencies(
    runner: &dyn CommandRunner,
    image: &str,
    dir: &Path,
    install: &InstallCommands,
    sink: &LogSink,
) -> Result<()> {
    let Some(command) = install_command(dir, install) else {
        sink.stdout("No package.json found, skipping dependency install");
        return Ok(());
    };
    sink.stdout(format!("Installing dependencies: {command}"));
    let spec = CommandSpec {
        image: image.to_string(),
        workdir: dir.to_path_buf(),
        command: command.to_string(),
    };
    match runner.run(&spec, sink).await {
        Ok(_) => Ok(()),
        Err(err @ Error::ProcessSpawnFailed(_)) => Err(err),
        Err(err) => {
            sink.stdout(format!("Dependency install failed: {err}"));
            Ok(())
        }
    }
}
