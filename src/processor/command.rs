//! Backend that runs each step as an external command.

use super::{ProcessorBackend, StageStep};
use crate::config::ProcessorsConfig;
use anyhow::{bail, Context};
use futures::future::BoxFuture;
use std::process::Stdio;
use tokio::process::Command;

/// Lines of stderr kept in failure messages.
const STDERR_TAIL_LINES: usize = 20;

/// Spawns `<executable> [args..] <namespace>.<processor> --name=value ..`
/// for every step and waits for it to exit.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    executable: String,
    namespace: String,
    args: Vec<String>,
}

impl CommandBackend {
    pub fn new(config: &ProcessorsConfig) -> Self {
        Self {
            executable: config.executable.clone(),
            namespace: config.namespace.clone(),
            args: config.args.clone(),
        }
    }

    /// Arguments passed to the executable for `step`.
    ///
    /// List inputs repeat their flag once per path. Maps are ordered, so the
    /// command line is deterministic.
    pub fn command_args(&self, step: &StageStep) -> Vec<String> {
        let mut args = self.args.clone();

        if self.namespace.is_empty() {
            args.push(step.processor.to_string());
        } else {
            args.push(format!("{}.{}", self.namespace, step.processor));
        }

        for (name, paths) in &step.inputs {
            for path in paths {
                args.push(format!("--{}={}", name, path.display()));
            }
        }
        for (name, path) in &step.outputs {
            args.push(format!("--{}={}", name, path.display()));
        }
        for (name, value) in &step.params {
            args.push(format!("--{}={}", name, value));
        }

        args
    }

    async fn run(&self, step: &StageStep) -> anyhow::Result<()> {
        let args = self.command_args(step);
        tracing::trace!("{} {}", self.executable, args.join(" "));

        let output = Command::new(&self.executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to spawn {}", self.executable))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lines: Vec<&str> = stderr.lines().collect();
            let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
            if tail.is_empty() {
                bail!("{}", output.status);
            }
            bail!("{}\n{}", output.status, tail);
        }

        Ok(())
    }
}

impl ProcessorBackend for CommandBackend {
    fn invoke<'a>(&'a self, step: &'a StageStep) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(self.run(step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::Artifact;
    use crate::processor::{FilterParams, ProcessorRequest, REQUEST_THREADS_PARAM};

    fn backend(executable: &str, args: &[&str]) -> CommandBackend {
        CommandBackend::new(&ProcessorsConfig {
            executable: executable.to_string(),
            namespace: "mountainsort".to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        })
    }

    fn bandpass_step() -> StageStep {
        ProcessorRequest::BandpassFilter {
            timeseries: Artifact::external("/data/pre.mda"),
            output: Artifact::external("/tmp/00-filt.mda"),
            params: FilterParams {
                sample_rate: 30000.0,
                freq_min: 300.0,
                freq_max: 6000.0,
                freq_wid: 1000.0,
            },
            threads: 8,
        }
        .to_step()
    }

    #[test]
    fn test_command_args_layout() {
        let args = backend("mp-run-process", &["--mode=exec"]).command_args(&bandpass_step());
        assert_eq!(
            args,
            vec![
                "--mode=exec".to_string(),
                "mountainsort.bandpass_filter".to_string(),
                "--timeseries=/data/pre.mda".to_string(),
                "--timeseries_out=/tmp/00-filt.mda".to_string(),
                format!("--{}=8", REQUEST_THREADS_PARAM),
                "--freq_max=6000".to_string(),
                "--freq_min=300".to_string(),
                "--freq_wid=1000".to_string(),
                "--samplerate=30000".to_string(),
            ]
        );
    }

    #[test]
    fn test_list_inputs_repeat_flag() {
        let step = ProcessorRequest::ComputeWhiteningMatrix {
            timeseries: vec![Artifact::external("/a.mda"), Artifact::external("/b.mda")],
            output: Artifact::external("/w.mda"),
            threads: 1,
        }
        .to_step();
        let args = backend("x", &[]).command_args(&step);
        assert!(args.contains(&"--timeseries_list=/a.mda".to_string()));
        assert!(args.contains(&"--timeseries_list=/b.mda".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_exit() {
        backend("true", &[]).invoke(&bandpass_step()).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let err = backend("false", &[]).invoke(&bandpass_step()).await.unwrap_err();
        assert!(err.to_string().contains("exit"));
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let err = backend("/nonexistent/segsort-processor", &[])
            .invoke(&bandpass_step())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }
}
