use crate::config::JobDefinition;
use crate::queue::ExecutionDispatch;
use crate::shared::CancellationToken;
use std::collections::BTreeMap;
use std::io::{BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const RUN_ID_ENV: &str = "RUNBRIDGE_RUN_ID";
pub const JOB_KEY_ENV: &str = "RUNBRIDGE_JOB_KEY";
const SUMMARY_MAX_CHARS: usize = 500;
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub success: bool,
    pub summary: String,
}

impl ExecutionReport {
    pub fn succeeded(summary: impl Into<String>) -> Self {
        Self {
            success: true,
            summary: summary.into(),
        }
    }

    pub fn failed(summary: impl Into<String>) -> Self {
        Self {
            success: false,
            summary: summary.into(),
        }
    }
}

/// Runs the job behind a dispatch. Failures are reported, not returned: the
/// worker turns every report into a terminal run status, except a failure
/// reported once `cancel` fired, which it treats as an interrupted execution.
pub trait Executor: Send + Sync {
    fn execute(&self, dispatch: &ExecutionDispatch, cancel: &CancellationToken)
        -> ExecutionReport;
}

impl<F> Executor for F
where
    F: Fn(&ExecutionDispatch, &CancellationToken) -> ExecutionReport + Send + Sync,
{
    fn execute(
        &self,
        dispatch: &ExecutionDispatch,
        cancel: &CancellationToken,
    ) -> ExecutionReport {
        self(dispatch, cancel)
    }
}

/// Executes configured job commands as child processes.
///
/// The child sees the run id and job key in its environment. Exit status zero
/// is success; the summary is the last non-empty output line.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    jobs: BTreeMap<String, JobDefinition>,
}

impl ProcessExecutor {
    pub fn new(jobs: BTreeMap<String, JobDefinition>) -> Self {
        Self { jobs }
    }

    pub fn has_job(&self, job_key: &str) -> bool {
        self.jobs.contains_key(job_key)
    }
}

impl Executor for ProcessExecutor {
    fn execute(
        &self,
        dispatch: &ExecutionDispatch,
        cancel: &CancellationToken,
    ) -> ExecutionReport {
        let Some(job) = self.jobs.get(&dispatch.job_key) else {
            return ExecutionReport::failed(format!(
                "job `{}` is not configured",
                dispatch.job_key
            ));
        };
        let Some((program, args)) = job.command.split_first() else {
            return ExecutionReport::failed(format!(
                "job `{}` has an empty command",
                dispatch.job_key
            ));
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .env(RUN_ID_ENV, dispatch.run_id.as_str())
            .env(JOB_KEY_ENV, &dispatch.job_key)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &job.working_dir {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return ExecutionReport::failed(format!("command `{program}` was not found"))
            }
            Err(err) => {
                return ExecutionReport::failed(format!("failed to start `{program}`: {err}"))
            }
        };

        let stdout_reader = child.stdout.take().map(|stdout| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = BufReader::new(stdout).read_to_string(&mut buf);
                buf
            })
        });
        let stderr_reader = child.stderr.take().map(|stderr| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = BufReader::new(stderr).read_to_string(&mut buf);
                buf
            })
        });
        let collect = |reader: Option<JoinHandle<String>>| {
            reader
                .and_then(|handle| handle.join().ok())
                .unwrap_or_default()
        };

        let exit_status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if cancel.is_cancelled() {
                        stop_child(&mut child, [stdout_reader, stderr_reader]);
                        return ExecutionReport::failed("execution canceled");
                    }
                    thread::sleep(CHILD_POLL_INTERVAL);
                }
                Err(err) => {
                    stop_child(&mut child, [stdout_reader, stderr_reader]);
                    return ExecutionReport::failed(format!(
                        "failed to wait for `{program}`: {err}"
                    ));
                }
            }
        };

        let stdout = collect(stdout_reader);
        let stderr = collect(stderr_reader);
        if exit_status.success() {
            let summary = last_line(&stdout).unwrap_or("completed");
            ExecutionReport::succeeded(clip(summary))
        } else {
            let code = exit_status
                .code()
                .map(|code| code.to_string())
                .unwrap_or_else(|| "signal".to_string());
            let summary = match last_line(&stderr).or_else(|| last_line(&stdout)) {
                Some(line) => format!("exit {code}: {line}"),
                None => format!("exit {code}"),
            };
            ExecutionReport::failed(clip(&summary))
        }
    }
}

/// Kills and reaps `child`, then joins its output readers.
fn stop_child(child: &mut Child, readers: [Option<JoinHandle<String>>; 2]) {
    let _ = child.kill();
    let _ = child.wait();
    for reader in readers.into_iter().flatten() {
        let _ = reader.join();
    }
}

fn last_line(output: &str) -> Option<&str> {
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
}

fn clip(text: &str) -> String {
    text.chars().take(SUMMARY_MAX_CHARS).collect()
}
