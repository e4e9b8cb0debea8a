use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use graph::{Body, CommandTask, NodeId, TaskNode};
use util::Timer;

use super::task::{capture, prepare_command};
use super::{Backend, Error, Finished, Job, LocalBackend, Runtime};
use crate::fs::paths;

/// How often `wait` checks the embedded local pool while remote jobs are out.
const LOCAL_TICK: Duration = Duration::from_millis(20);
/// Consecutive failed status queries before a job is given up on.
const MAX_STATUS_ERRORS: usize = 3;
/// Polls a job may go unreported by the queue before it is treated as ended.
const UNKNOWN_GRACE_POLLS: usize = 30;

/// State of a batch job as reported by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    /// Finished as far as the queue is concerned; the exit code decides success.
    Done,
    /// The queue itself ended the job (e.g. `CANCELLED`, `OUT_OF_MEMORY`).
    Failed(String),
    /// The queue has no record of the job (yet).
    Unknown,
}

impl JobStatus {
    /// Interpret a Slurm job state name.
    pub fn from_slurm(state: &str) -> Self {
        let state = state.split_whitespace().next().unwrap_or("");
        match state {
            "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_HOLD" | "RESIZING"
            | "SUSPENDED" => Self::Pending,
            "RUNNING" | "COMPLETING" | "STAGE_OUT" | "SIGNALING" => Self::Running,
            "COMPLETED" => Self::Done,
            "" => Self::Unknown,
            other => Self::Failed(other.trim_end_matches('+').to_owned()),
        }
    }

    fn is_finished(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }
}

/// A handle on an external batch queue.
pub trait QueueClient {
    /// Submit `script` with extra submission `args`, returning the job id.
    fn submit(&mut self, script: &Path, args: &[String]) -> Result<String>;

    fn status(&mut self, job_id: &str) -> Result<JobStatus>;

    fn cancel(&mut self, job_id: &str) -> Result<()>;
}

/// Talks to Slurm through `sbatch`, `squeue`, `sacct` and `scancel`.
#[derive(Debug, Default)]
pub struct Slurm;

impl Slurm {
    fn output(cmd: &mut Command) -> Result<String> {
        let out = cmd
            .output()
            .with_context(|| format!("running {:?}", cmd.get_program()))?;
        if !out.status.success() {
            return Err(anyhow!(
                "{:?} exited with {}: {}",
                cmd.get_program(),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_owned())
    }
}

impl QueueClient for Slurm {
    fn submit(&mut self, script: &Path, args: &[String]) -> Result<String> {
        let out = Self::output(Command::new("sbatch").arg("--parsable").args(args).arg(script))?;
        // --parsable prints "jobid" or "jobid;cluster"
        let job_id = out.split(';').next().unwrap_or("").trim();
        if job_id.is_empty() {
            return Err(anyhow!("sbatch did not report a job id"));
        }
        Ok(job_id.to_owned())
    }

    fn status(&mut self, job_id: &str) -> Result<JobStatus> {
        // squeue forgets jobs shortly after they end, so fall back to accounting:
        let state = Self::output(Command::new("squeue").args(["-h", "-o", "%T", "-j", job_id]))
            .unwrap_or_default();
        if !state.is_empty() {
            return Ok(JobStatus::from_slurm(&state));
        }
        let state = Self::output(
            Command::new("sacct").args(["-n", "-X", "-P", "-o", "State", "-j", job_id]),
        )?;
        Ok(JobStatus::from_slurm(state.lines().next().unwrap_or("")))
    }

    fn cancel(&mut self, job_id: &str) -> Result<()> {
        Self::output(Command::new("scancel").arg(job_id)).map(|_| ())
    }
}

/// Tuning for the Slurm backend.
#[derive(Debug, Clone)]
pub struct SlurmOptions {
    /// concurrency bound: jobs submitted or running at once
    pub max_jobs: usize,
    /// workers for nodes that must run in this process
    pub n_procs: usize,
    pub poll_interval: Duration,
    /// passed to every `sbatch` call, before node-specific arguments
    pub sbatch_args: Vec<String>,
}

struct RemoteJob {
    id: NodeId,
    job_id: String,
    node: TaskNode,
    work_dir: PathBuf,
    timer: Timer,
    timeout: Option<Duration>,
    /// consecutive failed status queries
    status_errors: usize,
    /// consecutive polls with no record of the job
    unknown_polls: usize,
}

/// Submits command nodes as Slurm batch jobs and polls them to completion.
///
/// Function nodes can't leave this process, so they run on an embedded local pool.
pub struct SlurmBackend<Q: QueueClient> {
    queue: Q,
    local: LocalBackend,
    opts: SlurmOptions,
    rt: Runtime,
    jobs: Vec<RemoteJob>,
    done: VecDeque<Finished>,
    last_poll: Option<Timer>,
}

impl<Q: QueueClient> SlurmBackend<Q> {
    pub fn new(queue: Q, opts: SlurmOptions, rt: Runtime) -> Result<Self> {
        let local = LocalBackend::new(opts.n_procs, rt.clone())?;
        Ok(Self {
            queue,
            local,
            opts,
            rt,
            jobs: Vec::with_capacity(16),
            done: VecDeque::with_capacity(4),
            last_poll: None,
        })
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Submission arguments for `node`, from the global arguments and its resource hints.
    fn sbatch_args(&self, node: &TaskNode, work_dir: &Path) -> Result<Vec<String>> {
        let dir = util::path_str(work_dir)?;
        let mut args = Vec::with_capacity(16);
        args.extend(self.opts.sbatch_args.iter().cloned());
        args.push(format!("--job-name={}", node.name()));
        args.push(format!("--chdir={dir}"));
        args.push(format!("--output={}", util::path_str(&paths::stdout(work_dir))?));
        args.push(format!("--error={}", util::path_str(&paths::stderr(work_dir))?));

        let hints = node.resource_hints();
        if let Some(threads) = hints.threads {
            args.push(format!("--cpus-per-task={threads}"));
        }
        if let Some(gb) = hints.memory_gb {
            args.push(format!("--mem={gb}G"));
        }
        if let Some(queue) = &hints.queue {
            args.push(format!("--partition={queue}"));
        }
        args.extend(hints.extra.iter().cloned());
        Ok(args)
    }

    fn submit_command(&mut self, job: Job, cmd: &CommandTask) -> Result<()> {
        let name = job.node.name();
        prepare_command(&job.node, cmd, &job.inputs, &job.work_dir, &self.rt.fs)?;
        let args = self.sbatch_args(&job.node, &job.work_dir)?;
        let script = paths::command_sh(&job.work_dir);

        let job_id = self
            .queue
            .submit(&script, &args)
            .map_err(|e| Error::execution(name, format!("batch queue rejected job: {e:#}")))?;
        log::info!("{name}: submitted as batch job {job_id}");

        let timeout = self.rt.timeout_for(&job.node);
        self.jobs.push(RemoteJob {
            id: job.id,
            job_id,
            node: job.node,
            work_dir: job.work_dir,
            timer: Timer::now(),
            timeout,
            status_errors: 0,
            unknown_polls: 0,
        });
        Ok(())
    }

    /// Check every outstanding job once, moving finished ones to `done`.
    /// Queue errors end only the job they concern.
    fn poll(&mut self) {
        self.last_poll = Some(Timer::now());
        let cancelled = self.rt.cancel.load(std::sync::atomic::Ordering::Relaxed);

        let mut i = 0;
        while i < self.jobs.len() {
            let ended = if cancelled {
                let job = &self.jobs[i];
                let e = Error::Cancelled {
                    node: job.node.name().to_owned(),
                };
                Some(Self::cancel_job(&mut self.queue, job, e))
            } else if let Some(limit) = self.jobs[i]
                .timeout
                .filter(|limit| self.jobs[i].timer.exceeded(*limit))
            {
                let job = &self.jobs[i];
                let e = Error::Timeout {
                    node: job.node.name().to_owned(),
                    limit,
                };
                Some(Self::cancel_job(&mut self.queue, job, e))
            } else {
                self.check(i)
            };

            match ended {
                Some(outcome) => {
                    let job = self.jobs.remove(i);
                    self.done.push_back(Finished { id: job.id, outcome });
                }
                None => i += 1,
            }
        }
    }

    /// Ask the queue to stop `job`, failing it with `reason`.
    fn cancel_job(queue: &mut Q, job: &RemoteJob, reason: Error) -> Result<graph::Bindings> {
        if let Err(e) = queue.cancel(&job.job_id) {
            log::warn!("could not cancel batch job {}: {e:#}", job.job_id);
            return Err(Error::execution(
                job.node.name(),
                format!("{reason}; cancelling batch job {} failed: {e:#}", job.job_id),
            )
            .into());
        }
        Err(reason.into())
    }

    /// Query the status of job `i`. Returns its outcome if it has ended.
    fn check(&mut self, i: usize) -> Option<Result<graph::Bindings>> {
        let job_id = self.jobs[i].job_id.clone();
        let name = self.jobs[i].node.name().to_owned();
        let status = match self.queue.status(&job_id) {
            Ok(status) => status,
            Err(e) => {
                let job = &mut self.jobs[i];
                job.status_errors += 1;
                log::warn!(
                    "batch job {job_id} ({name}): status query failed ({}/{MAX_STATUS_ERRORS}): {e:#}",
                    job.status_errors
                );
                if job.status_errors < MAX_STATUS_ERRORS {
                    return None;
                }
                if let Err(cancel) = self.queue.cancel(&job_id) {
                    log::warn!("could not cancel batch job {job_id}: {cancel:#}");
                }
                return Some(Err(Error::execution(
                    &name,
                    format!("lost track of batch job {job_id}: {e:#}"),
                )
                .into()));
            }
        };
        log::trace!("batch job {job_id} ({name}): {status:?}");

        let job = &mut self.jobs[i];
        job.status_errors = 0;
        let status = match status {
            // accounting can lag behind the job; the exit code file settles it
            JobStatus::Unknown if paths::exit_code(&job.work_dir).exists() => JobStatus::Done,
            JobStatus::Unknown => {
                job.unknown_polls += 1;
                if job.unknown_polls < UNKNOWN_GRACE_POLLS {
                    return None;
                }
                JobStatus::Done
            }
            other => {
                job.unknown_polls = 0;
                other
            }
        };
        if status.is_finished() {
            Some(self.collect(&self.jobs[i], status))
        } else {
            None
        }
    }

    fn collect(&self, job: &RemoteJob, status: JobStatus) -> Result<graph::Bindings> {
        let name = job.node.name();
        let code = std::fs::read_to_string(paths::exit_code(&job.work_dir))
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok());

        let cause = match (&status, code) {
            (JobStatus::Done, Some(0)) => None,
            (_, Some(code)) => Some(format!("batch job {} exited with code {code}", job.job_id)),
            (JobStatus::Failed(state), None) => {
                Some(format!("batch job {} ended in state {state}", job.job_id))
            }
            (_, None) => Some(format!(
                "batch job {} ended without recording an exit code",
                job.job_id
            )),
        };
        if let Some(cause) = cause {
            return Err(Error::TaskExecution {
                node: name.to_owned(),
                cause,
                captured: Some(capture(&job.work_dir, code)),
            }
            .into());
        }

        match job.node.body() {
            Body::Command(cmd) => Ok(cmd.collect_outputs(name, &job.work_dir)?),
            Body::Function(_) => Err(anyhow!("{name} is not a command node")),
        }
    }

    fn poll_due(&self) -> bool {
        self.last_poll
            .map_or(true, |t| t.exceeded(self.opts.poll_interval))
    }
}

impl<Q: QueueClient> Backend for SlurmBackend<Q> {
    fn name(&self) -> &'static str {
        "slurm"
    }

    fn capacity(&self) -> usize {
        self.opts.max_jobs.max(1)
    }

    fn submit(&mut self, job: Job) -> Result<()> {
        match job.node.body().clone() {
            Body::Function(_) => self.local.submit(job),
            Body::Command(cmd) => self.submit_command(job, &cmd),
        }
    }

    fn wait(&mut self) -> Result<Finished> {
        loop {
            if let Some(finished) = self.done.pop_front() {
                return Ok(finished);
            }
            if let Some(finished) = self.local.try_wait()? {
                return Ok(finished);
            }
            if self.jobs.is_empty() {
                // only local work left (or nothing at all, which is an error):
                return self.local.wait();
            }
            if self.poll_due() {
                self.poll();
                continue;
            }
            thread::sleep(LOCAL_TICK.min(self.opts.poll_interval));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::Fs;
    use graph::{Bindings, FunctionTask, OutputFile, ResourceHints, ValueType};
    use std::fs;
    use tempfile::tempdir;

    /// Runs submitted scripts with bash when first polled.
    #[derive(Default)]
    struct FakeQueue {
        reject: bool,
        hang: bool,
        /// job ids whose status can't be queried
        unreachable: Vec<String>,
        /// report no record of any job, running each one on its third poll
        unrecorded: bool,
        submitted: Vec<(PathBuf, Vec<String>)>,
        polls: usize,
        cancelled: Vec<String>,
    }

    impl QueueClient for FakeQueue {
        fn submit(&mut self, script: &Path, args: &[String]) -> Result<String> {
            if self.reject {
                return Err(anyhow!("sbatch: error: invalid partition specified"));
            }
            self.submitted.push((script.to_path_buf(), args.to_vec()));
            Ok(format!("{}", 1000 + self.submitted.len()))
        }

        fn status(&mut self, job_id: &str) -> Result<JobStatus> {
            self.polls += 1;
            if self.hang {
                return Ok(JobStatus::Running);
            }
            if self.unreachable.iter().any(|id| id == job_id) {
                return Err(anyhow!("sacct: error: slurmdbd unreachable"));
            }
            if self.unrecorded && self.polls < 3 {
                return Ok(JobStatus::Unknown);
            }
            let idx: usize = job_id.parse::<usize>()? - 1001;
            let script = &self.submitted[idx].0;
            let status = Command::new("bash").arg(script).status()?;
            log::debug!("fake job {job_id} ran with {status}");
            if self.unrecorded {
                return Ok(JobStatus::Unknown);
            }
            Ok(JobStatus::Done)
        }

        fn cancel(&mut self, job_id: &str) -> Result<()> {
            self.cancelled.push(job_id.to_owned());
            Ok(())
        }
    }

    fn opts() -> SlurmOptions {
        SlurmOptions {
            max_jobs: 4,
            n_procs: 1,
            poll_interval: Duration::from_millis(10),
            sbatch_args: vec!["--account=lab".to_owned()],
        }
    }

    fn command_job(dir: &Path, cmd: CommandTask, hints: ResourceHints) -> Job {
        Job {
            id: NodeId::from(0),
            node: TaskNode::command("sub-01", "eddy", cmd).hints(hints),
            inputs: Bindings::new(),
            work_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn test_state_names() {
        assert_eq!(JobStatus::from_slurm("PENDING"), JobStatus::Pending);
        assert_eq!(JobStatus::from_slurm("COMPLETING"), JobStatus::Running);
        assert_eq!(JobStatus::from_slurm("COMPLETED"), JobStatus::Done);
        assert_eq!(
            JobStatus::from_slurm("CANCELLED by 1234"),
            JobStatus::Failed("CANCELLED".to_owned())
        );
        assert_eq!(JobStatus::from_slurm(""), JobStatus::Unknown);
    }

    #[test]
    fn test_status_error_fails_only_its_job() -> Result<()> {
        let dir = tempdir()?;
        let rt = Runtime::new(Fs::new([dir.path()]));
        let queue = FakeQueue {
            unreachable: vec!["1001".to_owned()],
            ..Default::default()
        };
        let mut backend = SlurmBackend::new(queue, opts(), rt)?;
        for (i, subject) in ["sub-01", "sub-02"].into_iter().enumerate() {
            let work_dir = dir.path().join(subject);
            fs::create_dir(&work_dir)?;
            let cmd = CommandTask::new("sh", |_| Ok(vec!["-c".to_owned(), "exit 0".to_owned()]));
            backend.submit(Job {
                id: NodeId::from(i),
                node: TaskNode::command(subject, "eddy", cmd),
                inputs: Bindings::new(),
                work_dir,
            })?;
        }

        let mut outcomes = vec![backend.wait()?, backend.wait()?];
        outcomes.sort_by_key(|f| usize::from(f.id));
        assert!(outcomes[1].outcome.is_ok());
        match outcomes[0].outcome.as_ref().map_err(|e| e.downcast_ref::<Error>()) {
            Err(Some(Error::TaskExecution { node, cause, .. })) => {
                assert_eq!(node, "sub-01.eddy");
                assert!(cause.contains("slurmdbd unreachable"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(backend.queue().cancelled, vec!["1001".to_owned()]);
        Ok(())
    }

    #[test]
    fn test_unrecorded_job_waits_for_exit_code() -> Result<()> {
        let dir = tempdir()?;
        let rt = Runtime::new(Fs::new([dir.path()]));
        let queue = FakeQueue {
            unrecorded: true,
            ..Default::default()
        };
        let mut backend = SlurmBackend::new(queue, opts(), rt)?;
        let cmd = CommandTask::new("sh", |_| {
            Ok(vec!["-c".to_owned(), "echo rotated > bvecs_rot".to_owned()])
        })
        .output("out_bvecs", OutputFile::WorkDir("bvecs_rot".into()));
        backend.submit(command_job(dir.path(), cmd, ResourceHints::default()))?;

        let outputs = backend.wait()?.outcome?;
        assert_eq!(outputs.file("out_bvecs")?, dir.path().join("bvecs_rot"));
        assert_eq!(backend.queue().polls, 3);
        Ok(())
    }

    #[test]
    fn test_submit_and_poll_to_completion() -> Result<()> {
        let dir = tempdir()?;
        let rt = Runtime::new(Fs::new([dir.path()]));
        let mut backend = SlurmBackend::new(FakeQueue::default(), opts(), rt)?;

        let cmd = CommandTask::new("sh", |_| {
            Ok(vec!["-c".to_owned(), "echo corrected > eddy_corrected.nii.gz".to_owned()])
        })
        .output("out_corrected", OutputFile::WorkDir("eddy_corrected.nii.gz".into()));
        let hints = ResourceHints::default()
            .threads(4)
            .memory_gb(10)
            .extra("--gres=gpu:1");
        backend.submit(command_job(dir.path(), cmd, hints))?;

        let (_, args) = &backend.queue().submitted[0];
        assert_eq!(args[0], "--account=lab");
        assert!(args.contains(&"--cpus-per-task=4".to_owned()));
        assert!(args.contains(&"--mem=10G".to_owned()));
        assert!(args.contains(&"--gres=gpu:1".to_owned()));
        assert!(args.contains(&"--job-name=sub-01.eddy".to_owned()));

        let finished = backend.wait()?;
        let outputs = finished.outcome?;
        assert_eq!(
            outputs.file("out_corrected")?,
            dir.path().join("eddy_corrected.nii.gz")
        );
        assert_eq!(fs::read_to_string(dir.path().join("exit_code"))?.trim(), "0");
        Ok(())
    }

    #[test]
    fn test_failed_job_reports_exit_code() -> Result<()> {
        let dir = tempdir()?;
        let rt = Runtime::new(Fs::new([dir.path()]));
        let mut backend = SlurmBackend::new(FakeQueue::default(), opts(), rt)?;
        let cmd = CommandTask::new("sh", |_| Ok(vec!["-c".to_owned(), "exit 7".to_owned()]));
        backend.submit(command_job(dir.path(), cmd, ResourceHints::default()))?;

        let e = backend.wait()?.outcome.unwrap_err();
        match e.downcast_ref::<Error>() {
            Some(Error::TaskExecution { captured: Some(c), .. }) => assert_eq!(c.code, Some(7)),
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_rejected_submission() -> Result<()> {
        let dir = tempdir()?;
        let rt = Runtime::new(Fs::new([dir.path()]));
        let queue = FakeQueue {
            reject: true,
            ..Default::default()
        };
        let mut backend = SlurmBackend::new(queue, opts(), rt)?;
        let cmd = CommandTask::new("true", |_| Ok(Vec::new()));
        let e = backend
            .submit(command_job(dir.path(), cmd, ResourceHints::default()))
            .unwrap_err();
        assert!(e.to_string().contains("rejected"));
        assert_eq!(backend.queue().polls, 0);
        Ok(())
    }

    #[test]
    fn test_timeout_cancels_job() -> Result<()> {
        let dir = tempdir()?;
        let rt = Runtime::new(Fs::new([dir.path()]));
        let queue = FakeQueue {
            hang: true,
            ..Default::default()
        };
        let mut backend = SlurmBackend::new(queue, opts(), rt)?;
        let cmd = CommandTask::new("true", |_| Ok(Vec::new()));
        let hints = ResourceHints::default().timeout(Duration::from_millis(50));
        backend.submit(command_job(dir.path(), cmd, hints))?;

        let e = backend.wait()?.outcome.unwrap_err();
        assert!(matches!(e.downcast_ref::<Error>(), Some(Error::Timeout { .. })));
        assert_eq!(backend.queue().cancelled, vec!["1001".to_owned()]);
        Ok(())
    }

    #[test]
    fn test_function_nodes_run_locally() -> Result<()> {
        let dir = tempdir()?;
        let rt = Runtime::new(Fs::new([dir.path()]));
        let mut backend = SlurmBackend::new(FakeQueue::default(), opts(), rt)?;
        let node = TaskNode::function(
            "sub-01",
            "rotate",
            FunctionTask::new(|_, _| Ok(Bindings::new().with("sid", "sub-01"))),
        )
        .output("sid", ValueType::Scalar);
        backend.submit(Job {
            id: NodeId::from(3),
            node,
            inputs: Bindings::new(),
            work_dir: dir.path().to_path_buf(),
        })?;
        let finished = backend.wait()?;
        assert_eq!(finished.id, NodeId::from(3));
        assert_eq!(finished.outcome?.scalar("sid")?, "sub-01");
        assert!(backend.queue().submitted.is_empty());
        Ok(())
    }
}
