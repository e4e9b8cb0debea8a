use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};

use graph::{Bindings, Body, CommandTask, FunctionTask, TaskNode};

use super::env_guard::{ThreadEnvGuard, THREAD_VARS};
use super::run_cmd::{run_cmd, CmdEnd};
use super::script::CommandScriptBuilder;
use super::{Captured, Error, Job, Runtime};
use crate::fs::{paths, Fs};

/// Lines of captured output kept in error reports.
const TAIL_LINES: usize = 20;

/// Run `job` in the current thread. Panics in function bodies are caught.
pub fn execute(job: &Job, rt: &Runtime) -> Result<Bindings> {
    match job.node.body() {
        Body::Function(func) => run_function(job, func),
        Body::Command(cmd) => run_command(job, cmd, rt),
    }
}

fn run_function(job: &Job, func: &FunctionTask) -> Result<Bindings> {
    let node = job.node.name();
    let result = {
        let _guard = job.node.resource_hints().threads.map(ThreadEnvGuard::set);
        panic::catch_unwind(AssertUnwindSafe(|| func.call(&job.inputs, &job.work_dir)))
    };
    let outputs = match result {
        Ok(Ok(outputs)) => outputs,
        Ok(Err(e)) => return Err(Error::execution(node, format!("{e:#}")).into()),
        Err(panic) => return Err(Error::execution(node, panic_message(panic)).into()),
    };
    job.node.check_outputs(&outputs)?;
    Ok(outputs)
}

pub(super) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Task panicked: {s}")
    } else {
        String::from("Task panicked with unknown payload")
    }
}

/// Remove stale outputs, render the command line, and record it in `command.sh`.
/// Returns the rendered arguments.
pub fn prepare_command(
    node: &TaskNode,
    cmd: &CommandTask,
    inputs: &Bindings,
    work_dir: &Path,
    fs: &Fs,
) -> Result<Vec<String>> {
    let name = node.name();
    for stale in cmd.stale_paths() {
        log::debug!("{name}: removing stale {:?}", stale);
        fs.remove(stale)
            .with_context(|| format!("clearing stale output for {name}"))?;
    }
    let args = cmd
        .render_args(inputs)
        .map_err(|e| Error::execution(name, format!("rendering command line: {e:#}")))?;

    let mut strbuf = String::with_capacity(1024);
    let mut script = CommandScriptBuilder::new(&mut strbuf);
    script.write_prefix(name);
    script.write_cd(util::path_str(work_dir)?);
    if let Some(threads) = node.resource_hints().threads {
        let threads = threads.to_string();
        for var in THREAD_VARS {
            script.write_export(var, &threads);
        }
    }
    for stale in cmd.stale_paths() {
        script.write_remove(util::path_str(stale)?);
    }
    script.write_command(cmd.program(), &args);
    fs.write_file(paths::command_sh(work_dir), &strbuf)
        .context("writing command.sh")?;
    Ok(args)
}

fn run_command(job: &Job, cmd: &CommandTask, rt: &Runtime) -> Result<Bindings> {
    let node = &job.node;
    let args = prepare_command(node, cmd, &job.inputs, &job.work_dir, &rt.fs)?;

    let mut process = Command::new(cmd.program());
    process.args(&args).current_dir(&job.work_dir);
    if let Some(threads) = node.resource_hints().threads {
        for var in THREAD_VARS {
            process.env(var, threads.to_string());
        }
    }

    log::info!("{}: running {} {}", node.name(), cmd.program(), args.join(" "));
    let timeout = rt.timeout_for(node);
    let end = run_cmd(
        &mut process,
        &job.work_dir,
        &rt.fs,
        timeout,
        &rt.cancel,
        rt.echo,
    )
    .map_err(|e| Error::execution(node.name(), format!("{e:#}")))?;

    match end {
        CmdEnd::Exited(status) if status.success() => (),
        CmdEnd::Exited(status) => {
            return Err(Error::TaskExecution {
                node: node.name().to_owned(),
                cause: format!("{} exited with {status}", cmd.program()),
                captured: Some(capture(&job.work_dir, status.code())),
            }
            .into())
        }
        CmdEnd::TimedOut => {
            return Err(Error::Timeout {
                node: node.name().to_owned(),
                limit: timeout.unwrap_or_default(),
            }
            .into())
        }
        CmdEnd::Cancelled => {
            return Err(Error::Cancelled {
                node: node.name().to_owned(),
            }
            .into())
        }
    }

    Ok(cmd.collect_outputs(node.name(), &job.work_dir)?)
}

/// Read the tail of `stdout.txt` and `stderr.txt` from a node directory.
pub fn capture(work_dir: &Path, code: Option<i32>) -> Captured {
    Captured {
        code,
        stdout: tail(&paths::stdout(work_dir)),
        stderr: tail(&paths::stderr(work_dir)),
    }
}

fn tail(path: &Path) -> String {
    let text = std::fs::read_to_string(path).unwrap_or_default();
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(TAIL_LINES);
    lines[start..].join("\n")
}

#[cfg(test)]
mod test {
    use super::*;
    use graph::{NodeId, OutputFile, ValueType};
    use std::fs;
    use tempfile::tempdir;

    fn job(node: TaskNode, inputs: Bindings, work_dir: &Path) -> Job {
        Job {
            id: NodeId::from(0),
            node,
            inputs,
            work_dir: work_dir.to_path_buf(),
        }
    }

    #[test]
    fn test_function_error_and_panic() -> Result<()> {
        let dir = tempdir()?;
        let rt = Runtime::new(Fs::new([dir.path()]));

        let failing = TaskNode::function(
            "sub-01",
            "preproc",
            FunctionTask::new(|_, _| anyhow::bail!("bval file is empty")),
        );
        let e = execute(&job(failing, Bindings::new(), dir.path()), &rt).unwrap_err();
        match e.downcast_ref::<Error>() {
            Some(Error::TaskExecution { node, cause, .. }) => {
                assert_eq!(node, "sub-01.preproc");
                assert!(cause.contains("bval file is empty"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let panicking = TaskNode::function(
            "sub-01",
            "rotate",
            FunctionTask::new(|_, _| panic!("index out of bounds")),
        );
        let e = execute(&job(panicking, Bindings::new(), dir.path()), &rt).unwrap_err();
        assert!(e.to_string().contains("panicked"));
        Ok(())
    }

    #[test]
    fn test_function_missing_output() -> Result<()> {
        let dir = tempdir()?;
        let rt = Runtime::new(Fs::new([dir.path()]));
        let node = TaskNode::function(
            "sub-01",
            "rotate",
            FunctionTask::new(|_, _| Ok(Bindings::new())),
        )
        .output("bvec_file", ValueType::File);
        let e = execute(&job(node, Bindings::new(), dir.path()), &rt).unwrap_err();
        assert!(matches!(
            e.downcast_ref::<graph::Error>(),
            Some(graph::Error::MissingOutput { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_command_success_and_outputs() -> Result<()> {
        let dir = tempdir()?;
        let rt = Runtime::new(Fs::new([dir.path()]));
        let cmd = CommandTask::new("sh", |inputs| {
            let msg = inputs.scalar("msg")?;
            Ok(vec!["-c".to_owned(), format!("echo {msg} > out.txt")])
        })
        .output("out_file", OutputFile::WorkDir("out.txt".into()));
        let node = TaskNode::command("sub-01", "echo", cmd).input("msg", ValueType::Scalar);

        let outputs = execute(
            &job(node, Bindings::new().with("msg", "hello"), dir.path()),
            &rt,
        )?;
        let out = outputs.file("out_file")?;
        assert_eq!(out, dir.path().join("out.txt"));
        assert_eq!(fs::read_to_string(out)?, "hello\n");
        assert!(dir.path().join("command.sh").is_file());
        Ok(())
    }

    #[test]
    fn test_command_failure_captures_output() -> Result<()> {
        let dir = tempdir()?;
        let rt = Runtime::new(Fs::new([dir.path()]));
        let cmd = CommandTask::new("sh", |_| {
            Ok(vec!["-c".to_owned(), "echo cannot open image 1>&2; exit 2".to_owned()])
        });
        let node = TaskNode::command("sub-01", "topup", cmd);

        let e = execute(&job(node, Bindings::new(), dir.path()), &rt).unwrap_err();
        match e.downcast_ref::<Error>() {
            Some(Error::TaskExecution {
                captured: Some(captured),
                ..
            }) => {
                assert_eq!(captured.code, Some(2));
                assert_eq!(captured.stderr, "cannot open image");
            }
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_command_missing_output_file() -> Result<()> {
        let dir = tempdir()?;
        let rt = Runtime::new(Fs::new([dir.path()]));
        let cmd = CommandTask::new("true", |_| Ok(Vec::new()))
            .output("mask_file", OutputFile::WorkDir("brain_mask.nii.gz".into()));
        let node = TaskNode::command("sub-01", "mask", cmd);
        let e = execute(&job(node, Bindings::new(), dir.path()), &rt).unwrap_err();
        match e.downcast_ref::<graph::Error>() {
            Some(graph::Error::MissingOutput { path, .. }) => {
                assert_eq!(path, &Some(dir.path().join("brain_mask.nii.gz")))
            }
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_stale_paths_cleared() -> Result<()> {
        let dir = tempdir()?;
        let rt = Runtime::new(Fs::new([dir.path()]));
        let stale = dir.path().join("dmri.bedpostX");
        fs::create_dir(&stale)?;
        fs::write(stale.join("old.nii.gz"), "old")?;
        let cmd = CommandTask::new("true", |_| Ok(Vec::new())).clear_before_run(stale.clone());
        let node = TaskNode::command("sub-01", "bedpost", cmd);
        execute(&job(node, Bindings::new(), dir.path()), &rt)?;
        assert!(!stale.exists());
        Ok(())
    }

    #[test]
    fn test_command_thread_hint_reaches_child() -> Result<()> {
        let dir = tempdir()?;
        let rt = Runtime::new(Fs::new([dir.path()]));
        let cmd = CommandTask::new("sh", |_| {
            Ok(vec!["-c".to_owned(), "echo $OMP_NUM_THREADS > threads.txt".to_owned()])
        })
        .output("threads", OutputFile::WorkDir("threads.txt".into()));
        let node = TaskNode::command("sub-01", "eddy", cmd)
            .hints(graph::ResourceHints::default().threads(4));
        let outputs = execute(&job(node, Bindings::new(), dir.path()), &rt)?;
        assert_eq!(fs::read_to_string(outputs.file("threads")?)?, "4\n");
        Ok(())
    }
}
