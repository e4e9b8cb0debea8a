use std::fs::File;
use std::io::{stderr, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use colored::Colorize;

use util::Timer;

use crate::fs::{paths, Fs};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How a subprocess ended.
#[derive(Debug)]
pub enum CmdEnd {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

/// Run a subprocess, storing stdout and stderr in `log_dir`.
/// The child is killed if it outlives `timeout` or if `cancel` is raised.
/// Based on:
/// <https://stackoverflow.com/questions/66060139/how-to-tee-stdout-stderr-from-a-subprocess-in-rust>
pub fn run_cmd(
    cmd: &mut Command,
    log_dir: &Path,
    fs: &Fs,
    timeout: Option<Duration>,
    cancel: &AtomicBool,
    echo: bool,
) -> Result<CmdEnd> {
    let out_file = fs
        .create_file(paths::stdout(log_dir))
        .context("creating stdout.txt file")?;
    let err_file = fs
        .create_file(paths::stderr(log_dir))
        .context("creating stderr.txt file")?;

    let mut child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| {
            format!(
                "failed to execute child process {:?} {:?}",
                cmd.get_program(),
                cmd.get_args().collect::<Vec<_>>(),
            )
        })?;

    let child_out = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("Cannot attach to child stdout"))?;
    let child_err = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("Cannot attach to child stderr"))?;

    let thread_out = thread::spawn(move || communicate(child_out, out_file, echo));
    let thread_err = thread::spawn(move || communicate(child_err, err_file, echo));

    let end = wait_or_kill(&mut child, timeout, cancel)?;

    thread_out
        .join()
        .map_err(|_| anyhow!("Error joining stdout thread"))?
        .context("communicating with child stdout")?;
    thread_err
        .join()
        .map_err(|_| anyhow!("Error joining stderr thread"))?
        .context("communicating with child stderr")?;

    if echo {
        if let CmdEnd::Exited(status) = &end {
            eprintln!("\n{} with {status}.", "Process finished".green());
        }
    }
    Ok(end)
}

fn wait_or_kill(child: &mut Child, timeout: Option<Duration>, cancel: &AtomicBool) -> Result<CmdEnd> {
    let timer = Timer::now();
    loop {
        if let Some(status) = child.try_wait().context("waiting on child process")? {
            return Ok(CmdEnd::Exited(status));
        }
        let end = if cancel.load(Ordering::Relaxed) {
            CmdEnd::Cancelled
        } else if timeout.is_some_and(|limit| timer.exceeded(limit)) {
            CmdEnd::TimedOut
        } else {
            thread::sleep(POLL_INTERVAL);
            continue;
        };
        // the child may have exited in the meantime; either way, reap it:
        if let Err(e) = child.kill() {
            log::debug!("kill failed: {e}");
        }
        child.wait().context("reaping killed child process")?;
        return Ok(end);
    }
}

fn communicate<R: Read>(mut stream: R, mut file: File, echo: bool) -> std::io::Result<()> {
    let mut buf = [0u8; 1024];
    let mut output = stderr();
    loop {
        let num_read = stream.read(&mut buf)?;
        if num_read == 0 {
            break;
        }

        let buf = &buf[..num_read];
        file.write_all(buf)?;
        if echo {
            output.write_all(buf)?;
        }
    }

    Ok(())
}
