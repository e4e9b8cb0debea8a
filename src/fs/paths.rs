use std::path::{Path, PathBuf};

/// $WORKDIR/subject/step
pub fn node_dir(work_root: &Path, subject: &str, step: &str) -> PathBuf {
    parts3(work_root, subject, step)
}

/// $WORKDIR/subject
pub fn subject_work_dir(work_root: &Path, subject: &str) -> PathBuf {
    parts2(work_root, subject)
}

/// $OUTDIR/subject/container (container may be empty for the subject root)
pub fn publish_dir(out_root: &Path, subject: &str, container: &str) -> PathBuf {
    let mut buf = parts2(out_root, subject);
    if !container.is_empty() {
        buf.push(container);
    }
    buf
}

/// node_dir/stdout.txt
pub fn stdout(node_dir: &Path) -> PathBuf {
    parts2(node_dir, "stdout.txt")
}

/// node_dir/stderr.txt
pub fn stderr(node_dir: &Path) -> PathBuf {
    parts2(node_dir, "stderr.txt")
}

/// node_dir/command.sh
pub fn command_sh(node_dir: &Path) -> PathBuf {
    parts2(node_dir, "command.sh")
}

/// node_dir/exit_code
pub fn exit_code(node_dir: &Path) -> PathBuf {
    parts2(node_dir, "exit_code")
}

fn parts2<T, U>(p1: T, p2: U) -> PathBuf
where
    T: AsRef<Path>,
    U: AsRef<Path>,
{
    let mut buf = PathBuf::with_capacity(256);
    buf.push(p1);
    buf.push(p2);
    buf
}

fn parts3<T, U, V>(p1: T, p2: U, p3: V) -> PathBuf
where
    T: AsRef<Path>,
    U: AsRef<Path>,
    V: AsRef<Path>,
{
    let mut buf = parts2(p1, p2);
    buf.push(p3);
    buf
}
