use std::ffi::OsString;

use clap::Parser;

use crate::fs::Retention;
use crate::pipeline::Recon;

const CMD_NAME: &str = "tractflow";
const DEFAULT_WORKDIR: &str = "workdir";
const DEFAULT_OUTPUT: &str = "output";
const DEFAULT_PLUGIN: &str = "local";

/// Stores our command-line args format.
#[derive(Parser, Debug)]
#[command(name = CMD_NAME, version, about = "Process BIDS diffusion data with eddy, TRACULA and DIPY", long_about = None)]
pub struct Args {
    /// BIDS dataset directory
    #[arg(short = 'd', value_name = "DIR")]
    pub datadir: String,

    /// Specific subjects to run (with or without the sub- prefix)
    #[arg(short, long, value_name = "SUBJECT", num_args = 1..)]
    pub subjects: Vec<String>,

    /// Session ID (ses-[input])
    #[arg(long = "ss", visible_alias = "session", value_name = "SESSION")]
    pub session: Option<String>,

    /// Directory where the tracula_config template is located [default: current dir]
    #[arg(short = 'c', value_name = "DIR")]
    pub config: Option<String>,

    /// Working directory
    #[arg(short = 'w', value_name = "DIR", default_value = DEFAULT_WORKDIR)]
    #[arg(env = "TRACTFLOW_WORKDIR")]
    pub workdir: String,

    /// Directory where tracula will write [default: DATASET/derivatives/diffusion]
    #[arg(short = 't', value_name = "DIR")]
    pub tracdir: Option<String>,

    /// Output directory
    #[arg(short = 'o', value_name = "DIR", default_value = DEFAULT_OUTPUT)]
    #[arg(env = "TRACTFLOW_OUTPUT")]
    pub outdir: String,

    /// Execution backend: local or slurm
    #[arg(short = 'p', value_name = "PLUGIN", default_value = DEFAULT_PLUGIN)]
    pub plugin: String,

    /// Backend arguments, e.g. "n_procs=8, sbatch_args='-p normal'"
    #[arg(long = "plugin_args", value_name = "ARGS")]
    pub plugin_args: Option<String>,

    /// Keep every working directory and log everything
    #[arg(long)]
    pub debug: bool,

    /// Reconstruction model
    #[arg(long, value_enum, default_value_t = Recon::Csd)]
    pub recon: Recon,

    /// Threads for the reconstruction steps
    #[arg(long, value_name = "N", default_value_t = 4)]
    pub threads: usize,

    /// Highest b-value counted as a b0 volume
    #[arg(long, value_name = "B", default_value_t = 10.0)]
    pub b0_threshold: f64,

    /// Per-node time limit in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// When to keep node working directories
    #[arg(long, value_enum, default_value_t = Retention::OnFailure)]
    pub retain: Retention,

    /// Print additional info (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    /// Parse the process's command line.
    pub fn from_env() -> Self {
        Self::parse_from(long_session(std::env::args_os()))
    }
}

/// Rewrite the single-dash `-ss SESSION` form to `--ss`, which clap can parse.
pub fn long_session<I, T>(argv: I) -> impl Iterator<Item = OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    argv.into_iter().map(|arg| {
        let arg: OsString = arg.into();
        match arg.to_str() {
            Some(s) if s == "-ss" || s.starts_with("-ss=") => OsString::from(format!("-{s}")),
            _ => arg,
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_flags() -> anyhow::Result<()> {
        let args = Args::try_parse_from([
            "tractflow", "-d", "/data", "-s", "01", "02", "--ss", "pre", "-p", "SLURM",
            "--recon", "csa", "--retain", "never", "-vv",
        ])?;
        assert_eq!(args.datadir, "/data");
        assert_eq!(args.subjects, vec!["01", "02"]);
        assert_eq!(args.session.as_deref(), Some("pre"));
        assert_eq!(args.plugin, "SLURM");
        assert_eq!(args.recon, Recon::Csa);
        assert_eq!(args.retain, Retention::Never);
        assert_eq!(args.verbose, 2);
        assert_eq!(args.b0_threshold, 10.0);
        Ok(())
    }

    #[test]
    fn test_session_alias() -> anyhow::Result<()> {
        let args = Args::try_parse_from(["tractflow", "-d", "/data", "--session", "post"])?;
        assert_eq!(args.session.as_deref(), Some("post"));
        assert!(Args::try_parse_from(["tractflow"]).is_err());
        Ok(())
    }

    #[test]
    fn test_single_dash_session() -> anyhow::Result<()> {
        let args = Args::try_parse_from(long_session(["tractflow", "-d", "/data", "-ss", "pre"]))?;
        assert_eq!(args.session.as_deref(), Some("pre"));
        assert!(args.subjects.is_empty());

        let args = Args::try_parse_from(long_session(["tractflow", "-d", "/data", "-ss=post", "-s", "01"]))?;
        assert_eq!(args.session.as_deref(), Some("post"));
        assert_eq!(args.subjects, vec!["01"]);
        Ok(())
    }
}
