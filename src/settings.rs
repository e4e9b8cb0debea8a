use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::args::Args;
use crate::fs::Retention;
use crate::pipeline::PipelineOptions;

const TRACULA_CONFIG: &str = "tracula_config";
const DEFAULT_POLL_SECS: u64 = 10;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Unknown plugin \"{0}\" (expected local or slurm)")]
    UnknownPlugin(String),
    #[error("Unknown plugin argument \"{0}\" (expected n_procs, max_jobs, poll_interval, or sbatch_args)")]
    UnknownPluginArg(String),
    #[error("Invalid value {value:?} for plugin argument \"{key}\"")]
    InvalidPluginArg { key: String, value: String },
    #[error("Dataset directory {0:?} does not exist")]
    NoDataset(PathBuf),
}

/// Which execution backend to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plugin {
    Local,
    Slurm,
}

impl std::str::FromStr for Plugin {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "local" | "MultiProc" => Ok(Self::Local),
            "slurm" | "SLURM" => Ok(Self::Slurm),
            other => Err(Error::UnknownPlugin(other.to_owned())),
        }
    }
}

/// Backend tuning from `--plugin_args`. Unset values get backend defaults.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PluginArgs {
    pub n_procs: Option<usize>,
    pub max_jobs: Option<usize>,
    pub poll_interval: Option<Duration>,
    pub sbatch_args: Vec<String>,
}

impl PluginArgs {
    pub fn parse(text: &str) -> Result<Self> {
        let mut out = Self::default();
        for (key, value) in template::parse_plugin_args(text)? {
            let invalid = || Error::InvalidPluginArg {
                key: key.to_owned(),
                value: value.to_owned(),
            };
            match key {
                "n_procs" => out.n_procs = Some(value.parse().map_err(|_| invalid())?),
                "max_jobs" => out.max_jobs = Some(value.parse().map_err(|_| invalid())?),
                "poll_interval" => {
                    let secs: f64 = value.parse().map_err(|_| invalid())?;
                    if !(secs.is_finite() && secs > 0.0) {
                        return Err(invalid().into());
                    }
                    out.poll_interval = Some(Duration::from_secs_f64(secs));
                }
                "sbatch_args" => {
                    out.sbatch_args = value.split_whitespace().map(str::to_owned).collect();
                }
                other => return Err(Error::UnknownPluginArg(other.to_owned()).into()),
            }
        }
        Ok(out)
    }

    /// Local worker count: `n_procs`, or the machine's available parallelism.
    pub fn n_procs(&self) -> usize {
        self.n_procs.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
            .unwrap_or(Duration::from_secs(DEFAULT_POLL_SECS))
    }
}

/// Settings are like Args, except all the logic has
/// been applied so e.g. defaults are added in and paths are absolute.
#[derive(Debug)]
pub struct Settings {
    pub datadir: PathBuf,
    pub subjects: Vec<String>,
    pub session: Option<String>,
    pub config_dir: PathBuf,
    pub workdir: PathBuf,
    pub tracdir: PathBuf,
    pub outdir: PathBuf,
    pub plugin: Plugin,
    pub plugin_args: PluginArgs,
    pub pipeline: PipelineOptions,
    pub timeout: Option<Duration>,
    pub retention: Retention,
    pub debug: bool,
    pub verbose: u8,
}

impl Settings {
    /// Path of the TRACULA config template.
    pub fn tracula_config(&self) -> PathBuf {
        self.config_dir.join(TRACULA_CONFIG)
    }

    pub fn log_level(&self) -> log::LevelFilter {
        if self.debug {
            return log::LevelFilter::Trace;
        }
        match self.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

fn absolute(cwd: &Path, path: &str) -> PathBuf {
    cwd.join(path)
}

impl TryFrom<Args> for Settings {
    type Error = anyhow::Error;
    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let cwd = std::env::current_dir().context("while reading current directory")?;

        let datadir = absolute(&cwd, &args.datadir);
        if !datadir.is_dir() {
            return Err(Error::NoDataset(datadir).into());
        }
        let config_dir = args
            .config
            .as_deref()
            .map(|c| absolute(&cwd, c))
            .unwrap_or_else(|| cwd.clone());
        let tracdir = args
            .tracdir
            .as_deref()
            .map(|t| absolute(&cwd, t))
            .unwrap_or_else(|| datadir.join("derivatives").join("diffusion"));

        let plugin_args = match &args.plugin_args {
            Some(text) => PluginArgs::parse(text)
                .with_context(|| format!("while parsing --plugin_args {text:?}"))?,
            None => PluginArgs::default(),
        };

        // debug mode keeps everything around for inspection:
        let retention = if args.debug {
            Retention::Always
        } else {
            args.retain
        };

        Ok(Self {
            subjects: args.subjects,
            session: args.session,
            workdir: absolute(&cwd, &args.workdir),
            outdir: absolute(&cwd, &args.outdir),
            plugin: args.plugin.parse()?,
            pipeline: PipelineOptions {
                recon: args.recon,
                threads: args.threads.max(1),
                b0_threshold: args.b0_threshold,
            },
            timeout: args.timeout.map(Duration::from_secs),
            debug: args.debug,
            verbose: args.verbose,
            datadir,
            config_dir,
            tracdir,
            plugin_args,
            retention,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::Parser;
    use tempfile::tempdir;

    #[test]
    fn test_plugin_args() -> Result<()> {
        let args = PluginArgs::parse("n_procs=8, sbatch_args='--mem=4G -p normal', poll_interval=0.5")?;
        assert_eq!(args.n_procs, Some(8));
        assert_eq!(args.n_procs(), 8);
        assert_eq!(args.sbatch_args, vec!["--mem=4G", "-p", "normal"]);
        assert_eq!(args.poll_interval(), Duration::from_millis(500));
        assert_eq!(PluginArgs::default().poll_interval(), Duration::from_secs(10));

        let e = PluginArgs::parse("overwrite=True").unwrap_err();
        assert!(matches!(e.downcast_ref::<Error>(), Some(Error::UnknownPluginArg(k)) if k == "overwrite"));
        assert!(PluginArgs::parse("n_procs=many").is_err());
        Ok(())
    }

    #[test]
    fn test_plugin_aliases() -> Result<()> {
        assert_eq!("MultiProc".parse::<Plugin>()?, Plugin::Local);
        assert_eq!("SLURM".parse::<Plugin>()?, Plugin::Slurm);
        assert!("SGE".parse::<Plugin>().is_err());
        Ok(())
    }

    #[test]
    fn test_defaults() -> Result<()> {
        let dir = tempdir()?;
        let data = dir.path().to_str().ok_or_else(|| anyhow::anyhow!("non-utf8 tempdir"))?;
        let args = Args::try_parse_from(["tractflow", "-d", data, "--debug", "-w", "/tmp/w", "-o", "/tmp/o"])?;
        let settings = Settings::try_from(args)?;
        assert_eq!(settings.tracdir, dir.path().join("derivatives/diffusion"));
        assert_eq!(settings.workdir, PathBuf::from("/tmp/w"));
        assert_eq!(settings.plugin, Plugin::Local);
        assert_eq!(settings.retention, Retention::Always);
        assert_eq!(settings.log_level(), log::LevelFilter::Trace);
        assert!(settings.tracula_config().ends_with("tracula_config"));
        Ok(())
    }

    #[test]
    fn test_missing_dataset() -> Result<()> {
        let args = Args::try_parse_from(["tractflow", "-d", "/no/such/dataset"])?;
        assert!(Settings::try_from(args).is_err());
        Ok(())
    }
}
