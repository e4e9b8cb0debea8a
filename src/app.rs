use anyhow::{Context, Result};

use graph::Graph;

use crate::exec::{Backend, Executor, LocalBackend, RunReport, Runtime, Slurm, SlurmBackend, SlurmOptions};
use crate::fs::{Fs, ResultSink, WorkDirs};
use crate::pipeline;
use crate::prep::{self, SubjectContext};
use crate::settings::{Plugin, Settings};
use crate::ui::Ui;

/// Default bound on Slurm jobs queued or running at once.
const DEFAULT_MAX_JOBS: usize = 64;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("TRACULA config template {0:?} does not exist")]
    NoTraculaConfig(std::path::PathBuf),
    #[error("No subjects to process")]
    NoSubjects,
}

/// This struct actually runs the command-line app.
pub struct App {
    /// Interpreted command line settings
    settings: Settings,
    /// Filesystem interface
    fs: Fs,
    /// User interface
    ui: Ui,
}

impl App {
    /// Create a new `App`.
    pub fn new(settings: Settings) -> Self {
        let fs = Fs::new([&settings.workdir, &settings.tracdir, &settings.outdir]);
        let ui = Ui::new(settings.verbose > 0);
        Self { settings, fs, ui }
    }

    /// Discover subjects, build the meta-graph, and run it.
    /// Returns true if every node completed.
    pub fn run(mut self) -> Result<bool> {
        let tracula_config = self.settings.tracula_config();
        if !self.fs.exists(&tracula_config) {
            return Err(Error::NoTraculaConfig(tracula_config).into());
        }
        self.ui.verbose_msg(&format!("Using working directory {:?}", self.settings.workdir));
        self.ui.verbose_msg(&format!("Using output directory {:?}", self.settings.outdir));
        self.fs.ensure_dir_exists(&self.settings.workdir, self.ui.verbose)?;
        self.fs.ensure_dir_exists(&self.settings.outdir, self.ui.verbose)?;

        let contexts = self.discover()?;
        for dir in pipeline::tool_output_dirs(&contexts) {
            self.fs.create_dir(&dir)?;
        }

        let sink = ResultSink::new(&self.settings.outdir, self.fs.clone());
        let graph = self.build_graph(&contexts, &sink)?;

        let work_dirs = WorkDirs::new(&self.settings.workdir, self.fs.clone(), self.settings.retention);
        let report = self.execute(&graph, work_dirs)?;
        report.print();
        Ok(report.success())
    }

    fn discover(&mut self) -> Result<Vec<SubjectContext>> {
        self.ui.start_timer();
        let found = prep::discover(
            &self.fs,
            &self.settings.datadir,
            &self.settings.subjects,
            self.settings.session.as_deref(),
        )?;
        if found.is_empty() {
            return Err(Error::NoSubjects.into());
        }
        let subjects: Vec<&str> = found.iter().map(|acq| acq.subject.as_str()).collect();
        self.ui.verbose_msg(&format!("Subjects: {}", subjects.join(", ")));
        self.ui.print_elapsed("Discovering subjects");

        let tracula_config = self.settings.tracula_config();
        Ok(found
            .into_iter()
            .map(|acq| {
                SubjectContext::new(acq, &tracula_config, &self.settings.tracdir, &self.settings.outdir)
            })
            .collect())
    }

    fn build_graph(&mut self, contexts: &[SubjectContext], sink: &ResultSink) -> Result<Graph> {
        self.ui.start_timer();
        let graph = pipeline::build_meta_graph(contexts, &self.settings.pipeline, &self.fs, sink)
            .context("while building pipeline graph")?;
        log::info!("built graph of {} nodes for {} subjects", graph.len(), contexts.len());
        self.ui.print_elapsed("Building graph");
        Ok(graph)
    }

    fn execute(self, graph: &Graph, work_dirs: WorkDirs) -> Result<RunReport> {
        let mut rt = Runtime::new(self.fs.clone());
        rt.timeout = self.settings.timeout;
        rt.echo = self.settings.debug || self.settings.verbose > 1;
        let cancel = rt.cancel.clone();

        let plugin_args = &self.settings.plugin_args;
        let backend: Box<dyn Backend> = match self.settings.plugin {
            Plugin::Local => Box::new(LocalBackend::new(plugin_args.n_procs(), rt)?),
            Plugin::Slurm => {
                let opts = SlurmOptions {
                    max_jobs: plugin_args.max_jobs.unwrap_or(DEFAULT_MAX_JOBS),
                    n_procs: plugin_args.n_procs(),
                    poll_interval: plugin_args.poll_interval(),
                    sbatch_args: plugin_args.sbatch_args.clone(),
                };
                Box::new(SlurmBackend::new(Slurm, opts, rt)?)
            }
        };

        let mut executor = Executor::new(backend, work_dirs, cancel, self.ui);
        executor.run(graph)
    }
}
