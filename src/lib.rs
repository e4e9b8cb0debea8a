/// High-level command line app
mod app;
/// Definition of command-line args
mod args;
/// Graph execution
mod exec;
/// Filesystem operations
mod fs;
/// The per-subject diffusion pipeline
mod pipeline;
/// Find subjects and their acquisition parameters
mod prep;
/// Interpreted command-line settings
mod settings;
/// Text UI
mod ui;

// exported for tests:
pub use app::App;
pub use args::Args;
pub use exec::{
    Backend, Captured, Error as ExecError, Executor, Finished, Job, JobStatus, LocalBackend,
    NodeReport, QueueClient, RunReport, Runtime, SlurmBackend, SlurmOptions, ThreadEnvGuard,
};
pub use fs::{Fs, ResultSink, Retention, WorkDirs};
pub use pipeline::{build_meta_graph, build_subject_graph, steps, PipelineOptions, Recon};
pub use prep::{discover, Acquisition, SubjectContext};
pub use settings::{PluginArgs, Settings};
pub use ui::Ui;

/// Run the command-line app. Returns true if every node completed.
pub fn run() -> Result<bool, anyhow::Error> {
    let args = Args::from_env();

    // INTERPRET SETTINGS ///////////////
    let settings: Settings = args.try_into()?;
    simple_logging::log_to_stderr(settings.log_level());

    // RUN THE THING /////////////////
    let app = App::new(settings);
    app.run()
}
