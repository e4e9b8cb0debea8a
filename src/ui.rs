use colored::Colorize;

use util::Timer;

/// All progress output meant for the user goes through this struct.
/// Diagnostics go through `log` instead.
pub struct Ui {
    /// -v setting, displays extra text info to user
    pub verbose: bool,
    /// keeps track of total run time
    timer: Timer,
}

impl Ui {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            timer: Timer::now(),
        }
    }

    pub fn start_timer(&mut self) {
        self.timer.reset();
    }

    pub fn print_elapsed(&self, what: &str) {
        if self.verbose {
            self.timer.print_elapsed(what);
        }
    }

    pub fn verbose_msg(&self, msg: &str) {
        if self.verbose {
            eprintln!("{}", msg);
        }
    }

    pub fn run(&self, node: &str, work_dir: &std::path::Path) {
        eprintln!("{} {node}", "RUN".green());
        if self.verbose {
            eprintln!("    in {}", work_dir.display());
        }
    }

    pub fn completed(&self, node: &str) {
        eprintln!("{} {node}", "COMPLETED".green());
    }

    pub fn failed(&self, node: &str, e: &anyhow::Error) {
        eprintln!("{} {node}: {e}", "FAILED".red());
    }

    pub fn skipped(&self, nodes: &[String], because: &str) {
        if nodes.is_empty() {
            return;
        }
        eprintln!(
            "{} {} ({because})",
            "SKIPPED".yellow(),
            nodes.join(", ")
        );
    }
}
