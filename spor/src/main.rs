// vim: tw=80
use std::{num::NonZeroUsize, path::PathBuf, process::exit};

use clap::{crate_version, Parser};
use spor_core::{
    recorder::{ResultRecorder, Verdict},
    scenario::{Harness, Scenario},
    Result,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;

use crate::config::Config;

#[derive(Parser, Clone, Debug)]
/// List the available scenarios
struct List {}

impl List {
    fn main(self) {
        for scenario in Scenario::ALL {
            println!("{:<14}{}", scenario.name(), scenario.description());
        }
    }
}

#[derive(Parser, Clone, Debug)]
/// Crash the storage service under load and verify what it acknowledged
struct Run {
    /// Directory for result artifacts
    #[clap(short, long)]
    result_dir: Option<PathBuf>,
    /// Only run the last offset and size combination of each scenario
    #[clap(short, long)]
    quick:      bool,
    /// Number of concurrent writers in the multi-thread scenario
    #[clap(short, long)]
    threads:    Option<NonZeroUsize>,
    /// Scenarios to run.  Runs all of them if none are given.
    scenarios:  Vec<Scenario>,
}

impl Run {
    /// Returns true if every scenario passed
    fn main(self, mut config: Config) -> Result<bool> {
        if let Some(dir) = self.result_dir {
            config.result_dir = dir;
        }
        config.quick |= self.quick;
        if let Some(threads) = self.threads {
            config.threads = threads.get();
        }
        info!(kind = ?config.target, result_dir = %config.result_dir.display(),
              "starting run");
        let harness = Harness::new(config.backend()?, config.topology()?,
                                   config.settings()?,
                                   ResultRecorder::new(&config.result_dir))?;
        let scenarios = if self.scenarios.is_empty() {
            Scenario::ALL.to_vec()
        } else {
            self.scenarios
        };
        let mut passed = true;
        for scenario in scenarios {
            let verdict = harness.run(scenario)?;
            println!("{scenario}: {verdict}");
            passed &= verdict == Verdict::Pass;
        }
        Ok(passed)
    }
}

#[derive(Parser, Clone, Debug)]
enum SubCommand {
    List(List),
    Run(Run),
}

#[derive(Parser, Clone, Debug)]
#[clap(version = crate_version!())]
struct Cli {
    /// Path to the YAML configuration file.  Without one, spor tests its
    /// built-in simulator.
    #[clap(short, long)]
    config: Option<PathBuf>,
    #[clap(subcommand)]
    cmd:    SubCommand,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli: Cli = Cli::parse();
    let config = match cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    match cli.cmd {
        SubCommand::List(list) => list.main(),
        SubCommand::Run(run) => {
            if !run.main(config)? {
                exit(1);
            }
        }
    }
    Ok(())
}
