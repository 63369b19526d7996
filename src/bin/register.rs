// ----------------------------------- CLI -----------------------------------
use clap::Parser;
use std::path::PathBuf;

#[derive(clap::Parser, Debug, Clone)]
#[clap(name = "register", about = "Deformable B-spline registration driven by a command file")]
pub struct Cli {
    /// Registration command file (TOML)
    pub command_file: PathBuf,

    /// Log level or filter spec; RUST_LOG takes precedence
    #[clap(short, long, default_value = "info")]
    pub log_level: String,

    /// Write rotating log files in this directory [default: stderr only]
    #[clap(long)]
    pub log_dir: Option<PathBuf>,

    /// Maximum number of rayon threads [default: all cores]
    #[clap(short = 'j', long)]
    pub threads: Option<usize>,
}

// --------------------------------------------------------------------------------

use std::error::Error;

use rtreg::logging::{setup_file_logging, setup_logging};
use rtreg::registration::{self, RegistrationParms};
use rtreg::utils::{group_digits, timing::Progress};

fn main() -> Result<(), Box<dyn Error>> {
    let args = Cli::parse();
    let _logger = match &args.log_dir {
        Some(dir) => setup_file_logging(&args.log_level, dir)?,
        None      => setup_logging(&args.log_level)?,
    };
    if let Some(n) = args.threads {
        rayon::ThreadPoolBuilder::new().num_threads(n).build_global()?;
    }

    let mut progress = Progress::new();
    progress.start("Reading command file");
    let parms = RegistrationParms::load(&args.command_file)?;
    progress.done_with_message(&format!("{} stage(s)", parms.stages.len()));

    let reports = registration::run(&parms)?;
    for report in &reports {
        let name = report.paths.moving.as_ref().map_or("-".into(), |p| p.display().to_string());
        for (n, stage) in report.stages.iter().enumerate() {
            println!("{name}  stage {}: score {:.6} after {} iterations ({} evaluations){}",
                     n + 1, stage.score, stage.iterations, group_digits(stage.evaluations),
                     if stage.converged { ", converged" } else { "" });
        }
    }
    progress.done_with_message(&format!("Registered {} job(s)", reports.len()));
    Ok(())
}
