use indicatif::{ProgressBar, ProgressStyle};

// ----------------------------------- CLI -----------------------------------
use clap::Parser;
use std::path::PathBuf;

use rtreg::utils::parse_triplet;

#[derive(clap::Parser, Debug, Clone)]
#[clap(name = "proton_dose", about = "Dose deposited in a CT by a proton pencil beam")]
pub struct Cli {
    /// CT volume: MetaImage, or raw f32 with --dim
    pub ct: PathBuf,

    /// Dose parameter file (TOML)
    #[clap(short, long)]
    pub config: PathBuf,

    /// Dose output: MetaImage for `.mha`, raw f32 otherwise
    #[clap(short, long, default_value = "dose.mha")]
    pub out: PathBuf,

    /// Also write the radiological path length volume
    #[clap(long)]
    pub rpl_out: Option<PathBuf>,

    /// Voxels per axis of a raw CT
    #[clap(long, value_parser = parse_triplet::<usize>)]
    pub dim: Option<[usize; 3]>,

    /// Centre of the first voxel of a raw CT, in mm
    #[clap(long, value_parser = parse_triplet::<f64>, default_value = "0,0,0")]
    pub offset: [f64; 3],

    /// Voxel size of a raw CT, in mm
    #[clap(long, value_parser = parse_triplet::<f64>, default_value = "1,1,1")]
    pub spacing: [f64; 3],

    /// Log level or filter spec; RUST_LOG takes precedence
    #[clap(short, long, default_value = "info")]
    pub log_level: String,
}

// --------------------------------------------------------------------------------

use std::error::Error;

use rtreg::config::dose::DoseParms;
use rtreg::diagnostics::LogSink;
use rtreg::dose::compute_dose_with_progress;
use rtreg::logging::setup_logging;
use rtreg::registration::RawGeometry;
use rtreg::utils::timing::Progress;
use rtreg::Volume;

fn main() -> Result<(), Box<dyn Error>> {
    let args = Cli::parse();
    let _logger = setup_logging(&args.log_level)?;
    let mut timer = Progress::new();

    timer.start("Reading CT");
    let geometry = args.dim.map(|dim| RawGeometry::from_mm(dim, args.offset, args.spacing));
    let ct = Volume::load(&args.ct, geometry.as_ref())?;
    let parms = DoseParms::load(&args.config)?;
    timer.done();

    // --- Progress bar --------------------------------------------------------------
    let progress = ProgressBar::new(ct.dim[2] as u64).with_message("CT slices");
    progress.set_style(ProgressStyle::default_bar()
                       .template("{msg}\n[{elapsed_precise}] {wide_bar} {pos}/{len} ({eta_precise})")?
    );
    progress.tick();
    let outcome = compute_dose_with_progress(&ct, &parms, &LogSink, &progress)?;
    progress.finish_with_message("Dose computed");

    timer.start(&format!("Writing {}", args.out.display()));
    outcome.dose.save(&args.out)?;
    if let Some(path) = &args.rpl_out {
        outcome.rpl.vol.save(path)?;
    }
    timer.done();
    Ok(())
}
