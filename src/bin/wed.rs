// ----------------------------------- CLI -----------------------------------
use clap::Parser;
use std::path::PathBuf;

use rtreg::utils::parse_triplet;

#[derive(clap::Parser, Debug, Clone)]
#[clap(name = "wed", about = "Resample a CT into water-equivalent depth along a proton beam")]
pub struct Cli {
    /// CT volume: MetaImage, or raw f32 with --dim
    pub ct: PathBuf,

    /// Beam and aperture parameters (the dose parameter file)
    #[clap(short, long)]
    pub config: PathBuf,

    /// Water-equivalent CT output
    #[clap(short, long, default_value = "wed.mha")]
    pub out: PathBuf,

    /// Dose volume on the grid of the CT to resample as well
    #[clap(long, requires = "dose_out")]
    pub dose: Option<PathBuf>,

    /// Output for the resampled dose
    #[clap(long)]
    pub dose_out: Option<PathBuf>,

    /// Also write the radiological path length volume
    #[clap(long)]
    pub rpl_out: Option<PathBuf>,

    /// Voxels per axis of raw inputs
    #[clap(long, value_parser = parse_triplet::<usize>)]
    pub dim: Option<[usize; 3]>,

    /// Centre of the first voxel of raw inputs, in mm
    #[clap(long, value_parser = parse_triplet::<f64>, default_value = "0,0,0")]
    pub offset: [f64; 3],

    /// Voxel size of raw inputs, in mm
    #[clap(long, value_parser = parse_triplet::<f64>, default_value = "1,1,1")]
    pub spacing: [f64; 3],

    /// Log level or filter spec; RUST_LOG takes precedence
    #[clap(short, long, default_value = "info")]
    pub log_level: String,
}

// --------------------------------------------------------------------------------

use std::error::Error;

use rtreg::config::dose::DoseParms;
use rtreg::logging::setup_logging;
use rtreg::registration::RawGeometry;
use rtreg::rpl::{BeamGeometry, RplVolume};
use rtreg::utils::timing::Progress;
use rtreg::Volume;

fn main() -> Result<(), Box<dyn Error>> {
    let args = Cli::parse();
    let _logger = setup_logging(&args.log_level)?;
    let mut progress = Progress::new();

    progress.start("Reading inputs");
    let geometry = args.dim.map(|dim| RawGeometry::from_mm(dim, args.offset, args.spacing));
    let ct = Volume::load(&args.ct, geometry.as_ref())?;
    let parms = DoseParms::load(&args.config)?;
    progress.done();

    progress.start("Tracing rays");
    let beam = BeamGeometry::new(parms.source, parms.isocenter, &parms.aperture)?;
    let rpl = RplVolume::compute(&ct, beam, parms.ray_step, parms.ct_units)?;
    progress.done_with_message(&format!("{} x {} rays, {} steps", rpl.vol.dim[0], rpl.vol.dim[1], rpl.steps()));

    progress.start(&format!("Writing {}", args.out.display()));
    rpl.compute_wed_volume(&ct)?.save(&args.out)?;
    progress.done();

    if let (Some(dose_path), Some(out)) = (&args.dose, &args.dose_out) {
        progress.start(&format!("Resampling {}", dose_path.display()));
        let dose = Volume::load(dose_path, geometry.as_ref())?;
        rpl.compute_wed_volume(&dose)?.save(out)?;
        progress.done();
    }
    if let Some(path) = &args.rpl_out {
        rpl.vol.save(path)?;
    }
    Ok(())
}
