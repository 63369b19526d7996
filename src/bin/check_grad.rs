// ----------------------------------- CLI -----------------------------------
use clap::Parser;
use std::path::PathBuf;

use rtreg::bspline::{check_grad::CheckMode, Metric};
use rtreg::utils::{parse_pair, parse_triplet};

#[derive(clap::Parser, Debug, Clone)]
#[clap(name = "check_grad", about = "Compare the analytic B-spline score gradient with finite differences")]
pub struct Cli {
    /// Fixed image: MetaImage, or raw f32 with --dim
    pub fixed: PathBuf,

    /// Moving image: MetaImage, or raw f32 with --dim
    pub moving: PathBuf,

    /// Output table
    #[clap(short, long, default_value = "check_grad.txt")]
    pub out: PathBuf,

    /// fwd: one difference per coefficient; line: scores along the gradient
    #[clap(short, long, value_enum, default_value = "fwd")]
    pub mode: CheckMode,

    /// Coefficient perturbation (fwd) or gradient multiple per step (line)
    #[clap(short, long, default_value = "0.0001")]
    pub step: f64,

    #[clap(long, value_enum, default_value = "mse")]
    pub metric: Metric,

    /// Mutual information bins for the fixed and moving images
    #[clap(long, value_parser = parse_pair::<usize>, default_value = "20,20")]
    pub mi_bins: [usize; 2],

    /// Fixed voxels per B-spline region
    #[clap(short, long, value_parser = parse_triplet::<usize>, default_value = "15,15,15")]
    pub vox_per_rgn: [usize; 3],

    /// Start from these coefficients instead of the identity
    #[clap(long)]
    pub xf_in: Option<PathBuf>,

    /// Voxels per axis of raw images
    #[clap(long, value_parser = parse_triplet::<usize>)]
    pub dim: Option<[usize; 3]>,

    /// Centre of the first voxel of raw images, in mm
    #[clap(long, value_parser = parse_triplet::<f64>, default_value = "0,0,0")]
    pub offset: [f64; 3],

    /// Voxel size of raw images, in mm
    #[clap(long, value_parser = parse_triplet::<f64>, default_value = "1,1,1")]
    pub spacing: [f64; 3],
}

// --------------------------------------------------------------------------------

use std::error::Error;

use rtreg::bspline::{check_grad::check_gradient, xform_io, BsplineScore, BsplineXform, ScoreParms};
use rtreg::logging::setup_logging;
use rtreg::registration::RawGeometry;
use rtreg::utils::timing::Progress;
use rtreg::Volume;

fn main() -> Result<(), Box<dyn Error>> {
    let args = Cli::parse();
    let _logger = setup_logging("info")?;
    let mut progress = Progress::new();

    progress.start("Reading images");
    let geometry = args.dim.map(|dim| RawGeometry::from_mm(dim, args.offset, args.spacing));
    let fixed  = Volume::load(&args.fixed , geometry.as_ref())?;
    let moving = Volume::load(&args.moving, geometry.as_ref())?;
    progress.done();

    let bxf = match &args.xf_in {
        Some(path) => xform_io::load(path)?,
        None       => BsplineXform::covering(&fixed, args.vox_per_rgn)?,
    };
    let parms = ScoreParms { metric: args.metric, mi_bins: args.mi_bins, ..ScoreParms::default() };

    progress.start("Making gradient");
    let mut score = BsplineScore::new(&bxf, &fixed, &moving, parms)?;
    progress.done();

    progress.start(&format!("Checking {} coefficients", bxf.num_coeff()));
    let check = check_gradient(&mut score, &bxf.coeff, args.mode, args.step);
    progress.done();
    if let Some(worst) = check.max_discrepancy() {
        println!("largest discrepancy: {worst:.6}");
    }
    check.save(&args.out)?;
    Ok(())
}
