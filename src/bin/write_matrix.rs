// ----------------------------------- CLI -----------------------------------
use clap::Parser;
use std::path::PathBuf;

use rtreg::utils::{parse_pair, parse_triplet};

#[derive(clap::Parser, Debug, Clone)]
#[clap(name = "write_matrix", about = "Write projection matrices for a circular gantry")]
pub struct Cli {
    /// Number of equally spaced angles
    #[clap(short = 'a', long, default_value = "1")]
    pub num_angles: usize,

    /// Difference between neighbouring angles, in degrees [default: 360 / num-angles]
    #[clap(short = 'A', long)]
    pub angle_diff: Option<f64>,

    /// File with one angle (degrees) per line; overrides -a and -A
    #[clap(short = 'P', long)]
    pub angle_file: Option<PathBuf>,

    /// Imager resolution in pixels
    #[clap(short = 'r', long, value_parser = parse_pair::<usize>, default_value = "384,512")]
    pub resolution: [usize; 2],

    /// Physical size of the imager, in mm
    #[clap(short = 'z', long, value_parser = parse_pair::<f64>, default_value = "300,400")]
    pub imager_size: [f64; 2],

    /// Source-axis and source-imager distances, in mm
    #[clap(short = 'g', long, value_parser = parse_pair::<f64>, default_value = "1000,1500")]
    pub geometry: [f64; 2],

    /// Image centre in pixels [default: centre of the imager]
    #[clap(short = 'c', long, value_parser = parse_pair::<f64>)]
    pub image_center: Option<[f64; 2]>,

    /// Isocenter position, in mm
    #[clap(short = 'o', long, value_parser = parse_triplet::<f64>, default_value = "0,0,0")]
    pub isocenter: [f64; 3],

    /// Output files are <prefix><angle number>.txt
    #[clap(short = 'O', long, default_value = "out_")]
    pub prefix: String,
}

// --------------------------------------------------------------------------------

use std::error::Error;

use rtreg::proj_matrix::{angle_series, gantry_projection, read_angles};
use rtreg::Point;

fn main() -> Result<(), Box<dyn Error>> {
    let args = Cli::parse();
    let angles = match &args.angle_file {
        Some(path) => read_angles(path)?,
        None       => angle_series(args.num_angles, args.angle_diff.map(f64::to_radians)),
    };
    let [nr, nc] = args.resolution;
    let ic = args.image_center.unwrap_or([(nr as f64 - 1.0) / 2.0, (nc as f64 - 1.0) / 2.0]);
    let ps = [args.imager_size[0] / nr as f64, args.imager_size[1] / nc as f64];
    let [sad, sid] = args.geometry;
    let isocenter = Point::from(args.isocenter);

    for (n, &angle) in angles.iter().enumerate() {
        let pmat = gantry_projection(angle, isocenter, sad, sid, ic, ps);
        let path = PathBuf::from(format!("{}{n:04}.txt", args.prefix));
        pmat.save(&path)?;
    }
    println!("Wrote {} projection matrices", angles.len());
    Ok(())
}
