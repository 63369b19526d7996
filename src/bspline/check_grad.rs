//! Compare the analytic gradient of a score with finite differences.

use std::io::Write;
use std::path::Path;

use serde::Deserialize;

use crate::error::Result;
use super::score::BsplineScore;

/// Number of steps taken along the gradient in `Line` mode
pub const LINE_STEPS: usize = 30;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CheckMode {
    /// One forward difference per coefficient
    #[default]
    Fwd,
    /// Scores at successive steps along the analytic gradient
    Line,
}

#[derive(Clone, Debug, PartialEq)]
pub enum GradCheck {
    /// `(analytic, finite difference)` for every coefficient
    Fwd(Vec<(f64, f64)>),
    /// Score at `coeff`, followed by the scores after 1, 2, ... steps
    Line(Vec<f64>),
}

/// Evaluate `score` around `coeff`. `step` is the coefficient perturbation
/// (mm) in `Fwd` mode, and the multiple of the gradient added at each step in
/// `Line` mode.
pub fn check_gradient(score: &mut BsplineScore, coeff: &[f64], mode: CheckMode, step: f64) -> GradCheck {
    let base = score.score_and_gradient(coeff);
    let mut x = coeff.to_vec();
    match mode {
        CheckMode::Fwd => {
            let mut rows = Vec::with_capacity(coeff.len());
            for i in 0..coeff.len() {
                x[i] = coeff[i] + step;
                let stepped = score.score_and_gradient(&x).score;
                x[i] = coeff[i];
                rows.push((base.grad[i], (stepped - base.score) / step));
            }
            GradCheck::Fwd(rows)
        },
        CheckMode::Line => {
            let mut scores = vec![base.score];
            for n in 1..=LINE_STEPS {
                let alpha = step * n as f64;
                x.iter_mut().zip(coeff).zip(&base.grad).for_each(|((x, c), g)| *x = c + alpha * g);
                scores.push(score.score_and_gradient(&x).score);
            }
            GradCheck::Line(scores)
        },
    }
}

impl GradCheck {
    /// Largest `|analytic - finite difference|` in `Fwd` mode
    pub fn max_discrepancy(&self) -> Option<f64> {
        match self {
            Self::Fwd(rows) => Some(rows.iter().map(|(a, f)| (a - f).abs()).fold(0.0, f64::max)),
            Self::Line(_) => None,
        }
    }

    /// Fixed-width text columns, one row per coefficient or step
    pub fn write(&self, mut out: impl Write) -> std::io::Result<()> {
        match self {
            Self::Fwd(rows)    => for (a, f) in rows { writeln!(out, "{a:10.5} {f:10.5}")? },
            Self::Line(scores) => for s in scores    { writeln!(out, "{s:10.5}")? },
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let mut buf = std::io::BufWriter::new(file);
        self.write(&mut buf)?;
        buf.flush()?;
        Ok(())
    }
}
