//! Minimizers for the registration score.
//!
//! Only steepest descent is implemented natively. The other optimizer names
//! a command file may use are recognised, but requesting them is an error:
//! there is no silent fallback to a different algorithm.

use serde::Deserialize;

use crate::bspline::{BsplineScore, ScoreResult};
use crate::error::{Error, Result};
use crate::utils::group_digits;

/// Something whose value and gradient can be evaluated at a point
pub trait Objective {
    fn evaluate(&mut self, x: &[f64]) -> ScoreResult;
}

impl Objective for BsplineScore<'_> {
    fn evaluate(&mut self, x: &[f64]) -> ScoreResult { self.score_and_gradient(x) }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OptimizeReport {
    pub score: f64,
    pub iterations: usize,
    /// Objective evaluations, including rejected steps
    pub evaluations: usize,
    pub converged: bool,
}

pub trait Optimizer: Send + Sync {
    /// Improve `x` in place
    fn minimize(&self, objective: &mut dyn Objective, x: &mut [f64]) -> OptimizeReport;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    None,
    Amoeba,
    Oneplusone,
    Frpr,
    Demons,
    Lbfgs,
    Lbfgsb,
    Liblbfgs,
    Nocedal,
    Rsg,
    #[default]
    Steepest,
    Versor,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SteepestDescent {
    pub max_its: usize,
    pub min_its: usize,
    /// Initial step length (mm)
    pub learn_rate: f64,
    pub max_step: f64,
    pub min_step: f64,
    /// Stop when the relative score improvement falls below this
    pub convergence_tol: f64,
    /// Stop when the gradient norm falls below this
    pub grad_tol: f64,
}

impl Default for SteepestDescent {
    fn default() -> Self {
        Self {
            max_its: 50,
            min_its: 2,
            learn_rate: 1.0,
            max_step: 10.0,
            min_step: 1e-3,
            convergence_tol: 1e-5,
            grad_tol: 1e-5,
        }
    }
}

impl Optimizer for SteepestDescent {
    fn minimize(&self, objective: &mut dyn Objective, x: &mut [f64]) -> OptimizeReport {
        let mut current = objective.evaluate(x);
        let mut evaluations = 1;
        let mut step = self.learn_rate.min(self.max_step);
        let mut trial = x.to_vec();
        let mut converged = false;
        let mut its = 0;

        while its < self.max_its {
            let norm = current.grad_norm();
            if norm <= self.grad_tol && its >= self.min_its {
                log::info!("gradient norm {norm:.3e} below tolerance");
                converged = true;
                break;
            }
            if norm == 0.0 { break }

            trial.iter_mut().zip(x.iter()).zip(&current.grad)
                .for_each(|((t, x), g)| *t = x - step * g / norm);
            let candidate = objective.evaluate(&trial);
            evaluations += 1;

            if candidate.score < current.score {
                its += 1;
                let gain = (current.score - candidate.score) / current.score.abs().max(f64::MIN_POSITIVE);
                x.copy_from_slice(&trial);
                current = candidate;
                log::info!("it {its:>3} score {:12.6} step {step:.4} nvox {}",
                           current.score, group_digits(current.num_vox));
                step = (step * 2.0).min(self.max_step);
                if gain < self.convergence_tol && its >= self.min_its {
                    converged = true;
                    break;
                }
            } else {
                step *= 0.5;
                log::debug!("rejected step, reducing to {step:.4}");
                if step < self.min_step {
                    converged = its >= self.min_its;
                    break;
                }
            }
        }
        OptimizeReport { score: current.score, iterations: its, evaluations, converged }
    }
}

/// Configured optimizer, or `Error::Unsupported` for algorithms which are
/// not implemented natively.
pub fn optimizer(kind: OptimizerKind, settings: SteepestDescent) -> Result<Box<dyn Optimizer>> {
    match kind {
        OptimizerKind::Steepest => Ok(Box::new(settings)),
        other => Err(Error::Unsupported { what: "optimizer", name: format!("{other:?}").to_lowercase() }),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use float_eq::assert_float_eq;
    use rstest::rstest;

    /// `Σ (xᵢ - i)²`
    struct Bowl { evaluations: usize }

    impl Objective for Bowl {
        fn evaluate(&mut self, x: &[f64]) -> ScoreResult {
            self.evaluations += 1;
            let score = x.iter().enumerate().map(|(i, x)| (x - i as f64).powi(2)).sum();
            let grad = x.iter().enumerate().map(|(i, x)| 2.0 * (x - i as f64)).collect();
            ScoreResult { score, smetric: score, rmetric: 0.0, grad, num_vox: x.len() }
        }
    }

    #[test]
    fn steepest_descent_finds_the_bottom() {
        let settings = SteepestDescent { max_its: 200, min_step: 1e-8, convergence_tol: 0.0, ..SteepestDescent::default() };
        let mut bowl = Bowl { evaluations: 0 };
        let mut x = vec![0.0; 4];
        let report = settings.minimize(&mut bowl, &mut x);
        assert_float_eq!(x, vec![0.0, 1.0, 2.0, 3.0], abs_all <= 1e-3);
        assert!(report.score < 1e-6);
        assert_eq!(report.evaluations, bowl.evaluations);
    }

    #[test]
    fn iteration_limit_is_honoured() {
        let settings = SteepestDescent { max_its: 3, learn_rate: 0.01, convergence_tol: 0.0, ..SteepestDescent::default() };
        let mut x = vec![0.0; 4];
        let report = settings.minimize(&mut Bowl { evaluations: 0 }, &mut x);
        assert_eq!(report.iterations, 3);
        assert!(!report.converged);
    }

    #[test]
    fn starting_at_the_minimum_stops_immediately() {
        let mut x = vec![0.0, 1.0, 2.0];
        let report = SteepestDescent::default().minimize(&mut Bowl { evaluations: 0 }, &mut x);
        assert_eq!(report.iterations, 0);
        assert_eq!(x, vec![0.0, 1.0, 2.0]);
    }

    #[rstest(/**/ kind,
             case(OptimizerKind::Lbfgsb),
             case(OptimizerKind::Amoeba),
             case(OptimizerKind::Demons),
             case(OptimizerKind::None),
    )]
    fn unsupported_optimizers_are_rejected(kind: OptimizerKind) {
        assert!(matches!(optimizer(kind, SteepestDescent::default()), Err(Error::Unsupported { what: "optimizer", .. })));
    }

    #[test]
    fn steepest_is_available() {
        assert!(optimizer(OptimizerKind::Steepest, SteepestDescent::default()).is_ok());
    }

    #[test]
    fn default_optimizer_is_available() {
        assert_eq!(OptimizerKind::default(), OptimizerKind::Steepest);
        assert!(optimizer(OptimizerKind::default(), SteepestDescent::default()).is_ok());
    }
}
