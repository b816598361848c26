//! CMA-ES (Covariance Matrix Adaptation Evolution Strategy).
//!
//! Canonical full-covariance update after Hansen's purecma. Used by the
//! tuning sampler over a handful of hyperparameters, so the dimension is
//! always small and the covariance is kept as a dense matrix.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use super::env::seeded_rng;

type Matrix = Vec<Vec<f64>>;

fn identity(n: usize) -> Matrix {
    (0..n)
        .map(|i| {
            let mut row = vec![0.0; n];
            row[i] = 1.0;
            row
        })
        .collect()
}

/// Jacobi eigendecomposition of a symmetric matrix.
/// Returns (eigenvalues, eigenvectors as columns).
fn symmetric_eigen(a: &[Vec<f64>]) -> (Vec<f64>, Matrix) {
    let n = a.len();
    let mut m = a.to_vec();
    let mut v = identity(n);

    for _ in 0..100 * n * n {
        let (mut p, mut q, mut off) = (0, 1, 0.0f64);
        for i in 0..n {
            for j in (i + 1)..n {
                if m[i][j].abs() > off {
                    off = m[i][j].abs();
                    p = i;
                    q = j;
                }
            }
        }
        if off < 1e-12 {
            break;
        }

        let theta = if (m[p][p] - m[q][q]).abs() < 1e-30 {
            std::f64::consts::FRAC_PI_4
        } else {
            0.5 * (2.0 * m[p][q] / (m[p][p] - m[q][q])).atan()
        };
        let (s, c) = theta.sin_cos();

        let (mpp, mqq, mpq) = (m[p][p], m[q][q], m[p][q]);
        for i in 0..n {
            if i != p && i != q {
                let (mip, miq) = (m[i][p], m[i][q]);
                m[i][p] = c * mip + s * miq;
                m[p][i] = m[i][p];
                m[i][q] = -s * mip + c * miq;
                m[q][i] = m[i][q];
            }
        }
        m[p][p] = c * c * mpp + 2.0 * s * c * mpq + s * s * mqq;
        m[q][q] = s * s * mpp - 2.0 * s * c * mpq + c * c * mqq;
        m[p][q] = 0.0;
        m[q][p] = 0.0;

        for row in v.iter_mut() {
            let (vip, viq) = (row[p], row[q]);
            row[p] = c * vip + s * viq;
            row[q] = -s * vip + c * viq;
        }
    }

    let eigenvalues = (0..n).map(|i| m[i][i].max(1e-20)).collect();
    (eigenvalues, v)
}

/// Ask/tell CMA-ES. Fitness is maximized.
pub struct CmaEs {
    pub n: usize,
    pub sigma: f64,
    pub mean: Vec<f64>,
    pub pop_size: usize,
    pub gen: usize,

    cov: Matrix,
    eigenvalues: Vec<f64>,
    /// Columns are eigenvectors: `eigenvectors[row][col]`.
    eigenvectors: Matrix,
    eigen_eval_count: usize,
    lazy_gap_evals: f64,

    ps: Vec<f64>,
    pc: Vec<f64>,

    mu: usize,
    weights: Vec<f64>,
    mu_eff: f64,
    cs: f64,
    ds: f64,
    cc: f64,
    c1: f64,
    cmu: f64,
    chi_n: f64,
    rng: ChaCha8Rng,
}

impl CmaEs {
    pub fn new(mean: Vec<f64>, sigma0: f64, pop_size: Option<usize>, seed: u64) -> Self {
        let n = mean.len();
        let nf = n as f64;
        let lam = pop_size.unwrap_or(4 + (3.0 * nf.ln()) as usize).max(2);
        let mu = lam / 2;

        let raw_w: Vec<f64> = (0..mu).map(|i| (mu as f64 + 0.5).ln() - ((i + 1) as f64).ln()).collect();
        let sum_w: f64 = raw_w.iter().sum();
        let weights: Vec<f64> = raw_w.iter().map(|w| w / sum_w).collect();
        let mu_eff = 1.0 / weights.iter().map(|w| w * w).sum::<f64>();

        let cs = (mu_eff + 2.0) / (nf + mu_eff + 5.0);
        let ds = 2.0 * mu_eff / lam as f64 + 0.3 + cs;
        let cc = (4.0 + mu_eff / nf) / (nf + 4.0 + 2.0 * mu_eff / nf);
        let c1 = 2.0 / ((nf + 1.3).powi(2) + mu_eff);
        let cmu = (2.0 * (mu_eff - 2.0 + 1.0 / mu_eff) / ((nf + 2.0).powi(2) + mu_eff)).min(1.0 - c1);
        let chi_n = nf.sqrt() * (1.0 - 1.0 / (4.0 * nf) + 1.0 / (21.0 * nf * nf));
        let lazy_gap_evals = 0.5 * nf * lam as f64 * (c1 + cmu).recip() / (nf * nf);

        CmaEs {
            n,
            sigma: sigma0,
            mean,
            pop_size: lam,
            gen: 0,
            cov: identity(n),
            eigenvalues: vec![1.0; n],
            eigenvectors: identity(n),
            eigen_eval_count: 0,
            lazy_gap_evals,
            ps: vec![0.0; n],
            pc: vec![0.0; n],
            mu,
            weights,
            mu_eff,
            cs,
            ds,
            cc,
            c1,
            cmu,
            chi_n,
            rng: seeded_rng(seed),
        }
    }

    fn update_eigensystem(&mut self) {
        let evals_since = (self.gen * self.pop_size) as f64 - self.eigen_eval_count as f64;
        if evals_since < self.lazy_gap_evals && self.gen > 0 {
            return;
        }
        let (eigenvalues, eigenvectors) = symmetric_eigen(&self.cov);
        self.eigenvalues = eigenvalues;
        self.eigenvectors = eigenvectors;
        self.eigen_eval_count = self.gen * self.pop_size;
    }

    /// C^(-1/2) v = B D^(-1) B^T v
    fn c_invsqrt_mul(&self, v: &[f64]) -> Vec<f64> {
        let n = self.n;
        let z: Vec<f64> = (0..n)
            .map(|j| {
                let s: f64 = (0..n).map(|i| self.eigenvectors[i][j] * v[i]).sum();
                s / self.eigenvalues[j].sqrt().max(1e-20)
            })
            .collect();
        (0..n).map(|i| (0..n).map(|j| self.eigenvectors[i][j] * z[j]).sum()).collect()
    }

    /// Sample one generation: x = mean + sigma * B D z.
    pub fn ask(&mut self) -> Vec<Vec<f64>> {
        self.update_eigensystem();
        let n = self.n;
        (0..self.pop_size)
            .map(|_| {
                let z: Vec<f64> = (0..n).map(|_| self.rng.sample(StandardNormal)).collect();
                let mut y = vec![0.0; n];
                for i in 0..n {
                    let dz = self.eigenvalues[i].sqrt() * z[i];
                    for (j, yj) in y.iter_mut().enumerate() {
                        *yj += self.eigenvectors[j][i] * dz;
                    }
                }
                (0..n).map(|i| self.mean[i] + self.sigma * y[i]).collect()
            })
            .collect()
    }

    /// Update the distribution from one full generation. Higher fitness is better.
    pub fn tell(&mut self, candidates: &[Vec<f64>], fitnesses: &[f64]) {
        assert_eq!(candidates.len(), self.pop_size);
        assert_eq!(fitnesses.len(), self.pop_size);
        let n = self.n;

        let mut order: Vec<usize> = (0..self.pop_size).collect();
        order.sort_by(|&a, &b| fitnesses[b].total_cmp(&fitnesses[a]));

        let old_mean = self.mean.clone();
        for i in 0..n {
            self.mean[i] = (0..self.mu).map(|k| self.weights[k] * candidates[order[k]][i]).sum();
        }
        let y: Vec<f64> = (0..n).map(|i| self.mean[i] - old_mean[i]).collect();

        let z = self.c_invsqrt_mul(&y);
        let csn = (self.cs * (2.0 - self.cs) * self.mu_eff).sqrt() / self.sigma;
        for i in 0..n {
            self.ps[i] = (1.0 - self.cs) * self.ps[i] + csn * z[i];
        }

        let ps_norm_sq: f64 = self.ps.iter().map(|p| p * p).sum();
        let gen_factor = 1.0 - (1.0 - self.cs).powi(2 * (self.gen as i32 + 1));
        let hsig = if ps_norm_sq / n as f64 / gen_factor < 2.0 + 4.0 / (n as f64 + 1.0) { 1.0 } else { 0.0 };

        let ccn = (self.cc * (2.0 - self.cc) * self.mu_eff).sqrt() / self.sigma;
        for i in 0..n {
            self.pc[i] = (1.0 - self.cc) * self.pc[i] + ccn * hsig * y[i];
        }

        let c1a = self.c1 * (1.0 - (1.0 - hsig * hsig) * self.cc * (2.0 - self.cc));
        let old_weight = 1.0 - c1a - self.cmu * self.weights.iter().sum::<f64>();
        let steps: Vec<Vec<f64>> = (0..self.mu)
            .map(|k| (0..n).map(|i| (candidates[order[k]][i] - old_mean[i]) / self.sigma).collect())
            .collect();

        for i in 0..n {
            for j in 0..=i {
                let rank_mu: f64 = (0..self.mu).map(|k| self.weights[k] * steps[k][i] * steps[k][j]).sum();
                let cij = old_weight * self.cov[i][j] + self.c1 * self.pc[i] * self.pc[j] + self.cmu * rank_mu;
                self.cov[i][j] = cij;
                self.cov[j][i] = cij;
            }
        }

        let cn = self.cs / self.ds;
        self.sigma *= (cn * (ps_norm_sq.sqrt() / self.chi_n - 1.0)).min(1.0).exp();
        self.sigma = self.sigma.clamp(1e-20, 1e10);
        self.gen += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neg_sphere(x: &[f64], center: f64) -> f64 {
        -x.iter().map(|v| (v - center).powi(2)).sum::<f64>()
    }

    #[test]
    fn test_cma_sphere() {
        let mut cma = CmaEs::new(vec![0.0; 5], 1.0, None, 0);
        for _ in 0..200 {
            let pop = cma.ask();
            let fitnesses: Vec<f64> = pop.iter().map(|x| neg_sphere(x, 0.3)).collect();
            cma.tell(&pop, &fitnesses);
        }
        let dist: f64 = cma.mean.iter().map(|v| (v - 0.3).powi(2)).sum::<f64>().sqrt();
        assert!(dist < 0.01, "CMA-ES should converge on sphere, got dist={:.4}", dist);
    }

    #[test]
    fn test_cma_pop_size() {
        let cma = CmaEs::new(vec![0.5; 6], 0.2, None, 0);
        assert_eq!(cma.pop_size, 4 + (3.0 * 6.0_f64.ln()) as usize);
        let one_d = CmaEs::new(vec![0.5], 0.2, None, 0);
        assert!(one_d.pop_size >= 2);
    }

    #[test]
    fn test_cma_seeded() {
        let mut a = CmaEs::new(vec![0.5; 3], 0.2, None, 9);
        let mut b = CmaEs::new(vec![0.5; 3], 0.2, None, 9);
        assert_eq!(a.ask(), b.ask());
    }

    #[test]
    fn test_eigen_diagonalizes() {
        let a = vec![vec![2.0, 1.0], vec![1.0, 2.0]];
        let (mut vals, _) = symmetric_eigen(&a);
        vals.sort_by(f64::total_cmp);
        assert!((vals[0] - 1.0).abs() < 1e-9);
        assert!((vals[1] - 3.0).abs() < 1e-9);
    }
}
