//! Convergence and fit summaries over monitored columns: R-hat, ESS, MCSE,
//! credible interval and conditional predictive ordinates.
//!
//! R-hat and ESS follow Vehtari et al. (2021) "Rank-normalization, folding,
//! and localization: An improved R-hat for assessing convergence of MCMC".

use statrs::function::erf::erfc_inv;
use statrs::statistics::Statistics;

/// Summary of one monitored column.
#[derive(Debug, Clone)]
pub struct ColumnDiagnostics {
    pub name: String,
    pub mean: f64,
    pub std: f64,
    pub q2_5: f64,
    pub q97_5: f64,
    pub ess_bulk: f64,
    pub ess_tail: f64,
    pub r_hat: f64,
    pub mcse_mean: f64,
}

/// Full diagnostic report for a sampling run.
#[derive(Debug, Clone)]
pub struct DiagnosticsReport {
    pub columns: Vec<ColumnDiagnostics>,
    pub num_chains: usize,
    pub num_draws: usize,
    pub accept_rates: Vec<f64>,
    /// Proposals that could not be evaluated, summed over chains.
    pub aborted: usize,
}

impl DiagnosticsReport {
    /// Render the diagnostics as a formatted table string.
    pub fn to_table(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!(
            "{} chains × {} draws per chain",
            self.num_chains, self.num_draws
        ));
        lines.push(String::new());
        lines.push(format!(
            "{:<12} {:>8} {:>8} {:>10} {:>10} {:>10} {:>10} {:>8} {:>10}",
            "Column", "mean", "std", "2.5%", "97.5%", "ess_bulk", "ess_tail", "r_hat", "mcse_mean"
        ));
        lines.push("─".repeat(96));

        for p in &self.columns {
            let ess_bulk_s = if p.ess_bulk.is_finite() {
                format!("{:.0}", p.ess_bulk)
            } else {
                "NaN".to_string()
            };
            let ess_tail_s = if p.ess_tail.is_finite() {
                format!("{:.0}", p.ess_tail)
            } else {
                "NaN".to_string()
            };
            lines.push(format!(
                "{:<12} {:>8.4} {:>8.4} {:>10.4} {:>10.4} {:>10} {:>10} {:>8.4} {:>10.6}",
                p.name, p.mean, p.std, p.q2_5, p.q97_5, ess_bulk_s, ess_tail_s, p.r_hat,
                p.mcse_mean,
            ));
        }

        lines.push("─".repeat(96));

        let avg_accept: f64 =
            self.accept_rates.iter().sum::<f64>() / self.accept_rates.len() as f64;
        lines.push(format!(
            "Mean accept rate: {:.2}  │  Aborted proposals: {}",
            avg_accept, self.aborted
        ));

        let any_bad_rhat = self.columns.iter().any(|p| p.r_hat > 1.05 || !p.r_hat.is_finite());
        let any_low_ess = self.columns.iter().any(|p| p.ess_bulk < 400.0 || p.ess_tail < 400.0);

        if any_bad_rhat {
            lines.push(
                "⚠  Some R-hat values > 1.05; chains may not have converged.".to_string(),
            );
        }
        if any_low_ess {
            lines.push(
                "⚠  Some ESS values < 400; consider more iterations or thinning less.".to_string(),
            );
        }

        lines.join("\n")
    }
}

/// Compute full diagnostics from samples[chain][draw][column].
pub fn compute_diagnostics(
    samples: &[Vec<Vec<f64>>],
    column_names: &[String],
    accept_rates: &[f64],
    aborted: usize,
) -> DiagnosticsReport {
    let n_chains = samples.len();
    let n_draws = samples.first().map_or(0, |c| c.len());
    let mut columns = Vec::with_capacity(column_names.len());

    for (pidx, name) in column_names.iter().enumerate() {
        let chains: Vec<Vec<f64>> = samples
            .iter()
            .map(|chain| chain.iter().map(|draw| draw[pidx]).collect())
            .collect();
        let all = sorted(chains.iter().flatten().copied().collect());
        let mean = all.iter().mean();
        let std = all.iter().std_dev();
        let ess_bulk = SplitChains::new(&normal_scores(&chains)).ess();
        let mcse_mean = if ess_bulk > 0.0 { std / ess_bulk.sqrt() } else { f64::NAN };

        columns.push(ColumnDiagnostics {
            name: name.clone(),
            mean,
            std,
            q2_5: quantile_sorted(&all, 0.025),
            q97_5: quantile_sorted(&all, 0.975),
            ess_bulk,
            ess_tail: ess_tail(&chains, &all),
            r_hat: SplitChains::new(&chains).r_hat(),
            mcse_mean,
        });
    }

    DiagnosticsReport {
        columns,
        num_chains: n_chains,
        num_draws: n_draws,
        accept_rates: accept_rates.to_vec(),
        aborted,
    }
}

/// Log conditional predictive ordinate of one observation from its
/// per-draw log-likelihoods: the log of the harmonic mean of the
/// likelihoods, computed in log space.
pub fn conditional_predictive_ordinate(ln_likelihoods: &[f64]) -> f64 {
    if ln_likelihoods.is_empty() {
        return f64::NAN;
    }
    let neg: Vec<f64> = ln_likelihoods.iter().map(|l| -l).collect();
    -(log_sum_exp(&neg) - (ln_likelihoods.len() as f64).ln())
}

fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

// ── split-chain estimators ──────────────────────────────────────────

/// Every chain cut in half, with the per-half means and the pooled
/// within-half variance W.
struct SplitChains {
    halves: Vec<Vec<f64>>,
    means: Vec<f64>,
    within: f64,
}

impl SplitChains {
    fn new(chains: &[Vec<f64>]) -> Self {
        let halves: Vec<Vec<f64>> = chains
            .iter()
            .flat_map(|c| {
                let (first, second) = c.split_at(c.len() / 2);
                [first.to_vec(), second.to_vec()]
            })
            .collect();
        let means: Vec<f64> = halves.iter().map(|h| h.iter().mean()).collect();
        let within = halves.iter().map(|h| h.iter().variance()).sum::<f64>() / halves.len() as f64;
        Self { halves, means, within }
    }

    fn num_halves(&self) -> f64 {
        self.halves.len() as f64
    }

    fn half_len(&self) -> usize {
        self.halves.first().map_or(0, |h| h.len())
    }

    /// Potential scale reduction from between- and within-half variance.
    fn r_hat(&self) -> f64 {
        if !(self.within > 1e-30) {
            return f64::NAN;
        }
        let n = self.half_len() as f64;
        let between_over_n = self.means.iter().variance();
        let var_hat = (n - 1.0) / n * self.within + between_over_n;
        (var_hat / self.within).sqrt()
    }

    /// Autocorrelation at `lag`, pooled over halves.
    fn autocorrelation(&self, lag: usize) -> f64 {
        let n = self.half_len();
        let gamma: f64 = self
            .halves
            .iter()
            .zip(&self.means)
            .map(|(h, &m)| (0..n - lag).map(|t| (h[t] - m) * (h[t + lag] - m)).sum::<f64>())
            .sum();
        let gamma = gamma / (self.num_halves() * (n as f64 - 1.0));
        1.0 - (self.within - gamma) / self.within
    }

    /// Effective sample size, truncating the autocorrelation sum at the
    /// first negative pair (Geyer's initial positive sequence).
    fn ess(&self) -> f64 {
        if !(self.within > 1e-30) {
            return f64::NAN;
        }
        let n = self.half_len();
        let total = self.num_halves() * n as f64;
        let mut tau = -1.0f64;
        let mut lag = 1;
        while lag + 1 < n {
            let pair = self.autocorrelation(lag) + self.autocorrelation(lag + 1);
            if pair < 0.0 {
                break;
            }
            tau += pair;
            lag += 2;
        }
        total / (1.0 + 2.0 * tau.max(1.0 / total))
    }
}

/// Tail ESS: the smaller ESS of the 5% and 95% exceedance indicators.
fn ess_tail(chains: &[Vec<f64>], all_sorted: &[f64]) -> f64 {
    let q05 = quantile_sorted(all_sorted, 0.05);
    let q95 = quantile_sorted(all_sorted, 0.95);
    let indicator = |hit: &dyn Fn(f64) -> bool| -> Vec<Vec<f64>> {
        chains
            .iter()
            .map(|c| c.iter().map(|&x| if hit(x) { 1.0 } else { 0.0 }).collect())
            .collect()
    };
    let lower = SplitChains::new(&indicator(&|x| x <= q05)).ess();
    let upper = SplitChains::new(&indicator(&|x| x >= q95)).ess();
    lower.min(upper)
}

/// Replace every draw by the standard normal quantile of its pooled rank,
/// ties sharing their average rank.
fn normal_scores(chains: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let mut order: Vec<(f64, usize, usize)> = chains
        .iter()
        .enumerate()
        .flat_map(|(ci, c)| c.iter().enumerate().map(move |(di, &v)| (v, ci, di)))
        .collect();
    order.sort_unstable_by(|a, b| a.0.total_cmp(&b.0));

    let total = order.len() as f64;
    let mut scores: Vec<Vec<f64>> = chains.iter().map(|c| vec![0.0; c.len()]).collect();
    let mut start = 0;
    while start < order.len() {
        let end = start + order[start..].iter().take_while(|e| e.0 == order[start].0).count();
        let rank = (start + end + 1) as f64 / 2.0;
        let z = std_normal_quantile((rank - 0.375) / (total + 0.25));
        for &(_, ci, di) in &order[start..end] {
            scores[ci][di] = z;
        }
        start = end;
    }
    scores
}

fn std_normal_quantile(p: f64) -> f64 {
    -std::f64::consts::SQRT_2 * erfc_inv(2.0 * p)
}

fn sorted(mut values: Vec<f64>) -> Vec<f64> {
    values.sort_unstable_by(f64::total_cmp);
    values
}

/// Linear interpolation between order statistics.
fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let idx = q * (sorted.len() - 1) as f64;
    let lo = idx.floor() as usize;
    let hi = idx.ceil() as usize;
    let frac = idx - lo as f64;
    sorted[lo] * (1.0 - frac) + sorted[hi] * frac
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, Normal};

    fn normal_chains(num_chains: usize, len: usize, offsets: &[f64]) -> Vec<Vec<f64>> {
        let mut rng = ChaCha8Rng::seed_from_u64(99);
        let n = Normal::new(0.0, 1.0).unwrap();
        (0..num_chains)
            .map(|c| (0..len).map(|_| n.sample(&mut rng) + offsets[c]).collect())
            .collect()
    }

    #[test]
    fn test_r_hat_converged() {
        let chains = normal_chains(4, 1000, &[0.0; 4]);
        let rh = SplitChains::new(&chains).r_hat();
        assert!(rh < 1.05, "R-hat should be near 1.0 for mixed chains, got {}", rh);
    }

    #[test]
    fn test_r_hat_diverged() {
        let chains = normal_chains(2, 500, &[0.0, 100.0]);
        let rh = SplitChains::new(&chains).r_hat();
        assert!(rh > 1.5, "R-hat should be large for separated chains, got {}", rh);
    }

    #[test]
    fn test_independent_draws_have_high_ess() {
        let chains = normal_chains(4, 500, &[0.0; 4]);
        let ess = SplitChains::new(&normal_scores(&chains)).ess();
        assert!(ess > 1000.0, "ESS of independent draws was {}", ess);
    }

    #[test]
    fn test_sticky_chain_has_low_ess() {
        // each value repeated ten times: roughly a tenth of the draws count
        let chains: Vec<Vec<f64>> = normal_chains(4, 100, &[0.0; 4])
            .into_iter()
            .map(|c| c.iter().flat_map(|&x| std::iter::repeat(x).take(10)).collect())
            .collect();
        let ess = SplitChains::new(&chains).ess();
        assert!(ess < 800.0, "ESS of repeated draws was {}", ess);
    }

    #[test]
    fn test_constant_column_has_undefined_r_hat() {
        let chains = vec![vec![1.0; 50], vec![1.0; 50]];
        assert!(SplitChains::new(&chains).r_hat().is_nan());
    }

    #[test]
    fn test_cpo_of_constant_likelihood() {
        let lcpo = conditional_predictive_ordinate(&[-1.5; 10]);
        assert!((lcpo + 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_cpo_is_dominated_by_worst_draw() {
        let lcpo = conditional_predictive_ordinate(&[0.0, -50.0]);
        assert!((lcpo - (-50.0 + 2f64.ln())).abs() < 1e-9, "got {}", lcpo);
    }

    #[test]
    fn test_report_lists_every_column() {
        let chains = normal_chains(2, 200, &[0.0, 0.0]);
        let samples: Vec<Vec<Vec<f64>>> = chains
            .iter()
            .map(|c| c.iter().map(|&x| vec![x, 2.0 * x]).collect())
            .collect();
        let names = vec!["x".to_string(), "y".to_string()];
        let report = compute_diagnostics(&samples, &names, &[0.4, 0.5], 3);
        assert_eq!(report.columns.len(), 2);
        assert!(report.to_table().contains("Aborted proposals: 3"));
    }
}
