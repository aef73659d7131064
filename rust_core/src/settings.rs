/// Numeric and protocol settings shared by moves and distributions.
///
/// There is no process-wide instance; each chain carries its own copy.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Tolerance used when comparing floating point quantities.
    pub tolerance: f64,
    /// After every rejection, check that the restored log-posterior matches
    /// the value before the proposal.
    pub verify_restore: bool,
    /// Upper bound for proposal tuning parameters.
    pub max_tuning_parameter: f64,
    /// Target acceptance rate for kernels constructed without an explicit one.
    pub default_target_acceptance: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tolerance: 1e-9,
            verify_restore: cfg!(debug_assertions),
            max_tuning_parameter: 10_000.0,
            default_target_acceptance: 0.44,
        }
    }
}

impl Settings {
    /// True when `a` and `b` agree within `tolerance` (relative for large magnitudes).
    /// Equal infinities compare equal.
    pub fn approx_eq(&self, a: f64, b: f64) -> bool {
        if a == b {
            return true;
        }
        if !a.is_finite() || !b.is_finite() {
            return false;
        }
        let scale = a.abs().max(b.abs()).max(1.0);
        (a - b).abs() <= self.tolerance * scale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approx_eq_handles_infinities() {
        let s = Settings::default();
        assert!(s.approx_eq(f64::NEG_INFINITY, f64::NEG_INFINITY));
        assert!(!s.approx_eq(f64::NEG_INFINITY, -1e300));
        assert!(s.approx_eq(1e6, 1e6 + 1e-4));
        assert!(!s.approx_eq(1.0, 1.001));
    }
}
