//! Safety-margin governor.
//!
//! While the dynamic worker runs ahead of contact detection, bodies keep
//! moving; every geometry is therefore inflated by a margin `β` during
//! binning and the per-bin overlap test, sized so that no contact can form
//! undetected between broad-phase rounds:
//! `β = max_velocity · dt · drift_budget · safety_multiplier`.
//!
//! In adaptive mode the governor also retunes the bin size every few rounds
//! toward a target geometries-per-bin average, within user-bounded rates of
//! change.

use crate::error::DemError;

/// User-facing adaptive tuning policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptivePolicy {
    /// Re-tune every this many broad-phase rounds.
    pub every_rounds: u64,
    /// Target average geometries per populated bin.
    pub target_geometries_per_bin: f64,
    /// Largest relative bin-size change per retune (e.g. `0.05` = ±5%).
    pub max_change_rate: f64,
    /// Smallest relative bin-size change worth applying.
    pub min_change_rate: f64,
    /// Smallest drift bound the governor may adapt down to. `0` leaves the
    /// drift bound alone.
    pub min_max_drift: u64,
}

impl Default for AdaptivePolicy {
    fn default() -> Self {
        Self {
            every_rounds: 10,
            target_geometries_per_bin: 4.0,
            max_change_rate: 0.05,
            min_change_rate: 0.005,
            min_max_drift: 0,
        }
    }
}

/// Outcome of one adaptive retune.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Retune {
    /// Replacement bin size, when a change is worthwhile.
    pub bin_size: Option<f64>,
    /// Replacement drift bound. Only ever at or below the configured
    /// update frequency: the safety margin was sized for that lag, so the
    /// governor may trade drift away for binning pressure but never extend
    /// it.
    pub max_drift: Option<u64>,
}

/// The margin governor: expansion factor plus the adaptive cadence.
#[derive(Debug, Clone)]
pub struct MarginGovernor {
    /// Current margin `β` applied to every bounding radius.
    beta: f64,
    /// Whether the user pinned `β` explicitly (disables derivation).
    user_fixed: bool,
    /// Over-expansion multiplier on the derived margin.
    safety_multiplier: f64,
    /// Adaptive policy, when enabled.
    adaptive: Option<AdaptivePolicy>,
    rounds_since_tune: u64,
}

impl MarginGovernor {
    /// A governor with no margin (lockstep-safe only).
    #[must_use]
    pub fn new() -> Self {
        Self {
            beta: 0.0,
            user_fixed: false,
            safety_multiplier: 1.0,
            adaptive: None,
            rounds_since_tune: 0,
        }
    }

    /// Pins the margin to an explicit value.
    pub fn set_expand_factor(&mut self, beta: f64) {
        self.beta = beta;
        self.user_fixed = true;
    }

    /// Sets the over-expansion multiplier applied to derived margins.
    pub fn set_safety_multiplier(&mut self, m: f64) {
        self.safety_multiplier = m;
    }

    /// Derives the margin from the expected maximum velocity and the time
    /// contact detection may lag behind (`dt × drift budget`).
    pub fn suggest(&mut self, max_velocity: f64, max_time_per_cd: f64) {
        if !self.user_fixed {
            self.beta = max_velocity * max_time_per_cd * self.safety_multiplier;
        }
    }

    /// Derivation from max velocity alone; needs the step size and update
    /// frequency to already be configured.
    pub fn suggest_from_velocity(
        &mut self,
        max_velocity: f64,
        dt: f64,
        update_freq: u64,
    ) -> Result<(), DemError> {
        if dt <= 0.0 {
            return Err(DemError::config(
                "set the constant time step size before suggesting an expand factor from \
                 velocity alone, or supply the maximum time per contact detection explicitly",
            ));
        }
        if update_freq == 0 {
            return Err(DemError::config(
                "set the contact-detection update frequency before suggesting an expand factor \
                 from velocity alone, or supply the maximum time per contact detection explicitly",
            ));
        }
        self.suggest(max_velocity, dt * update_freq as f64);
        Ok(())
    }

    /// Enables adaptive bin-size tuning.
    pub fn set_adaptive(&mut self, policy: AdaptivePolicy) {
        self.adaptive = Some(policy);
    }

    /// The current margin.
    #[must_use]
    pub fn beta(&self) -> f64 {
        self.beta
    }

    /// Called once per broad-phase round with the observed average
    /// geometries per populated bin; returns the retune when one is due
    /// and worthwhile.
    pub fn maybe_retune(
        &mut self,
        current_bin_size: f64,
        current_max_drift: u64,
        configured_max_drift: u64,
        avg_geometries_per_bin: f64,
    ) -> Option<Retune> {
        let policy = self.adaptive?;
        self.rounds_since_tune += 1;
        if self.rounds_since_tune < policy.every_rounds {
            return None;
        }
        self.rounds_since_tune = 0;
        if avg_geometries_per_bin <= 0.0 {
            return None;
        }
        let mut retune = Retune::default();

        // Bin population scales with bin volume; move a third of the way in
        // log-space toward the target, clamped by the allowed rate.
        let ratio = (policy.target_geometries_per_bin / avg_geometries_per_bin).cbrt();
        let step = ratio.clamp(1.0 - policy.max_change_rate, 1.0 + policy.max_change_rate);
        if (step - 1.0).abs() >= policy.min_change_rate {
            retune.bin_size = Some(current_bin_size * step);
        }

        // Persistent over-occupancy with the bin step already clamped:
        // trade drift away (smaller lag, smaller inflated radii). Relaxed
        // occupancy lets the drift bound recover toward its configured
        // value.
        if policy.min_max_drift > 0 {
            let over = avg_geometries_per_bin > 2.0 * policy.target_geometries_per_bin;
            let under = avg_geometries_per_bin < policy.target_geometries_per_bin;
            if over && current_max_drift > policy.min_max_drift {
                retune.max_drift = Some(current_max_drift - 1);
            } else if under && current_max_drift < configured_max_drift {
                retune.max_drift = Some(current_max_drift + 1);
            }
        }

        if retune == Retune::default() {
            None
        } else {
            Some(retune)
        }
    }
}

impl Default for MarginGovernor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn derived_margin_is_velocity_times_lag() {
        let mut g = MarginGovernor::new();
        g.set_safety_multiplier(1.2);
        g.suggest(2.0, 0.01);
        assert_relative_eq!(g.beta(), 0.024, epsilon = 1e-12);
    }

    #[test]
    fn explicit_margin_wins_over_derivation() {
        let mut g = MarginGovernor::new();
        g.set_expand_factor(0.5);
        g.suggest(2.0, 0.01);
        assert_relative_eq!(g.beta(), 0.5);
    }

    #[test]
    fn suggestion_from_velocity_needs_dt_and_freq() {
        let mut g = MarginGovernor::new();
        assert!(g.suggest_from_velocity(1.0, 0.0, 5).is_err());
        assert!(g.suggest_from_velocity(1.0, 1e-5, 0).is_err());
        g.suggest_from_velocity(1.0, 1e-5, 5).unwrap();
        assert_relative_eq!(g.beta(), 5e-5, epsilon = 1e-15);
    }

    #[test]
    fn adaptive_retune_is_rate_bounded() {
        let mut g = MarginGovernor::new();
        g.set_adaptive(AdaptivePolicy {
            every_rounds: 1,
            target_geometries_per_bin: 4.0,
            max_change_rate: 0.05,
            min_change_rate: 0.001,
            min_max_drift: 0,
        });
        // Far too many geometries per bin: shrink, but no more than 5%.
        let new = g.maybe_retune(1.0, 8, 8, 100.0).unwrap().bin_size.unwrap();
        assert_relative_eq!(new, 0.95, epsilon = 1e-12);
        // Already on target: no change.
        assert!(g.maybe_retune(1.0, 8, 8, 4.0).is_none());
    }

    #[test]
    fn retune_honors_cadence() {
        let mut g = MarginGovernor::new();
        g.set_adaptive(AdaptivePolicy {
            every_rounds: 3,
            ..Default::default()
        });
        assert!(g.maybe_retune(1.0, 8, 8, 100.0).is_none());
        assert!(g.maybe_retune(1.0, 8, 8, 100.0).is_none());
        assert!(g.maybe_retune(1.0, 8, 8, 100.0).is_some());
    }

    #[test]
    fn drift_adapts_down_under_pressure_and_recovers() {
        let mut g = MarginGovernor::new();
        g.set_adaptive(AdaptivePolicy {
            every_rounds: 1,
            target_geometries_per_bin: 4.0,
            min_max_drift: 2,
            ..Default::default()
        });
        // Heavy occupancy: one step down.
        let r = g.maybe_retune(1.0, 8, 8, 20.0).unwrap();
        assert_eq!(r.max_drift, Some(7));
        // Light occupancy: recover toward the configured bound, never past.
        let r = g.maybe_retune(1.0, 7, 8, 1.0).unwrap();
        assert_eq!(r.max_drift, Some(8));
        assert!(g.maybe_retune(1.0, 8, 8, 1.0).map_or(true, |r| r.max_drift.is_none()));
    }
}
