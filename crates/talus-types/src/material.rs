//! Surface material properties and the deduplicating material table.

use serde::{Deserialize, Serialize};

/// Tolerance under which two material property values compare equal.
///
/// The table is a set of materials under this equivalence: loading a
/// material that matches an existing entry within tolerance returns the
/// existing index instead of growing the table.
pub const MATERIAL_EQ_TOL: f64 = 1e-9;

/// Surface material properties used by the contact force models.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Material {
    /// Young's modulus `[Pa]`.
    pub e: f64,
    /// Poisson ratio.
    pub nu: f64,
    /// Coefficient of restitution. Physical range is `(0, 1]`; values
    /// outside it are accepted with a warning.
    pub cor: f64,
    /// Sliding friction coefficient (Coulomb).
    pub mu: f64,
    /// Rolling resistance coefficient.
    pub crr: f64,
    /// Density `[kg/m³]`, used only by samplers and mass bookkeeping.
    pub density: Option<f64>,
}

impl Material {
    /// A frictional material from the five contact properties.
    #[must_use]
    pub fn new(e: f64, nu: f64, cor: f64, mu: f64, crr: f64) -> Self {
        Self {
            e,
            nu,
            cor,
            mu,
            crr,
            density: None,
        }
    }

    /// A material with friction and rolling resistance left at the
    /// conventional defaults (μ = 0.5, Crr = 0).
    #[must_use]
    pub fn frictionless_defaults(e: f64, nu: f64, cor: f64) -> Self {
        Self::new(e, nu, cor, 0.5, 0.0)
    }

    /// Whether all scalar properties of `self` and `other` agree within
    /// [`MATERIAL_EQ_TOL`].
    #[must_use]
    pub fn equivalent(&self, other: &Self) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= MATERIAL_EQ_TOL;
        close(self.e, other.e)
            && close(self.nu, other.nu)
            && close(self.cor, other.cor)
            && close(self.mu, other.mu)
            && close(self.crr, other.crr)
            && match (self.density, other.density) {
                (None, None) => true,
                (Some(a), Some(b)) => close(a, b),
                _ => false,
            }
    }
}

/// The canonical material table: a set of [`Material`]s under tolerance
/// equivalence. `insert_or_find` is the only way in.
#[derive(Debug, Clone, Default)]
pub struct MaterialSet {
    entries: Vec<Material>,
}

impl MaterialSet {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the index of a table entry equivalent to `mat`, inserting
    /// `mat` if none exists yet.
    pub fn insert_or_find(&mut self, mat: Material) -> u32 {
        if let Some(i) = self.entries.iter().position(|m| m.equivalent(&mat)) {
            return i as u32;
        }
        self.entries.push(mat);
        (self.entries.len() - 1) as u32
    }

    /// Number of distinct materials loaded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no material has been loaded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The material at `index`, if in range.
    #[must_use]
    pub fn get(&self, index: u32) -> Option<&Material> {
        self.entries.get(index as usize)
    }

    /// All entries, in insertion order.
    #[must_use]
    pub fn entries(&self) -> &[Material] {
        &self.entries
    }

    /// Drops all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_or_find_deduplicates_within_tolerance() {
        let mut set = MaterialSet::new();
        let a = set.insert_or_find(Material::new(1e9, 0.3, 0.8, 0.5, 0.01));
        let b = set.insert_or_find(Material::new(1e9, 0.3 + 1e-12, 0.8, 0.5, 0.01));
        assert_eq!(a, b);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn insert_or_find_distinguishes_beyond_tolerance() {
        let mut set = MaterialSet::new();
        let a = set.insert_or_find(Material::new(1e9, 0.3, 0.8, 0.5, 0.01));
        let b = set.insert_or_find(Material::new(1e9, 0.31, 0.8, 0.5, 0.01));
        assert_ne!(a, b);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn density_participates_in_equivalence() {
        let mut set = MaterialSet::new();
        let mut with_density = Material::new(1e9, 0.3, 0.8, 0.5, 0.0);
        with_density.density = Some(2650.0);
        let a = set.insert_or_find(Material::new(1e9, 0.3, 0.8, 0.5, 0.0));
        let b = set.insert_or_find(with_density);
        assert_ne!(a, b);
    }
}
