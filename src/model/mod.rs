//! Declarative model specifications and priors
//!
//! A [`ModelSpec`] is the validated, immutable description of one regression
//! variant: its terms (linear, smooth, random intercept), the noise family,
//! and the prior resolved for every coefficient class. Validation happens at
//! build time, so a prior naming a coefficient that does not exist, or a
//! smooth term too small to be identifiable, is a [`Error::SpecificationError`]
//! long before any sampler runs.
//!
//! The two required variants of the motivating analysis differ only in noise
//! family (Gaussian vs Student-t); [`ModelSpec::with_noise_family`] derives
//! one from the other so the structural terms and priors are shared by
//! construction, never by convention.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Minimum basis dimension for an identifiable smooth term.
pub const MIN_SMOOTH_BASIS: usize = 3;

/// One term of the regression formula.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Term {
    /// Linear fixed-effect term over a named column
    Linear {
        /// Column the term reads (`time` or a covariate)
        name: String,
    },
    /// Smooth (penalized spline) term over a named column
    Smooth {
        /// Column the term reads
        name: String,
        /// Number of basis functions; at least [`MIN_SMOOTH_BASIS`]
        basis_dim: usize,
    },
    /// Per-group random intercept
    RandomIntercept {
        /// Grouping column (the dense study id)
        group: String,
    },
}

impl Term {
    /// The column this term reads, if it reads one.
    #[must_use]
    pub fn column(&self) -> &str {
        match self {
            Self::Linear { name } | Self::Smooth { name, .. } => name,
            Self::RandomIntercept { group } => group,
        }
    }
}

/// Prior distribution family with parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Prior {
    /// Normal(location, scale)
    Normal {
        /// Location
        mu: f64,
        /// Scale, strictly positive
        sigma: f64,
    },
    /// Student-t(df, location, scale)
    StudentT {
        /// Degrees of freedom, strictly positive
        nu: f64,
        /// Location
        mu: f64,
        /// Scale, strictly positive
        sigma: f64,
    },
    /// Exponential(rate); support is the positive half-line
    Exponential {
        /// Rate, strictly positive
        rate: f64,
    },
    /// Cauchy(location, scale)
    Cauchy {
        /// Location
        mu: f64,
        /// Scale, strictly positive
        sigma: f64,
    },
}

impl Prior {
    /// Log density at `theta`.
    ///
    /// Needed by power-scaling sensitivity, which reweights posterior draws
    /// by a perturbed prior exponent.
    #[must_use]
    pub fn log_density(&self, theta: f64) -> f64 {
        use std::f64::consts::PI;
        match *self {
            Self::Normal { mu, sigma } => {
                let z = (theta - mu) / sigma;
                -0.5 * z * z - sigma.ln() - 0.5 * (2.0 * PI).ln()
            }
            Self::StudentT { nu, mu, sigma } => {
                let z = (theta - mu) / sigma;
                let half = 0.5 * (nu + 1.0);
                ln_gamma(half) - ln_gamma(0.5 * nu)
                    - 0.5 * (nu * PI).ln()
                    - sigma.ln()
                    - half * (1.0 + z * z / nu).ln()
            }
            Self::Exponential { rate } => {
                if theta < 0.0 {
                    f64::NEG_INFINITY
                } else {
                    rate.ln() - rate * theta
                }
            }
            Self::Cauchy { mu, sigma } => {
                let z = (theta - mu) / sigma;
                -(PI * sigma).ln() - (1.0 + z * z).ln()
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let scale = match *self {
            Self::Normal { sigma, .. } | Self::Cauchy { sigma, .. } => sigma,
            Self::StudentT { nu, sigma, .. } => {
                if nu <= 0.0 {
                    return Err(Error::SpecificationError(format!(
                        "Student-t prior needs positive degrees of freedom, got {nu}"
                    )));
                }
                sigma
            }
            Self::Exponential { rate } => rate,
        };
        if scale <= 0.0 {
            return Err(Error::SpecificationError(format!(
                "prior scale must be strictly positive, got {scale}"
            )));
        }
        Ok(())
    }
}

/// Lanczos approximation of ln Γ(x), x > 0.
fn ln_gamma(x: f64) -> f64 {
    const G: [f64; 8] = [
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];
    if x < 0.5 {
        // Reflection
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin()).ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let mut acc = 0.999_999_999_999_809_9;
    for (i, &g) in G.iter().enumerate() {
        #[allow(clippy::cast_precision_loss)]
        let denom = x + (i as f64) + 1.0;
        acc += g / denom;
    }
    let t = x + 7.5;
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + acc.ln()
}

/// Coefficient class a prior attaches to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CoefClass {
    /// Class-level default for every fixed-effect coefficient not
    /// individually named
    FixedEffect,
    /// A single named fixed-effect coefficient (overrides the class default)
    Coefficient(String),
    /// The population intercept
    Intercept,
    /// Group-level (random-intercept) standard deviation
    GroupSd,
    /// Smooth-term penalty standard deviation
    SmoothSd,
    /// Residual scale
    Sigma,
}

impl fmt::Display for CoefClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FixedEffect => write!(f, "b"),
            Self::Coefficient(name) => write!(f, "b_{name}"),
            Self::Intercept => write!(f, "Intercept"),
            Self::GroupSd => write!(f, "sd"),
            Self::SmoothSd => write!(f, "sds"),
            Self::Sigma => write!(f, "sigma"),
        }
    }
}

/// Outcome noise family. The only axis the paired model variants differ on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NoiseFamily {
    /// Gaussian residuals
    Gaussian,
    /// Heavier-tailed Student-t residuals (robust variant)
    StudentT,
}

impl fmt::Display for NoiseFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gaussian => write!(f, "gaussian"),
            Self::StudentT => write!(f, "student"),
        }
    }
}

/// A validated, immutable model specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    name: String,
    terms: Vec<Term>,
    priors: BTreeMap<CoefClass, Prior>,
    noise: NoiseFamily,
}

impl ModelSpec {
    /// Start building a specification.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ModelSpecBuilder {
        ModelSpecBuilder::new(name)
    }

    /// Specification name, used in reports and cache keys.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Formula terms.
    #[must_use]
    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    /// Noise family.
    #[must_use]
    pub const fn noise_family(&self) -> NoiseFamily {
        self.noise
    }

    /// Declared priors, keyed by coefficient class.
    #[must_use]
    pub fn priors(&self) -> &BTreeMap<CoefClass, Prior> {
        &self.priors
    }

    /// The prior in effect for a named fixed-effect coefficient: the named
    /// override when declared, the class default otherwise.
    #[must_use]
    pub fn coefficient_prior(&self, name: &str) -> Option<Prior> {
        self.priors
            .get(&CoefClass::Coefficient(name.to_string()))
            .or_else(|| self.priors.get(&CoefClass::FixedEffect))
            .copied()
    }

    /// The prior attached to a non-coefficient class, if declared.
    #[must_use]
    pub fn class_prior(&self, class: &CoefClass) -> Option<Prior> {
        self.priors.get(class).copied()
    }

    /// Derive the paired variant differing only in noise family.
    ///
    /// Terms and priors are shared by construction, so a comparison between
    /// the two attributes differences to the noise family alone.
    #[must_use]
    pub fn with_noise_family(&self, noise: NoiseFamily) -> Self {
        let mut spec = self.clone();
        spec.noise = noise;
        spec.name = format!("{}_{noise}", self.base_name());
        spec
    }

    fn base_name(&self) -> &str {
        self.name
            .strip_suffix(&format!("_{}", self.noise))
            .unwrap_or(&self.name)
    }

    /// Check every term against the dataset's columns.
    ///
    /// `time` and the dense study id are always available; anything else
    /// must be a covariate column of the table. This turns what would be a
    /// runtime lookup failure inside a formula into a build-time error,
    /// raised strictly before any sampling call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SpecificationError`] naming the missing column.
    pub fn validate_columns(&self, data: &crate::dataset::AnalysisTable) -> Result<()> {
        for term in &self.terms {
            let column = term.column();
            let known = matches!(column, "time" | "study_id") || data.has_covariate(column);
            if !known {
                return Err(Error::SpecificationError(format!(
                    "term '{column}' in model '{}' has no matching dataset column \
                     (available: time, study_id, {})",
                    self.name,
                    data.covariate_names().join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Stable content fingerprint, used as the cache key's spec component.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = rustc_hash::FxHasher::default();
        self.name.hash(&mut hasher);
        format!("{:?}", self.terms).hash(&mut hasher);
        format!("{:?}", self.priors).hash(&mut hasher);
        self.noise.hash(&mut hasher);
        hasher.finish()
    }
}

/// Builder for [`ModelSpec`]; all validation happens in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct ModelSpecBuilder {
    name: String,
    terms: Vec<Term>,
    priors: BTreeMap<CoefClass, Prior>,
    noise: NoiseFamily,
}

impl ModelSpecBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            terms: Vec::new(),
            priors: BTreeMap::new(),
            noise: NoiseFamily::Gaussian,
        }
    }

    /// Add a linear fixed-effect term over a column.
    #[must_use]
    pub fn linear(mut self, name: impl Into<String>) -> Self {
        self.terms.push(Term::Linear { name: name.into() });
        self
    }

    /// Add a smooth term over a column with the given basis dimension.
    #[must_use]
    pub fn smooth(mut self, name: impl Into<String>, basis_dim: usize) -> Self {
        self.terms.push(Term::Smooth {
            name: name.into(),
            basis_dim,
        });
        self
    }

    /// Add a per-group random intercept.
    #[must_use]
    pub fn random_intercept(mut self, group: impl Into<String>) -> Self {
        self.terms.push(Term::RandomIntercept {
            group: group.into(),
        });
        self
    }

    /// Attach a prior to a coefficient class.
    #[must_use]
    pub fn prior(mut self, class: CoefClass, prior: Prior) -> Self {
        self.priors.insert(class, prior);
        self
    }

    /// Select the noise family (default: Gaussian).
    #[must_use]
    pub fn noise_family(mut self, noise: NoiseFamily) -> Self {
        self.noise = noise;
        self
    }

    /// Validate and freeze the specification.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SpecificationError`] if:
    /// - no terms were declared;
    /// - a named-coefficient prior references no declared term;
    /// - a smooth term's basis dimension is below [`MIN_SMOOTH_BASIS`];
    /// - a smooth-penalty or group-sd prior is declared without a matching
    ///   term kind, or a prior carries an invalid parameter.
    pub fn build(self) -> Result<ModelSpec> {
        if self.terms.is_empty() {
            return Err(Error::SpecificationError(format!(
                "model '{}' declares no terms",
                self.name
            )));
        }

        for term in &self.terms {
            if let Term::Smooth { name, basis_dim } = term {
                if *basis_dim < MIN_SMOOTH_BASIS {
                    return Err(Error::SpecificationError(format!(
                        "smooth term '{name}' needs at least {MIN_SMOOTH_BASIS} basis \
                         functions to be identifiable, got {basis_dim}"
                    )));
                }
            }
        }

        let has_smooth = self.terms.iter().any(|t| matches!(t, Term::Smooth { .. }));
        let has_group = self
            .terms
            .iter()
            .any(|t| matches!(t, Term::RandomIntercept { .. }));

        for (class, prior) in &self.priors {
            prior.validate()?;
            match class {
                CoefClass::Coefficient(name) => {
                    let declared = self.terms.iter().any(|t| {
                        matches!(t, Term::Linear { name: n } | Term::Smooth { name: n, .. } if n == name)
                    });
                    if !declared {
                        return Err(Error::SpecificationError(format!(
                            "prior for coefficient '{name}' references no term of model '{}'",
                            self.name
                        )));
                    }
                }
                CoefClass::SmoothSd if !has_smooth => {
                    return Err(Error::SpecificationError(format!(
                        "smooth-penalty prior declared but model '{}' has no smooth term",
                        self.name
                    )));
                }
                CoefClass::GroupSd if !has_group => {
                    return Err(Error::SpecificationError(format!(
                        "group-sd prior declared but model '{}' has no random intercept",
                        self.name
                    )));
                }
                _ => {}
            }
        }

        Ok(ModelSpec {
            name: self.name,
            terms: self.terms,
            priors: self.priors,
            noise: self.noise,
        })
    }
}
