use crate::GcError;

/// Tuning knobs for a [`Collector`](crate::Collector).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GcConfig {
    /// Upper bound on `items / slots` in the allocation registry.
    pub load_factor: f64,
    /// Growth allowed between automatic collections, relative to the number
    /// of allocations that survived the last sweep.
    pub sweep_factor: f64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            load_factor: Self::LOAD_FACTOR,
            sweep_factor: Self::SWEEP_FACTOR,
        }
    }
}

impl GcConfig {
    const LOAD_FACTOR: f64 = 0.9;
    const SWEEP_FACTOR: f64 = 0.5;

    pub const LOAD_FACTOR_VAR: &'static str = "CGC_LOAD_FACTOR";
    pub const SWEEP_FACTOR_VAR: &'static str = "CGC_SWEEP_FACTOR";

    /// Reads the configuration from `CGC_LOAD_FACTOR` and `CGC_SWEEP_FACTOR`,
    /// keeping the default for any variable that is unset.
    pub fn from_env() -> Result<Self, GcError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, GcError> {
        let mut config = Self::default();

        if let Some(value) = lookup(Self::LOAD_FACTOR_VAR) {
            config.load_factor = parse_factor(Self::LOAD_FACTOR_VAR, &value)?;
        }
        if let Some(value) = lookup(Self::SWEEP_FACTOR_VAR) {
            config.sweep_factor = parse_factor(Self::SWEEP_FACTOR_VAR, &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), GcError> {
        if !(self.load_factor > 0.0 && self.load_factor <= 1.0) {
            return Err(GcError::InvalidConfig(format!(
                "load factor must be in (0, 1], got {}",
                self.load_factor
            )));
        }

        if !self.sweep_factor.is_finite() || self.sweep_factor < 0.0 {
            return Err(GcError::InvalidConfig(format!(
                "sweep factor must be a non-negative number, got {}",
                self.sweep_factor
            )));
        }

        Ok(())
    }
}

fn parse_factor(key: &str, value: &str) -> Result<f64, GcError> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| GcError::InvalidConfig(format!("{key}={value:?} is not a number")))
}
