//! Licensing validation port.
//!
//! Checked once per `start`; the validator is injected at startup like every
//! other process-wide capability. The shipped implementation accepts
//! everything, which is exactly what the boundary needs until a commercial
//! validator plugs in.

use crate::error::{Error, Result};

pub trait LicenseValidator: Send + Sync {
    /// Err(Conflict) blocks extraction starts; reads are never gated.
    fn validate(&self) -> Result<()>;
}

/// Fixed-outcome validator.
pub struct StaticLicense {
    accepted: bool,
}

impl StaticLicense {
    pub fn allow_all() -> Self {
        StaticLicense { accepted: true }
    }

    pub fn denying() -> Self {
        StaticLicense { accepted: false }
    }
}

impl LicenseValidator for StaticLicense {
    fn validate(&self) -> Result<()> {
        if self.accepted {
            Ok(())
        } else {
            Err(Error::Conflict("license validation failed".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_all_accepts() {
        assert!(StaticLicense::allow_all().validate().is_ok());
    }

    #[test]
    fn denying_conflicts() {
        let err = StaticLicense::denying().validate().unwrap_err();
        assert_eq!(err.code(), "conflict");
    }
}
