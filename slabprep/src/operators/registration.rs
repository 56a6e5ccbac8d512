//! The registration operator seam.

use crate::errors::OperatorError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Name used for registration in templates and errors.
pub const REGISTRATION_OPERATOR: &str = "registration";

/// A request to estimate the linear transform aligning `moving` to `fixed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    /// Image being aligned.
    pub moving: PathBuf,
    /// Image aligned to.
    pub fixed: PathBuf,
    /// Multi-label tissue segmentation (`dseg`) of `fixed`, required for boundary-based cost.
    ///
    /// The tool derives its white-matter boundary from the label image.
    pub segmentation: Option<PathBuf>,
    /// Degrees of freedom (6 rigid, 9 or 12 affine).
    pub dof: u8,
    /// Use boundary-based cost.
    pub bbr: bool,
    /// Directory outputs are written to.
    pub workdir: PathBuf,
}

impl RegistrationRequest {
    /// Cost function name passed to the tool.
    #[must_use]
    pub const fn cost(&self) -> &'static str {
        if self.bbr {
            "bbr"
        } else {
            "corratio"
        }
    }

    /// Checks the request before any tool is invoked.
    pub fn validate(&self) -> Result<(), OperatorError> {
        if self.bbr && self.segmentation.is_none() {
            return Err(OperatorError::invalid_request(
                REGISTRATION_OPERATOR,
                "boundary-based registration needs a tissue segmentation of the fixed image",
            ));
        }
        if !matches!(self.dof, 6 | 9 | 12) {
            return Err(OperatorError::invalid_request(
                REGISTRATION_OPERATOR,
                format!("unsupported degrees of freedom {}", self.dof),
            ));
        }
        Ok(())
    }
}

/// Files produced by a registration tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationOutput {
    /// Moving-to-fixed matrix in the FSL scaled-voxel convention.
    pub forward_mat: PathBuf,
    /// Visual report.
    pub report: PathBuf,
}

/// Estimates rigid or affine alignment between two images.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegistrationOperator: Send + Sync {
    /// Runs the registration.
    async fn register(&self, request: &RegistrationRequest) -> Result<RegistrationOutput, OperatorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(bbr: bool, segmentation: Option<PathBuf>) -> RegistrationRequest {
        RegistrationRequest {
            moving: "/m.nii.gz".into(),
            fixed: "/f.nii.gz".into(),
            segmentation,
            dof: 6,
            bbr,
            workdir: "/w".into(),
        }
    }

    #[test]
    fn test_bbr_without_segmentation_invalid() {
        let err = request(true, None).validate().unwrap_err();
        assert!(matches!(err, OperatorError::InvalidRequest { .. }));
        assert!(err.to_string().contains("tissue segmentation"));
        assert!(request(true, Some("/desc-brain_dseg.nii.gz".into())).validate().is_ok());
        assert!(request(false, None).validate().is_ok());
    }

    #[test]
    fn test_cost_name() {
        assert_eq!(request(true, None).cost(), "bbr");
        assert_eq!(request(false, None).cost(), "corratio");
    }

    #[test]
    fn test_odd_dof_rejected() {
        let mut req = request(false, None);
        req.dof = 7;
        assert!(req.validate().is_err());
    }
}
