use crate::errors::{OperatorError, Result};
use crate::io::{read_fsl_mat, read_geometry, write_fsl_mat, write_itk_affine};
use crate::operators::{RegistrationOperator, RegistrationRequest, REGISTRATION_OPERATOR};
use crate::spatial::{LinearTransform, ReferenceFrame, TransformPair};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info};

/// A link of the frame graph and the request that estimates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationLink {
    /// Frame of the moving image.
    pub source: ReferenceFrame,
    /// Frame of the fixed image.
    pub target: ReferenceFrame,
    /// Tool request.
    pub request: RegistrationRequest,
}

/// Files written for a registered link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationFiles {
    /// Source-to-target FSL matrix.
    pub forward_mat: PathBuf,
    /// Target-to-source FSL matrix.
    pub inverse_mat: PathBuf,
    /// `from-source_to-target` ITK affine.
    pub forward_itk: PathBuf,
    /// `from-target_to-source` ITK affine.
    pub inverse_itk: PathBuf,
    /// Visual report.
    pub report: PathBuf,
}

impl RegistrationFiles {
    /// Files keyed by output port.
    #[must_use]
    pub fn outputs(&self) -> BTreeMap<String, PathBuf> {
        [
            ("forward_mat", &self.forward_mat),
            ("inverse_mat", &self.inverse_mat),
            ("forward_itk", &self.forward_itk),
            ("inverse_itk", &self.inverse_itk),
            ("report", &self.report),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
    }
}

/// A registered link with both directions.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredLink {
    /// Source to target and back.
    pub pair: TransformPair,
    /// Files written.
    pub files: RegistrationFiles,
}

/// Runs the operator, validates its matrix and writes both directions in
/// FSL and ITK form.
pub async fn register_link(operator: &dyn RegistrationOperator, link: &RegistrationLink) -> Result<RegisteredLink> {
    let request = &link.request;
    request.validate()?;
    debug!(source = %link.source, target = %link.target, dof = request.dof, cost = request.cost(), "registering");

    let output = operator.register(request).await?;
    let matrix = read_fsl_mat(&output.forward_mat).map_err(|e| {
        OperatorError::non_convergence(REGISTRATION_OPERATOR, format!("unreadable matrix: {e}"))
    })?;
    let moving = read_geometry(&request.moving)?;
    let fixed = read_geometry(&request.fixed)?;
    let linear = LinearTransform::fsl(matrix, moving.clone(), fixed.clone());
    if !linear.is_well_formed() {
        return Err(OperatorError::non_convergence(
            REGISTRATION_OPERATOR,
            format!("matrix for {} -> {} is not finite and invertible", link.source, link.target),
        )
        .into());
    }

    let pair = TransformPair::from_linear(link.source.clone(), link.target.clone(), linear.clone())?;
    let inverse = linear.inverse()?;
    let forward_world = linear.to_physical()?;
    let inverse_world = inverse.to_physical()?;

    let files = RegistrationFiles {
        forward_mat: output.forward_mat.clone(),
        inverse_mat: request.workdir.join("inverse.mat"),
        forward_itk: request.workdir.join("forward_itk.txt"),
        inverse_itk: request.workdir.join("inverse_itk.txt"),
        report: output.report,
    };
    write_fsl_mat(&files.inverse_mat, &inverse.to_fsl(&fixed, &moving)?)?;
    // ITK files hold the pull direction.
    write_itk_affine(&files.forward_itk, &inverse_world)?;
    write_itk_affine(&files.inverse_itk, &forward_world)?;

    info!(source = %link.source, target = %link.target, "link registered");
    Ok(RegisteredLink { pair, files })
}
