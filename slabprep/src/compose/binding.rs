//! Loading planned links from the files that carry them.

use crate::errors::{Result, SlabprepError};
use crate::io::{read_fsl_mat, read_geometry, read_warp};
use crate::spatial::{DistortionState, LinearTransform, PlannedLink, TransformPair};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Files a link is read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkFiles {
    /// An FSL matrix between two images.
    Matrix {
        /// The matrix.
        mat: PathBuf,
        /// Image the matrix maps from.
        moving: PathBuf,
        /// Image the matrix maps to.
        fixed: PathBuf,
    },
    /// A distortion field pulling corrected positions back into the distorted image.
    Warp {
        /// The field.
        field: PathBuf,
    },
}

/// A planned link bound to its files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkBinding {
    /// The link.
    pub link: PlannedLink,
    /// Where it is read from.
    pub files: LinkFiles,
    /// Apply target to source instead.
    pub invert: bool,
}

impl LinkBinding {
    /// Binds a link in its planned direction.
    #[must_use]
    pub const fn new(link: PlannedLink, files: LinkFiles) -> Self {
        Self {
            link,
            files,
            invert: false,
        }
    }

    /// Applies the link backwards.
    #[must_use]
    pub const fn inverted(mut self) -> Self {
        self.invert = !self.invert;
        self
    }

    /// Reads the link's transform pair, oriented as bound.
    pub fn load(&self) -> Result<TransformPair> {
        let pair = match (&self.link, &self.files) {
            (PlannedLink::Distortion { family, inverse }, files) => {
                let field = match files {
                    LinkFiles::Warp { field } => read_warp(field)?,
                    LinkFiles::Matrix { .. } => {
                        return Err(SlabprepError::UnsupportedVariant(
                            "distortion link stored as a matrix".into(),
                        ))
                    }
                };
                let pair = TransformPair::from_pull_field(
                    family.at(DistortionState::Distorted),
                    family.at(DistortionState::Corrected),
                    field,
                )?;
                if *inverse {
                    pair.inverted()
                } else {
                    pair
                }
            }
            (PlannedLink::Registration { .. }, LinkFiles::Matrix { mat, moving, fixed }) => {
                let linear = LinearTransform::fsl(read_fsl_mat(mat)?, read_geometry(moving)?, read_geometry(fixed)?);
                TransformPair::from_linear(self.link.source(), self.link.target(), linear)?
            }
            (PlannedLink::Registration { .. }, LinkFiles::Warp { .. }) => {
                return Err(SlabprepError::UnsupportedVariant(
                    "registration link stored as a displacement field".into(),
                ))
            }
        };
        Ok(if self.invert { pair.inverted() } else { pair })
    }
}
