//! On-disk formats: NIfTI images and text transform files.

mod image;
mod xfm;

pub use image::{
    geometry_from_header, read_geometry, read_series, read_volume, read_warp, write_series, write_volume,
    write_warp, TimeSeries, Volume,
};
pub use xfm::{
    format_fsl_mat, format_itk_affine, list_motion_matrices, motion_matrix_path, parse_fsl_mat,
    parse_itk_affine, read_fsl_mat, read_itk_affine, write_fsl_mat, write_itk_affine,
};
