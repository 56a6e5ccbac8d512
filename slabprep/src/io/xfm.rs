//! Text transform formats: FSL `.mat` and ITK affine files.

use crate::errors::{Result, SlabprepError};
use nalgebra::Matrix4;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

const ITK_HEADER: &str = "#Insight Transform File V1.0";
const ITK_AFFINE: &str = "AffineTransform_double_3_3";

/// RAS <-> LPS flip.
fn lps() -> Matrix4<f64> {
    Matrix4::from_diagonal(&nalgebra::Vector4::new(-1.0, -1.0, 1.0, 1.0))
}

/// Parses a 4x4 whitespace-separated FSL matrix.
pub fn parse_fsl_mat(text: &str) -> Result<Matrix4<f64>> {
    let values = text
        .split_whitespace()
        .map(|v| {
            v.parse::<f64>()
                .map_err(|e| SlabprepError::Numerical(format!("bad FSL matrix entry '{v}': {e}")))
        })
        .collect::<Result<Vec<_>>>()?;
    if values.len() != 16 {
        return Err(SlabprepError::Numerical(format!(
            "FSL matrix must have 16 entries, found {}",
            values.len()
        )));
    }
    Ok(Matrix4::from_row_slice(&values))
}

/// Reads an FSL `.mat` file.
pub fn read_fsl_mat(path: &Path) -> Result<Matrix4<f64>> {
    parse_fsl_mat(&std::fs::read_to_string(path)?)
}

/// Formats a matrix the way FSL writes it.
#[must_use]
pub fn format_fsl_mat(matrix: &Matrix4<f64>) -> String {
    let mut out = String::new();
    for r in 0..4 {
        let row: Vec<String> = (0..4).map(|c| format!("{:.10}", matrix[(r, c)])).collect();
        let _ = writeln!(out, "{}  ", row.join("  "));
    }
    out
}

/// Writes an FSL `.mat` file.
pub fn write_fsl_mat(path: &Path, matrix: &Matrix4<f64>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format_fsl_mat(matrix))?;
    Ok(())
}

/// Formats a world-space (RAS) point map as an ITK affine file.
///
/// ITK files hold the map from fixed to moving points in LPS, so a
/// `from-A_to-B` file stores the inverse of the A -> B point map.
pub fn format_itk_affine(pull_ras: &Matrix4<f64>) -> String {
    let m = lps() * pull_ras * lps();
    let mut params = Vec::with_capacity(12);
    for r in 0..3 {
        for c in 0..3 {
            params.push(format!("{}", m[(r, c)]));
        }
    }
    for r in 0..3 {
        params.push(format!("{}", m[(r, 3)]));
    }
    format!(
        "{ITK_HEADER}\n#Transform 0\nTransform: {ITK_AFFINE}\nParameters: {}\nFixedParameters: 0 0 0\n",
        params.join(" ")
    )
}

/// Parses an ITK affine file back into the RAS pull matrix.
pub fn parse_itk_affine(text: &str) -> Result<Matrix4<f64>> {
    let mut params: Option<Vec<f64>> = None;
    let mut center = [0.0; 3];
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("Transform:") {
            let kind = rest.trim();
            if !kind.starts_with("AffineTransform") && !kind.starts_with("MatrixOffsetTransformBase") {
                return Err(SlabprepError::UnsupportedVariant(format!("ITK transform type '{kind}'")));
            }
        } else if let Some(rest) = line.strip_prefix("Parameters:") {
            params = Some(parse_floats(rest)?);
        } else if let Some(rest) = line.strip_prefix("FixedParameters:") {
            let fixed = parse_floats(rest)?;
            for (slot, v) in center.iter_mut().zip(fixed) {
                *slot = v;
            }
        }
    }
    let params = params.ok_or_else(|| SlabprepError::Numerical("ITK file has no Parameters line".into()))?;
    if params.len() != 12 {
        return Err(SlabprepError::Numerical(format!(
            "ITK affine must have 12 parameters, found {}",
            params.len()
        )));
    }
    let mut m = Matrix4::identity();
    for r in 0..3 {
        for c in 0..3 {
            m[(r, c)] = params[r * 3 + c];
        }
    }
    // offset = translation + center - A * center
    for r in 0..3 {
        let a_center: f64 = (0..3).map(|c| m[(r, c)] * center[c]).sum();
        m[(r, 3)] = params[9 + r] + center[r] - a_center;
    }
    Ok(lps() * m * lps())
}

fn parse_floats(text: &str) -> Result<Vec<f64>> {
    text.split_whitespace()
        .map(|v| {
            v.parse::<f64>()
                .map_err(|e| SlabprepError::Numerical(format!("bad ITK parameter '{v}': {e}")))
        })
        .collect()
}

/// Writes an ITK affine file.
pub fn write_itk_affine(path: &Path, pull_ras: &Matrix4<f64>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format_itk_affine(pull_ras))?;
    Ok(())
}

/// Reads an ITK affine file.
pub fn read_itk_affine(path: &Path) -> Result<Matrix4<f64>> {
    parse_itk_affine(&std::fs::read_to_string(path)?)
}

/// Path of the per-volume motion matrix `index` inside a motion-correction directory.
#[must_use]
pub fn motion_matrix_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("MAT_{index:04}"))
}

/// Lists the per-volume motion matrices present in a directory, in volume order.
pub fn list_motion_matrices(dir: &Path) -> Result<Vec<(usize, PathBuf)>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(index) = name.strip_prefix("MAT_").and_then(|i| i.parse::<usize>().ok()) {
            found.push((index, path));
        }
    }
    found.sort_by_key(|(i, _)| *i);
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;
    use tempfile::TempDir;

    #[test]
    fn test_fsl_mat_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("xfm.mat");
        let m = Matrix4::new_translation(&Vector3::new(1.5, -2.0, 0.25));
        write_fsl_mat(&path, &m).unwrap();
        let back = read_fsl_mat(&path).unwrap();
        assert!((back - m).norm() < 1e-9);
    }

    #[test]
    fn test_fsl_mat_wrong_size_rejected() {
        assert!(parse_fsl_mat("1 0 0\n0 1 0\n").is_err());
    }

    #[test]
    fn test_itk_round_trip_and_lps_sign() {
        let m = Matrix4::new_translation(&Vector3::new(2.0, 3.0, 4.0));
        let text = format_itk_affine(&m);
        assert!(text.contains("Parameters: 1 0 0 0 1 0 0 0 1 -2 -3 4"));
        let back = parse_itk_affine(&text).unwrap();
        assert!((back - m).norm() < 1e-12);
    }

    #[test]
    fn test_itk_rejects_displacement_field_type() {
        let text = "#Insight Transform File V1.0\nTransform: DisplacementFieldTransform_double_3_3\n";
        assert!(matches!(parse_itk_affine(text), Err(SlabprepError::UnsupportedVariant(_))));
    }

    #[test]
    fn test_motion_matrices_listed_in_order() {
        let dir = TempDir::new().unwrap();
        for i in [2usize, 0, 1] {
            write_fsl_mat(&motion_matrix_path(dir.path(), i), &Matrix4::identity()).unwrap();
        }
        let listed = list_motion_matrices(dir.path()).unwrap();
        assert_eq!(listed.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1, 2]);
    }
}
