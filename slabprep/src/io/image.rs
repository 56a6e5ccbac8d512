//! NIfTI images: geometry, 3-D volumes, 4-D series and displacement fields.

use crate::errors::{Result, SlabprepError};
use crate::spatial::{ImageGeometry, WarpField};
use nalgebra::{Matrix3, Matrix4, Vector3};
use ndarray::{Array3, Array4, ArrayD, Axis, Ix3, Ix4};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use std::path::Path;

/// A single 3-D image.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    /// Grid.
    pub geometry: ImageGeometry,
    /// Intensities indexed `[i, j, k]`.
    pub data: Array3<f32>,
}

/// A 4-D functional run split along time.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    /// Grid shared by every volume.
    pub geometry: ImageGeometry,
    /// Volumes in acquisition order.
    pub volumes: Vec<Array3<f32>>,
    /// Repetition time in seconds.
    pub repetition_time: f64,
}

impl TimeSeries {
    /// Number of volumes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    /// Returns true if the series has no volumes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    /// Keeps only the first `n` volumes.
    #[must_use]
    pub fn truncated(mut self, n: usize) -> Self {
        self.volumes.truncate(n);
        self
    }
}

/// Reads only the header and derives the grid.
pub fn read_geometry(path: &Path) -> Result<ImageGeometry> {
    let header = NiftiHeader::from_file(path)?;
    Ok(geometry_from_header(&header))
}

/// Grid from a header: sform, then qform, then pixdim scaling.
#[must_use]
pub fn geometry_from_header(header: &NiftiHeader) -> ImageGeometry {
    let shape = [
        usize::from(header.dim[1].max(1)),
        usize::from(header.dim[2].max(1)),
        usize::from(header.dim[3].max(1)),
    ];
    let rows: [[f32; 4]; 3] = if header.sform_code > 0 {
        [header.srow_x, header.srow_y, header.srow_z]
    } else if header.qform_code > 0 {
        qform_rows(header)
    } else {
        [
            [header.pixdim[1], 0.0, 0.0, 0.0],
            [0.0, header.pixdim[2], 0.0, 0.0],
            [0.0, 0.0, header.pixdim[3], 0.0],
        ]
    };
    let mut affine = Matrix4::identity();
    for (r, row) in rows.iter().enumerate() {
        for (c, v) in row.iter().enumerate() {
            affine[(r, c)] = f64::from(*v);
        }
    }
    ImageGeometry::new(shape, affine)
}

fn qform_rows(header: &NiftiHeader) -> [[f32; 4]; 3] {
    let (b, c, d) = (header.quatern_b, header.quatern_c, header.quatern_d);
    let a = (1.0 - (b * b + c * c + d * d).min(1.0)).sqrt();
    let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
    let (dx, dy, dz) = (header.pixdim[1], header.pixdim[2], header.pixdim[3] * qfac);
    [
        [
            (a * a + b * b - c * c - d * d) * dx,
            2.0 * (b * c - a * d) * dy,
            2.0 * (b * d + a * c) * dz,
            header.quatern_x,
        ],
        [
            2.0 * (b * c + a * d) * dx,
            (a * a + c * c - b * b - d * d) * dy,
            2.0 * (c * d - a * b) * dz,
            header.quatern_y,
        ],
        [
            2.0 * (b * d - a * c) * dx,
            2.0 * (c * d + a * b) * dy,
            (a * a + d * d - c * c - b * b) * dz,
            header.quatern_z,
        ],
    ]
}

#[allow(clippy::cast_possible_truncation)]
fn header_for(geometry: &ImageGeometry, repetition_time: Option<f64>) -> NiftiHeader {
    let row = |r: usize| -> [f32; 4] {
        [
            geometry.affine[(r, 0)] as f32,
            geometry.affine[(r, 1)] as f32,
            geometry.affine[(r, 2)] as f32,
            geometry.affine[(r, 3)] as f32,
        ]
    };
    let spacing = geometry.spacing();
    let mut pixdim = [1.0f32; 8];
    pixdim[1] = spacing.x as f32;
    pixdim[2] = spacing.y as f32;
    pixdim[3] = spacing.z as f32;
    pixdim[4] = repetition_time.unwrap_or(1.0) as f32;
    NiftiHeader {
        sform_code: 1,
        qform_code: 0,
        srow_x: row(0),
        srow_y: row(1),
        srow_z: row(2),
        pixdim,
        ..NiftiHeader::default()
    }
}

fn read_array(path: &Path) -> Result<(NiftiHeader, ArrayD<f32>)> {
    let object = ReaderOptions::new().read_file(path)?;
    let header = object.header().clone();
    let data = object.into_volume().into_ndarray::<f32>()?;
    Ok((header, data))
}

fn to_volume3(array: ArrayD<f32>) -> Result<Array3<f32>> {
    array
        .into_dimensionality::<Ix3>()
        .map_err(|e| SlabprepError::Numerical(format!("expected a 3-D image: {e}")))
}

/// Reads a 3-D image; a 4-D image contributes its first volume.
pub fn read_volume(path: &Path) -> Result<Volume> {
    let (header, data) = read_array(path)?;
    let geometry = geometry_from_header(&header);
    let data = if data.ndim() > 3 {
        to_volume3(data.index_axis(Axis(3), 0).to_owned())?
    } else {
        to_volume3(data)?
    };
    Ok(Volume { geometry, data })
}

/// Reads a 4-D series; a 3-D image is a one-volume series.
///
/// `repetition_time` overrides the header value (sidecar metadata is authoritative).
pub fn read_series(path: &Path, repetition_time: Option<f64>) -> Result<TimeSeries> {
    let (header, data) = read_array(path)?;
    let geometry = geometry_from_header(&header);
    let volumes = if data.ndim() > 3 {
        let n = data.len_of(Axis(3));
        (0..n)
            .map(|t| to_volume3(data.index_axis(Axis(3), t).to_owned()))
            .collect::<Result<Vec<_>>>()?
    } else {
        vec![to_volume3(data)?]
    };
    Ok(TimeSeries {
        geometry,
        volumes,
        repetition_time: repetition_time.unwrap_or_else(|| f64::from(header.pixdim[4])),
    })
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Writes a 3-D image.
pub fn write_volume(path: &Path, volume: &Volume) -> Result<()> {
    ensure_parent(path)?;
    WriterOptions::new(path)
        .reference_header(&header_for(&volume.geometry, None))
        .write_nifti(&volume.data)?;
    Ok(())
}

/// Writes a 4-D series in volume order.
pub fn write_series(path: &Path, series: &TimeSeries) -> Result<()> {
    ensure_parent(path)?;
    let views: Vec<_> = series.volumes.iter().map(Array3::view).collect();
    let stacked = ndarray::stack(Axis(3), &views)
        .map_err(|e| SlabprepError::Numerical(format!("cannot stack volumes: {e}")))?;
    WriterOptions::new(path)
        .reference_header(&header_for(&series.geometry, Some(series.repetition_time)))
        .write_nifti(&stacked)?;
    Ok(())
}

fn fsl_linear(geometry: &ImageGeometry) -> Matrix3<f64> {
    geometry.fsl_scaling().fixed_view::<3, 3>(0, 0).into_owned()
}

/// Reads a displacement field stored as FSL relative millimetres on its grid.
pub fn read_warp(path: &Path) -> Result<WarpField> {
    let (header, data) = read_array(path)?;
    let geometry = geometry_from_header(&header);
    let data = match data.ndim() {
        4 => data,
        5 => data.index_axis(Axis(3), 0).to_owned(),
        n => {
            return Err(SlabprepError::Numerical(format!(
                "displacement field must be 4-D or 5-D, got {n}-D"
            )))
        }
    };
    let data = data
        .into_dimensionality::<Ix4>()
        .map_err(|e| SlabprepError::Numerical(format!("bad displacement field shape: {e}")))?;
    let components = data.len_of(Axis(3));
    if components != 3 {
        return Err(SlabprepError::Numerical(format!(
            "displacement field must have 3 components, got {components}"
        )));
    }
    let to_world = geometry.linear()
        * fsl_linear(&geometry)
            .try_inverse()
            .ok_or_else(|| SlabprepError::Numerical("singular FSL scaling".into()))?;

    let [nx, ny, nz] = geometry.shape;
    let mut displacements = Vec::with_capacity(geometry.voxel_count());
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let d = Vector3::new(
                    f64::from(data[[i, j, k, 0]]),
                    f64::from(data[[i, j, k, 1]]),
                    f64::from(data[[i, j, k, 2]]),
                );
                displacements.push(to_world * d);
            }
        }
    }
    WarpField::new(geometry, displacements)
}

/// Writes a displacement field as FSL relative millimetres on its grid.
#[allow(clippy::cast_possible_truncation)]
pub fn write_warp(path: &Path, field: &WarpField) -> Result<()> {
    ensure_parent(path)?;
    let geometry = &field.geometry;
    let to_fsl = fsl_linear(geometry)
        * geometry
            .linear()
            .try_inverse()
            .ok_or_else(|| SlabprepError::Numerical("singular voxel-to-world affine".into()))?;
    let [nx, ny, nz] = geometry.shape;
    let mut data = Array4::<f32>::zeros((nx, ny, nz, 3));
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let d = to_fsl * field.displacements[geometry.flat_index(i, j, k)];
                for c in 0..3 {
                    data[[i, j, k, c]] = d[c] as f32;
                }
            }
        }
    }
    WriterOptions::new(path)
        .reference_header(&header_for(geometry, None))
        .write_nifti(&data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn geometry() -> ImageGeometry {
        ImageGeometry::axis_aligned([4, 5, 3], [2.0, 2.0, 3.0], [-4.0, -5.0, -3.0])
    }

    #[test]
    fn test_volume_round_trip_keeps_geometry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vol.nii.gz");
        let mut data = Array3::<f32>::zeros((4, 5, 3));
        data[[1, 2, 1]] = 5.0;
        write_volume(&path, &Volume { geometry: geometry(), data }).unwrap();

        let back = read_volume(&path).unwrap();
        assert_eq!(back.geometry.shape, [4, 5, 3]);
        assert!((back.geometry.affine - geometry().affine).norm() < 1e-5);
        assert!((back.data[[1, 2, 1]] - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_series_round_trip_keeps_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bold.nii.gz");
        let volumes = (0..3)
            .map(|t| Array3::<f32>::from_elem((4, 5, 3), t as f32))
            .collect();
        let series = TimeSeries { geometry: geometry(), volumes, repetition_time: 2.5 };
        write_series(&path, &series).unwrap();

        let back = read_series(&path, None).unwrap();
        assert_eq!(back.len(), 3);
        assert!((back.volumes[2][[0, 0, 0]] - 2.0).abs() < 1e-6);
        assert!((back.repetition_time - 2.5).abs() < 1e-6);
        assert_eq!(read_geometry(&path).unwrap().shape, [4, 5, 3]);
    }

    #[test]
    fn test_warp_round_trip_in_world_space() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("warp.nii.gz");
        let field = WarpField::constant(geometry(), Vector3::new(1.0, -0.5, 0.25)).unwrap();
        write_warp(&path, &field).unwrap();

        let back = read_warp(&path).unwrap();
        assert!(back
            .displacements
            .iter()
            .all(|d| (d - Vector3::new(1.0, -0.5, 0.25)).norm() < 1e-5));
    }
}
