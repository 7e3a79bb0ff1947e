//! Converts raw inputs into the `(T, H, W)` `[0, 1]` frame stack models expect.
//!
//! Images carry 8-bit grayscale (`/ 255`); gridded files carry percentage-like
//! concentrations (`/ 100`).

use image::{DynamicImage, GenericImageView};
use ndarray::{Array3, Axis};

use crate::models::error::AppError;

pub const IMAGE_SCALE: f32 = 255.0;
pub const GRIDDED_SCALE: f32 = 100.0;

/// Opens every locator; the first failure aborts the whole batch.
pub fn open_images<S: AsRef<str>>(locators: &[S]) -> Result<Vec<DynamicImage>, AppError> {
    locators
        .iter()
        .map(|locator| {
            let locator = locator.as_ref();
            image::open(locator).map_err(|e| {
                AppError::ValidationError(format!("Failed to open image {}: {}", locator, e))
            })
        })
        .collect()
}

pub fn images_to_frames(images: &[DynamicImage]) -> Result<Array3<f32>, AppError> {
    let first = images
        .first()
        .ok_or_else(|| AppError::Shape("no input frames".to_string()))?;
    let (w, h) = first.dimensions();
    let mut frames = Array3::<f32>::zeros((images.len(), h as usize, w as usize));

    for (t, img) in images.iter().enumerate() {
        if img.dimensions() != (w, h) {
            let (iw, ih) = img.dimensions();
            return Err(AppError::Shape(format!(
                "frame {} is {}x{}, expected {}x{}",
                t, iw, ih, w, h
            )));
        }
        let gray = to_grayscale(img);
        for (x, y, pixel) in gray.enumerate_pixels() {
            frames[[t, y as usize, x as usize]] = pixel[0] as f32 / IMAGE_SCALE;
        }
    }

    Ok(frames)
}

/// Grayscale images pass through untouched; colour images use ITU-R 601-2 luma.
fn to_grayscale(img: &DynamicImage) -> image::GrayImage {
    match img {
        DynamicImage::ImageLuma8(gray) => gray.clone(),
        DynamicImage::ImageLumaA8(gray_alpha) => {
            image::GrayImage::from_fn(gray_alpha.width(), gray_alpha.height(), |x, y| {
                image::Luma([gray_alpha.get_pixel(x, y)[0]])
            })
        }
        DynamicImage::ImageLuma16(_) | DynamicImage::ImageLumaA16(_) => img.to_luma8(),
        _ => {
            let rgb = img.to_rgb8();
            image::GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
                let p = rgb.get_pixel(x, y);
                let l = (p[0] as u32 * 19595 + p[1] as u32 * 38470 + p[2] as u32 * 7471 + 0x8000)
                    >> 16;
                image::Luma([l.min(255) as u8])
            })
        }
    }
}

/// A gridded variable with `scale_factor`/`add_offset` applied and fill values as NaN.
#[cfg_attr(not(feature = "netcdf"), allow(dead_code))]
#[derive(Debug, Clone)]
pub struct GriddedVariable {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

#[cfg_attr(not(feature = "netcdf"), allow(dead_code))]
impl GriddedVariable {
    /// Normalizes a `(H, W)` or `(T, H, W)` variable; missing cells become 0.
    pub fn into_frames(self, first_slice_only: bool) -> Result<Array3<f32>, AppError> {
        let (t, h, w) = match self.shape.as_slice() {
            [h, w] => (1, *h, *w),
            [t, h, w] => (*t, *h, *w),
            other => {
                return Err(AppError::Shape(format!(
                    "gridded variable must be 2-D or 3-D, got shape {:?}",
                    other
                )))
            }
        };
        if t == 0 {
            return Err(AppError::Shape("gridded variable has no time slices".to_string()));
        }

        let values = self
            .values
            .into_iter()
            .map(|v| if v.is_finite() { v / GRIDDED_SCALE } else { 0.0 })
            .collect();
        let frames = Array3::from_shape_vec((t, h, w), values)
            .map_err(|e| AppError::Shape(format!("gridded variable: {}", e)))?;

        if first_slice_only && t > 1 {
            Ok(frames.index_axis(Axis(0), 0).insert_axis(Axis(0)).to_owned())
        } else {
            Ok(frames)
        }
    }
}

/// One frame per file, taking the first time slice of each.
#[cfg_attr(not(feature = "netcdf"), allow(dead_code))]
pub fn stack_gridded_files(variables: Vec<GriddedVariable>) -> Result<Array3<f32>, AppError> {
    let frames = variables
        .into_iter()
        .map(|v| v.into_frames(true))
        .collect::<Result<Vec<_>, _>>()?;
    if frames.is_empty() {
        return Err(AppError::Shape("no input frames".to_string()));
    }
    let views: Vec<_> = frames.iter().map(|f| f.view()).collect();
    ndarray::concatenate(Axis(0), &views)
        .map_err(|e| AppError::Shape(format!("gridded frames differ in shape: {}", e)))
}

#[cfg(feature = "netcdf")]
mod gridded_io {
    use std::path::Path;

    use netcdf::AttributeValue;

    use super::GriddedVariable;
    use crate::models::error::AppError;

    fn numeric_attribute(var: &netcdf::Variable<'_>, name: &str) -> Option<f64> {
        match var.attribute_value(name)?.ok()? {
            AttributeValue::Double(v) => Some(v),
            AttributeValue::Float(v) => Some(v as f64),
            AttributeValue::Short(v) => Some(v as f64),
            AttributeValue::Int(v) => Some(v as f64),
            AttributeValue::Schar(v) => Some(v as f64),
            AttributeValue::Uchar(v) => Some(v as f64),
            AttributeValue::Ushort(v) => Some(v as f64),
            AttributeValue::Uint(v) => Some(v as f64),
            AttributeValue::Longlong(v) => Some(v as f64),
            AttributeValue::Ulonglong(v) => Some(v as f64),
            _ => None,
        }
    }

    pub fn read_variable(path: &Path, variable: &str) -> Result<GriddedVariable, AppError> {
        let file = netcdf::open(path)
            .map_err(|e| AppError::Io(format!("Failed to open {}: {}", path.display(), e)))?;
        let var = file.variable(variable).ok_or_else(|| {
            AppError::InvalidFormat(format!(
                "Variable '{}' not found in {}",
                variable,
                path.display()
            ))
        })?;

        let shape: Vec<usize> = var.dimensions().iter().map(|d| d.len()).collect();
        let raw: Vec<f64> = var.get_values::<f64, _>(..).map_err(|e| {
            AppError::InvalidFormat(format!(
                "Failed to read '{}' from {}: {}",
                variable,
                path.display(),
                e
            ))
        })?;

        let fill = numeric_attribute(&var, "_FillValue");
        let scale = numeric_attribute(&var, "scale_factor").unwrap_or(1.0);
        let offset = numeric_attribute(&var, "add_offset").unwrap_or(0.0);

        let values = raw
            .into_iter()
            .map(|v| match fill {
                Some(f) if v == f => f32::NAN,
                _ => (v * scale + offset) as f32,
            })
            .collect();

        Ok(GriddedVariable { shape, values })
    }
}

/// Whole temporal stack of the named variable from one file.
#[cfg(feature = "netcdf")]
pub fn read_gridded_file<P: AsRef<std::path::Path>>(
    path: P,
    variable: &str,
) -> Result<Array3<f32>, AppError> {
    gridded_io::read_variable(path.as_ref(), variable)?.into_frames(false)
}

/// First time slice of the named variable from each file.
#[cfg(feature = "netcdf")]
pub fn read_gridded_files<P: AsRef<std::path::Path>>(
    paths: &[P],
    variable: &str,
) -> Result<Array3<f32>, AppError> {
    let variables = paths
        .iter()
        .map(|p| gridded_io::read_variable(p.as_ref(), variable))
        .collect::<Result<Vec<_>, _>>()?;
    stack_gridded_files(variables)
}
