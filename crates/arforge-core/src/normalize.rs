//! Orientation and scale heuristics.
//!
//! Both checks are advisory. [`suggest_transform`] turns their findings into
//! a [`CorrectiveTransform`] that the glTF stage can bake into the export.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::format::parse_extension;
use crate::model::{BoundingBox, Dimensions};

/// Depth-to-height ratio above which a scene is assumed to lie on its back.
const Z_UP_ASPECT: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum UpAxis {
    #[strum(serialize = "Y")]
    Y,
    #[strum(serialize = "Z")]
    Z,
}

/// Rotation in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rotation {
    pub rotate_x: f64,
    pub rotate_y: f64,
    pub rotate_z: f64,
}

impl Rotation {
    fn z_up_to_y_up() -> Self {
        Self {
            rotate_x: -90.0,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrientationCheck {
    pub format: String,
    pub detected_up_axis: UpAxis,
    pub correction_needed: Option<Rotation>,
    pub reason: String,
}

/// Detect the up axis from the format convention, then the bounding box.
pub fn check_orientation(format: &str, bbox: Option<&BoundingBox>) -> OrientationCheck {
    let format = format.trim().trim_start_matches('.').to_ascii_lowercase();

    if parse_extension(&format).is_some_and(|f| f.is_z_up()) {
        return OrientationCheck {
            reason: format!("'{format}' exporters write Z-up scenes by convention"),
            format,
            detected_up_axis: UpAxis::Z,
            correction_needed: Some(Rotation::z_up_to_y_up()),
        };
    }

    if let Some(dims) = bbox.map(BoundingBox::dimensions)
        && dims.depth > dims.height * Z_UP_ASPECT
    {
        return OrientationCheck {
            reason: format!(
                "depth {:.3} is more than {Z_UP_ASPECT}x height {:.3}",
                dims.depth, dims.height
            ),
            format,
            detected_up_axis: UpAxis::Z,
            correction_needed: Some(Rotation::z_up_to_y_up()),
        };
    }

    OrientationCheck {
        format,
        detected_up_axis: UpAxis::Y,
        correction_needed: None,
        reason: "no Z-up evidence".to_owned(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LengthUnit {
    Millimeters,
    Centimeters,
    Inches,
    Meters,
}

impl LengthUnit {
    /// Factor converting this unit to meters.
    pub fn to_meters(self) -> f64 {
        match self {
            LengthUnit::Millimeters => 0.001,
            LengthUnit::Centimeters => 0.01,
            LengthUnit::Inches => 0.0254,
            LengthUnit::Meters => 1.0,
        }
    }

    /// Guess the authoring unit from the largest extent.
    pub fn infer(max_dimension: f64) -> Self {
        if max_dimension > 100.0 {
            LengthUnit::Millimeters
        } else if max_dimension > 10.0 {
            LengthUnit::Centimeters
        } else if (0.3..=40.0).contains(&max_dimension) {
            LengthUnit::Inches
        } else {
            LengthUnit::Meters
        }
    }
}

/// Product categories with a known real-world size range.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ProductCategory {
    Ring,
    Earring,
    Bracelet,
    Watch,
    Necklace,
    Glasses,
    Shoe,
    Vase,
    Lamp,
    Chair,
    Table,
    General,
}

impl ProductCategory {
    /// Unknown or missing hints fall back to `General`.
    pub fn from_hint(hint: Option<&str>) -> Self {
        hint.and_then(|h| h.trim().parse().ok())
            .unwrap_or(ProductCategory::General)
    }

    /// Expected largest extent in meters.
    pub fn expected_range(self) -> (f64, f64) {
        match self {
            ProductCategory::Ring => (0.015, 0.03),
            ProductCategory::Earring => (0.005, 0.08),
            ProductCategory::Bracelet => (0.05, 0.1),
            ProductCategory::Watch => (0.03, 0.25),
            ProductCategory::Necklace => (0.1, 0.6),
            ProductCategory::Glasses => (0.12, 0.16),
            ProductCategory::Shoe => (0.2, 0.35),
            ProductCategory::Vase => (0.1, 1.0),
            ProductCategory::Lamp => (0.15, 2.0),
            ProductCategory::Chair => (0.4, 1.2),
            ProductCategory::Table => (0.4, 3.0),
            ProductCategory::General => (0.01, 1000.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleCheck {
    pub detected_unit: LengthUnit,
    /// Multiply source coordinates by this to get meters.
    pub suggested_scale: f64,
    pub max_dimension: f64,
    pub scaled_dimensions: Dimensions,
    pub scaled_max_dimension: f64,
    pub category: ProductCategory,
    pub expected_range: (f64, f64),
    pub within_range: bool,
    pub issues: Vec<String>,
}

/// Infer the source unit and compare the rescaled size with the category range.
pub fn check_scale(bbox: &BoundingBox, category_hint: Option<&str>) -> ScaleCheck {
    let dims = bbox.dimensions();
    let max_dimension = dims.max_dimension();
    let detected_unit = LengthUnit::infer(max_dimension);
    let suggested_scale = detected_unit.to_meters();
    let scaled_dimensions = dims.scaled(suggested_scale);
    let scaled_max_dimension = scaled_dimensions.max_dimension();
    let category = ProductCategory::from_hint(category_hint);
    let (min, max) = category.expected_range();

    let mut issues = Vec::new();
    if max_dimension <= 0.0 {
        issues.push("bounding box has no extent".to_owned());
    }
    let within_range = (min..=max).contains(&scaled_max_dimension);
    if !within_range {
        issues.push(format!(
            "scaled size {scaled_max_dimension:.3} m is outside the {category} range {min}..{max} m"
        ));
    }

    ScaleCheck {
        detected_unit,
        suggested_scale,
        max_dimension,
        scaled_dimensions,
        scaled_max_dimension,
        category,
        expected_range: (min, max),
        within_range,
        issues,
    }
}

/// Uniform scale and X rotation baked into an export.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrectiveTransform {
    pub scale: f64,
    pub rotate_x: f64,
}

/// Combine orientation and scale findings. `None` when nothing needs changing.
pub fn suggest_transform(
    format: &str,
    bbox: &BoundingBox,
    category_hint: Option<&str>,
) -> Option<CorrectiveTransform> {
    let orientation = check_orientation(format, Some(bbox));
    let scale = check_scale(bbox, category_hint);
    let rotate_x = orientation
        .correction_needed
        .map(|r| r.rotate_x)
        .unwrap_or(0.0);
    let factor = if scale.max_dimension > 0.0 {
        scale.suggested_scale
    } else {
        1.0
    };

    if rotate_x == 0.0 && factor == 1.0 {
        None
    } else {
        Some(CorrectiveTransform {
            scale: factor,
            rotate_x,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube(extent: f64) -> BoundingBox {
        BoundingBox::new([0.0, 0.0, 0.0], [extent, extent, extent])
    }

    #[test]
    fn fbx_is_z_up_by_convention() {
        let result = check_orientation("FBX", None);
        assert_eq!(result.detected_up_axis, UpAxis::Z);
        assert_eq!(result.correction_needed.unwrap().rotate_x, -90.0);
    }

    #[test]
    fn glb_with_regular_bounds_is_y_up() {
        let result = check_orientation("glb", Some(&cube(1.0)));
        assert_eq!(result.detected_up_axis, UpAxis::Y);
        assert!(result.correction_needed.is_none());
    }

    #[test]
    fn flat_deep_bounds_suggest_z_up() {
        let bbox = BoundingBox::new([0.0, 0.0, 0.0], [1.0, 0.1, 1.0]);
        let result = check_orientation("glb", Some(&bbox));
        assert_eq!(result.detected_up_axis, UpAxis::Z);
    }

    #[test]
    fn unit_inference_thresholds() {
        assert_eq!(LengthUnit::infer(250.0), LengthUnit::Millimeters);
        assert_eq!(LengthUnit::infer(45.0), LengthUnit::Centimeters);
        assert_eq!(LengthUnit::infer(5.0), LengthUnit::Inches);
        assert_eq!(LengthUnit::infer(0.2), LengthUnit::Meters);
    }

    #[test]
    fn ring_modelled_in_millimeters_fits_after_scaling() {
        let result = check_scale(&cube(200.0), Some("ring"));
        assert_eq!(result.detected_unit, LengthUnit::Millimeters);
        assert_eq!(result.suggested_scale, 0.001);
        assert!((result.scaled_max_dimension - 0.2).abs() < 1e-9);
        // 20 cm is far too large for a ring
        assert!(!result.within_range);
        assert_eq!(result.issues.len(), 1);

        let ring = check_scale(&cube(120.0), Some("Ring"));
        assert_eq!(ring.category, ProductCategory::Ring);
        assert!(!ring.within_range);

        let fits = check_scale(&BoundingBox::new([0.0; 3], [0.02, 0.02, 0.005]), Some("ring"));
        assert!(fits.within_range, "{:?}", fits.issues);
    }

    #[test]
    fn unknown_category_falls_back_to_general() {
        let result = check_scale(&cube(0.5), Some("spaceship"));
        assert_eq!(result.category, ProductCategory::General);
        assert!(result.within_range);
    }

    #[test]
    fn suggest_transform_combines_rotation_and_scale() {
        let transform = suggest_transform("fbx", &cube(150.0), None).unwrap();
        assert_eq!(transform.rotate_x, -90.0);
        assert_eq!(transform.scale, 0.001);

        assert!(suggest_transform("glb", &cube(0.2), None).is_none());
    }
}
