use serde::{Deserialize, Serialize};

/// Ellipse in fractional image coordinates.
///
/// `cx` and `rx` are fractions of the image width, `cy` and `ry` fractions of
/// the image height, so the same region applies at any resolution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EllipseRegion {
    pub cx: f64,
    pub cy: f64,
    pub rx: f64,
    pub ry: f64,
}

impl EllipseRegion {
    pub fn new(cx: f64, cy: f64, rx: f64, ry: f64) -> Self {
        Self { cx, cy, rx, ry }
    }

    /// Shrinks the vertical radius and moves the centre up.
    ///
    /// The centre is never moved above the top edge.
    pub fn shrunk(self, ry_factor: f64, cy_shift: f64) -> Self {
        Self {
            cx: self.cx,
            cy: (self.cy - cy_shift).max(0.0),
            rx: self.rx,
            ry: self.ry * ry_factor,
        }
    }
}

/// Location of an edit, as supplied by the caller.
///
/// Accepts `{cx, cy, rx, ry}` ellipses and `{cx, cy, r}` circles (also the
/// older `{x, y, radius}` spelling). A circle radius is a fraction of the
/// image width on both axes so it renders round.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegionDescriptor {
    Ellipse {
        cx: f64,
        cy: f64,
        rx: f64,
        ry: f64,
    },
    Circle {
        #[serde(alias = "x")]
        cx: f64,
        #[serde(alias = "y")]
        cy: f64,
        #[serde(alias = "radius")]
        r: f64,
    },
}

impl RegionDescriptor {
    pub fn ellipse(cx: f64, cy: f64, rx: f64, ry: f64) -> Self {
        Self::Ellipse { cx, cy, rx, ry }
    }

    pub fn circle(cx: f64, cy: f64, r: f64) -> Self {
        Self::Circle { cx, cy, r }
    }

    /// Resolves the descriptor against an image of the given size.
    pub fn to_ellipse(&self, width: u32, height: u32) -> EllipseRegion {
        match *self {
            Self::Ellipse { cx, cy, rx, ry } => EllipseRegion { cx, cy, rx, ry },
            Self::Circle { cx, cy, r } => {
                let aspect = if height == 0 {
                    1.0
                } else {
                    f64::from(width) / f64::from(height)
                };
                EllipseRegion {
                    cx,
                    cy,
                    rx: r,
                    ry: r * aspect,
                }
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let (cx, cy, radii) = match *self {
            Self::Ellipse { cx, cy, rx, ry } => (cx, cy, vec![rx, ry]),
            Self::Circle { cx, cy, r } => (cx, cy, vec![r]),
        };
        if !cx.is_finite() || !cy.is_finite() {
            anyhow::bail!("region centre must be finite (cx={cx}, cy={cy})");
        }
        if radii.iter().any(|radius| !radius.is_finite() || *radius <= 0.0) {
            anyhow::bail!("region radii must be positive fractions ({radii:?})");
        }
        Ok(())
    }
}

impl From<EllipseRegion> for RegionDescriptor {
    fn from(value: EllipseRegion) -> Self {
        Self::Ellipse {
            cx: value.cx,
            cy: value.cy,
            rx: value.rx,
            ry: value.ry,
        }
    }
}

/// Rectangle in fractional image coordinates whose pixels must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PreserveRect {
    pub x: f64,
    pub y: f64,
    #[serde(alias = "width")]
    pub w: f64,
    #[serde(alias = "height")]
    pub h: f64,
}

impl PreserveRect {
    pub fn new(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self { x, y, w, h }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let values = [self.x, self.y, self.w, self.h];
        if values.iter().any(|value| !value.is_finite()) {
            anyhow::bail!("preserve region must be finite ({values:?})");
        }
        if self.w <= 0.0 || self.h <= 0.0 {
            anyhow::bail!(
                "preserve region needs a positive size (w={}, h={})",
                self.w,
                self.h
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{EllipseRegion, PreserveRect, RegionDescriptor};

    #[test]
    fn parses_ellipse_and_circle_forms() -> anyhow::Result<()> {
        let ellipse: RegionDescriptor =
            serde_json::from_value(json!({"cx": 0.15, "cy": 0.7, "rx": 0.05, "ry": 0.07}))?;
        assert_eq!(ellipse, RegionDescriptor::ellipse(0.15, 0.7, 0.05, 0.07));

        let circle: RegionDescriptor =
            serde_json::from_value(json!({"cx": 0.38, "cy": 0.72, "r": 0.08}))?;
        assert_eq!(circle, RegionDescriptor::circle(0.38, 0.72, 0.08));

        let legacy: RegionDescriptor =
            serde_json::from_value(json!({"x": 0.15, "y": 0.78, "radius": 0.07}))?;
        assert_eq!(legacy, RegionDescriptor::circle(0.15, 0.78, 0.07));
        Ok(())
    }

    #[test]
    fn circle_resolves_round_against_aspect() {
        let region = RegionDescriptor::circle(0.5, 0.5, 0.1).to_ellipse(2000, 1000);
        assert_eq!(region.rx, 0.1);
        assert!((region.ry - 0.2).abs() < 1e-12);
        assert!((region.rx * 2000.0 - region.ry * 1000.0).abs() < 1e-9);
    }

    #[test]
    fn shrunk_moves_up_and_narrows_vertically() {
        let region = EllipseRegion::new(0.4, 0.6, 0.1, 0.2).shrunk(0.85, 0.02);
        assert_eq!(region.rx, 0.1);
        assert!((region.ry - 0.17).abs() < 1e-12);
        assert!((region.cy - 0.58).abs() < 1e-12);

        let top = EllipseRegion::new(0.4, 0.01, 0.1, 0.2).shrunk(0.85, 0.02);
        assert_eq!(top.cy, 0.0);
    }

    #[test]
    fn validation_rejects_degenerate_shapes() {
        assert!(RegionDescriptor::ellipse(0.5, 0.5, 0.0, 0.1)
            .validate()
            .is_err());
        assert!(RegionDescriptor::circle(f64::NAN, 0.5, 0.1)
            .validate()
            .is_err());
        assert!(RegionDescriptor::circle(0.5, 0.5, 0.1).validate().is_ok());
        assert!(PreserveRect::new(0.1, 0.1, 0.0, 0.2).validate().is_err());
        assert!(PreserveRect::new(0.1, 0.78, 0.1, 0.08).validate().is_ok());
    }
}
