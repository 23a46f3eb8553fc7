//! Mirror surface prescriptions and ideal panel-ring geometry.

use nalgebra::Vector3;
use pas_kinematics::PanelKind;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::GeometryError;

/// The mirrors panels can live on.
///
/// The test bench carries two outer-ring primary panels and duplicates the
/// primary geometry wholesale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MirrorId {
    Primary,
    Secondary,
    TestBench,
}

impl MirrorId {
    /// The leading digit of a panel position.
    pub fn position(self) -> u32 {
        match self {
            MirrorId::Primary => 1,
            MirrorId::Secondary => 2,
            MirrorId::TestBench => 3,
        }
    }

    pub fn prescription(self) -> &'static Prescription {
        match self {
            MirrorId::Primary | MirrorId::TestBench => &PRIMARY,
            MirrorId::Secondary => &SECONDARY,
        }
    }
}

impl TryFrom<u32> for MirrorId {
    type Error = GeometryError;
    fn try_from(value: u32) -> Result<Self, GeometryError> {
        match value {
            1 => Ok(MirrorId::Primary),
            2 => Ok(MirrorId::Secondary),
            3 => Ok(MirrorId::TestBench),
            other => Err(GeometryError::InvalidMirror(other)),
        }
    }
}

impl fmt::Display for MirrorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MirrorId::Primary => "primary",
            MirrorId::Secondary => "secondary",
            MirrorId::TestBench => "test bench",
        };
        write!(f, "{name}")
    }
}

/// Ideal geometry of one panel ring.
#[derive(Debug, Clone)]
pub struct RingGeometry {
    pub kind: PanelKind,
    /// Panels in the full ring; always a multiple of the 4 quadrants.
    pub panels: u32,
    /// Pad coordinates of the reference panel in the mirror frame, bottom pad
    /// first [mm].
    pub pads: [Vector3<f64>; 3],
}

impl RingGeometry {
    pub fn quadrant_panels(&self) -> u32 {
        self.panels / 4
    }
    /// Azimuthal width of one panel [rad].
    pub fn panel_width(&self) -> f64 {
        2. * std::f64::consts::PI / self.panels as f64
    }
}

/// An even-polynomial aspheric surface, rotationally symmetric about z:
/// `z(r) = z0 + c1 r^2 + c2 r^4`.
#[derive(Debug, Clone)]
pub struct Prescription {
    /// Surface vertex height in the mirror frame [mm].
    pub vertex: f64,
    /// Sag coefficients for r^2 and r^4 [mm^-1, mm^-3].
    pub coeffs: [f64; 2],
    /// Mirror aperture [mm].
    pub diameter: f64,
    /// Inner and outer panel rings.
    pub rings: [RingGeometry; 2],
}

impl Prescription {
    /// Surface height at radius `r` from the optical axis.
    pub fn sag(&self, r: f64) -> f64 {
        let r2 = r * r;
        self.vertex + self.coeffs[0] * r2 + self.coeffs[1] * r2 * r2
    }

    /// Unit surface normal at a point above/below the surface, oriented along
    /// +z.
    pub fn normal(&self, point: &Vector3<f64>) -> Vector3<f64> {
        let r = point.x.hypot(point.y);
        if r == 0. {
            return Vector3::z();
        }
        // gradient of z - sag(r)
        let slope = 2. * self.coeffs[0] * r + 4. * self.coeffs[1] * r * r * r;
        let mut n = Vector3::new(-slope * point.x / r, -slope * point.y / r, 1.).normalize();
        if n.z < 0. {
            n = -n;
        }
        n
    }

    pub fn ring(&self, ring: u32) -> Option<&RingGeometry> {
        match ring {
            1 => Some(&self.rings[0]),
            2 => Some(&self.rings[1]),
            _ => None,
        }
    }
}

// The ideal pad coordinates below are the as-designed values in each mirror's
// own frame; the secondary values have the vertex distance already taken out.
// The sag coefficients reproduce the pad heights across both rings to better
// than a millimetre, which is all the frame precomputation consumes.

static PRIMARY: Prescription = Prescription {
    vertex: 0.,
    coeffs: [1.9985e-5, -5.85e-14],
    diameter: 9664.,
    rings: [
        RingGeometry {
            kind: PanelKind::P1,
            panels: 16,
            pads: [
                Vector3::new(2507.1922, 0., 123.3165),
                Vector3::new(2984.3973, 277.1281, 175.0409),
                Vector3::new(2984.3973, -277.1281, 175.0409),
            ],
        },
        RingGeometry {
            kind: PanelKind::P2,
            panels: 32,
            pads: [
                Vector3::new(3816.1544, 0., 279.1626),
                Vector3::new(4290.9753, 277.1281, 349.4850),
                Vector3::new(4290.9753, -277.1281, 349.4850),
            ],
        },
    ],
};

static SECONDARY: Prescription = Prescription {
    vertex: 0.,
    coeffs: [-7.462e-5, -6.924e-13],
    diameter: 5402.,
    rings: [
        RingGeometry {
            kind: PanelKind::S1,
            panels: 8,
            pads: [
                Vector3::new(799.9935, 0., -48.04048),
                Vector3::new(1273.1926, 277.1281, -128.562789),
                Vector3::new(1273.1926, -277.1281, -128.562789),
            ],
        },
        RingGeometry {
            kind: PanelKind::S2,
            panels: 16,
            pads: [
                Vector3::new(1878.2451, 0., -270.118868),
                Vector3::new(2332.1339, 277.1281, -426.275059),
                Vector3::new(2332.1339, -277.1281, -426.275059),
            ],
        },
    ],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sag_reproduces_pad_heights() {
        for mirror in [MirrorId::Primary, MirrorId::Secondary] {
            let p = mirror.prescription();
            for ring in &p.rings {
                for pad in &ring.pads {
                    let r = pad.x.hypot(pad.y);
                    assert!(
                        (p.sag(r) - pad.z).abs() < 1.,
                        "{mirror} {:?}: sag({r}) = {} vs pad z {}",
                        ring.kind,
                        p.sag(r),
                        pad.z
                    );
                }
            }
        }
    }

    #[test]
    fn normal_is_unit_and_upward() {
        let p = MirrorId::Primary.prescription();
        let n = p.normal(&Vector3::new(3000., 500., 0.));
        assert!((n.norm() - 1.).abs() < 1e-12);
        assert!(n.z > 0.);
        // concave primary tilts the normal back towards the axis
        assert!(n.x < 0.);
        assert!(n.y < 0.);
    }

    #[test]
    fn on_axis_normal_is_z() {
        let p = MirrorId::Secondary.prescription();
        assert_eq!(p.normal(&Vector3::zeros()), Vector3::z());
    }

    #[test]
    fn ring_lookup() {
        let p = MirrorId::Primary.prescription();
        assert_eq!(p.ring(1).map(|r| r.panels), Some(16));
        assert_eq!(p.ring(2).map(|r| r.panels), Some(32));
        assert!(p.ring(3).is_none());
        assert_eq!(p.ring(2).map(|r| r.quadrant_panels()), Some(8));
    }
}
