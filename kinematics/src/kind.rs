use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The panel families, each with its own pad-normal table.
///
/// `Opt` is the flat optical-table payload used on test benches; its pads sit
/// squarely on the platform so all normals are -z.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PanelKind {
    /// Primary mirror, inner ring
    P1,
    /// Primary mirror, outer ring
    P2,
    /// Secondary mirror, inner ring
    S1,
    /// Secondary mirror, outer ring
    S2,
    /// Flat optical table
    Opt,
}

// Surface normals at the pad locations, one row per pad in actuator winding
// order, expressed in the pad frame: x from the bottom pad to the pad
// barycenter, z perpendicular to the pad plane towards the panel, y = z ^ x.
// The normals point out of the back surface of the panel, towards the base.
// 15 decimal places, the most a double resolves.
const P1_NORMS: [[f64; 3]; 3] = [
    [
        5.097668129476970e-3,
        1.047654179548714e-2,
        -9.999321256223591e-1,
    ],
    [
        -1.139023920803046e-2,
        0.000000000000000e0,
        -9.999351291212767e-1,
    ],
    [
        5.097668129476970e-3,
        -1.047654179548714e-2,
        -9.999321256223591e-1,
    ],
];
const P2_NORMS: [[f64; 3]; 3] = [
    [
        2.282953930408088e-3,
        9.607558782302985e-3,
        -9.999512402790428e-1,
    ],
    [
        -8.576078760768602e-3,
        0.000000000000000e0,
        -9.999632247603353e-1,
    ],
    [
        2.282953930408088e-3,
        -9.607558782302985e-3,
        -9.999512402790428e-1,
    ],
];
const S1_NORMS: [[f64; 3]; 3] = [
    [
        2.416787326798328e-2,
        4.165752266588766e-2,
        -9.988396091000016e-1,
    ],
    [
        -4.825925442124093e-2,
        0.000000000000000e0,
        -9.988348433863861e-1,
    ],
    [
        2.416787326798328e-2,
        -4.165752266588766e-2,
        -9.988396091000016e-1,
    ],
];
const S2_NORMS: [[f64; 3]; 3] = [
    [
        2.207153924068211e-2,
        4.109652812313958e-2,
        -9.989113687068392e-1,
    ],
    [
        -4.637346218008032e-2,
        0.000000000000000e0,
        -9.989241723000966e-1,
    ],
    [
        2.207153924068211e-2,
        -4.109652812313958e-2,
        -9.989113687068392e-1,
    ],
];
const OPT_NORMS: [[f64; 3]; 3] = [[0., 0., -1.], [0., 0., -1.], [0., 0., -1.]];

impl PanelKind {
    /// Pad-frame surface normals at the pad locations, in actuator winding
    /// order.
    pub fn pad_normals(self) -> [Vector3<f64>; 3] {
        let table = match self {
            PanelKind::P1 => &P1_NORMS,
            PanelKind::P2 => &P2_NORMS,
            PanelKind::S1 => &S1_NORMS,
            PanelKind::S2 => &S2_NORMS,
            PanelKind::Opt => &OPT_NORMS,
        };
        [
            Vector3::from_column_slice(&table[0]),
            Vector3::from_column_slice(&table[1]),
            Vector3::from_column_slice(&table[2]),
        ]
    }
}

impl fmt::Display for PanelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PanelKind::P1 => "P1",
            PanelKind::P2 => "P2",
            PanelKind::S1 => "S1",
            PanelKind::S2 => "S2",
            PanelKind::Opt => "OPT",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_normals_are_unit_vectors() {
        for kind in [
            PanelKind::P1,
            PanelKind::P2,
            PanelKind::S1,
            PanelKind::S2,
            PanelKind::Opt,
        ] {
            for n in kind.pad_normals() {
                assert!((n.norm() - 1.).abs() < 1e-12, "{kind}: |{n}| != 1");
                assert!(n.z < 0., "{kind}: normal should point towards the base");
            }
        }
    }

    #[test]
    fn side_pads_mirror_each_other() {
        let n = PanelKind::P1.pad_normals();
        assert_eq!(n[0].x, n[2].x);
        assert_eq!(n[0].y, -n[2].y);
        assert_eq!(n[0].z, n[2].z);
    }
}
