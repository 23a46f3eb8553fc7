//! Panel position encoding and ring topology.
//!
//! A panel position is a 4-digit number `<mirror><quadrant><ring><panel>`,
//! e.g. `1221` for primary, quadrant 2, ring 2, panel 1. A ring of N panels
//! across the 4 quadrants forms a cyclic group of order N, represented in
//! base B = N/4; panel numbering increases in the direction opposite to a
//! positive (+z) rotation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{GeometryError, MirrorId};

/// Sense of travel around a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// With a +z rotation; panel numbering decreases this way.
    Positive,
    /// Against a +z rotation; panel numbering increases this way.
    Negative,
}

impl Direction {
    pub fn reversed(self) -> Self {
        match self {
            Direction::Positive => Direction::Negative,
            Direction::Negative => Direction::Positive,
        }
    }
}

/// A validated panel position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PanelPosition(u32);

impl PanelPosition {
    pub fn new(
        mirror: MirrorId,
        quadrant: u32,
        ring: u32,
        panel: u32,
    ) -> Result<Self, GeometryError> {
        Self::from_raw(mirror.position() * 1000 + quadrant * 100 + ring * 10 + panel)
    }

    pub fn from_raw(raw: u32) -> Result<Self, GeometryError> {
        let pos = Self(raw);
        let mirror = MirrorId::try_from(raw / 1000)?;
        let ring = mirror
            .prescription()
            .ring(pos.ring())
            .ok_or(GeometryError::InvalidPosition(raw))?;
        if pos.quadrant() < 1
            || pos.quadrant() > 4
            || pos.panel() < 1
            || pos.panel() > ring.quadrant_panels()
        {
            return Err(GeometryError::InvalidPosition(raw));
        }
        Ok(pos)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
    pub fn mirror(self) -> MirrorId {
        // validated at construction
        match self.0 / 1000 {
            1 => MirrorId::Primary,
            2 => MirrorId::Secondary,
            _ => MirrorId::TestBench,
        }
    }
    pub fn quadrant(self) -> u32 {
        self.0 / 100 % 10
    }
    pub fn ring(self) -> u32 {
        self.0 / 10 % 10
    }
    pub fn panel(self) -> u32 {
        self.0 % 10
    }

    /// Panels in this position's full ring.
    pub fn ring_panels(self) -> u32 {
        // ring validated at construction
        self.mirror()
            .prescription()
            .ring(self.ring())
            .map(|r| r.panels)
            .unwrap_or(0)
    }

    /// Zero-based index within the cyclic ring group.
    pub fn ring_index(self) -> u32 {
        let base = self.ring_panels() / 4;
        (self.quadrant() - 1) * base + self.panel() - 1
    }

    fn from_ring_index(self, index: u32) -> PanelPosition {
        let base = self.ring_panels() / 4;
        let quadrant = index / base + 1;
        let panel = index % base + 1;
        PanelPosition(self.0 / 1000 * 1000 + quadrant * 100 + self.ring() * 10 + panel)
    }

    /// The next panel around the ring in the given direction.
    pub fn neighbor(self, dir: Direction) -> PanelPosition {
        let n = self.ring_panels();
        let index = match dir {
            Direction::Positive => (self.ring_index() + n - 1) % n,
            Direction::Negative => (self.ring_index() + 1) % n,
        };
        self.from_ring_index(index)
    }
}

impl fmt::Display for PanelPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An edge between neighboring panels, addressed as their positions joined
/// by `+` in ascending order, e.g. `1211+1212`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    panels: Vec<PanelPosition>,
}

impl Edge {
    pub fn between(a: PanelPosition, b: PanelPosition) -> Self {
        let mut panels = vec![a, b];
        panels.sort();
        Self { panels }
    }

    pub fn panels(&self) -> &[PanelPosition] {
        &self.panels
    }

    fn ring_pair(&self) -> Result<(PanelPosition, PanelPosition), GeometryError> {
        if self.panels.len() != 2 {
            return Err(GeometryError::InvalidEdge(self.to_string()));
        }
        let (a, b) = (self.panels[0], self.panels[1]);
        if a.ring() != b.ring() || a.mirror() != b.mirror() {
            return Err(GeometryError::NotRingAdjacent(a.as_u32(), b.as_u32()));
        }
        Ok((a, b))
    }

    /// The two panels ordered along `dir`: the trailing panel first (the one
    /// visited earlier going in `dir`), the leading panel second.
    pub fn ordered_panels(
        &self,
        dir: Direction,
    ) -> Result<(PanelPosition, PanelPosition), GeometryError> {
        let (a, b) = self.ring_pair()?;
        let n = a.ring_panels();
        let step = match dir {
            Direction::Positive => n - 1,
            Direction::Negative => 1,
        };
        if (a.ring_index() + step) % n == b.ring_index() {
            Ok((a, b))
        } else if (b.ring_index() + step) % n == a.ring_index() {
            Ok((b, a))
        } else {
            Err(GeometryError::NotRingAdjacent(a.as_u32(), b.as_u32()))
        }
    }

    /// The next ring edge in the given direction, sharing its leading panel.
    pub fn ring_neighbor(&self, dir: Direction) -> Result<Edge, GeometryError> {
        let (_, leading) = self.ordered_panels(dir)?;
        Ok(Edge::between(leading, leading.neighbor(dir)))
    }
}

impl FromStr for Edge {
    type Err = GeometryError;
    fn from_str(s: &str) -> Result<Self, GeometryError> {
        let panels = s
            .split('+')
            .map(|part| {
                part.trim()
                    .parse::<u32>()
                    .map_err(|_| GeometryError::InvalidEdge(s.into()))
                    .and_then(PanelPosition::from_raw)
            })
            .collect::<Result<Vec<_>, _>>()?;
        if panels.len() < 2 || panels.len() > 3 {
            return Err(GeometryError::InvalidEdge(s.into()));
        }
        let mut sorted = panels.clone();
        sorted.sort();
        Ok(Edge { panels: sorted })
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for p in &self.panels {
            if !first {
                write!(f, "+")?;
            }
            write!(f, "{p}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(raw: u32) -> PanelPosition {
        PanelPosition::from_raw(raw).unwrap()
    }

    #[test]
    fn position_digits() {
        let p = pos(1224);
        assert_eq!(p.mirror(), MirrorId::Primary);
        assert_eq!(p.quadrant(), 2);
        assert_eq!(p.ring(), 2);
        assert_eq!(p.panel(), 4);
        assert_eq!(p.ring_panels(), 32);
        assert_eq!(p.ring_index(), 11);
    }

    #[test]
    fn invalid_positions_are_rejected() {
        assert!(PanelPosition::from_raw(4111).is_err()); // no such mirror
        assert!(PanelPosition::from_raw(1511).is_err()); // no such quadrant
        assert!(PanelPosition::from_raw(1131).is_err()); // no such ring
        assert!(PanelPosition::from_raw(1115).is_err()); // P1 quadrants hold 4
        assert!(PanelPosition::from_raw(2113).is_err()); // S1 quadrants hold 2
        assert!(PanelPosition::from_raw(2122).is_ok());
    }

    #[test]
    fn neighbors_wrap_across_quadrants() {
        // negative direction increases numbering
        assert_eq!(pos(1114).neighbor(Direction::Negative), pos(1121));
        assert_eq!(pos(1121).neighbor(Direction::Positive), pos(1114));
        // and wraps around the full ring
        assert_eq!(pos(1444).neighbor(Direction::Negative), pos(1111));
        assert_eq!(pos(1111).neighbor(Direction::Positive), pos(1444));
    }

    #[test]
    fn neighbor_round_trip_covers_the_ring() {
        let start = pos(2211);
        let mut cur = start;
        for _ in 0..start.ring_panels() {
            cur = cur.neighbor(Direction::Negative);
        }
        assert_eq!(cur, start);
    }

    #[test]
    fn edge_address_is_sorted() {
        let e = Edge::between(pos(1112), pos(1111));
        assert_eq!(e.to_string(), "1111+1112");
        assert_eq!("1112 + 1111".parse::<Edge>().unwrap(), e);
        assert!("1111".parse::<Edge>().is_err());
        assert!("1111+bogus".parse::<Edge>().is_err());
    }

    #[test]
    fn ordered_panels_follow_direction() {
        let e = Edge::between(pos(1111), pos(1112));
        // negative travel visits 1111 before 1112
        assert_eq!(
            e.ordered_panels(Direction::Negative).unwrap(),
            (pos(1111), pos(1112))
        );
        assert_eq!(
            e.ordered_panels(Direction::Positive).unwrap(),
            (pos(1112), pos(1111))
        );
        // the wrap-around edge orders against raw numbering
        let wrap = Edge::between(pos(1444), pos(1111));
        assert_eq!(
            wrap.ordered_panels(Direction::Negative).unwrap(),
            (pos(1444), pos(1111))
        );
    }

    #[test]
    fn ring_neighbor_walks_the_ring() {
        let e = Edge::between(pos(1111), pos(1112));
        let next = e.ring_neighbor(Direction::Negative).unwrap();
        assert_eq!(next, Edge::between(pos(1112), pos(1113)));
        let prev = e.ring_neighbor(Direction::Positive).unwrap();
        assert_eq!(prev, Edge::between(pos(1444), pos(1111)));
    }

    #[test]
    fn cross_ring_edges_have_no_ring_order() {
        let e = Edge::between(pos(1111), pos(1211));
        assert!(e.ordered_panels(Direction::Negative).is_err());
    }
}
