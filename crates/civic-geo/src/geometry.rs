//! Planar polygon containment over `[lng, lat]` positions.

/// `[lng, lat]`, the GeoJSON axis order.
pub type Position = [f64; 2];

const EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min: Position,
    pub max: Position,
}

impl BoundingBox {
    fn empty() -> Self {
        Self {
            min: [f64::INFINITY, f64::INFINITY],
            max: [f64::NEG_INFINITY, f64::NEG_INFINITY],
        }
    }

    fn extend(&mut self, p: Position) {
        self.min[0] = self.min[0].min(p[0]);
        self.min[1] = self.min[1].min(p[1]);
        self.max[0] = self.max[0].max(p[0]);
        self.max[1] = self.max[1].max(p[1]);
    }

    pub fn contains(&self, p: Position) -> bool {
        p[0] >= self.min[0] - EPSILON
            && p[0] <= self.max[0] + EPSILON
            && p[1] >= self.min[1] - EPSILON
            && p[1] <= self.max[1] + EPSILON
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RingSide {
    Inside,
    Boundary,
    Outside,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    pub exterior: Vec<Position>,
    pub holes: Vec<Vec<Position>>,
}

impl Polygon {
    pub fn new(exterior: Vec<Position>, holes: Vec<Vec<Position>>) -> Self {
        Self { exterior, holes }
    }

    /// Boundary-inclusive: points on the exterior ring or on a hole's ring
    /// count as contained; points strictly inside a hole do not.
    pub fn contains(&self, p: Position) -> bool {
        match ring_side(&self.exterior, p) {
            RingSide::Outside => false,
            RingSide::Boundary => true,
            RingSide::Inside => !self
                .holes
                .iter()
                .any(|hole| ring_side(hole, p) == RingSide::Inside),
        }
    }
}

/// A polygon or multipolygon, normalised to a list of polygons.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    polygons: Vec<Polygon>,
    bbox: BoundingBox,
}

impl Geometry {
    pub fn new(polygons: Vec<Polygon>) -> Self {
        let mut bbox = BoundingBox::empty();
        for p in polygons.iter().flat_map(|poly| poly.exterior.iter()) {
            bbox.extend(*p);
        }
        Self { polygons, bbox }
    }

    pub fn polygons(&self) -> &[Polygon] {
        &self.polygons
    }

    pub fn bbox(&self) -> BoundingBox {
        self.bbox
    }

    pub fn contains(&self, lng: f64, lat: f64) -> bool {
        let p = [lng, lat];
        self.bbox.contains(p) && self.polygons.iter().any(|poly| poly.contains(p))
    }
}

fn ring_side(ring: &[Position], p: Position) -> RingSide {
    let n = ring.len();
    if n < 3 {
        return RingSide::Outside;
    }

    let mut inside = false;
    for i in 0..n {
        let a = ring[i];
        let b = ring[(i + 1) % n];
        if on_segment(p, a, b) {
            return RingSide::Boundary;
        }
        // Crossing-number test against a ray towards +lng.
        if (a[1] > p[1]) != (b[1] > p[1]) {
            let x_at = (b[0] - a[0]) * (p[1] - a[1]) / (b[1] - a[1]) + a[0];
            if p[0] < x_at {
                inside = !inside;
            }
        }
    }

    if inside {
        RingSide::Inside
    } else {
        RingSide::Outside
    }
}

fn on_segment(p: Position, a: Position, b: Position) -> bool {
    let cross = (b[0] - a[0]) * (p[1] - a[1]) - (b[1] - a[1]) * (p[0] - a[0]);
    if cross.abs() > EPSILON {
        return false;
    }
    p[0] >= a[0].min(b[0]) - EPSILON
        && p[0] <= a[0].max(b[0]) + EPSILON
        && p[1] >= a[1].min(b[1]) - EPSILON
        && p[1] <= a[1].max(b[1]) + EPSILON
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> Vec<Position> {
        vec![[x0, y0], [x1, y0], [x1, y1], [x0, y1], [x0, y0]]
    }

    #[test]
    fn interior_exterior_and_boundary() {
        let poly = Polygon::new(square(0.0, 0.0, 4.0, 4.0), vec![]);
        assert!(poly.contains([2.0, 2.0]));
        assert!(!poly.contains([5.0, 2.0]));
        assert!(!poly.contains([-0.5, -0.5]));
        assert!(poly.contains([4.0, 2.0]), "edge counts as inside");
        assert!(poly.contains([0.0, 0.0]), "vertex counts as inside");
    }

    #[test]
    fn holes_exclude_their_interior_only() {
        let poly = Polygon::new(square(0.0, 0.0, 10.0, 10.0), vec![square(4.0, 4.0, 6.0, 6.0)]);
        assert!(!poly.contains([5.0, 5.0]));
        assert!(poly.contains([4.0, 5.0]), "hole boundary belongs to the polygon");
        assert!(poly.contains([2.0, 2.0]));
    }

    #[test]
    fn concave_ring() {
        // A "U" opening upwards; the notch is outside.
        let ring = vec![
            [0.0, 0.0],
            [6.0, 0.0],
            [6.0, 6.0],
            [4.0, 6.0],
            [4.0, 2.0],
            [2.0, 2.0],
            [2.0, 6.0],
            [0.0, 6.0],
        ];
        let poly = Polygon::new(ring, vec![]);
        assert!(!poly.contains([3.0, 4.0]));
        assert!(poly.contains([1.0, 4.0]));
        assert!(poly.contains([5.0, 4.0]));
        assert!(poly.contains([3.0, 1.0]));
    }

    #[test]
    fn multipolygon_and_bbox() {
        let geometry = Geometry::new(vec![
            Polygon::new(square(0.0, 0.0, 1.0, 1.0), vec![]),
            Polygon::new(square(5.0, 5.0, 6.0, 6.0), vec![]),
        ]);
        assert!(geometry.contains(0.5, 0.5));
        assert!(geometry.contains(5.5, 5.5));
        assert!(!geometry.contains(3.0, 3.0), "inside bbox, outside both parts");
        assert_eq!(geometry.bbox().max, [6.0, 6.0]);
    }

    #[test]
    fn real_world_coordinates() {
        let geometry = Geometry::new(vec![Polygon::new(
            square(-122.46, 47.23, -122.42, 47.27),
            vec![],
        )]);
        assert!(geometry.contains(-122.44, 47.25));
        assert!(!geometry.contains(-122.40, 47.25));
    }
}
