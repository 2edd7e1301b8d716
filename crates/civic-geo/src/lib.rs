//! Polygon layers and the point-in-polygon join that enriches issues with them.

pub mod enrich;
pub mod geometry;
pub mod layer;

pub use enrich::{EnrichmentOutput, EnrichmentReport, SpatialEnricher, ZoneStat};
pub use geometry::{BoundingBox, Geometry, Polygon, Position};
pub use layer::{
    fields, load_layer, parse_layer, FieldMapping, GeoFeature, GeoLayer, GeoParseError, LayerKind,
};

pub const CRATE_NAME: &str = "civic-geo";
