//! Loading polygon feature collections into queryable layers.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

use crate::geometry::{Geometry, Polygon, Position};

/// Output field names the enrichment engine reads from layer attributes.
pub mod fields {
    pub const COUNCIL_DISTRICT: &str = "council_district";
    pub const COUNCILMEMBER: &str = "councilmember";
    pub const EQUITY_OBJECTID: &str = "equity_objectid";
    pub const EQUITY_INDEX: &str = "equity_index";
    pub const POPULATION: &str = "population";
    pub const POLICE_SECTOR: &str = "police_sector";
    pub const POLICE_DISTRICT: &str = "police_district";
    pub const SHELTER_NAME: &str = "shelter_name";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    CouncilDistrict,
    EquityIndex,
    PoliceSector,
    ShelterBuffer,
}

impl LayerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CouncilDistrict => "council_district",
            Self::EquityIndex => "equity_index",
            Self::PoliceSector => "police_sector",
            Self::ShelterBuffer => "shelter_buffer",
        }
    }

    /// Renaming table used when the layer registry does not supply one.
    pub fn default_fields(self) -> Vec<FieldMapping> {
        let pairs: &[(&str, &str)] = match self {
            Self::CouncilDistrict => &[
                ("district", fields::COUNCIL_DISTRICT),
                ("councilmember", fields::COUNCILMEMBER),
            ],
            Self::EquityIndex => &[
                ("objectid", fields::EQUITY_OBJECTID),
                ("equityindex", fields::EQUITY_INDEX),
                ("population", fields::POPULATION),
            ],
            Self::PoliceSector => &[
                ("sector", fields::POLICE_SECTOR),
                ("district", fields::POLICE_DISTRICT),
            ],
            Self::ShelterBuffer => &[("name", fields::SHELTER_NAME)],
        };
        pairs
            .iter()
            .map(|(source, target)| FieldMapping::new(*source, *target))
            .collect()
    }

    /// Attribute identifying a zone in per-zone statistics.
    pub fn zone_key(self) -> &'static str {
        match self {
            Self::CouncilDistrict => fields::COUNCIL_DISTRICT,
            Self::EquityIndex => fields::EQUITY_OBJECTID,
            Self::PoliceSector => fields::POLICE_SECTOR,
            Self::ShelterBuffer => fields::SHELTER_NAME,
        }
    }
}

/// Source property name to output field name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source: String,
    pub target: String,
}

impl FieldMapping {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeoFeature {
    pub geometry: Geometry,
    /// Keyed by output field name; every mapped field is present, `Null` when
    /// the source property was missing.
    pub attributes: BTreeMap<String, JsonValue>,
}

impl GeoFeature {
    pub fn attr(&self, key: &str) -> Option<&JsonValue> {
        self.attributes.get(key).filter(|v| !v.is_null())
    }

    /// Strings pass through; numbers and booleans are rendered.
    pub fn attr_string(&self, key: &str) -> Option<String> {
        match self.attr(key)? {
            JsonValue::String(s) if s.trim().is_empty() => None,
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            JsonValue::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn attr_f64(&self, key: &str) -> Option<f64> {
        let value = match self.attr(key)? {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        value.filter(|v| v.is_finite())
    }
}

/// A named, read-only collection of features.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoLayer {
    pub name: String,
    pub kind: LayerKind,
    pub fields: Vec<FieldMapping>,
    pub features: Vec<GeoFeature>,
}

impl GeoLayer {
    pub fn maps_field(&self, target: &str) -> bool {
        self.fields.iter().any(|f| f.target == target)
    }

    /// First feature containing the point. Features inside a layer are
    /// assumed not to overlap, so which of several matches wins is unspecified
    /// beyond "first in file order".
    pub fn locate(&self, lng: f64, lat: f64) -> Option<usize> {
        self.features
            .iter()
            .position(|f| f.geometry.contains(lng, lat))
    }
}

#[derive(Debug, Error)]
pub enum GeoParseError {
    #[error("reading layer file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("layer {layer}: invalid JSON: {source}")]
    Json {
        layer: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("layer {layer}: feature collection has no \"features\" array")]
    MissingFeatures { layer: String },
    #[error("layer {layer}, feature {index}: {reason}")]
    InvalidGeometry {
        layer: String,
        index: usize,
        reason: String,
    },
    #[error("layer {layer}, feature {index}: unsupported geometry type {geometry_type:?}")]
    UnsupportedGeometry {
        layer: String,
        index: usize,
        geometry_type: String,
    },
}

pub fn load_layer(
    path: impl AsRef<Path>,
    name: &str,
    kind: LayerKind,
    fields: &[FieldMapping],
) -> Result<GeoLayer, GeoParseError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| GeoParseError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let layer = parse_layer(&text, name, kind, fields)?;
    info!(
        layer = name,
        kind = kind.as_str(),
        features = layer.features.len(),
        path = %path.display(),
        "loaded geo layer"
    );
    Ok(layer)
}

pub fn parse_layer(
    text: &str,
    name: &str,
    kind: LayerKind,
    fields: &[FieldMapping],
) -> Result<GeoLayer, GeoParseError> {
    let root: JsonValue = serde_json::from_str(text).map_err(|source| GeoParseError::Json {
        layer: name.to_string(),
        source,
    })?;
    let raw_features = root
        .get("features")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| GeoParseError::MissingFeatures {
            layer: name.to_string(),
        })?;

    let mut features = Vec::with_capacity(raw_features.len());
    for (index, raw) in raw_features.iter().enumerate() {
        let geometry = match raw.get("geometry") {
            None | Some(JsonValue::Null) => {
                warn!(layer = name, index, "feature without geometry skipped");
                continue;
            }
            Some(g) => parse_geometry(g).map_err(|err| err.into_parse_error(name, index))?,
        };

        let properties = raw.get("properties").and_then(JsonValue::as_object);
        let attributes = fields
            .iter()
            .map(|mapping| {
                let value = properties
                    .and_then(|p| p.get(&mapping.source))
                    .cloned()
                    .unwrap_or(JsonValue::Null);
                (mapping.target.clone(), value)
            })
            .collect();

        features.push(GeoFeature {
            geometry,
            attributes,
        });
    }

    Ok(GeoLayer {
        name: name.to_string(),
        kind,
        fields: fields.to_vec(),
        features,
    })
}

enum GeometryError {
    Invalid(String),
    Unsupported(String),
}

impl GeometryError {
    fn into_parse_error(self, layer: &str, index: usize) -> GeoParseError {
        match self {
            Self::Invalid(reason) => GeoParseError::InvalidGeometry {
                layer: layer.to_string(),
                index,
                reason,
            },
            Self::Unsupported(geometry_type) => GeoParseError::UnsupportedGeometry {
                layer: layer.to_string(),
                index,
                geometry_type,
            },
        }
    }
}

fn parse_geometry(value: &JsonValue) -> Result<Geometry, GeometryError> {
    let geometry_type = value
        .get("type")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| GeometryError::Invalid("geometry has no \"type\"".to_string()))?;
    let coordinates = value
        .get("coordinates")
        .ok_or_else(|| GeometryError::Invalid("geometry has no \"coordinates\"".to_string()))?;

    let polygons = match geometry_type {
        "Polygon" => vec![parse_polygon(coordinates)?],
        "MultiPolygon" => coordinates
            .as_array()
            .ok_or_else(|| GeometryError::Invalid("MultiPolygon coordinates must be an array".into()))?
            .iter()
            .map(parse_polygon)
            .collect::<Result<Vec<_>, _>>()?,
        other => return Err(GeometryError::Unsupported(other.to_string())),
    };
    if polygons.is_empty() {
        return Err(GeometryError::Invalid("geometry has no polygons".to_string()));
    }
    Ok(Geometry::new(polygons))
}

fn parse_polygon(value: &JsonValue) -> Result<Polygon, GeometryError> {
    let rings = value
        .as_array()
        .ok_or_else(|| GeometryError::Invalid("polygon must be an array of rings".into()))?
        .iter()
        .map(parse_ring)
        .collect::<Result<Vec<_>, _>>()?;
    let mut rings = rings.into_iter();
    let exterior = rings
        .next()
        .ok_or_else(|| GeometryError::Invalid("polygon has no exterior ring".into()))?;
    Ok(Polygon::new(exterior, rings.collect()))
}

fn parse_ring(value: &JsonValue) -> Result<Vec<Position>, GeometryError> {
    let ring = value
        .as_array()
        .ok_or_else(|| GeometryError::Invalid("ring must be an array of positions".into()))?
        .iter()
        .map(parse_position)
        .collect::<Result<Vec<_>, _>>()?;
    if ring.len() < 3 {
        return Err(GeometryError::Invalid(format!(
            "ring has {} positions, need at least 3",
            ring.len()
        )));
    }
    Ok(ring)
}

fn parse_position(value: &JsonValue) -> Result<Position, GeometryError> {
    let coords = value
        .as_array()
        .filter(|c| c.len() >= 2)
        .ok_or_else(|| GeometryError::Invalid("position must have at least 2 numbers".into()))?;
    match (coords[0].as_f64(), coords[1].as_f64()) {
        (Some(lng), Some(lat)) if lng.is_finite() && lat.is_finite() => Ok([lng, lat]),
        _ => Err(GeometryError::Invalid(format!("non-numeric position {value}"))),
    }
}
