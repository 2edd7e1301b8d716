//! Brute-force spatial join of issues against every configured layer.
//!
//! Cost is `records x features` containment tests. Municipal layers hold a
//! few hundred features and the issue table a few hundred thousand rows at
//! most; beyond that this needs a real spatial index.

use std::collections::BTreeMap;

use civic_core::{EnrichedIssue, IssueRecord};
use serde::Serialize;
use tracing::{info, warn};

use crate::layer::{fields, GeoFeature, GeoLayer, LayerKind};

const SCALE_WARNING_TESTS: usize = 50_000_000;

/// Issue count and rate for one feature of a population-bearing layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneStat {
    pub layer: String,
    pub kind: LayerKind,
    pub zone_id: Option<String>,
    pub population: Option<f64>,
    pub issue_count: u64,
    /// `0.0` when the population is missing or not positive.
    pub issues_per_capita: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentReport {
    pub total_records: usize,
    pub located_records: usize,
    pub skipped_no_coordinates: usize,
    pub within_shelter_buffer: usize,
    /// Located records that fell outside every feature, per layer name.
    pub unmatched_by_layer: BTreeMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct EnrichmentOutput {
    pub issues: Vec<EnrichedIssue>,
    pub zones: Vec<ZoneStat>,
    pub report: EnrichmentReport,
}

pub struct SpatialEnricher {
    layers: Vec<GeoLayer>,
}

impl SpatialEnricher {
    pub fn new(layers: Vec<GeoLayer>) -> Self {
        Self { layers }
    }

    pub fn layers(&self) -> &[GeoLayer] {
        &self.layers
    }

    pub fn total_features(&self) -> usize {
        self.layers.iter().map(|l| l.features.len()).sum()
    }

    pub fn enrich(&self, records: Vec<IssueRecord>) -> EnrichmentOutput {
        let total_features = self.total_features();
        if records.len().saturating_mul(total_features) > SCALE_WARNING_TESTS {
            warn!(
                records = records.len(),
                features = total_features,
                "spatial join is a linear scan; this input is past its intended size"
            );
        }

        let has_shelters = self
            .layers
            .iter()
            .any(|l| l.kind == LayerKind::ShelterBuffer);
        let mut report = EnrichmentReport {
            total_records: records.len(),
            unmatched_by_layer: self.layers.iter().map(|l| (l.name.clone(), 0)).collect(),
            ..Default::default()
        };
        // counts[layer][feature]
        let mut counts: Vec<Vec<u64>> = self
            .layers
            .iter()
            .map(|l| vec![0; l.features.len()])
            .collect();
        // (issue index, layer index, feature index) for per-capita back-fill.
        let mut equity_matches: Vec<(usize, usize, usize)> = Vec::new();

        let mut issues = Vec::with_capacity(records.len());
        for record in records {
            let coordinates = record.coordinates();
            let mut enriched = EnrichedIssue::unenriched(record);
            let Some((lng, lat)) = coordinates else {
                report.skipped_no_coordinates += 1;
                issues.push(enriched);
                continue;
            };
            report.located_records += 1;
            if has_shelters {
                enriched.within_10_blocks_of_shelter = Some(false);
            }

            for (layer_idx, layer) in self.layers.iter().enumerate() {
                let Some(feature_idx) = layer.locate(lng, lat) else {
                    *report
                        .unmatched_by_layer
                        .entry(layer.name.clone())
                        .or_default() += 1;
                    continue;
                };
                counts[layer_idx][feature_idx] += 1;
                let feature = &layer.features[feature_idx];
                apply_feature(&mut enriched, layer.kind, feature);
                if layer.kind == LayerKind::EquityIndex && enriched.equity_issues_per_capita.is_none()
                {
                    equity_matches.push((issues.len(), layer_idx, feature_idx));
                    // Placeholder until zone totals are known.
                    enriched.equity_issues_per_capita = Some(0.0);
                }
            }

            if enriched.within_10_blocks_of_shelter == Some(true) {
                report.within_shelter_buffer += 1;
            }
            issues.push(enriched);
        }

        let rates: Vec<Vec<f64>> = self
            .layers
            .iter()
            .zip(&counts)
            .map(|(layer, layer_counts)| {
                layer
                    .features
                    .iter()
                    .zip(layer_counts)
                    .map(|(feature, count)| per_capita(*count, feature.attr_f64(fields::POPULATION)))
                    .collect()
            })
            .collect();
        for (issue_idx, layer_idx, feature_idx) in equity_matches {
            issues[issue_idx].equity_issues_per_capita = Some(rates[layer_idx][feature_idx]);
        }

        let zones = self.zone_stats(&counts, &rates);

        info!(
            total = report.total_records,
            located = report.located_records,
            skipped_no_coordinates = report.skipped_no_coordinates,
            within_shelter_buffer = report.within_shelter_buffer,
            layers = self.layers.len(),
            features = total_features,
            "spatial enrichment complete"
        );

        EnrichmentOutput {
            issues,
            zones,
            report,
        }
    }

    fn zone_stats(&self, counts: &[Vec<u64>], rates: &[Vec<f64>]) -> Vec<ZoneStat> {
        let mut zones = Vec::new();
        for (layer_idx, layer) in self.layers.iter().enumerate() {
            if !layer.maps_field(fields::POPULATION) {
                continue;
            }
            for (feature_idx, feature) in layer.features.iter().enumerate() {
                zones.push(ZoneStat {
                    layer: layer.name.clone(),
                    kind: layer.kind,
                    zone_id: feature.attr_string(layer.kind.zone_key()),
                    population: feature.attr_f64(fields::POPULATION),
                    issue_count: counts[layer_idx][feature_idx],
                    issues_per_capita: rates[layer_idx][feature_idx],
                });
            }
        }
        zones
    }
}

/// Matched-issue count over population, `0.0` for empty or unknown zones.
pub fn per_capita(issue_count: u64, population: Option<f64>) -> f64 {
    match population {
        Some(p) if p > 0.0 && p.is_finite() => issue_count as f64 / p,
        _ => 0.0,
    }
}

fn set_once(slot: &mut Option<String>, value: Option<String>) {
    if slot.is_none() {
        *slot = value;
    }
}

fn apply_feature(enriched: &mut EnrichedIssue, kind: LayerKind, feature: &GeoFeature) {
    match kind {
        LayerKind::CouncilDistrict => {
            if enriched.council_district.is_none() && enriched.councilmember.is_none() {
                enriched.council_district = feature.attr_string(fields::COUNCIL_DISTRICT);
                enriched.councilmember = feature.attr_string(fields::COUNCILMEMBER);
            }
        }
        LayerKind::EquityIndex => {
            if enriched.equity_issues_per_capita.is_none() {
                set_once(&mut enriched.equity_objectid, feature.attr_string(fields::EQUITY_OBJECTID));
                set_once(&mut enriched.equity_index, feature.attr_string(fields::EQUITY_INDEX));
                if enriched.equity_population.is_none() {
                    enriched.equity_population = feature.attr_f64(fields::POPULATION);
                }
            }
        }
        LayerKind::PoliceSector => {
            if enriched.police_sector.is_none() && enriched.police_district.is_none() {
                enriched.police_sector = feature.attr_string(fields::POLICE_SECTOR);
                enriched.police_district = feature.attr_string(fields::POLICE_DISTRICT);
            }
        }
        LayerKind::ShelterBuffer => {
            enriched.within_10_blocks_of_shelter = Some(true);
            set_once(&mut enriched.nearby_shelter_name, feature.attr_string(fields::SHELTER_NAME));
        }
    }
}
