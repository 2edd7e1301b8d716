//! Export Materializer: parquet snapshots of the enriched issue set.
//!
//! Every file is encoded in memory and swapped into place with
//! [`write_atomic`], so a reader sees the previous snapshot or the new one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray,
    TimestampMicrosecondArray, UInt64Array,
};
use arrow_schema::{Field as ArrowField, Schema, SchemaRef};
use chrono::{DateTime, Utc};
use civic_core::EnrichedIssue;
use civic_geo::ZoneStat;
use civic_storage::{write_atomic, WrittenFile};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use uuid::Uuid;

pub const ISSUES_FILE: &str = "issues_enriched.parquet";
pub const ZONES_FILE: &str = "zone_stats.parquet";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct SnapshotPaths {
    pub issues: PathBuf,
    pub zones: PathBuf,
    pub manifest: PathBuf,
}

/// Collects a schema and its arrays column by column, keeping the two in step.
#[derive(Default)]
struct Columns {
    fields: Vec<ArrowField>,
    arrays: Vec<ArrayRef>,
}

impl Columns {
    fn push(&mut self, name: &str, nullable: bool, array: ArrayRef) {
        self.fields
            .push(ArrowField::new(name, array.data_type().clone(), nullable));
        self.arrays.push(array);
    }

    fn utf8(&mut self, name: &str, values: impl IntoIterator<Item = Option<String>>) {
        let array = StringArray::from(values.into_iter().collect::<Vec<_>>());
        self.push(name, true, Arc::new(array));
    }

    fn int64(&mut self, name: &str, nullable: bool, values: impl IntoIterator<Item = Option<i64>>) {
        let array = Int64Array::from(values.into_iter().collect::<Vec<_>>());
        self.push(name, nullable, Arc::new(array));
    }

    fn float64(&mut self, name: &str, values: impl IntoIterator<Item = Option<f64>>) {
        let array = Float64Array::from(values.into_iter().collect::<Vec<_>>());
        self.push(name, true, Arc::new(array));
    }

    fn boolean(&mut self, name: &str, nullable: bool, values: impl IntoIterator<Item = Option<bool>>) {
        let array = BooleanArray::from(values.into_iter().collect::<Vec<_>>());
        self.push(name, nullable, Arc::new(array));
    }

    fn timestamp(
        &mut self,
        name: &str,
        nullable: bool,
        values: impl IntoIterator<Item = Option<DateTime<Utc>>>,
    ) {
        let micros = values
            .into_iter()
            .map(|ts| ts.map(|ts| ts.timestamp_micros()))
            .collect::<Vec<_>>();
        let array = TimestampMicrosecondArray::from(micros).with_timezone("UTC");
        self.push(name, nullable, Arc::new(array));
    }

    fn into_batch(self, what: &str) -> Result<RecordBatch> {
        let schema: SchemaRef = Arc::new(Schema::new(self.fields));
        RecordBatch::try_new(schema, self.arrays)
            .with_context(|| format!("building {what} record batch"))
    }
}

/// Column set of the issue snapshot, independent of the rows.
pub fn issues_schema() -> Result<SchemaRef> {
    Ok(issues_batch(&[])?.schema())
}

pub fn issues_batch(issues: &[EnrichedIssue]) -> Result<RecordBatch> {
    let mut c = Columns::default();
    c.int64("external_id", false, issues.iter().map(|e| Some(e.issue.external_id)));
    c.utf8("summary", issues.iter().map(|e| e.issue.summary.clone()));
    c.utf8("description", issues.iter().map(|e| e.issue.description.clone()));
    c.utf8(
        "status",
        issues.iter().map(|e| Some(e.issue.status.as_str().to_string())),
    );
    c.timestamp("created_at", false, issues.iter().map(|e| Some(e.issue.created_at)));
    c.timestamp("updated_at", false, issues.iter().map(|e| Some(e.issue.updated_at)));
    c.timestamp("acknowledged_at", true, issues.iter().map(|e| e.issue.acknowledged_at));
    c.timestamp("closed_at", true, issues.iter().map(|e| e.issue.closed_at));
    c.timestamp("resolved_at", true, issues.iter().map(EnrichedIssue::resolved_at));
    c.int64("days_to_acknowledge", true, issues.iter().map(EnrichedIssue::days_to_acknowledge));
    c.int64("days_to_close", true, issues.iter().map(EnrichedIssue::days_to_close));
    c.float64("lat", issues.iter().map(|e| e.issue.lat));
    c.float64("lng", issues.iter().map(|e| e.issue.lng));
    c.utf8("address", issues.iter().map(|e| e.issue.address.clone()));
    c.utf8("html_url", issues.iter().map(|e| e.issue.html_url.clone()));
    c.utf8("url", issues.iter().map(|e| e.issue.url.clone()));
    c.utf8("comment_url", issues.iter().map(|e| e.issue.comment_url.clone()));
    c.utf8("shortened_url", issues.iter().map(|e| e.issue.shortened_url.clone()));
    c.utf8("rating", issues.iter().map(|e| e.issue.rating.clone()));
    c.int64("vote_count", false, issues.iter().map(|e| Some(e.issue.vote_count)));
    c.int64("comment_count", false, issues.iter().map(|e| Some(e.issue.comment_count)));
    c.int64("assignee_id", true, issues.iter().map(|e| e.issue.assignee.id));
    c.utf8("assignee_name", issues.iter().map(|e| e.issue.assignee.name.clone()));
    c.utf8("assignee_role", issues.iter().map(|e| e.issue.assignee.role.clone()));
    c.int64("reporter_id", true, issues.iter().map(|e| e.issue.reporter.id));
    c.utf8("reporter_name", issues.iter().map(|e| e.issue.reporter.name.clone()));
    c.utf8("reporter_role", issues.iter().map(|e| e.issue.reporter.role.clone()));
    c.int64("request_type_id", true, issues.iter().map(|e| e.issue.request_type.id));
    c.utf8(
        "request_type_title",
        issues.iter().map(|e| e.issue.request_type.title.clone()),
    );
    c.utf8(
        "request_type_organization",
        issues.iter().map(|e| e.issue.request_type.organization.clone()),
    );
    c.utf8("department", issues.iter().map(|e| e.department.clone()));
    c.boolean(
        "homeless_related",
        false,
        issues.iter().map(|e| Some(e.homeless_related())),
    );
    c.utf8("council_district", issues.iter().map(|e| e.council_district.clone()));
    c.utf8("councilmember", issues.iter().map(|e| e.councilmember.clone()));
    c.utf8("district_display", issues.iter().map(EnrichedIssue::district_display));
    c.utf8("equity_objectid", issues.iter().map(|e| e.equity_objectid.clone()));
    c.utf8("equity_index", issues.iter().map(|e| e.equity_index.clone()));
    c.float64("equity_population", issues.iter().map(|e| e.equity_population));
    c.float64(
        "equity_issues_per_capita",
        issues.iter().map(|e| e.equity_issues_per_capita),
    );
    c.utf8("police_sector", issues.iter().map(|e| e.police_sector.clone()));
    c.utf8("police_district", issues.iter().map(|e| e.police_district.clone()));
    c.utf8("nearby_shelter_name", issues.iter().map(|e| e.nearby_shelter_name.clone()));
    c.boolean(
        "within_10_blocks_of_shelter",
        true,
        issues.iter().map(|e| e.within_10_blocks_of_shelter),
    );
    c.into_batch("issues")
}

pub fn zones_batch(zones: &[ZoneStat]) -> Result<RecordBatch> {
    let mut c = Columns::default();
    c.utf8("layer", zones.iter().map(|z| Some(z.layer.clone())));
    c.utf8("kind", zones.iter().map(|z| Some(z.kind.as_str().to_string())));
    c.utf8("zone_id", zones.iter().map(|z| z.zone_id.clone()));
    c.float64("population", zones.iter().map(|z| z.population));
    c.push(
        "issue_count",
        false,
        Arc::new(UInt64Array::from(
            zones.iter().map(|z| z.issue_count).collect::<Vec<_>>(),
        )),
    );
    c.float64("issues_per_capita", zones.iter().map(|z| Some(z.issues_per_capita)));
    c.into_batch("zone stats")
}

pub fn encode_parquet(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)
        .context("opening parquet writer")?;
    writer.write(batch).context("writing record batch")?;
    writer.into_inner().context("closing parquet writer")
}

/// Write both parquet files, then the manifest describing them.
pub async fn write_snapshot(
    exports_dir: &Path,
    run_id: Uuid,
    issues: &[EnrichedIssue],
    zones: &[ZoneStat],
) -> Result<SnapshotPaths> {
    let paths = SnapshotPaths {
        issues: exports_dir.join(ISSUES_FILE),
        zones: exports_dir.join(ZONES_FILE),
        manifest: exports_dir.join(MANIFEST_FILE),
    };

    let issues_written = write_atomic(&paths.issues, &encode_parquet(&issues_batch(issues)?)?)
        .await
        .context("writing issue snapshot")?;
    let zones_written = write_atomic(&paths.zones, &encode_parquet(&zones_batch(zones)?)?)
        .await
        .context("writing zone stats snapshot")?;

    let manifest = SnapshotManifest {
        schema_version: SCHEMA_VERSION,
        run_id,
        generated_at: Utc::now(),
        files: vec![
            manifest_entry("issues_enriched", exports_dir, &issues_written, issues.len()),
            manifest_entry("zone_stats", exports_dir, &zones_written, zones.len()),
        ],
    };
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    write_atomic(&paths.manifest, &bytes)
        .await
        .context("writing snapshot manifest")?;

    Ok(paths)
}

fn manifest_entry(name: &str, base: &Path, written: &WrittenFile, rows: usize) -> ManifestFile {
    let rel = written
        .path
        .strip_prefix(base)
        .unwrap_or(&written.path)
        .display()
        .to_string();
    ManifestFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256: written.sha256.clone(),
        bytes: written.byte_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::Array;
    use arrow_schema::{DataType, TimeUnit};
    use chrono::TimeZone;
    use civic_core::{IssueRecord, IssueStatus, Person, RequestType};
    use civic_geo::LayerKind;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    fn enriched(id: i64, located: bool) -> EnrichedIssue {
        let created = Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).single().unwrap();
        let mut issue = EnrichedIssue::unenriched(IssueRecord {
            external_id: id,
            summary: Some("Homeless camp".into()),
            description: None,
            status: IssueStatus::Acknowledged,
            created_at: created,
            updated_at: created + chrono::Duration::days(3),
            acknowledged_at: Some(created + chrono::Duration::days(2)),
            closed_at: None,
            lat: located.then_some(47.25),
            lng: located.then_some(-122.44),
            address: None,
            html_url: None,
            url: None,
            comment_url: None,
            shortened_url: None,
            rating: None,
            vote_count: 2,
            comment_count: 0,
            assignee: Person {
                id: Some(5),
                name: Some("ES_Jane".into()),
                role: None,
            },
            reporter: Person::default(),
            request_type: RequestType::default(),
        });
        if located {
            issue.council_district = Some("D3".into());
            issue.within_10_blocks_of_shelter = Some(false);
        }
        issue
    }

    fn read_back(path: &Path) -> Vec<RecordBatch> {
        let file = std::fs::File::open(path).expect("open parquet");
        ParquetRecordBatchReaderBuilder::try_new(file)
            .expect("reader builder")
            .build()
            .expect("reader")
            .collect::<Result<Vec<_>, _>>()
            .expect("batches")
    }

    #[tokio::test]
    async fn snapshot_reads_back_with_nulls_and_manifest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zones = vec![ZoneStat {
            layer: "equity".into(),
            kind: LayerKind::EquityIndex,
            zone_id: Some("7".into()),
            population: Some(0.0),
            issue_count: 3,
            issues_per_capita: 0.0,
        }];
        let paths = write_snapshot(
            dir.path(),
            Uuid::new_v4(),
            &[enriched(1, true), enriched(2, false)],
            &zones,
        )
        .await
        .expect("snapshot");

        let batches = read_back(&paths.issues);
        let batch = &batches[0];
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.schema().fields().len(), issues_schema().unwrap().fields().len());

        let district = batch.column_by_name("council_district").expect("column");
        assert!(district.is_valid(0));
        assert!(district.is_null(1));
        let within = batch.column_by_name("within_10_blocks_of_shelter").expect("column");
        assert!(within.is_null(1));
        let summary = batch.column_by_name("description").expect("column");
        assert_eq!(summary.null_count(), 2);
        let department = batch
            .column_by_name("department")
            .expect("column")
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("utf8");
        assert_eq!(department.value(0), "Environmental Services");

        assert_eq!(read_back(&paths.zones)[0].num_rows(), 1);

        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&paths.manifest).expect("manifest")).expect("json");
        let files = manifest["files"].as_array().expect("files");
        assert_eq!(files.len(), 2);
        assert_eq!(files[0]["path"], ISSUES_FILE);
        assert_eq!(files[0]["rows"], 2);
        assert_eq!(files[0]["sha256"].as_str().map(str::len), Some(64));
    }

    #[test]
    fn empty_snapshot_keeps_the_column_set() {
        let empty = issues_batch(&[]).expect("empty batch");
        let full = issues_batch(&[enriched(1, true)]).expect("batch");
        assert_eq!(empty.schema(), full.schema());
        assert_eq!(empty.num_rows(), 0);

        let created = full.schema();
        let created = created.field_with_name("created_at").expect("field");
        assert_eq!(
            created.data_type(),
            &DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
        );
    }

    #[tokio::test]
    async fn rewrite_replaces_previous_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_snapshot(dir.path(), Uuid::new_v4(), &[enriched(1, true)], &[])
            .await
            .expect("first");
        let paths = write_snapshot(
            dir.path(),
            Uuid::new_v4(),
            &[enriched(1, true), enriched(2, true), enriched(3, false)],
            &[],
        )
        .await
        .expect("second");

        assert_eq!(read_back(&paths.issues)[0].num_rows(), 3);
        let leftovers = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
