//! Core domain model for civic 311 issues and their geospatial enrichment.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod department;

pub use department::department_for_assignee;

pub const CRATE_NAME: &str = "civic-core";

/// Workflow state reported by the issue source.
///
/// The source is free to introduce new states, so unknown values are carried
/// through verbatim instead of failing the record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IssueStatus {
    Open,
    Acknowledged,
    Closed,
    Archived,
    Other(String),
}

impl IssueStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "open" => Self::Open,
            "acknowledged" => Self::Acknowledged,
            "closed" => Self::Closed,
            "archived" => Self::Archived,
            _ => Self::Other(raw.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Open => "Open",
            Self::Acknowledged => "Acknowledged",
            Self::Closed => "Closed",
            Self::Archived => "Archived",
            Self::Other(raw) => raw,
        }
    }
}

impl From<String> for IssueStatus {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<IssueStatus> for String {
    fn from(value: IssueStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Assignee or reporter attached to an issue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestType {
    pub id: Option<i64>,
    pub title: Option<String>,
    pub organization: Option<String>,
}

/// One reported service request, keyed by the source's stable id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueRecord {
    pub external_id: i64,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub status: IssueStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub address: Option<String>,
    pub html_url: Option<String>,
    pub url: Option<String>,
    pub comment_url: Option<String>,
    pub shortened_url: Option<String>,
    /// Raw JSON text of the source's rating object.
    pub rating: Option<String>,
    pub vote_count: i64,
    pub comment_count: i64,
    pub assignee: Person,
    pub reporter: Person,
    pub request_type: RequestType,
}

impl IssueRecord {
    /// `(lng, lat)` when both halves of the pair are present and finite.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.lng, self.lat) {
            (Some(lng), Some(lat)) if lng.is_finite() && lat.is_finite() => Some((lng, lat)),
            _ => None,
        }
    }

    /// Decode one raw payload from the issue source.
    pub fn from_payload(payload: &JsonValue) -> Result<Self, RecordMalformed> {
        let external_id = payload.get("id").and_then(JsonValue::as_i64);
        let malformed = |reason: String| RecordMalformed {
            external_id,
            reason,
        };

        let raw: RawIssue =
            serde_json::from_value(payload.clone()).map_err(|e| malformed(e.to_string()))?;
        let external_id = raw
            .id
            .ok_or_else(|| malformed("missing required field `id`".to_string()))?;

        let created_at = required_timestamp(raw.created_at.as_deref(), "created_at")
            .map_err(&malformed)?;
        let updated_at = required_timestamp(raw.updated_at.as_deref(), "updated_at")
            .map_err(&malformed)?;
        let acknowledged_at = optional_timestamp(raw.acknowledged_at.as_deref(), "acknowledged_at")
            .map_err(&malformed)?;
        let closed_at =
            optional_timestamp(raw.closed_at.as_deref(), "closed_at").map_err(&malformed)?;

        let rating = match raw.rating {
            None | Some(JsonValue::Null) => None,
            Some(value) => Some(value.to_string()),
        };

        Ok(Self {
            external_id,
            summary: non_empty(raw.summary),
            description: non_empty(raw.description),
            status: raw
                .status
                .as_deref()
                .map(IssueStatus::parse)
                .unwrap_or_else(|| IssueStatus::Other(String::new())),
            created_at,
            updated_at,
            acknowledged_at,
            closed_at,
            lat: raw.lat,
            lng: raw.lng,
            address: non_empty(raw.address),
            html_url: non_empty(raw.html_url),
            url: non_empty(raw.url),
            comment_url: non_empty(raw.comment_url),
            shortened_url: non_empty(raw.shortened_url),
            rating,
            vote_count: raw.vote_count.unwrap_or(0),
            comment_count: raw.comment_count.unwrap_or(0),
            assignee: raw.assignee.map(RawPerson::into_person).unwrap_or_default(),
            reporter: raw.reporter.map(RawPerson::into_person).unwrap_or_default(),
            request_type: raw
                .request_type
                .map(RawRequestType::into_request_type)
                .unwrap_or_default(),
        })
    }
}

/// A single fetched payload that could not be turned into an [`IssueRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed issue record (id={}): {reason}", display_id(.external_id))]
pub struct RecordMalformed {
    pub external_id: Option<i64>,
    pub reason: String,
}

fn display_id(id: &Option<i64>) -> String {
    id.map(|id| id.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[derive(Debug, Deserialize)]
struct RawIssue {
    id: Option<i64>,
    summary: Option<String>,
    description: Option<String>,
    status: Option<String>,
    created_at: Option<String>,
    updated_at: Option<String>,
    acknowledged_at: Option<String>,
    closed_at: Option<String>,
    lat: Option<f64>,
    lng: Option<f64>,
    address: Option<String>,
    html_url: Option<String>,
    url: Option<String>,
    comment_url: Option<String>,
    shortened_url: Option<String>,
    rating: Option<JsonValue>,
    vote_count: Option<i64>,
    comment_count: Option<i64>,
    assignee: Option<RawPerson>,
    reporter: Option<RawPerson>,
    request_type: Option<RawRequestType>,
}

#[derive(Debug, Deserialize)]
struct RawPerson {
    id: Option<i64>,
    name: Option<String>,
    role: Option<String>,
}

impl RawPerson {
    fn into_person(self) -> Person {
        Person {
            id: self.id,
            name: non_empty(self.name),
            role: non_empty(self.role),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawRequestType {
    id: Option<i64>,
    title: Option<String>,
    organization: Option<String>,
}

impl RawRequestType {
    fn into_request_type(self) -> RequestType {
        RequestType {
            id: self.id,
            title: non_empty(self.title),
            organization: non_empty(self.organization),
        }
    }
}

/// Drops blank strings and strips NUL characters, which text columns refuse.
fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| if s.contains('\0') { s.replace('\0', "") } else { s })
        .filter(|s| !s.trim().is_empty())
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw.trim()).map(|ts| ts.with_timezone(&Utc))
}

fn required_timestamp(raw: Option<&str>, field: &str) -> Result<DateTime<Utc>, String> {
    let raw = raw.ok_or_else(|| format!("missing required field `{field}`"))?;
    parse_timestamp(raw).map_err(|e| format!("invalid `{field}` timestamp {raw:?}: {e}"))
}

fn optional_timestamp(raw: Option<&str>, field: &str) -> Result<Option<DateTime<Utc>>, String> {
    match raw {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => parse_timestamp(s)
            .map(Some)
            .map_err(|e| format!("invalid `{field}` timestamp {s:?}: {e}")),
    }
}

/// An issue with the contextual attributes attached by the spatial join.
///
/// Layer attributes stay `None` when the issue has no coordinates or falls
/// outside every feature of that layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedIssue {
    pub issue: IssueRecord,
    pub council_district: Option<String>,
    pub councilmember: Option<String>,
    pub equity_objectid: Option<String>,
    pub equity_index: Option<String>,
    pub equity_population: Option<f64>,
    pub equity_issues_per_capita: Option<f64>,
    pub police_sector: Option<String>,
    pub police_district: Option<String>,
    pub nearby_shelter_name: Option<String>,
    /// `None` for issues without coordinates.
    pub within_10_blocks_of_shelter: Option<bool>,
    pub department: Option<String>,
}

impl EnrichedIssue {
    pub fn unenriched(issue: IssueRecord) -> Self {
        let department = issue
            .assignee
            .name
            .as_deref()
            .and_then(department_for_assignee)
            .map(ToString::to_string);
        Self {
            issue,
            council_district: None,
            councilmember: None,
            equity_objectid: None,
            equity_index: None,
            equity_population: None,
            equity_issues_per_capita: None,
            police_sector: None,
            police_district: None,
            nearby_shelter_name: None,
            within_10_blocks_of_shelter: None,
            department,
        }
    }

    pub fn homeless_related(&self) -> bool {
        let summary = self
            .issue
            .summary
            .as_deref()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let description = self
            .issue
            .description
            .as_deref()
            .unwrap_or_default()
            .to_ascii_lowercase();
        summary.contains("homeless")
            || summary.contains("someone living on")
            || description.contains("homeless")
    }

    /// First response time: the earlier of acknowledgement and closure.
    pub fn resolved_at(&self) -> Option<DateTime<Utc>> {
        match (self.issue.acknowledged_at, self.issue.closed_at) {
            (Some(a), Some(c)) => Some(a.min(c)),
            (a, c) => a.or(c),
        }
    }

    pub fn days_to_acknowledge(&self) -> Option<i64> {
        self.issue
            .acknowledged_at
            .map(|at| (at - self.issue.created_at).num_days())
    }

    pub fn days_to_close(&self) -> Option<i64> {
        self.issue
            .closed_at
            .map(|at| (at - self.issue.created_at).num_days())
    }

    pub fn district_display(&self) -> Option<String> {
        let district = self.council_district.as_deref()?;
        Some(format!(
            "{} - {}",
            district,
            self.councilmember.as_deref().unwrap_or("Unknown")
        ))
    }
}
