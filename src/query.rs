//! Catalog query construction and validation.
//!
//! A [`QueryBuilder`] collects filters with chained calls and is turned into an
//! immutable [`Query`] by [`QueryBuilder::build`]. All validation happens there,
//! once, without touching the network; the resulting [`Query`] can then be paged
//! through any number of times.
//!
//! ```
//! use earthaccess::{QueryBuilder, QueryKind};
//!
//! let query = QueryBuilder::granules()
//!     .short_name("ATL06")
//!     .temporal("2020-02", "2020-03")
//!     .bounding_box(-46.5, 61.0, -42.5, 63.0)
//!     .build()?;
//! assert_eq!(query.kind(), QueryKind::Granules);
//! # Ok::<(), earthaccess::Error>(())
//! ```

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde_json::Value;

use crate::daac::find_provider;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// Dataset-level records.
    Collections,
    /// File-level records.
    Granules,
}

impl QueryKind {
    pub(crate) fn endpoint(self) -> &'static str {
        match self {
            QueryKind::Collections => "search/collections.umm_json",
            QueryKind::Granules => "search/granules.umm_json",
        }
    }

    fn label(self) -> &'static str {
        match self {
            QueryKind::Collections => "collection",
            QueryKind::Granules => "granule",
        }
    }
}

/// Spatial filter. A query carries at most one geometry kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Spatial {
    Point {
        lon: f64,
        lat: f64,
    },
    BoundingBox {
        lower_left_lon: f64,
        lower_left_lat: f64,
        upper_right_lon: f64,
        upper_right_lat: f64,
    },
    /// Counter-clockwise `(lon, lat)` ring, first point repeated at the end.
    Polygon(Vec<(f64, f64)>),
    Line(Vec<(f64, f64)>),
}

impl Spatial {
    fn kind_name(&self) -> &'static str {
        match self {
            Spatial::Point { .. } => "point",
            Spatial::BoundingBox { .. } => "bounding_box",
            Spatial::Polygon(_) => "polygon",
            Spatial::Line(_) => "line",
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Spatial::Point { lon, lat } => check_coordinate(*lon, *lat),
            Spatial::BoundingBox {
                lower_left_lon,
                lower_left_lat,
                upper_right_lon,
                upper_right_lat,
            } => {
                check_coordinate(*lower_left_lon, *lower_left_lat)?;
                check_coordinate(*upper_right_lon, *upper_right_lat)?;
                // Longitudes may wrap across the antimeridian; latitudes may not.
                if lower_left_lat > upper_right_lat {
                    return Err(invalid(format!(
                        "bounding box lower-left latitude {lower_left_lat} is above upper-right latitude {upper_right_lat}"
                    )));
                }
                Ok(())
            }
            Spatial::Polygon(points) => {
                if points.len() < 4 {
                    return Err(invalid(format!(
                        "polygon needs at least 4 points, got {}",
                        points.len()
                    )));
                }
                if points.first() != points.last() {
                    return Err(invalid("polygon must be closed (first point == last point)"));
                }
                points.iter().try_for_each(|(lon, lat)| check_coordinate(*lon, *lat))
            }
            Spatial::Line(points) => {
                if points.len() < 2 {
                    return Err(invalid(format!(
                        "line needs at least 2 points, got {}",
                        points.len()
                    )));
                }
                points.iter().try_for_each(|(lon, lat)| check_coordinate(*lon, *lat))
            }
        }
    }

    fn render(&self) -> (String, String) {
        let value = match self {
            Spatial::Point { lon, lat } => format!("{lon},{lat}"),
            Spatial::BoundingBox {
                lower_left_lon,
                lower_left_lat,
                upper_right_lon,
                upper_right_lat,
            } => format!("{lower_left_lon},{lower_left_lat},{upper_right_lon},{upper_right_lat}"),
            Spatial::Polygon(points) | Spatial::Line(points) => points
                .iter()
                .map(|(lon, lat)| format!("{lon},{lat}"))
                .collect::<Vec<_>>()
                .join(","),
        };
        (self.kind_name().to_string(), value)
    }
}

fn check_coordinate(lon: f64, lat: f64) -> Result<()> {
    if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
        return Err(invalid(format!("longitude {lon} is outside [-180, 180]")));
    }
    if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
        return Err(invalid(format!("latitude {lat} is outside [-90, 90]")));
    }
    Ok(())
}

/// A resolved, validated temporal range. Either side may be open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemporalRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub exclude_boundary: bool,
}

impl TemporalRange {
    fn render(&self) -> String {
        let fmt = |d: &Option<DateTime<Utc>>| {
            d.map(|d| d.format("%Y-%m-%dT%H:%M:%SZ").to_string())
                .unwrap_or_default()
        };
        format!("{},{}", fmt(&self.start), fmt(&self.end))
    }
}

#[derive(Debug, Clone, PartialEq)]
struct TemporalInput {
    from: Option<String>,
    to: Option<String>,
    exclude_boundary: bool,
}

/// Parses `YYYY`, `YYYY-MM`, `YYYY-MM-DD`, `YYYY-MM-DDTHH:MM:SS[Z]` or RFC 3339.
///
/// Partial dates expand to the start of their period, or to its last second
/// when `end_of_period` is set, so a date-only end includes the whole day.
pub fn parse_datetime(input: &str, end_of_period: bool) -> Result<DateTime<Utc>> {
    let s = input.trim();
    let bad = || invalid(format!("`{input}` is not a valid date or datetime"));

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%SZ", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    let last_second = NaiveTime::from_hms_opt(23, 59, 59).ok_or_else(bad)?;
    let time = if end_of_period { last_second } else { NaiveTime::MIN };

    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(Utc.from_utc_datetime(&date.and_time(time)));
    }

    let parts: Vec<&str> = s.split('-').collect();
    let year: i32 = parts.first().and_then(|y| y.parse().ok()).ok_or_else(bad)?;
    let date = match parts.as_slice() {
        [_] if parts[0].len() == 4 => {
            if end_of_period {
                NaiveDate::from_ymd_opt(year, 12, 31)
            } else {
                NaiveDate::from_ymd_opt(year, 1, 1)
            }
        }
        [_, m] if parts[0].len() == 4 => {
            let month: u32 = m.parse().map_err(|_| bad())?;
            let first = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(bad)?;
            if end_of_period {
                let next = if month == 12 {
                    NaiveDate::from_ymd_opt(year + 1, 1, 1)
                } else {
                    NaiveDate::from_ymd_opt(year, month + 1, 1)
                };
                next.and_then(|n| n.pred_opt())
            } else {
                Some(first)
            }
        }
        _ => None,
    }
    .ok_or_else(bad)?;

    Ok(Utc.from_utc_datetime(&date.and_time(time)))
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidQuery(msg.into())
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Filters {
    keyword: Option<String>,
    short_name: Option<String>,
    version: Option<String>,
    entry_title: Option<String>,
    doi: Option<String>,
    instrument: Option<String>,
    project: Option<String>,
    platform: Option<String>,
    provider: Option<String>,
    daac: Option<String>,
    granule_name: Option<String>,
    day_night_flag: Option<String>,
    concept_ids: Vec<String>,
    cloud_hosted: Option<bool>,
    has_granules: Option<bool>,
    online_only: Option<bool>,
    downloadable: Option<bool>,
    cloud_cover: Option<(f64, f64)>,
    orbit_number: Option<(u64, Option<u64>)>,
    temporal: Vec<TemporalInput>,
    spatial: Vec<Spatial>,
}

/// Chained filter setters. Nothing is checked until [`QueryBuilder::build`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueryBuilder {
    kind: QueryKind,
    filters: Filters,
    // Setter-time problems (unknown keys, wrong value shapes) reported by build().
    errors: Vec<String>,
}

impl QueryBuilder {
    pub fn new(kind: QueryKind) -> Self {
        Self {
            kind,
            filters: Filters::default(),
            errors: Vec::new(),
        }
    }

    pub fn collections() -> Self {
        Self::new(QueryKind::Collections)
    }

    pub fn granules() -> Self {
        Self::new(QueryKind::Granules)
    }

    /// Builder from `(name, value)` pairs, e.g. `("temporal", json!(["2020-02", "2020-03"]))`.
    pub fn from_params<I, K>(kind: QueryKind, params: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        Self::new(kind).parameters(params)
    }

    /// Applies `(name, value)` pairs on top of the current filters.
    pub fn parameters<I, K>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        for (key, value) in params {
            self = self.parameter(key.as_ref(), value);
        }
        self
    }

    fn parameter(mut self, key: &str, value: Value) -> Self {
        let text = || value_as_string(&value);
        match key {
            "keyword" => with_string(self, key, text(), Self::keyword),
            "short_name" => with_string(self, key, text(), Self::short_name),
            "version" => with_string(self, key, text(), Self::version),
            "entry_title" => with_string(self, key, text(), Self::entry_title),
            "doi" => with_string(self, key, text(), Self::doi),
            "instrument" => with_string(self, key, text(), Self::instrument),
            "project" => with_string(self, key, text(), Self::project),
            "platform" => with_string(self, key, text(), Self::platform),
            "provider" => with_string(self, key, text(), Self::provider),
            "daac" => with_string(self, key, text(), Self::daac),
            "granule_name" => with_string(self, key, text(), Self::granule_name),
            "day_night_flag" => with_string(self, key, text(), Self::day_night_flag),
            "concept_id" => match &value {
                Value::Array(items) => {
                    let ids: Option<Vec<String>> = items.iter().map(value_as_string).collect();
                    match ids {
                        Some(ids) => self.concept_id(ids),
                        None => self.reject(key, "expected a list of strings"),
                    }
                }
                _ => match text() {
                    Some(id) => self.concept_id([id]),
                    None => self.reject(key, "expected a string or a list of strings"),
                },
            },
            "cloud_hosted" | "has_granules" | "online_only" | "downloadable" => {
                match value.as_bool() {
                    Some(b) => match key {
                        "cloud_hosted" => self.cloud_hosted(b),
                        "has_granules" => self.has_granules(b),
                        "online_only" => self.online_only(b),
                        _ => self.downloadable(b),
                    },
                    None => self.reject(key, "expected a boolean"),
                }
            }
            "temporal" => match &value {
                Value::Array(items) if items.len() == 2 || items.len() == 3 => {
                    let side = |v: &Value| match v {
                        Value::Null => Some(None),
                        other => value_as_string(other).map(Some),
                    };
                    let exclude = items.get(2).and_then(Value::as_bool).unwrap_or(false);
                    match (side(&items[0]), side(&items[1])) {
                        (Some(from), Some(to)) => self.temporal_range(from, to, exclude),
                        _ => self.reject(key, "expected [start, end] date strings"),
                    }
                }
                _ => self.reject(key, "expected [start, end] or [start, end, exclude_boundary]"),
            },
            "point" => match numbers(&value).as_deref() {
                Some([lon, lat]) => self.point(*lon, *lat),
                _ => self.reject(key, "expected [lon, lat]"),
            },
            "bounding_box" => match numbers(&value).as_deref() {
                Some([a, b, c, d]) => self.bounding_box(*a, *b, *c, *d),
                _ => self.reject(key, "expected [ll_lon, ll_lat, ur_lon, ur_lat]"),
            },
            "polygon" | "line" => match pairs(&value) {
                Some(points) if key == "polygon" => self.polygon(points),
                Some(points) => self.line(points),
                None => self.reject(key, "expected a list of [lon, lat] pairs"),
            },
            "cloud_cover" => match numbers(&value).as_deref() {
                Some([min, max]) => self.cloud_cover(*min, *max),
                _ => self.reject(key, "expected [min, max]"),
            },
            "orbit_number" => match &value {
                Value::Array(_) => match numbers(&value).as_deref() {
                    Some([a, b]) if *a >= 0.0 && *b >= 0.0 => {
                        self.orbit_number(*a as u64, Some(*b as u64))
                    }
                    _ => self.reject(key, "expected an orbit number or [first, last]"),
                },
                other => match other.as_u64() {
                    Some(n) => self.orbit_number(n, None),
                    None => self.reject(key, "expected a non-negative integer"),
                },
            },
            unknown => {
                self.errors.push(format!("unknown parameter `{unknown}`"));
                self
            }
        }
    }

    fn reject(mut self, key: &str, why: &str) -> Self {
        self.errors.push(format!("parameter `{key}`: {why}"));
        self
    }

    /// Case-insensitive, wildcard-capable free-text search (collections only).
    pub fn keyword(mut self, text: impl Into<String>) -> Self {
        self.filters.keyword = Some(text.into());
        self
    }

    pub fn short_name(mut self, short_name: impl Into<String>) -> Self {
        self.filters.short_name = Some(short_name.into());
        self
    }

    /// The catalog treats versions as strings: MODIS v6 is `"006"`.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.filters.version = Some(version.into());
        self
    }

    pub fn entry_title(mut self, title: impl Into<String>) -> Self {
        self.filters.entry_title = Some(title.into());
        self
    }

    /// Collections only.
    pub fn doi(mut self, doi: impl Into<String>) -> Self {
        self.filters.doi = Some(doi.into());
        self
    }

    pub fn instrument(mut self, instrument: impl Into<String>) -> Self {
        self.filters.instrument = Some(instrument.into());
        self
    }

    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.filters.project = Some(project.into());
        self
    }

    pub fn platform(mut self, platform: impl Into<String>) -> Self {
        self.filters.platform = Some(platform.into());
        self
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.filters.provider = Some(provider.into());
        self
    }

    /// Resolved to a provider code at build time, honouring [`Self::cloud_hosted`].
    pub fn daac(mut self, short_name: impl Into<String>) -> Self {
        self.filters.daac = Some(short_name.into());
        self
    }

    /// Readable granule name; `*` and `?` wildcards are allowed.
    pub fn granule_name(mut self, name: impl Into<String>) -> Self {
        self.filters.granule_name = Some(name.into());
        self
    }

    pub fn day_night_flag(mut self, flag: impl Into<String>) -> Self {
        self.filters.day_night_flag = Some(flag.into());
        self
    }

    /// Concept ids accumulate across calls.
    pub fn concept_id<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filters
            .concept_ids
            .extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn cloud_hosted(mut self, cloud_hosted: bool) -> Self {
        self.filters.cloud_hosted = Some(cloud_hosted);
        self
    }

    pub fn has_granules(mut self, has_granules: bool) -> Self {
        self.filters.has_granules = Some(has_granules);
        self
    }

    pub fn online_only(mut self, online_only: bool) -> Self {
        self.filters.online_only = Some(online_only);
        self
    }

    pub fn downloadable(mut self, downloadable: bool) -> Self {
        self.filters.downloadable = Some(downloadable);
        self
    }

    pub fn cloud_cover(mut self, min_cover: f64, max_cover: f64) -> Self {
        self.filters.cloud_cover = Some((min_cover, max_cover));
        self
    }

    pub fn orbit_number(mut self, first: u64, last: Option<u64>) -> Self {
        self.filters.orbit_number = Some((first, last));
        self
    }

    /// Closed range; repeated calls add more ranges.
    pub fn temporal(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.temporal_range(Some(from.into()), Some(to.into()), false)
    }

    /// Open or closed range; `None` leaves that side unbounded.
    pub fn temporal_range(
        mut self,
        from: Option<String>,
        to: Option<String>,
        exclude_boundary: bool,
    ) -> Self {
        self.filters.temporal.push(TemporalInput {
            from,
            to,
            exclude_boundary,
        });
        self
    }

    pub fn point(self, lon: f64, lat: f64) -> Self {
        self.spatial(Spatial::Point { lon, lat })
    }

    pub fn bounding_box(
        self,
        lower_left_lon: f64,
        lower_left_lat: f64,
        upper_right_lon: f64,
        upper_right_lat: f64,
    ) -> Self {
        self.spatial(Spatial::BoundingBox {
            lower_left_lon,
            lower_left_lat,
            upper_right_lon,
            upper_right_lat,
        })
    }

    pub fn polygon(self, coordinates: impl Into<Vec<(f64, f64)>>) -> Self {
        self.spatial(Spatial::Polygon(coordinates.into()))
    }

    pub fn line(self, coordinates: impl Into<Vec<(f64, f64)>>) -> Self {
        self.spatial(Spatial::Line(coordinates.into()))
    }

    pub fn spatial(mut self, spatial: Spatial) -> Self {
        self.filters.spatial.push(spatial);
        self
    }

    /// Validates the filter combination and renders the catalog parameters.
    pub fn build(self) -> Result<Query> {
        if let Some(first) = self.errors.first() {
            return Err(invalid(first.clone()));
        }

        let kind = self.kind;
        let f = self.filters;

        for (name, value) in [
            ("keyword", &f.keyword),
            ("short_name", &f.short_name),
            ("version", &f.version),
            ("entry_title", &f.entry_title),
            ("doi", &f.doi),
            ("instrument", &f.instrument),
            ("project", &f.project),
            ("platform", &f.platform),
            ("provider", &f.provider),
            ("daac", &f.daac),
            ("granule_name", &f.granule_name),
            ("day_night_flag", &f.day_night_flag),
        ] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                return Err(invalid(format!("`{name}` must not be empty")));
            }
        }

        let collection_only = [
            ("keyword", f.keyword.is_some()),
            ("doi", f.doi.is_some()),
            ("project", f.project.is_some()),
            ("has_granules", f.has_granules.is_some()),
        ];
        let granule_only = [
            ("granule_name", f.granule_name.is_some()),
            ("online_only", f.online_only.is_some()),
            ("downloadable", f.downloadable.is_some()),
            ("day_night_flag", f.day_night_flag.is_some()),
            ("cloud_cover", f.cloud_cover.is_some()),
            ("orbit_number", f.orbit_number.is_some()),
        ];
        let unsupported = match kind {
            QueryKind::Collections => &granule_only[..],
            QueryKind::Granules => &collection_only[..],
        };
        if let Some((name, _)) = unsupported.iter().find(|(_, set)| *set) {
            return Err(invalid(format!(
                "`{name}` is not supported on {} queries",
                kind.label()
            )));
        }

        // Identifier lookups are exact; mixing them with free text is rejected upstream.
        if f.keyword.is_some() && (!f.concept_ids.is_empty() || f.doi.is_some()) {
            return Err(invalid(
                "identifier filters (`concept_id`, `doi`) cannot be combined with `keyword`",
            ));
        }

        for id in &f.concept_ids {
            validate_concept_id(id)?;
        }

        let spatial = match f.spatial.as_slice() {
            [] => None,
            [first, rest @ ..] => {
                if let Some(other) = rest.iter().find(|s| s.kind_name() != first.kind_name()) {
                    return Err(invalid(format!(
                        "spatial filters `{}` and `{}` cannot be combined",
                        first.kind_name(),
                        other.kind_name()
                    )));
                }
                // Same kind repeated: the last one wins.
                let last = f.spatial.last().unwrap_or(first).clone();
                last.validate()?;
                Some(last)
            }
        };

        if kind == QueryKind::Granules
            && spatial.is_some()
            && f.short_name.is_none()
            && f.entry_title.is_none()
            && f.concept_ids.is_empty()
        {
            return Err(invalid(
                "granule spatial filters need a collection filter (`short_name`, `entry_title` or `concept_id`)",
            ));
        }

        let mut temporal = Vec::with_capacity(f.temporal.len());
        for t in &f.temporal {
            let start = t.from.as_deref().map(|s| parse_datetime(s, false)).transpose()?;
            let end = t.to.as_deref().map(|s| parse_datetime(s, true)).transpose()?;
            if let (Some(s), Some(e)) = (start, end) {
                if s > e {
                    return Err(invalid(format!(
                        "temporal range start {} is after end {}",
                        s.to_rfc3339(),
                        e.to_rfc3339()
                    )));
                }
            }
            temporal.push(TemporalRange {
                start,
                end,
                exclude_boundary: t.exclude_boundary,
            });
        }

        if let Some((min, max)) = f.cloud_cover {
            if !(0.0..=100.0).contains(&min) || !(0.0..=100.0).contains(&max) {
                return Err(invalid("cloud cover must be within [0, 100]"));
            }
            if min > max {
                return Err(invalid(format!(
                    "cloud cover minimum {min} is greater than maximum {max}"
                )));
            }
        }

        if let Some((first, Some(last))) = f.orbit_number {
            if first > last {
                return Err(invalid(format!("orbit range {first}..{last} is reversed")));
            }
        }

        if let Some(flag) = &f.day_night_flag {
            if !matches!(
                flag.to_ascii_lowercase().as_str(),
                "day" | "night" | "unspecified"
            ) {
                return Err(invalid(format!(
                    "day_night_flag must be `day`, `night` or `unspecified`, got `{flag}`"
                )));
            }
        }

        let provider = match (&f.provider, &f.daac) {
            (Some(_), Some(_)) => {
                return Err(invalid("`provider` and `daac` cannot both be set"));
            }
            (Some(p), None) => Some(p.clone()),
            (None, Some(daac)) => Some(
                find_provider(daac, f.cloud_hosted.unwrap_or(false))
                    .ok_or_else(|| invalid(format!("unknown DAAC `{daac}`")))?
                    .to_string(),
            ),
            (None, None) => None,
        };

        let mut params: Vec<(String, String)> = Vec::new();
        let mut push = |k: &str, v: String| params.push((k.to_string(), v));

        if let Some(v) = &f.keyword {
            push("keyword", v.clone());
        }
        if let Some(v) = &f.short_name {
            push("short_name", v.clone());
        }
        if let Some(v) = &f.version {
            push("version", v.clone());
        }
        if let Some(v) = &f.entry_title {
            push("entry_title", v.clone());
        }
        for id in &f.concept_ids {
            // Granule searches name their parent collections separately.
            if kind == QueryKind::Granules && id.starts_with('C') {
                push("collection_concept_id[]", id.clone());
            } else {
                push("concept_id[]", id.clone());
            }
        }
        if let Some(v) = &f.doi {
            push("doi", v.clone());
        }
        if let Some(v) = &f.instrument {
            push("instrument", v.clone());
        }
        if let Some(v) = &f.project {
            push("project", v.clone());
        }
        if let Some(v) = &f.platform {
            push("platform", v.clone());
        }
        if let Some(v) = provider {
            push("provider", v);
        }
        if let Some(v) = f.cloud_hosted {
            push("cloud_hosted", v.to_string());
        }
        if let Some(v) = f.has_granules {
            push("has_granules", v.to_string());
        }
        if let Some(v) = f.online_only {
            push("online_only", v.to_string());
        }
        if let Some(v) = f.downloadable {
            push("downloadable", v.to_string());
        }
        if let Some(v) = &f.granule_name {
            push("readable_granule_name[]", v.clone());
            push("options[readable_granule_name][pattern]", "true".to_string());
        }
        if let Some(v) = &f.day_night_flag {
            push("day_night_flag", v.to_ascii_lowercase());
        }
        if let Some((min, max)) = f.cloud_cover {
            push("cloud_cover", format!("{min},{max}"));
        }
        if let Some((first, last)) = f.orbit_number {
            match last {
                Some(last) => push("orbit_number", format!("{first},{last}")),
                None => push("orbit_number", first.to_string()),
            }
        }
        for t in &temporal {
            push("temporal[]", t.render());
        }
        if temporal.iter().any(|t| t.exclude_boundary) {
            push("options[temporal][exclude_boundary]", "true".to_string());
        }
        if let Some(s) = &spatial {
            let (k, v) = s.render();
            push(&k, v);
        }

        Ok(Query {
            kind,
            params,
            temporal,
            spatial,
        })
    }
}

fn with_string(
    builder: QueryBuilder,
    key: &str,
    value: Option<String>,
    set: fn(QueryBuilder, String) -> QueryBuilder,
) -> QueryBuilder {
    match value {
        Some(v) => set(builder, v),
        None => builder.reject(key, "expected a string"),
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn numbers(value: &Value) -> Option<Vec<f64>> {
    value.as_array()?.iter().map(value_as_f64).collect()
}

fn pairs(value: &Value) -> Option<Vec<(f64, f64)>> {
    value
        .as_array()?
        .iter()
        .map(|p| match numbers(p)?.as_slice() {
            [lon, lat] => Some((*lon, *lat)),
            _ => None,
        })
        .collect()
}

/// `C1299783579-LPDAAC_ECS`, `G1327299284-LPDAAC_ECS`, `S…`, `T…`.
fn validate_concept_id(id: &str) -> Result<()> {
    let bad = || invalid(format!("`{id}` is not a valid concept id"));
    let mut chars = id.chars();
    if !matches!(chars.next(), Some('C' | 'G' | 'S' | 'T')) {
        return Err(bad());
    }
    let (digits, provider) = chars.as_str().split_once('-').ok_or_else(bad)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) || provider.is_empty() {
        return Err(bad());
    }
    Ok(())
}

/// A validated query. Reusable: every fetch pages it from the first page.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    kind: QueryKind,
    params: Vec<(String, String)>,
    temporal: Vec<TemporalRange>,
    spatial: Option<Spatial>,
}

impl Query {
    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    /// Rendered catalog parameters, without paging parameters.
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn temporal(&self) -> &[TemporalRange] {
        &self.temporal
    }

    pub fn spatial(&self) -> Option<&Spatial> {
        self.spatial.as_ref()
    }
}

/// Builds a query from `(name, value)` pairs in one step.
pub fn build<I, K>(kind: QueryKind, params: I) -> Result<Query>
where
    I: IntoIterator<Item = (K, Value)>,
    K: AsRef<str>,
{
    QueryBuilder::from_params(kind, params).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn param<'a>(q: &'a Query, key: &str) -> Vec<&'a str> {
        q.params()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    fn assert_invalid(result: Result<Query>, needle: &str) {
        match result {
            Err(Error::InvalidQuery(msg)) => {
                assert!(msg.contains(needle), "`{msg}` does not mention `{needle}`")
            }
            other => panic!("expected InvalidQuery, got {other:?}"),
        }
    }

    #[test]
    fn month_range_expands_to_whole_months() {
        let q = build(QueryKind::Granules, [("temporal", json!(["2020-02", "2020-03"]))]).unwrap();
        assert_eq!(
            param(&q, "temporal[]"),
            vec!["2020-02-01T00:00:00Z,2020-03-31T23:59:59Z"]
        );
    }

    #[test]
    fn date_only_end_includes_the_day_and_open_sides_render_empty() {
        let q = QueryBuilder::granules()
            .temporal("2021-01-05", "2021-01-05")
            .temporal_range(None, Some("2019".into()), true)
            .build()
            .unwrap();
        assert_eq!(
            param(&q, "temporal[]"),
            vec![
                "2021-01-05T00:00:00Z,2021-01-05T23:59:59Z",
                ",2019-12-31T23:59:59Z"
            ]
        );
        assert_eq!(param(&q, "options[temporal][exclude_boundary]"), vec!["true"]);
    }

    #[test]
    fn rfc3339_inputs_are_normalised_to_utc() {
        let d = parse_datetime("2020-06-01T12:00:00+02:00", false).unwrap();
        assert_eq!(d.to_rfc3339(), "2020-06-01T10:00:00+00:00");
        assert!(parse_datetime("June 2020", false).is_err());
        assert!(parse_datetime("2020-13", false).is_err());
    }

    #[test]
    fn reversed_temporal_range_is_rejected() {
        assert_invalid(
            QueryBuilder::collections()
                .temporal("2020-03-01", "2020-02-01")
                .build(),
            "after end",
        );
    }

    #[test]
    fn different_geometry_kinds_are_rejected() {
        assert_invalid(
            QueryBuilder::granules()
                .short_name("ATL06")
                .point(10.0, 10.0)
                .bounding_box(0.0, 0.0, 1.0, 1.0)
                .build(),
            "cannot be combined",
        );
    }

    #[test]
    fn repeated_geometry_of_the_same_kind_keeps_the_last() {
        let q = QueryBuilder::collections()
            .point(1.0, 2.0)
            .point(3.0, 4.0)
            .build()
            .unwrap();
        assert_eq!(param(&q, "point"), vec!["3,4"]);
    }

    #[test]
    fn polygon_must_be_closed_with_four_points() {
        assert_invalid(
            QueryBuilder::collections()
                .polygon(vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0)])
                .build(),
            "at least 4",
        );
        assert_invalid(
            QueryBuilder::collections()
                .polygon(vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)])
                .build(),
            "closed",
        );
        let q = QueryBuilder::collections()
            .polygon(vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 0.0)])
            .build()
            .unwrap();
        assert_eq!(param(&q, "polygon"), vec!["0,0,1,0,1,1,0,0"]);
    }

    #[test]
    fn coordinates_are_range_checked() {
        assert_invalid(QueryBuilder::collections().point(200.0, 0.0).build(), "longitude");
        assert_invalid(
            QueryBuilder::collections()
                .bounding_box(0.0, 10.0, 1.0, 5.0)
                .build(),
            "lower-left latitude",
        );
    }

    #[test]
    fn granule_spatial_needs_collection_filter() {
        assert_invalid(
            QueryBuilder::granules().point(0.0, 0.0).build(),
            "collection filter",
        );
        assert!(
            QueryBuilder::granules()
                .concept_id(["C1299783579-LPDAAC_ECS"])
                .point(0.0, 0.0)
                .build()
                .is_ok()
        );
    }

    #[test]
    fn identifiers_and_keyword_do_not_mix() {
        assert_invalid(
            QueryBuilder::collections()
                .keyword("sea ice")
                .concept_id(["C1299783579-LPDAAC_ECS"])
                .build(),
            "cannot be combined with `keyword`",
        );
        assert_invalid(
            QueryBuilder::collections()
                .keyword("sea ice")
                .doi("10.5067/AQR50-3Q7CS")
                .build(),
            "keyword",
        );
        assert_invalid(
            QueryBuilder::granules().keyword("sea ice").build(),
            "not supported on granule",
        );
    }

    #[test]
    fn kind_specific_filters() {
        assert_invalid(
            QueryBuilder::collections().cloud_cover(0.0, 10.0).build(),
            "not supported on collection",
        );
        let q = QueryBuilder::granules()
            .short_name("HLSL30")
            .cloud_cover(0.0, 20.0)
            .granule_name("*T15*")
            .day_night_flag("Day")
            .build()
            .unwrap();
        assert_eq!(param(&q, "cloud_cover"), vec!["0,20"]);
        assert_eq!(param(&q, "readable_granule_name[]"), vec!["*T15*"]);
        assert_eq!(param(&q, "day_night_flag"), vec!["day"]);
    }

    #[test]
    fn concept_ids_are_validated() {
        assert_invalid(
            QueryBuilder::granules().concept_id(["X123-PROV"]).build(),
            "not a valid concept id",
        );
        assert_invalid(
            QueryBuilder::granules().concept_id(["C12a-PROV"]).build(),
            "not a valid concept id",
        );
        let q = QueryBuilder::granules()
            .concept_id(["C1-A", "G2-B"])
            .build()
            .unwrap();
        assert_eq!(param(&q, "collection_concept_id[]"), vec!["C1-A"]);
        assert_eq!(param(&q, "concept_id[]"), vec!["G2-B"]);
    }

    #[test]
    fn daac_resolves_provider() {
        let q = QueryBuilder::collections()
            .daac("PODAAC")
            .cloud_hosted(true)
            .build()
            .unwrap();
        assert_eq!(param(&q, "provider"), vec!["POCLOUD"]);
        assert_invalid(QueryBuilder::collections().daac("NOWHERE").build(), "unknown DAAC");
        assert_invalid(
            QueryBuilder::collections().daac("PODAAC").provider("X").build(),
            "cannot both be set",
        );
    }

    #[test]
    fn parameter_pairs_report_unknown_and_malformed_keys() {
        assert_invalid(
            build(QueryKind::Collections, [("colour", json!("blue"))]),
            "unknown parameter `colour`",
        );
        assert_invalid(
            build(QueryKind::Collections, [("point", json!([1.0]))]),
            "expected [lon, lat]",
        );
        let q = build(
            QueryKind::Granules,
            [
                ("short_name", json!("ATL06")),
                ("bounding_box", json!([-10, -5, "10", 5])),
                ("cloud_hosted", json!(true)),
            ],
        )
        .unwrap();
        assert_eq!(param(&q, "bounding_box"), vec!["-10,-5,10,5"]);
        assert_eq!(param(&q, "cloud_hosted"), vec!["true"]);
    }

    #[test]
    fn empty_strings_are_rejected() {
        assert_invalid(QueryBuilder::collections().short_name("  ").build(), "must not be empty");
    }
}
