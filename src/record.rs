use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::query::QueryKind;
use crate::util::provider_from_concept_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Collection,
    Granule,
}

impl From<QueryKind> for RecordKind {
    fn from(kind: QueryKind) -> Self {
        match kind {
            QueryKind::Collections => RecordKind::Collection,
            QueryKind::Granules => RecordKind::Granule,
        }
    }
}

/// How a link is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AccessClass {
    /// Object storage co-located with compute (`s3://`).
    Direct,
    /// Generic HTTPS from anywhere.
    #[default]
    External,
}

impl AccessClass {
    pub fn other(self) -> Self {
        match self {
            AccessClass::Direct => AccessClass::External,
            AccessClass::External => AccessClass::Direct,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessLink {
    pub url: String,
    pub access: AccessClass,
    /// CMR `RelatedUrls[].Type`, or `DERIVED` for s3 paths guessed from HTTPS links.
    pub link_type: String,
}

const GET_DATA: &str = "GET DATA";
const GET_DATA_DIRECT: &str = "GET DATA VIA DIRECT ACCESS";
const GET_VISUALIZATION: &str = "GET RELATED VISUALIZATION";

/// One catalog entry. Immutable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    kind: RecordKind,
    concept_id: String,
    provider_id: Option<String>,
    links: Vec<AccessLink>,
    cloud_hosted: bool,
    size_mb: f64,
    raw: Value,
}

impl Record {
    /// Parses a `umm_json` item. The kind comes from `meta.concept-type`; `fallback`
    /// is used only when the item does not say.
    pub fn from_umm(raw: Value, fallback: RecordKind) -> Result<Self> {
        let meta = raw.get("meta").unwrap_or(&Value::Null);
        let concept_id = meta
            .get("concept-id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::MalformedRecord("item without meta.concept-id".to_string()))?
            .to_string();

        let kind = match meta.get("concept-type").and_then(Value::as_str) {
            Some("collection") => RecordKind::Collection,
            Some("granule") => RecordKind::Granule,
            Some(other) => {
                return Err(Error::MalformedRecord(format!(
                    "{concept_id}: unsupported concept-type `{other}`"
                )));
            }
            None => fallback,
        };

        let provider_id = meta
            .get("provider-id")
            .and_then(Value::as_str)
            .or_else(|| provider_from_concept_id(&concept_id))
            .map(str::to_string);

        let umm = raw.get("umm").unwrap_or(&Value::Null);
        let related = related_urls(umm);

        let mut links = Vec::new();
        for (url, link_type) in &related {
            let access = match link_type.as_str() {
                GET_DATA_DIRECT => AccessClass::Direct,
                GET_DATA if url.starts_with("s3://") => AccessClass::Direct,
                GET_DATA => AccessClass::External,
                _ => continue,
            };
            links.push(AccessLink {
                url: url.clone(),
                access,
                link_type: link_type.clone(),
            });
        }

        let cloud_hosted = match kind {
            RecordKind::Granule => related
                .iter()
                .any(|(url, t)| url.contains("protected") || t == GET_DATA_DIRECT),
            RecordKind::Collection => {
                meta.get("s3-links").is_some() || umm.get("DirectDistributionInformation").is_some()
            }
        };

        // Some cloud collections only advertise HTTPS links; their s3 paths follow a
        // fixed layout behind the distribution host.
        if cloud_hosted && !links.iter().any(|l| l.access == AccessClass::Direct) {
            let derived: Vec<AccessLink> = links
                .iter()
                .filter_map(|l| derive_s3_link(&l.url))
                .map(|url| AccessLink {
                    url,
                    access: AccessClass::Direct,
                    link_type: "DERIVED".to_string(),
                })
                .collect();
            links.extend(derived);
        }

        let size_mb = granule_size_mb(umm);

        Ok(Self {
            kind,
            concept_id,
            provider_id,
            links,
            cloud_hosted,
            size_mb,
            raw,
        })
    }

    /// Wraps a bare data URL; `s3://` URLs are direct, everything else external.
    pub fn from_url(url: impl Into<String>) -> Self {
        let url = url.into();
        let access = if url.starts_with("s3://") {
            AccessClass::Direct
        } else {
            AccessClass::External
        };
        Self {
            kind: RecordKind::Granule,
            concept_id: url.clone(),
            provider_id: None,
            links: vec![AccessLink {
                url: url.clone(),
                access,
                link_type: GET_DATA.to_string(),
            }],
            cloud_hosted: access == AccessClass::Direct,
            size_mb: 0.0,
            raw: json!({ "meta": { "concept-id": url }, "umm": {} }),
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn concept_id(&self) -> &str {
        &self.concept_id
    }

    pub fn provider_id(&self) -> Option<&str> {
        self.provider_id.as_deref()
    }

    pub fn cloud_hosted(&self) -> bool {
        self.cloud_hosted
    }

    pub fn links(&self) -> &[AccessLink] {
        &self.links
    }

    /// Data links of one access class, in catalog order.
    pub fn data_links(&self, access: AccessClass) -> Vec<&str> {
        self.links
            .iter()
            .filter(|l| l.access == access)
            .map(|l| l.url.as_str())
            .collect()
    }

    /// First advertised link of `access`; links the catalog lists explicitly are
    /// preferred over derived ones.
    pub fn best_link(&self, access: AccessClass) -> Option<&AccessLink> {
        self.links
            .iter()
            .filter(|l| l.access == access)
            .min_by_key(|l| l.link_type == "DERIVED")
    }

    pub fn s3_credentials_endpoint(&self) -> Option<&str> {
        self.umm()
            .get("RelatedUrls")
            .and_then(Value::as_array)?
            .iter()
            .filter_map(|l| l.get("URL").and_then(Value::as_str))
            .find(|u| u.contains("/s3credentials"))
    }

    /// Browse images.
    pub fn dataviz_links(&self) -> Vec<&str> {
        self.related_of_type(GET_VISUALIZATION)
    }

    /// Landing page of a collection, if it advertises one.
    pub fn landing_page(&self) -> Option<&str> {
        self.related_of_type("LANDING PAGE").into_iter().next()
    }

    /// Total size in MB from `DataGranule.ArchiveAndDistributionInformation`, 0 when unknown.
    pub fn size_mb(&self) -> f64 {
        self.size_mb
    }

    pub fn short_name(&self) -> Option<&str> {
        let umm = self.umm();
        match self.kind {
            RecordKind::Collection => umm.get("ShortName"),
            RecordKind::Granule => umm.get("CollectionReference").and_then(|c| c.get("ShortName")),
        }
        .and_then(Value::as_str)
    }

    pub fn version(&self) -> Option<&str> {
        let umm = self.umm();
        match self.kind {
            RecordKind::Collection => umm.get("Version"),
            RecordKind::Granule => umm.get("CollectionReference").and_then(|c| c.get("Version")),
        }
        .and_then(Value::as_str)
    }

    pub fn granule_ur(&self) -> Option<&str> {
        self.umm().get("GranuleUR").and_then(Value::as_str)
    }

    pub fn umm(&self) -> &Value {
        self.raw.get("umm").unwrap_or(&Value::Null)
    }

    pub fn meta(&self) -> &Value {
        self.raw.get("meta").unwrap_or(&Value::Null)
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Short overview, handy for listings.
    pub fn summary(&self) -> Value {
        let kind = match self.kind {
            RecordKind::Collection => "collection",
            RecordKind::Granule => "granule",
        };
        let mut s = json!({
            "concept-id": self.concept_id,
            "kind": kind,
            "short-name": self.short_name(),
            "version": self.version(),
            "provider-id": self.provider_id,
            "cloud-hosted": self.cloud_hosted,
            "get-data": self.data_links(AccessClass::External),
        });
        if self.kind == RecordKind::Granule {
            s["granule-ur"] = json!(self.granule_ur());
            s["size-mb"] = json!(self.size_mb);
        } else if let Some(info) = self.umm().get("DirectDistributionInformation") {
            s["cloud-info"] = info.clone();
        }
        s
    }

    fn related_of_type(&self, wanted: &str) -> Vec<&str> {
        self.umm()
            .get("RelatedUrls")
            .and_then(Value::as_array)
            .map(|links| {
                links
                    .iter()
                    .filter(|l| l.get("Type").and_then(Value::as_str) == Some(wanted))
                    .filter_map(|l| l.get("URL").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn related_urls(umm: &Value) -> Vec<(String, String)> {
    umm.get("RelatedUrls")
        .and_then(Value::as_array)
        .map(|links| {
            links
                .iter()
                .filter_map(|l| {
                    let url = l.get("URL").and_then(Value::as_str)?;
                    let t = l.get("Type").and_then(Value::as_str).unwrap_or("");
                    Some((url.to_string(), t.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// `https://data.lpdaac.earthdatacloud.nasa.gov/lp-prod-protected/x/y.tif`
/// -> `s3://lp-prod-protected/x/y.tif`
fn derive_s3_link(url: &str) -> Option<String> {
    if !url.starts_with("https://") || !(url.contains("cumulus") || url.contains("protected")) {
        return None;
    }
    let (_, path) = url.split_once("nasa.gov/")?;
    if path.is_empty() {
        return None;
    }
    Some(format!("s3://{path}"))
}

fn granule_size_mb(umm: &Value) -> f64 {
    let Some(infos) = umm
        .get("DataGranule")
        .and_then(|g| g.get("ArchiveAndDistributionInformation"))
        .and_then(Value::as_array)
    else {
        return 0.0;
    };
    let number = |v: Option<&Value>| -> Option<f64> {
        match v? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    };
    let sizes: Option<Vec<f64>> = infos.iter().map(|i| number(i.get("Size"))).collect();
    if let Some(sizes) = sizes {
        return sizes.iter().sum();
    }
    let bytes: Option<Vec<f64>> = infos.iter().map(|i| number(i.get("SizeInBytes"))).collect();
    bytes
        .map(|b| b.iter().sum::<f64>() / (1024.0 * 1024.0))
        .unwrap_or(0.0)
}
