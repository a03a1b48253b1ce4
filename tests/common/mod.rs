#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use earthaccess::credentials::{BearerToken, Credential, S3Credentials};
use earthaccess::catalog::{CatalogRequest, CatalogResponse};
use earthaccess::{
    CatalogTransport, CredentialProvider, Error, FailureReason, ObjectStore, Record, RecordKind,
    RemoteFile, TransferTaskError,
};
use parking_lot::Mutex;
use serde_json::{Value, json};

/// In-memory catalog serving `items` with offset-based search-after tokens.
pub struct FakeCatalog {
    items: Vec<Value>,
    hits: Option<u64>,
    /// `(call number, status)`: answer that call with an error body.
    fail_on_call: Option<(usize, u16)>,
    /// Hand out a token on the page that reaches the end, like the real catalog.
    token_on_last_page: bool,
    calls: AtomicUsize,
    requests: Mutex<Vec<CatalogRequest>>,
}

impl FakeCatalog {
    pub fn with_granules(n: usize) -> Self {
        Self {
            items: (1..=n).map(|i| granule_item(&format!("G{i}-TEST"))).collect(),
            hits: None,
            fail_on_call: None,
            token_on_last_page: true,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn reporting_hits(mut self, hits: u64) -> Self {
        self.hits = Some(hits);
        self
    }

    pub fn failing_on_call(mut self, call: usize, status: u16) -> Self {
        self.fail_on_call = Some((call, status));
        self
    }

    pub fn without_final_token(mut self) -> Self {
        self.token_on_last_page = false;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CatalogRequest> {
        self.requests.lock().clone()
    }

    pub fn concept_ids(&self, range: std::ops::Range<usize>) -> Vec<String> {
        self.items[range]
            .iter()
            .map(|i| i["meta"]["concept-id"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

impl CatalogTransport for FakeCatalog {
    fn get(&self, request: &CatalogRequest) -> earthaccess::Result<CatalogResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().push(request.clone());

        if let Some((n, status)) = self.fail_on_call {
            if n == call {
                return Ok(CatalogResponse {
                    status,
                    body: r#"{"errors":["simulated outage"]}"#.to_string(),
                    ..Default::default()
                });
            }
        }

        let page_size: usize = request
            .params
            .iter()
            .find(|(k, _)| k == "page_size")
            .and_then(|(_, v)| v.parse().ok())
            .unwrap_or(10);
        let offset: usize = request
            .search_after
            .as_deref()
            .and_then(|t| t.strip_prefix("after-"))
            .and_then(|t| t.parse().ok())
            .unwrap_or(0);
        let end = (offset + page_size).min(self.items.len());
        let page = &self.items[offset.min(end)..end];
        let more = end < self.items.len();
        let token = (!page.is_empty() && (more || self.token_on_last_page))
            .then(|| format!("after-{end}"));
        let hits = self.hits.unwrap_or(self.items.len() as u64);

        Ok(CatalogResponse {
            status: 200,
            hits: Some(hits),
            search_after: token,
            body: json!({ "hits": hits, "items": page }).to_string(),
        })
    }
}

pub fn granule_item(concept_id: &str) -> Value {
    json!({
        "meta": {
            "concept-id": concept_id,
            "concept-type": "granule",
            "provider-id": "TEST"
        },
        "umm": {
            "GranuleUR": concept_id,
            "RelatedUrls": [
                { "URL": format!("https://data.test/{concept_id}.nc"), "Type": "GET DATA" }
            ]
        }
    })
}

/// Granule whose data links are `urls`; `s3://` links are tagged for direct access.
pub fn granule(concept_id: &str, urls: &[&str]) -> Record {
    let related: Vec<Value> = urls
        .iter()
        .map(|u| {
            let kind = if u.starts_with("s3://") {
                "GET DATA VIA DIRECT ACCESS"
            } else {
                "GET DATA"
            };
            json!({ "URL": u, "Type": kind })
        })
        .collect();
    Record::from_umm(
        json!({
            "meta": { "concept-id": concept_id, "provider-id": "TEST" },
            "umm": { "RelatedUrls": related }
        }),
        RecordKind::Granule,
    )
    .expect("valid granule")
}

struct Script {
    reason: FailureReason,
    remaining: usize,
}

/// Object store that writes small files and fails on cue.
#[derive(Default)]
pub struct FakeStore {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<HashMap<String, usize>>,
    s3_keys: Mutex<Vec<String>>,
    total: AtomicUsize,
    delay: Duration,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first `times` calls for `url` fail with `reason`.
    pub fn failing(self, url: &str, reason: FailureReason, times: usize) -> Self {
        self.scripts.lock().insert(
            url.to_string(),
            Script {
                reason,
                remaining: times,
            },
        );
        self
    }

    pub fn always_failing(self, url: &str, reason: FailureReason) -> Self {
        self.failing(url, reason, usize::MAX)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, url: &str) -> usize {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    /// Access key of the S3 credential seen by each direct-access call, in call order.
    pub fn s3_keys(&self) -> Vec<String> {
        self.s3_keys.lock().clone()
    }

    fn attempt(&self, url: &str, credential: &Credential) -> Result<(), TransferTaskError> {
        self.total.fetch_add(1, Ordering::SeqCst);
        *self.calls.lock().entry(url.to_string()).or_default() += 1;
        if let Credential::S3(creds) = credential {
            self.s3_keys.lock().push(creds.access_key_id.clone());
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }

        let wants_s3 = url.starts_with("s3://");
        if wants_s3 != matches!(credential, Credential::S3(_)) {
            return Err(TransferTaskError::new(
                FailureReason::Credential,
                format!("wrong credential for {url}"),
            ));
        }

        if let Some(script) = self.scripts.lock().get_mut(url) {
            if script.remaining > 0 {
                script.remaining -= 1;
                return Err(TransferTaskError::new(script.reason, format!("scripted {url}")));
            }
        }
        Ok(())
    }
}

pub fn payload(url: &str) -> Vec<u8> {
    format!("contents of {url}").into_bytes()
}

impl ObjectStore for FakeStore {
    fn download(
        &self,
        url: &str,
        credential: &Credential,
        target: &Path,
    ) -> Result<u64, TransferTaskError> {
        self.attempt(url, credential)?;
        let body = payload(url);
        std::fs::write(target, &body).map_err(|e| TransferTaskError::new(FailureReason::Other, e.to_string()))?;
        Ok(body.len() as u64)
    }

    fn open(&self, url: &str, credential: &Credential) -> Result<RemoteFile, TransferTaskError> {
        self.attempt(url, credential)?;
        let body = payload(url);
        let len = body.len() as u64;
        Ok(RemoteFile::new(url, Some(len), Cursor::new(body)))
    }
}

/// Credential provider that counts refreshes and can be made slow or broken.
#[derive(Default)]
pub struct FakeProvider {
    s3_calls: AtomicUsize,
    bearer_calls: AtomicUsize,
    delay: Duration,
    fail_s3: bool,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn rejecting_s3(mut self) -> Self {
        self.fail_s3 = true;
        self
    }

    pub fn s3_calls(&self) -> usize {
        self.s3_calls.load(Ordering::SeqCst)
    }

    pub fn bearer_calls(&self) -> usize {
        self.bearer_calls.load(Ordering::SeqCst)
    }
}

pub fn s3_credentials(expires_in: TimeDelta) -> S3Credentials {
    S3Credentials {
        access_key_id: "ASIATEST".into(),
        secret_access_key: "secret".into(),
        session_token: "session".into(),
        expiration: Utc::now() + expires_in,
    }
}

impl CredentialProvider for FakeProvider {
    fn s3_credentials(&self, endpoint: &str) -> earthaccess::Result<S3Credentials> {
        self.s3_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if self.fail_s3 {
            return Err(Error::Credential(format!("{endpoint} refused")));
        }
        Ok(s3_credentials(TimeDelta::hours(1)))
    }

    fn bearer_token(&self) -> earthaccess::Result<BearerToken> {
        self.bearer_calls.fetch_add(1, Ordering::SeqCst);
        Ok(BearerToken {
            token: "edl-token".into(),
            expiration: None,
        })
    }
}
