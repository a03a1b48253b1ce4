//! Paged search against the metadata catalog.
//!
//! Pagination uses the catalog's search-after protocol: every response carries an
//! opaque `CMR-Search-After` header which is echoed on the next request. The cursor
//! lives in an explicit [`PageRequest`] value derived from the previous request and
//! its response, never in the [`Query`], so a query can be paged any number of times.

use reqwest::StatusCode;
use reqwest::blocking::Client as HttpClient;
use serde_json::Value;

use crate::error::{Error, Result, format_catalog_error};
use crate::query::Query;
use crate::record::Record;
use crate::util::urljoin;

/// Largest page the catalog serves.
pub const MAX_PAGE_SIZE: usize = 2000;

/// Continuation cursor, returned on each response and echoed on the next request.
pub const SEARCH_AFTER_HEADER: &str = "CMR-Search-After";
/// Total match count for the query.
pub const HITS_HEADER: &str = "CMR-Hits";

/// One HTTP round trip as seen by a [`CatalogTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRequest {
    pub url: String,
    /// Query parameters including `page_size`.
    pub params: Vec<(String, String)>,
    pub search_after: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogResponse {
    pub status: u16,
    /// `CMR-Hits` header, when present.
    pub hits: Option<u64>,
    /// `CMR-Search-After` header, when present.
    pub search_after: Option<String>,
    pub body: String,
}

/// Carries catalog requests. Network failures are returned as
/// [`Error::CatalogRequest`]; non-2xx statuses are returned as responses.
pub trait CatalogTransport: Send + Sync {
    fn get(&self, request: &CatalogRequest) -> Result<CatalogResponse>;
}

impl<T: CatalogTransport + ?Sized> CatalogTransport for &T {
    fn get(&self, request: &CatalogRequest) -> Result<CatalogResponse> {
        (**self).get(request)
    }
}

/// Catalog transport over a blocking `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpCatalogTransport {
    http: HttpClient,
    token: Option<String>,
}

impl HttpCatalogTransport {
    pub fn new(http: HttpClient, token: Option<String>) -> Self {
        Self { http, token }
    }
}

impl CatalogTransport for HttpCatalogTransport {
    fn get(&self, request: &CatalogRequest) -> Result<CatalogResponse> {
        let mut req = self.http.get(&request.url).query(&request.params);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some(after) = &request.search_after {
            req = req.header(SEARCH_AFTER_HEADER, after);
        }

        let resp = req.send().map_err(|e| Error::CatalogRequest {
            status: e.status().map(|s| s.as_u16()),
            url: request.url.clone(),
            message: format!("could not reach the catalog: {e}"),
        })?;

        let header = |name: &str| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let hits = header(HITS_HEADER).and_then(|h| h.trim().parse().ok());
        let search_after = header(SEARCH_AFTER_HEADER);
        let status = resp.status().as_u16();
        let body = resp.text().map_err(|e| Error::CatalogRequest {
            status: Some(status),
            url: request.url.clone(),
            message: format!("failed to read response body: {e}"),
        })?;

        Ok(CatalogResponse {
            status,
            hits,
            search_after,
            body,
        })
    }
}

/// One page of raw catalog items.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultPage {
    pub items: Vec<Value>,
    /// `None` once the catalog has no further cursor.
    pub search_after: Option<String>,
    /// Informational; it may change between requests.
    pub hits: Option<u64>,
}

/// Immutable description of the next page to fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest<'q> {
    pub query: &'q Query,
    pub page_size: usize,
    pub search_after: Option<String>,
}

impl<'q> PageRequest<'q> {
    pub fn first(query: &'q Query, page_size: usize) -> Self {
        Self {
            query,
            page_size,
            search_after: None,
        }
    }

    /// Request for the page after `page`, or `None` when the catalog gave no cursor.
    pub fn next(&self, page: &ResultPage) -> Option<Self> {
        let token = page.search_after.as_deref().map(str::trim)?;
        if token.is_empty() {
            return None;
        }
        Some(Self {
            query: self.query,
            page_size: self.page_size,
            search_after: Some(token.to_string()),
        })
    }

    fn to_request(&self, base_url: &str) -> CatalogRequest {
        let mut params = self.query.params().to_vec();
        params.push(("page_size".to_string(), self.page_size.to_string()));
        CatalogRequest {
            url: urljoin(base_url, self.query.kind().endpoint()),
            params,
            search_after: self.search_after.clone(),
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct SearchBody {
    #[serde(default)]
    hits: Option<u64>,
    items: Vec<Value>,
}

/// The paginated query engine.
#[derive(Debug, Clone)]
pub struct Catalog<T> {
    base_url: String,
    transport: T,
}

impl<T: CatalogTransport> Catalog<T> {
    pub fn new(base_url: impl Into<String>, transport: T) -> Self {
        Self {
            base_url: base_url.into(),
            transport,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Authoritative hit count, with one `page_size=0` request.
    pub fn count(&self, query: &Query) -> Result<u64> {
        let request = PageRequest::first(query, 0).to_request(&self.base_url);
        let resp = self.round_trip(&request)?;
        if let Some(hits) = resp.hits {
            return Ok(hits);
        }
        let body = parse_body(&request.url, &resp)?;
        body.hits.ok_or_else(|| Error::CatalogRequest {
            status: Some(resp.status),
            url: request.url,
            message: "response carries no hit count".to_string(),
        })
    }

    /// Fetches exactly one page.
    pub fn fetch_page(&self, request: &PageRequest<'_>) -> Result<ResultPage> {
        let req = request.to_request(&self.base_url);
        tracing::debug!(
            url = %req.url,
            page_size = request.page_size,
            continued = req.search_after.is_some(),
            "requesting catalog page"
        );
        let resp = self.round_trip(&req)?;
        let body = parse_body(&req.url, &resp)?;
        Ok(ResultPage {
            items: body.items,
            search_after: resp.search_after.filter(|t| !t.trim().is_empty()),
            hits: resp.hits.or(body.hits),
        })
    }

    /// Lazy page sequence. Each call starts again from the first page.
    pub fn fetch_pages<'a>(
        &'a self,
        query: &'a Query,
        page_size: usize,
        max_results: Option<usize>,
    ) -> Pages<'a, T> {
        let page_size = effective_page_size(page_size, max_results);
        let next = match max_results {
            Some(0) => None,
            _ => Some(PageRequest::first(query, page_size)),
        };
        Pages {
            catalog: self,
            next,
            max_results,
            received: 0,
            first_hits: None,
        }
    }

    /// Lazy record sequence, in catalog order.
    ///
    /// Stops when a page is empty, when `max_results` records were yielded, or when
    /// the catalog stops handing out a cursor. An error is yielded once and ends the
    /// sequence; records already yielded stay valid.
    pub fn fetch<'a>(
        &'a self,
        query: &'a Query,
        page_size: usize,
        max_results: Option<usize>,
    ) -> Records<'a, T> {
        Records {
            pages: self.fetch_pages(query, page_size, max_results),
            buffer: Vec::new().into_iter(),
            kind: query.kind().into(),
            failed: false,
        }
    }

    /// Eager form of [`Catalog::fetch`] with the largest page size.
    pub fn get(&self, query: &Query, max_results: Option<usize>) -> Result<Vec<Record>> {
        self.fetch(query, MAX_PAGE_SIZE, max_results).collect()
    }

    fn round_trip(&self, request: &CatalogRequest) -> Result<CatalogResponse> {
        let resp = self.transport.get(request)?;
        let status = StatusCode::from_u16(resp.status).map_err(|_| Error::CatalogRequest {
            status: Some(resp.status),
            url: request.url.clone(),
            message: "invalid HTTP status".to_string(),
        })?;
        if !status.is_success() {
            return Err(format_catalog_error(status, &request.url, &resp.body));
        }
        Ok(resp)
    }
}

fn parse_body(url: &str, resp: &CatalogResponse) -> Result<SearchBody> {
    serde_json::from_str(&resp.body).map_err(|e| Error::CatalogRequest {
        status: Some(resp.status),
        url: url.to_string(),
        message: format!("failed to parse catalog JSON: {e}"),
    })
}

fn effective_page_size(requested: usize, max_results: Option<usize>) -> usize {
    let mut size = requested;
    if size > MAX_PAGE_SIZE {
        tracing::warn!(
            requested,
            max = MAX_PAGE_SIZE,
            "page size above the catalog maximum, clamping"
        );
        size = MAX_PAGE_SIZE;
    }
    if size == 0 {
        tracing::warn!("page size 0 cannot page through results, using 1");
        size = 1;
    }
    match max_results {
        Some(max) if max > 0 && max < size => max,
        _ => size,
    }
}

/// Iterator over [`ResultPage`]s; see [`Catalog::fetch_pages`].
pub struct Pages<'a, T> {
    catalog: &'a Catalog<T>,
    next: Option<PageRequest<'a>>,
    max_results: Option<usize>,
    received: usize,
    first_hits: Option<u64>,
}

impl<T: CatalogTransport> Pages<'_, T> {
    fn check_hits(&mut self, hits: Option<u64>) {
        match (self.first_hits, hits) {
            (None, Some(h)) => self.first_hits = Some(h),
            (Some(first), Some(h)) if first != h => {
                tracing::warn!(first, now = h, "catalog hit count changed while paging");
            }
            _ => {}
        }
    }

    fn finish_naturally(&self) {
        if let Some(hits) = self.first_hits {
            if hits != self.received as u64 {
                tracing::warn!(
                    reported = hits,
                    retrieved = self.received,
                    "catalog reported a different number of hits than pagination returned"
                );
            }
        }
    }
}

impl<T: CatalogTransport> Iterator for Pages<'_, T> {
    type Item = Result<ResultPage>;

    fn next(&mut self) -> Option<Self::Item> {
        let request = self.next.take()?;
        let mut page = match self.catalog.fetch_page(&request) {
            Ok(page) => page,
            Err(e) => return Some(Err(e)),
        };
        self.check_hits(page.hits);

        if page.items.is_empty() {
            self.finish_naturally();
            return None;
        }

        if let Some(max) = self.max_results {
            let remaining = max - self.received;
            if page.items.len() >= remaining {
                page.items.truncate(remaining);
                self.received += page.items.len();
                return Some(Ok(page));
            }
        }

        self.received += page.items.len();
        self.next = request.next(&page);
        if self.next.is_none() {
            self.finish_naturally();
        }
        Some(Ok(page))
    }
}

/// Iterator over [`Record`]s; see [`Catalog::fetch`].
pub struct Records<'a, T> {
    pages: Pages<'a, T>,
    buffer: std::vec::IntoIter<Value>,
    kind: crate::record::RecordKind,
    failed: bool,
}

impl<T: CatalogTransport> Iterator for Records<'_, T> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(raw) = self.buffer.next() {
                let record = Record::from_umm(raw, self.kind);
                self.failed = record.is_err();
                return Some(record);
            }
            match self.pages.next()? {
                Ok(page) => self.buffer = page.items.into_iter(),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
