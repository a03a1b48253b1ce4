use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::catalog::{Catalog, HttpCatalogTransport, Records};
use crate::config::{System, load_config};
use crate::credentials::{CredentialCache, EarthdataAuth};
use crate::error::Result;
use crate::query::{Query, QueryBuilder};
use crate::record::{AccessClass, Record};
use crate::store::HttpObjectStore;
use crate::transfer::{TransferEngine, TransferOptions, TransferReport};

#[derive(Clone)]
pub struct ClientConfig {
    /// Catalog and Earthdata Login hosts.
    pub system: System,
    /// Earthdata Login bearer token.
    pub token: Option<String>,
    /// Earthdata Login user, used to obtain a token when none is given.
    pub username: Option<String>,
    pub password: Option<String>,
    /// Whether to verify TLS certificates.
    pub verify: bool,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("system", &self.system)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("username", &self.username)
            .field("verify", &self.verify)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ClientConfig {
    /// Resolves configuration from the environment and `.netrc` only.
    pub fn from_env() -> Result<Self> {
        Ok(load_config(None, None, None, None)?)
    }
}

/// Search and download entry point.
pub struct Client {
    system: System,
    catalog: Catalog<HttpCatalogTransport>,
    transfer: TransferEngine<HttpObjectStore, EarthdataAuth>,
    progress: bool,
}

impl Client {
    /// Creates a client using environment variables and/or `.netrc`.
    ///
    /// This is equivalent to `Client::new(None, None)`.
    pub fn from_env() -> Result<Self> {
        Self::new(None, None)
    }

    /// Creates a client using (in order of precedence):
    /// - explicit `token`/`verify` arguments
    /// - `EARTHDATA_TOKEN`, `EARTHDATA_USERNAME`/`EARTHDATA_PASSWORD`, `EARTHACCESS_VERIFY`
    /// - the `.netrc` entry for the Earthdata Login host
    pub fn new(token: Option<String>, verify: Option<bool>) -> Result<Self> {
        Self::with_config(load_config(token, None, None, verify)?)
    }

    /// Logs in with a username and password; a token is requested on first use.
    pub fn login(username: impl Into<String>, password: impl Into<String>) -> Result<Self> {
        Self::with_config(load_config(
            None,
            Some(username.into()),
            Some(password.into()),
            None,
        )?)
    }

    pub fn with_config(cfg: ClientConfig) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("earthaccess-rs/{}", env!("CARGO_PKG_VERSION")))
                .unwrap_or(HeaderValue::from_static("earthaccess-rs")),
        );

        let mut builder = HttpClient::builder()
            .default_headers(default_headers)
            .timeout(cfg.timeout);
        if !cfg.verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder.build().context("failed to build HTTP client")?;

        let auth = EarthdataAuth::new(
            http.clone(),
            cfg.system.edl_hostname.clone(),
            cfg.token.clone(),
            cfg.username,
            cfg.password,
        );
        if !auth.has_credentials() {
            tracing::debug!("no Earthdata Login credentials found; searching anonymously");
        }

        let catalog = Catalog::new(
            cfg.system.cmr_base_url.clone(),
            HttpCatalogTransport::new(http.clone(), cfg.token),
        );
        let transfer = TransferEngine::new(
            HttpObjectStore::new(http),
            Arc::new(CredentialCache::new(auth)),
        );

        Ok(Self {
            system: cfg.system,
            catalog,
            transfer,
            progress: true,
        })
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn system(&self) -> &System {
        &self.system
    }

    pub fn catalog(&self) -> &Catalog<HttpCatalogTransport> {
        &self.catalog
    }

    pub fn transfer_engine(&self) -> &TransferEngine<HttpObjectStore, EarthdataAuth> {
        &self.transfer
    }

    pub fn collections(&self) -> QueryBuilder {
        QueryBuilder::collections()
    }

    pub fn granules(&self) -> QueryBuilder {
        QueryBuilder::granules()
    }

    pub fn count(&self, query: &Query) -> Result<u64> {
        self.catalog.count(query)
    }

    pub fn fetch<'a>(
        &'a self,
        query: &'a Query,
        page_size: usize,
        max_results: Option<usize>,
    ) -> Records<'a, HttpCatalogTransport> {
        self.catalog.fetch(query, page_size, max_results)
    }

    pub fn get(&self, query: &Query, max_results: Option<usize>) -> Result<Vec<Record>> {
        self.catalog.get(query, max_results)
    }

    /// Builds and runs a query in one go.
    ///
    /// ```no_run
    /// # fn main() -> earthaccess::Result<()> {
    /// let client = earthaccess::Client::from_env()?;
    /// let granules = client.search(
    ///     client.granules().short_name("ATL06").temporal("2020-01", "2020-02"),
    ///     Some(50),
    /// )?;
    /// println!("{} granules", granules.len());
    /// # Ok(())
    /// # }
    /// ```
    pub fn search(&self, builder: QueryBuilder, max_results: Option<usize>) -> Result<Vec<Record>> {
        self.catalog.get(&builder.build()?, max_results)
    }

    /// Downloads the data links of every record into `dir`, HTTPS first.
    pub fn download(&self, records: &[Record], dir: impl AsRef<Path>) -> Result<TransferReport> {
        let options = TransferOptions::download(dir.as_ref()).with_progress(self.progress);
        self.transfer(records, &options)
    }

    /// Downloads bare links.
    pub fn download_urls<I, S>(&self, urls: I, dir: impl AsRef<Path>) -> Result<TransferReport>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.download(&records_from_urls(urls), dir)
    }

    /// Opens every record's data links as seekable remote files.
    pub fn open(&self, records: &[Record]) -> Result<TransferReport> {
        let options = TransferOptions::stream().with_progress(self.progress);
        self.transfer(records, &options)
    }

    pub fn open_urls<I, S>(&self, urls: I) -> Result<TransferReport>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.open(&records_from_urls(urls))
    }

    /// Full control over the transfer; see [`TransferOptions`].
    pub fn transfer(&self, records: &[Record], options: &TransferOptions) -> Result<TransferReport> {
        self.transfer.transfer(records, options)
    }

    /// Like [`Client::download`] but prefers in-region S3 access.
    pub fn download_direct(&self, records: &[Record], dir: impl AsRef<Path>) -> Result<TransferReport> {
        let options = TransferOptions::download(dir.as_ref())
            .with_access(AccessClass::Direct)
            .with_progress(self.progress);
        self.transfer(records, &options)
    }
}

fn records_from_urls<I, S>(urls: I) -> Vec<Record>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    urls.into_iter().map(Record::from_url).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClientConfig {
        ClientConfig {
            system: System::uat(),
            token: Some("secret-token".into()),
            username: None,
            password: None,
            verify: true,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn config_debug_hides_token() {
        let text = format!("{:?}", config());
        assert!(!text.contains("secret-token"));
        assert!(text.contains("redacted"));
    }

    #[test]
    fn client_targets_configured_system() {
        let client = Client::with_config(config()).unwrap();
        assert_eq!(client.catalog().base_url(), "https://cmr.uat.earthdata.nasa.gov");
        assert_eq!(client.system(), &System::uat());
    }

    #[test]
    fn bare_urls_become_records() {
        let records = records_from_urls(["s3://b/a.nc", "https://h/b.nc"]);
        assert_eq!(records[0].data_links(AccessClass::Direct), ["s3://b/a.nc"]);
        assert_eq!(records[1].data_links(AccessClass::External), ["https://h/b.nc"]);
    }

    #[test]
    fn empty_batch_is_rejected_before_any_work() {
        let client = Client::with_config(config()).unwrap().with_progress(false);
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            client.download(&[], dir.path()),
            Err(crate::Error::EmptyBatch)
        ));
    }
}
