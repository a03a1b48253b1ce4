use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use reqwest::StatusCode;
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response};
use reqwest::header::{CONTENT_RANGE, RANGE};

use crate::credentials::Credential;
use crate::error::{FailureReason, TransferTaskError};
use crate::sigv4::{PresignRequest, presign_get};
use crate::util::split_s3_url;

pub const DEFAULT_S3_REGION: &str = "us-west-2";

// Bytes fetched per range request when reading a remote file.
const BLOCK_SIZE: u64 = 4 * 1024 * 1024;

pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// An open, seekable handle on a remote object.
pub struct RemoteFile {
    url: String,
    len: Option<u64>,
    inner: Box<dyn ReadSeek>,
}

impl RemoteFile {
    pub fn new(url: impl Into<String>, len: Option<u64>, inner: impl ReadSeek + 'static) -> Self {
        Self {
            url: url.into(),
            len,
            inner: Box::new(inner),
        }
    }

    /// The link this handle was opened from.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn len(&self) -> Option<u64> {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == Some(0)
    }
}

impl std::fmt::Debug for RemoteFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFile")
            .field("url", &self.url)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl Read for RemoteFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Seek for RemoteFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

/// Remote filesystem used by the transfer engine. One call is one attempt; the
/// engine owns retries.
pub trait ObjectStore: Send + Sync {
    /// Writes the object at `url` to `target` and returns the number of bytes written.
    fn download(
        &self,
        url: &str,
        credential: &Credential,
        target: &Path,
    ) -> Result<u64, TransferTaskError>;

    fn open(&self, url: &str, credential: &Credential) -> Result<RemoteFile, TransferTaskError>;
}

impl<S: ObjectStore + ?Sized> ObjectStore for &S {
    fn download(
        &self,
        url: &str,
        credential: &Credential,
        target: &Path,
    ) -> Result<u64, TransferTaskError> {
        (**self).download(url, credential, target)
    }

    fn open(&self, url: &str, credential: &Credential) -> Result<RemoteFile, TransferTaskError> {
        (**self).open(url, credential)
    }
}

impl<S: ObjectStore + ?Sized> ObjectStore for Arc<S> {
    fn download(
        &self,
        url: &str,
        credential: &Credential,
        target: &Path,
    ) -> Result<u64, TransferTaskError> {
        (**self).download(url, credential, target)
    }

    fn open(&self, url: &str, credential: &Credential) -> Result<RemoteFile, TransferTaskError> {
        (**self).open(url, credential)
    }
}

/// `https://` links with an Earthdata bearer token, `s3://` links presigned with
/// temporary S3 keys.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    http: HttpClient,
    region: String,
    presign_expiry: Duration,
}

#[derive(Debug, Clone)]
struct Resolved {
    url: String,
    bearer: Option<String>,
}

impl Resolved {
    fn get(&self, http: &HttpClient) -> RequestBuilder {
        let req = http.get(&self.url);
        match &self.bearer {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

impl HttpObjectStore {
    pub fn new(http: HttpClient) -> Self {
        Self {
            http,
            region: DEFAULT_S3_REGION.to_string(),
            presign_expiry: Duration::from_secs(3600),
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    fn resolve(&self, url: &str, credential: &Credential) -> Result<Resolved, TransferTaskError> {
        if url.starts_with("s3://") {
            let (bucket, key) = split_s3_url(url).ok_or_else(|| {
                TransferTaskError::new(FailureReason::Other, format!("malformed S3 link {url}"))
            })?;
            let Credential::S3(creds) = credential else {
                return Err(TransferTaskError::new(
                    FailureReason::Credential,
                    format!("{url} needs S3 credentials"),
                ));
            };
            let presigned = presign_get(
                &PresignRequest {
                    bucket,
                    key,
                    region: &self.region,
                    expires_in: self.presign_expiry,
                    now: SystemTime::now(),
                },
                creds,
            )?;
            return Ok(Resolved {
                url: presigned.into(),
                bearer: None,
            });
        }

        let bearer = match credential {
            Credential::Bearer(t) => Some(t.token.clone()),
            Credential::S3(_) => None,
        };
        Ok(Resolved {
            url: url.to_string(),
            bearer,
        })
    }
}

fn status_error(url: &str, status: StatusCode) -> TransferTaskError {
    TransferTaskError::new(
        FailureReason::from_status(status),
        format!("{url}: HTTP {}", status.as_u16()),
    )
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    target.with_file_name(name)
}

impl ObjectStore for HttpObjectStore {
    fn download(
        &self,
        url: &str,
        credential: &Credential,
        target: &Path,
    ) -> Result<u64, TransferTaskError> {
        let resolved = self.resolve(url, credential)?;
        let mut resp = resolved
            .get(&self.http)
            .send()
            .map_err(|e| TransferTaskError::from_reqwest(url, &e))?;
        if !resp.status().is_success() {
            return Err(status_error(url, resp.status()));
        }
        let expected = resp.content_length();

        let part = part_path(target);
        let written = write_body(&mut resp, url, &part, expected)
            .and_then(|n| {
                fs::rename(&part, target).map_err(|e| TransferTaskError::from_io(target, &e))?;
                Ok(n)
            });

        if written.is_err() {
            let _ = fs::remove_file(&part);
        }
        written
    }

    fn open(&self, url: &str, credential: &Credential) -> Result<RemoteFile, TransferTaskError> {
        let resolved = self.resolve(url, credential)?;
        // A one-byte range doubles as a HEAD that presigned GET URLs accept.
        let resp = resolved
            .get(&self.http)
            .header(RANGE, "bytes=0-0")
            .send()
            .map_err(|e| TransferTaskError::from_reqwest(url, &e))?;

        let len = match resp.status() {
            StatusCode::PARTIAL_CONTENT => resp
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(total_from_content_range),
            StatusCode::RANGE_NOT_SATISFIABLE => Some(0),
            s if s.is_success() => resp.content_length(),
            s => return Err(status_error(url, s)),
        };

        let reader = RangeReader {
            http: self.http.clone(),
            resolved,
            display_url: url.to_string(),
            pos: 0,
            len,
            block: Vec::new(),
            block_start: 0,
        };
        Ok(RemoteFile::new(url, len, reader))
    }
}

fn write_body(
    resp: &mut Response,
    url: &str,
    part: &Path,
    expected: Option<u64>,
) -> Result<u64, TransferTaskError> {
    let mut out = File::create(part).map_err(|e| TransferTaskError::from_io(part, &e))?;
    let mut written: u64 = 0;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = match resp.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                return Err(TransferTaskError::new(
                    FailureReason::TransientNetwork,
                    format!("{url}: download interrupted: {e}"),
                ));
            }
        };
        out.write_all(&buf[..n])
            .map_err(|e| TransferTaskError::from_io(part, &e))?;
        written += n as u64;
    }
    out.flush().map_err(|e| TransferTaskError::from_io(part, &e))?;

    if let Some(expected) = expected {
        if written < expected {
            return Err(TransferTaskError::new(
                FailureReason::TransientNetwork,
                format!("{url}: received {written} of {expected} byte(s)"),
            ));
        }
    }
    Ok(written)
}

/// `bytes 0-0/12345` -> `12345`.
fn total_from_content_range(value: &str) -> Option<u64> {
    value.rsplit_once('/').and_then(|(_, total)| total.trim().parse().ok())
}

/// Reads a remote object through HTTP range requests, one block at a time.
struct RangeReader {
    http: HttpClient,
    resolved: Resolved,
    display_url: String,
    pos: u64,
    len: Option<u64>,
    block: Vec<u8>,
    block_start: u64,
}

impl RangeReader {
    fn buffered(&self) -> bool {
        self.pos >= self.block_start && self.pos < self.block_start + self.block.len() as u64
    }

    fn fill(&mut self) -> io::Result<()> {
        let end = self.pos + BLOCK_SIZE - 1;
        let end = match self.len {
            Some(len) => end.min(len.saturating_sub(1)),
            None => end,
        };
        let resp = self
            .resolved
            .get(&self.http)
            .header(RANGE, format!("bytes={}-{}", self.pos, end))
            .send()
            .map_err(io::Error::other)?;

        let status = resp.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            self.block.clear();
            self.block_start = self.pos;
            return Ok(());
        }
        if !status.is_success() {
            return Err(io::Error::other(format!(
                "{}: HTTP {}",
                self.display_url,
                status.as_u16()
            )));
        }
        // A server that ignores Range sends the whole object from offset 0.
        let start = if status == StatusCode::PARTIAL_CONTENT { self.pos } else { 0 };
        self.block = resp.bytes().map_err(io::Error::other)?.to_vec();
        self.block_start = start;
        Ok(())
    }
}

impl Read for RangeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.len.is_some_and(|len| self.pos >= len) {
            return Ok(0);
        }
        if !self.buffered() {
            self.fill()?;
            if !self.buffered() {
                return Ok(0);
            }
        }
        let offset = (self.pos - self.block_start) as usize;
        let available = &self.block[offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for RangeReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
            SeekFrom::End(d) => {
                let len = self.len.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::Unsupported, "remote size unknown")
                })?;
                len.checked_add_signed(d)
            }
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of object")
        })?;
        self.pos = target;
        Ok(target)
    }
}
