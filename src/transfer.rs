//! Concurrent batch transfer of record data links.
//!
//! Every input [`Record`] becomes one task. Tasks run on a bounded rayon pool and
//! are collected through an indexed parallel iterator, so the report lists successes
//! in input order whatever order the tasks finish in. A failing task never affects
//! its siblings; the batch only errors out when it cannot start at all.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;

use crate::credentials::{Credential, CredentialCache, CredentialProvider, CredentialScope};
use crate::daac;
use crate::error::{Error, FailureReason, Result, TransferTaskError};
use crate::record::{AccessClass, Record};
use crate::store::{ObjectStore, RemoteFile};
use crate::util::{backoff, guess_filename_from_url, normalize_data_url};

pub const DEFAULT_CONCURRENCY: usize = 8;
pub const MAX_CONCURRENCY: usize = 16;

/// Cooperative cancellation, checked before every attempt and every backoff sleep.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferMode {
    /// Write files into this directory.
    Download(PathBuf),
    /// Return open seekable handles.
    Stream,
}

#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub mode: TransferMode,
    /// Worker count; `None` means `min(items, 8)`. Capped at 16.
    pub concurrency: Option<usize>,
    /// Access class tried first.
    pub access: AccessClass,
    /// Use the other class when a record has no link of the preferred one.
    pub fallback: bool,
    /// Skip files already present with a non-zero size.
    pub skip_existing: bool,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub progress: bool,
    pub cancel: Option<CancelFlag>,
    /// Credential endpoint for direct access when a record does not name one.
    pub s3_credentials_endpoint: Option<String>,
}

impl TransferOptions {
    pub fn download(dir: impl Into<PathBuf>) -> Self {
        Self::with_mode(TransferMode::Download(dir.into()))
    }

    pub fn stream() -> Self {
        Self::with_mode(TransferMode::Stream)
    }

    fn with_mode(mode: TransferMode) -> Self {
        Self {
            mode,
            concurrency: None,
            access: AccessClass::External,
            fallback: true,
            skip_existing: true,
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            progress: true,
            cancel: None,
            s3_credentials_endpoint: None,
        }
    }

    pub fn with_concurrency(mut self, workers: usize) -> Self {
        self.concurrency = Some(workers);
        self
    }

    pub fn with_access(mut self, access: AccessClass) -> Self {
        self.access = access;
        self
    }

    pub fn with_fallback(mut self, fallback: bool) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_skip_existing(mut self, skip: bool) -> Self {
        self.skip_existing = skip;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_s3_credentials_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.s3_credentials_endpoint = Some(endpoint.into());
        self
    }

    fn workers(&self, items: usize) -> usize {
        self.concurrency
            .unwrap_or_else(|| items.min(DEFAULT_CONCURRENCY))
            .clamp(1, MAX_CONCURRENCY)
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled)
    }
}

/// What a successful task produced, one entry per data link.
#[derive(Debug)]
pub enum Artifact {
    Files(Vec<PathBuf>),
    Streams(Vec<RemoteFile>),
}

impl Artifact {
    pub fn paths(&self) -> &[PathBuf] {
        match self {
            Artifact::Files(paths) => paths,
            Artifact::Streams(_) => &[],
        }
    }

    pub fn into_streams(self) -> Vec<RemoteFile> {
        match self {
            Artifact::Files(_) => Vec::new(),
            Artifact::Streams(files) => files,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferFailure {
    /// Position of the record in the input.
    pub index: usize,
    pub record: Record,
    pub error: TransferTaskError,
}

#[derive(Debug, Default)]
pub struct TransferReport {
    /// In input order.
    pub succeeded: Vec<Artifact>,
    pub failed: Vec<TransferFailure>,
    pub total: usize,
    /// Successes that needed no network call.
    pub skipped: usize,
    /// Store calls made across the batch.
    pub attempts: usize,
}

impl TransferReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Every downloaded (or already present) file, in input order.
    pub fn files(&self) -> impl Iterator<Item = &Path> {
        self.succeeded
            .iter()
            .flat_map(|a| a.paths().iter().map(PathBuf::as_path))
    }
}

#[derive(Debug)]
struct TransferTask<'a> {
    index: usize,
    record: &'a Record,
    access: Option<AccessClass>,
    attempts: u32,
}

impl<'a> TransferTask<'a> {
    fn new(index: usize, record: &'a Record) -> Self {
        Self {
            index,
            record,
            access: None,
            attempts: 0,
        }
    }
}

/// Artifact and whether the task was satisfied by files already on disk.
type Outcome = std::result::Result<(Artifact, bool), TransferTaskError>;

pub struct TransferEngine<S, P> {
    store: S,
    credentials: Arc<CredentialCache<P>>,
}

impl<S: ObjectStore, P: CredentialProvider> TransferEngine<S, P> {
    pub fn new(store: S, credentials: Arc<CredentialCache<P>>) -> Self {
        Self { store, credentials }
    }

    pub fn with_provider(store: S, provider: P) -> Self {
        Self::new(store, Arc::new(CredentialCache::new(provider)))
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn credentials(&self) -> &CredentialCache<P> {
        &self.credentials
    }

    /// Transfers every record. Per-record failures land in the report; only an
    /// empty batch or an unusable destination is an `Err`.
    pub fn transfer(&self, records: &[Record], options: &TransferOptions) -> Result<TransferReport> {
        if records.is_empty() {
            return Err(Error::EmptyBatch);
        }
        if let TransferMode::Download(dir) = &options.mode {
            std::fs::create_dir_all(dir)?;
        }

        let workers = options.workers(records.len());
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("earthaccess-transfer-{i}"))
            .build()
            .map_err(std::io::Error::other)?;
        tracing::info!(items = records.len(), workers, "starting transfer");

        let conflicts = match &options.mode {
            TransferMode::Download(dir) => claim_targets(records, dir, options),
            TransferMode::Stream => HashMap::new(),
        };

        let pb = options.progress.then(|| progress_bar(records.len()));
        let finished: Vec<(TransferTask<'_>, Outcome)> = pool.install(|| {
            records
                .par_iter()
                .enumerate()
                .map(|(index, record)| {
                    let task = TransferTask::new(index, record);
                    let done = self.run(task, options, conflicts.get(&index));
                    if let Some(pb) = &pb {
                        pb.inc(1);
                    }
                    done
                })
                .collect()
        });
        if let Some(pb) = pb {
            pb.finish_and_clear();
        }

        let mut report = TransferReport {
            total: records.len(),
            ..Default::default()
        };
        for (task, outcome) in finished {
            report.attempts += task.attempts as usize;
            match outcome {
                Ok((artifact, skipped)) => {
                    report.skipped += usize::from(skipped);
                    report.succeeded.push(artifact);
                }
                Err(error) => report.failed.push(TransferFailure {
                    index: task.index,
                    record: task.record.clone(),
                    error,
                }),
            }
        }

        tracing::info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped,
            attempts = report.attempts,
            "transfer finished"
        );
        Ok(report)
    }

    fn run<'a>(
        &self,
        mut task: TransferTask<'a>,
        options: &TransferOptions,
        conflict: Option<&TransferTaskError>,
    ) -> (TransferTask<'a>, Outcome) {
        let outcome = match conflict {
            Some(error) => Err(error.clone()),
            None => self.execute(&mut task, options),
        };
        if let Err(error) = &outcome {
            tracing::warn!(
                concept_id = task.record.concept_id(),
                access = ?task.access,
                attempts = task.attempts,
                %error,
                "transfer failed"
            );
        }
        (task, outcome)
    }

    fn execute(
        &self,
        task: &mut TransferTask<'_>,
        options: &TransferOptions,
    ) -> Outcome {
        let (access, urls) = plan_links(task.record, options)?;
        task.access = Some(access);

        match &options.mode {
            TransferMode::Download(dir) => {
                let targets = urls
                    .iter()
                    .map(|url| target_path(dir, url).map(|path| (url.as_str(), path)))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                let pending: Vec<&(&str, PathBuf)> = targets
                    .iter()
                    .filter(|(_, path)| !(options.skip_existing && already_present(path)))
                    .collect();
                let paths: Vec<PathBuf> = targets.iter().map(|(_, p)| p.clone()).collect();

                if pending.is_empty() {
                    tracing::debug!(
                        concept_id = task.record.concept_id(),
                        "files already present, skipping"
                    );
                    return Ok((Artifact::Files(paths), true));
                }

                let scope = self.scope_for(task.record, access, options)?;
                for (url, path) in pending {
                    let bytes = self.with_retry(task, options, &scope, url, |cred| {
                        self.store.download(url, cred, path)
                    })?;
                    tracing::debug!(%url, path = %path.display(), bytes, "downloaded");
                }
                Ok((Artifact::Files(paths), false))
            }
            TransferMode::Stream => {
                let scope = self.scope_for(task.record, access, options)?;
                let mut files = Vec::with_capacity(urls.len());
                for url in &urls {
                    files.push(self.with_retry(task, options, &scope, url, |cred| {
                        self.store.open(url, cred)
                    })?);
                }
                Ok((Artifact::Streams(files), false))
            }
        }
    }

    /// One credential check per attempt, then the store call.
    fn with_retry<T>(
        &self,
        task: &mut TransferTask<'_>,
        options: &TransferOptions,
        scope: &CredentialScope,
        url: &str,
        mut op: impl FnMut(&Credential) -> std::result::Result<T, TransferTaskError>,
    ) -> std::result::Result<T, TransferTaskError> {
        let max_attempts = options.max_attempts.max(1);
        let mut attempt: u32 = 0;
        loop {
            if options.cancelled() {
                return Err(cancelled());
            }
            let credential = self.credentials.get(scope)?;
            attempt += 1;
            task.attempts += 1;

            match op(&credential) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = backoff(attempt - 1, options.backoff_base, options.backoff_max);
                    tracing::warn!(
                        %url,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    if options.cancelled() {
                        return Err(cancelled());
                    }
                    thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn scope_for(
        &self,
        record: &Record,
        access: AccessClass,
        options: &TransferOptions,
    ) -> std::result::Result<CredentialScope, TransferTaskError> {
        if access == AccessClass::External {
            return Ok(CredentialScope::Https);
        }
        let endpoint = options
            .s3_credentials_endpoint
            .clone()
            .or_else(|| record.s3_credentials_endpoint().map(str::to_string))
            .or_else(|| {
                record
                    .provider_id()
                    .and_then(daac::s3_credentials_endpoint)
                    .map(str::to_string)
            })
            .ok_or_else(|| {
                TransferTaskError::new(
                    FailureReason::Credential,
                    format!(
                        "no S3 credentials endpoint known for {}",
                        record.concept_id()
                    ),
                )
            })?;
        Ok(CredentialScope::S3 { endpoint })
    }
}

fn cancelled() -> TransferTaskError {
    TransferTaskError::new(FailureReason::Cancelled, "transfer cancelled")
}

fn select_access(
    record: &Record,
    preferred: AccessClass,
    fallback: bool,
) -> std::result::Result<AccessClass, TransferTaskError> {
    if !record.data_links(preferred).is_empty() {
        return Ok(preferred);
    }
    let other = preferred.other();
    if fallback && !record.data_links(other).is_empty() {
        tracing::debug!(
            concept_id = record.concept_id(),
            ?preferred,
            using = ?other,
            "no link of the preferred access class"
        );
        return Ok(other);
    }
    Err(TransferTaskError::new(
        FailureReason::NoAccessLink,
        format!("{} has no {preferred:?} data link", record.concept_id()),
    ))
}

/// Access class and de-duplicated data links a record's task will transfer.
fn plan_links(
    record: &Record,
    options: &TransferOptions,
) -> std::result::Result<(AccessClass, Vec<String>), TransferTaskError> {
    let access = select_access(record, options.access, options.fallback)?;
    let mut seen = HashSet::new();
    let urls = record
        .data_links(access)
        .into_iter()
        .map(normalize_data_url)
        .filter(|url| seen.insert(url.clone()))
        .collect();
    Ok((access, urls))
}

/// Assigns every local target to the first record (in input order) that needs it.
/// Later records that would write the same file are failed up front, so no task
/// can overwrite a sibling's file or mistake it for its own.
fn claim_targets(
    records: &[Record],
    dir: &Path,
    options: &TransferOptions,
) -> HashMap<usize, TransferTaskError> {
    let mut owners: HashMap<PathBuf, (usize, String)> = HashMap::new();
    let mut conflicts = HashMap::new();
    for (index, record) in records.iter().enumerate() {
        // Tasks that cannot plan fail on their own once they run.
        let Ok((_, urls)) = plan_links(record, options) else {
            continue;
        };
        let mut claimed: Vec<(PathBuf, String)> = Vec::with_capacity(urls.len());
        let mut conflict = None;
        for url in urls {
            let Ok(path) = target_path(dir, &url) else {
                continue;
            };
            let taken = owners
                .get(&path)
                .map(|(owner, owner_url)| (records[*owner].concept_id(), owner_url.as_str()))
                .or_else(|| {
                    claimed
                        .iter()
                        .find(|(p, _)| *p == path)
                        .map(|(_, own_url)| (record.concept_id(), own_url.as_str()))
                });
            if let Some((owner_id, owner_url)) = taken {
                conflict = Some(TransferTaskError::new(
                    FailureReason::LocalPathConflict,
                    format!("{url} and {owner_url} ({owner_id}) both map to {}", path.display()),
                ));
                break;
            }
            claimed.push((path, url));
        }
        // A failed record writes nothing, so it keeps none of its paths.
        match conflict {
            Some(error) => {
                conflicts.insert(index, error);
            }
            None => owners.extend(claimed.into_iter().map(|(path, url)| (path, (index, url)))),
        }
    }
    conflicts
}

fn target_path(dir: &Path, url: &str) -> std::result::Result<PathBuf, TransferTaskError> {
    let name = guess_filename_from_url(url).ok_or_else(|| {
        TransferTaskError::new(
            FailureReason::LocalPathConflict,
            format!("cannot derive a file name from {url}"),
        )
    })?;
    let path = dir.join(name);
    if path.is_dir() {
        return Err(TransferTaskError::new(
            FailureReason::LocalPathConflict,
            format!("{} is a directory", path.display()),
        ));
    }
    Ok(path)
}

fn already_present(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

fn progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) =
        ProgressStyle::with_template("{spinner:.green} {pos}/{len} files {wide_bar} {elapsed}")
    {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn granule(links: serde_json::Value) -> Record {
        Record::from_umm(
            json!({
                "meta": { "concept-id": "G1-PODAAC", "provider-id": "POCLOUD" },
                "umm": { "RelatedUrls": links }
            }),
            crate::record::RecordKind::Granule,
        )
        .unwrap()
    }

    #[test]
    fn worker_count_defaults_and_caps() {
        let opts = TransferOptions::stream();
        assert_eq!(opts.workers(3), 3);
        assert_eq!(opts.workers(100), DEFAULT_CONCURRENCY);
        assert_eq!(opts.clone().with_concurrency(64).workers(100), MAX_CONCURRENCY);
        assert_eq!(opts.with_concurrency(0).workers(5), 1);
    }

    #[test]
    fn access_selection_honours_fallback() {
        let https_only = Record::from_url("https://data.example/a.nc");
        assert_eq!(
            select_access(&https_only, AccessClass::Direct, true).unwrap(),
            AccessClass::External
        );
        let err = select_access(&https_only, AccessClass::Direct, false).unwrap_err();
        assert_eq!(err.reason, FailureReason::NoAccessLink);
    }

    #[test]
    fn target_paths_come_from_link_names() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            target_path(dir.path(), "https://h/x/a.nc?token=1").unwrap(),
            dir.path().join("a.nc")
        );
        let err = target_path(dir.path(), "https://h/x/").unwrap_err();
        assert_eq!(err.reason, FailureReason::LocalPathConflict);

        std::fs::create_dir(dir.path().join("b.nc")).unwrap();
        let err = target_path(dir.path(), "https://h/b.nc").unwrap_err();
        assert_eq!(err.reason, FailureReason::LocalPathConflict);
    }

    #[test]
    fn empty_files_are_not_trusted() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("e.nc");
        std::fs::write(&empty, b"").unwrap();
        let full = dir.path().join("f.nc");
        std::fs::write(&full, b"x").unwrap();
        assert!(!already_present(&empty));
        assert!(already_present(&full));
        assert!(!already_present(&dir.path().join("missing.nc")));
    }

    #[test]
    fn later_records_lose_a_shared_file_name() {
        let records = vec![
            Record::from_url("https://a.example/dir1/x.nc"),
            Record::from_url("https://b.example/y.nc"),
            Record::from_url("https://c.example/dir2/x.nc"),
        ];
        let dir = Path::new("/data");
        let conflicts = claim_targets(&records, dir, &TransferOptions::download(dir));
        assert_eq!(conflicts.len(), 1);
        let err = &conflicts[&2];
        assert_eq!(err.reason, FailureReason::LocalPathConflict);
        assert!(err.message.contains("https://a.example/dir1/x.nc"));
    }

    #[test]
    fn a_losing_record_claims_none_of_its_files() {
        let records = vec![
            Record::from_url("https://a.example/x.nc"),
            granule(json!([
                { "URL": "https://b.example/x.nc", "Type": "GET DATA" },
                { "URL": "https://b.example/y.nc", "Type": "GET DATA" }
            ])),
            Record::from_url("https://c.example/y.nc"),
        ];
        let dir = Path::new("/data");
        let conflicts = claim_targets(&records, dir, &TransferOptions::download(dir));
        assert_eq!(conflicts.keys().copied().collect::<Vec<_>>(), [1]);
    }

    #[test]
    fn repeated_links_are_transferred_once() {
        let record = granule(json!([
            { "URL": "https://data.example/a.nc", "Type": "GET DATA" },
            { "URL": "https://data.example/a.nc", "Type": "GET DATA" }
        ]));
        let (access, urls) = plan_links(&record, &TransferOptions::stream()).unwrap();
        assert_eq!(access, AccessClass::External);
        assert_eq!(urls, ["https://data.example/a.nc"]);
        let dir = Path::new("/data");
        assert!(claim_targets(&[record], dir, &TransferOptions::download(dir)).is_empty());
    }

    #[test]
    fn direct_scope_uses_table_when_record_is_silent() {
        let record = granule(json!([
            { "URL": "s3://podaac-ops/a.nc", "Type": "GET DATA VIA DIRECT ACCESS" }
        ]));
        let engine = TransferEngine::with_provider(NoStore, NoCreds);
        let scope = engine
            .scope_for(&record, AccessClass::Direct, &TransferOptions::stream())
            .unwrap();
        assert!(matches!(scope, CredentialScope::S3 { endpoint } if endpoint.contains("podaac")));

        let opts = TransferOptions::stream().with_s3_credentials_endpoint("https://x/s3credentials");
        let scope = engine.scope_for(&record, AccessClass::Direct, &opts).unwrap();
        assert_eq!(
            scope,
            CredentialScope::S3 {
                endpoint: "https://x/s3credentials".into()
            }
        );
    }

    struct NoStore;

    impl ObjectStore for NoStore {
        fn download(
            &self,
            url: &str,
            _: &Credential,
            _: &Path,
        ) -> std::result::Result<u64, TransferTaskError> {
            Err(TransferTaskError::new(FailureReason::NotFound, url))
        }

        fn open(&self, url: &str, _: &Credential) -> std::result::Result<RemoteFile, TransferTaskError> {
            Err(TransferTaskError::new(FailureReason::NotFound, url))
        }
    }

    struct NoCreds;

    impl CredentialProvider for NoCreds {
        fn s3_credentials(&self, _: &str) -> Result<crate::credentials::S3Credentials> {
            Err(Error::Credential("none".into()))
        }

        fn bearer_token(&self) -> Result<crate::credentials::BearerToken> {
            Err(Error::Credential("none".into()))
        }
    }
}
