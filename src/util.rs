use std::time::Duration;

pub(crate) fn retriable_status(code: u16) -> bool {
    matches!(code, 500 | 502 | 503 | 504 | 429 | 408)
}

/// Delay before retry number `retry` (0 = first retry): `base * 2^retry`, capped at `max`.
pub(crate) fn backoff(retry: u32, base: Duration, max: Duration) -> Duration {
    let next = base.saturating_mul(2_u32.saturating_pow(retry));
    if next > max { max } else { next }
}

pub(crate) fn guess_filename_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().and_then(|s| {
        if s.is_empty() || s == "." || s == ".." {
            None
        } else {
            Some(s.to_string())
        }
    })
}

/// OPeNDAP landing links end in `.html`; the data itself lives at the bare path.
pub(crate) fn normalize_data_url(url: &str) -> String {
    if url.contains("opendap") && url.ends_with(".html") {
        url.trim_end_matches(".html").to_string()
    } else {
        url.to_string()
    }
}

pub(crate) fn urljoin(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

/// `C1299783579-LPDAAC_ECS` -> `LPDAAC_ECS`.
pub(crate) fn provider_from_concept_id(concept_id: &str) -> Option<&str> {
    concept_id
        .split_once('-')
        .map(|(_, p)| p)
        .filter(|p| !p.is_empty())
}

/// `s3://bucket/key/parts` -> `("bucket", "key/parts")`.
pub(crate) fn split_s3_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("s3://")?;
    let (bucket, key) = rest.split_once('/')?;
    if bucket.is_empty() || key.is_empty() {
        return None;
    }
    Some((bucket, key))
}
