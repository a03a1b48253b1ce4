//! Query-string presigning of S3 `GET` requests.

use std::time::{Duration, SystemTime};

use aws_credential_types::Credentials;
use aws_sigv4::http_request::{
    PercentEncodingMode, SignableBody, SignableRequest, SignatureLocation, SigningParams,
    SigningSettings, UriPathNormalizationMode, sign,
};
use aws_sigv4::sign::v4;
use aws_smithy_runtime_api::client::identity::Identity;
use reqwest::Url;

use crate::credentials::S3Credentials;
use crate::error::{FailureReason, TransferTaskError};

#[derive(Debug, Clone)]
pub(crate) struct PresignRequest<'a> {
    pub bucket: &'a str,
    pub key: &'a str,
    pub region: &'a str,
    pub expires_in: Duration,
    pub now: SystemTime,
}

/// Regional URL of `bucket`/`key`. Buckets with dots use path style so the TLS
/// wildcard certificate still matches.
pub(crate) fn object_url(bucket: &str, key: &str, region: &str) -> Option<Url> {
    let (host, prefix) = if bucket.contains('.') {
        (format!("s3.{region}.amazonaws.com"), Some(bucket))
    } else {
        (format!("{bucket}.s3.{region}.amazonaws.com"), None)
    };
    let mut url = Url::parse(&format!("https://{host}/")).ok()?;
    url.path_segments_mut()
        .ok()?
        .clear()
        .extend(prefix)
        .extend(key.split('/'));
    Some(url)
}

pub(crate) fn presign_get(
    req: &PresignRequest<'_>,
    creds: &S3Credentials,
) -> Result<Url, TransferTaskError> {
    let mut url = object_url(req.bucket, req.key, req.region).ok_or_else(|| {
        TransferTaskError::new(
            FailureReason::Other,
            format!("cannot address s3://{}/{}", req.bucket, req.key),
        )
    })?;

    let session_token = (!creds.session_token.is_empty()).then(|| creds.session_token.clone());
    let identity: Identity = Credentials::new(
        creds.access_key_id.clone(),
        creds.secret_access_key.clone(),
        session_token,
        None,
        "earthaccess",
    )
    .into();

    let mut settings = SigningSettings::default();
    settings.signature_location = SignatureLocation::QueryParams;
    settings.expires_in = Some(req.expires_in);
    // S3 signs the path as sent, without normalisation or double encoding.
    settings.percent_encoding_mode = PercentEncodingMode::Single;
    settings.uri_path_normalization_mode = UriPathNormalizationMode::Disabled;

    let params: SigningParams<'_> = v4::SigningParams::builder()
        .identity(&identity)
        .region(req.region)
        .name("s3")
        .time(req.now)
        .settings(settings)
        .build()
        .map_err(signing_error)?
        .into();

    let signable = SignableRequest::new(
        "GET",
        url.as_str(),
        std::iter::empty(),
        SignableBody::UnsignedPayload,
    )
    .map_err(signing_error)?;
    let (instructions, _signature) = sign(signable, &params).map_err(signing_error)?.into_parts();
    let (_headers, query) = instructions.into_parts();

    {
        let mut pairs = url.query_pairs_mut();
        for (name, value) in &query {
            pairs.append_pair(name, value);
        }
    }
    Ok(url)
}

fn signing_error(err: impl std::fmt::Display) -> TransferTaskError {
    TransferTaskError::new(
        FailureReason::Credential,
        format!("could not presign S3 request: {err}"),
    )
}
