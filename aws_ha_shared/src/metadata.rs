//! IMDSv2 instance-metadata probe.
//!
//! Every read first obtains a short-lived session token with
//! `PUT /latest/api/token` and presents it on the subsequent `GET`.

use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::{Body, Method, Request};
use tracing::debug;

use crate::{Error, MAX_TIMEOUT};

const META_DATA_HOST: &str = "http://169.254.169.254";
pub const META_DATA: &str = "/2014-02-25/meta-data";
const TOKEN_PATH: &str = "/latest/api/token";
const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";
const TOKEN_TTL_SECONDS: &str = "60";

/// Read-only access to the instance metadata service.
#[async_trait]
pub trait InstanceMetadata: Send + Sync {
    /// Fetches a metadata path (absolute, e.g. `/2014-02-25/meta-data/...`)
    /// and returns the body as text.
    async fn get(&self, path: &str) -> Result<String, Error>;

    /// The `Date:` response header of the metadata service, for clock
    /// comparison.
    async fn date_header(&self) -> Result<String, Error>;
}

pub struct ImdsClient {
    http: hyper::Client<HttpConnector>,
}

impl Default for ImdsClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ImdsClient {
    pub fn new() -> Self {
        Self {
            http: hyper::Client::new(),
        }
    }

    async fn token(&self) -> Result<String, Error> {
        let request = Request::builder()
            .method(Method::PUT)
            .uri(format!("{}{}", META_DATA_HOST, TOKEN_PATH))
            .header(TOKEN_TTL_HEADER, TOKEN_TTL_SECONDS)
            .body(Body::empty())?;
        let response = tokio::time::timeout(MAX_TIMEOUT, self.http.request(request)).await??;
        if !response.status().is_success() {
            return Err(Error::MetadataStatus {
                path: TOKEN_PATH.to_owned(),
                status: response.status().as_u16(),
            });
        }
        let body = hyper::body::to_bytes(response.into_body()).await?;
        Ok(String::from_utf8_lossy(&body).trim().to_owned())
    }

    async fn request(&self, path: &str) -> Result<hyper::Response<Body>, Error> {
        let token = self.token().await?;
        let request = Request::builder()
            .method(Method::GET)
            .uri(format!("{}{}", META_DATA_HOST, path).parse::<hyper::Uri>()?)
            .header(TOKEN_HEADER, token)
            .body(Body::empty())?;
        let response = tokio::time::timeout(MAX_TIMEOUT, self.http.request(request)).await??;
        if !response.status().is_success() {
            return Err(Error::MetadataStatus {
                path: path.to_owned(),
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl InstanceMetadata for ImdsClient {
    async fn get(&self, path: &str) -> Result<String, Error> {
        let response = self.request(path).await?;
        let body = hyper::body::to_bytes(response.into_body()).await?;
        let text = String::from_utf8_lossy(&body).into_owned();
        debug!("{} = {}", path, text.trim());
        Ok(text)
    }

    async fn date_header(&self) -> Result<String, Error> {
        let response = self.request(META_DATA).await?;
        response
            .headers()
            .get(hyper::header::DATE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| Error::MetadataUnavailable("Date header".to_owned()))
    }
}

/// The instance id of this machine.
pub async fn instance_id(metadata: &dyn InstanceMetadata) -> Result<String, Error> {
    Ok(metadata
        .get("/latest/meta-data/instance-id")
        .await?
        .trim()
        .to_owned())
}

/// The region this instance runs in, derived from its availability zone.
pub async fn region(metadata: &dyn InstanceMetadata) -> Result<String, Error> {
    let az = metadata
        .get(&format!("{}/placement/availability-zone", META_DATA))
        .await?;
    Ok(region_of(az.trim()))
}

/// Extracts the region from an availability-zone name by keeping the first
/// three dash-separated tokens, which also covers local zones
/// (`us-west-2-lax-1a` is in `us-west-2`).
pub fn region_of(az: &str) -> String {
    az.split('-').take(3).collect::<Vec<_>>().join("-")
}
