//! Blocking client for the registry HTTP API.
//!
//! See <https://distribution.github.io/distribution/spec/api/> for the
//! endpoints used here. Every request goes through [`RegistryClient::send`],
//! which answers a `401` by following the `WWW-Authenticate` challenge once
//! and replaying the request with the obtained token.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::{Body, Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Proxy, StatusCode, Url};
use tracing::{debug, info, warn};

use crate::auth::{AuthScheme, Challenge, Credentials, fetch_token};
use crate::config::Settings;
use crate::credentials::CredentialStore;
use crate::digest::{sha256_digest, validate_digest};
use crate::error::AppError;
use crate::model::{
    Descriptor, ImageManifest, ManifestKind, ManifestList, OCI_INDEX, OCI_MANIFEST, Platform,
    SCHEMA1_MANIFEST, SCHEMA2_MANIFEST, SCHEMA2_MANIFEST_LIST,
};
use crate::reference::ImageReference;

const USER_AGENT: &str = concat!("crpy/", env!("CARGO_PKG_VERSION"));
const MAX_ERROR_BODY: usize = 512;

/// Raw manifest document as served by the registry.
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub digest: Option<String>,
}

impl FetchedManifest {
    pub fn json(&self) -> Result<serde_json::Value, AppError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn kind(&self) -> Result<ManifestKind, AppError> {
        Ok(ManifestKind::detect(self.content_type.as_deref(), &self.json()?))
    }
}

/// Streaming body of a blob download.
pub struct BlobReader {
    response: Response,
    pub size: Option<u64>,
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.response.read(buf)
    }
}

pub struct RegistryClient {
    reference: ImageReference,
    http: Client,
    credentials: Option<Credentials>,
    token: Option<String>,
    basic: Option<Credentials>,
    push: bool,
    manifests: HashMap<(String, bool), FetchedManifest>,
}

impl RegistryClient {
    pub fn new(
        reference: ImageReference,
        settings: &Settings,
        proxy: Option<&str>,
    ) -> Result<Self, AppError> {
        let mut builder = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(settings.timeout_secs));
        if let Some(proxy) = proxy.or(settings.proxy.as_deref()) {
            debug!(proxy, "routing registry requests through proxy");
            builder = builder.proxy(Proxy::all(proxy)?);
        }

        Ok(RegistryClient {
            reference,
            http: builder.build()?,
            credentials: None,
            token: None,
            basic: None,
            push: false,
            manifests: HashMap::new(),
        })
    }

    /// Client preloaded with any credentials stored for the registry.
    pub fn connect(
        reference: ImageReference,
        settings: &Settings,
        proxy: Option<&str>,
    ) -> Result<Self, AppError> {
        let credentials = match CredentialStore::load()?.get(&reference.registry) {
            Ok(credentials) => credentials,
            Err(err) => {
                warn!(
                    registry = %reference.registry,
                    error = %err,
                    "ignoring unreadable stored credentials"
                );
                None
            }
        };
        Ok(RegistryClient::new(reference, settings, proxy)?.with_credentials(credentials))
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Request push access whenever the registry asks for a token.
    pub fn for_push(mut self) -> Self {
        self.push = true;
        self
    }

    pub fn reference(&self) -> &ImageReference {
        &self.reference
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Verify that the registry accepts `credentials` (or anonymous access).
    pub fn authenticate(&mut self, credentials: Option<Credentials>) -> Result<(), AppError> {
        if credentials.is_some() {
            self.credentials = credentials;
        }
        let url = self.reference.base_url();

        let response = self.authorize(self.http.get(&url)).send()?;
        if response.status() != StatusCode::UNAUTHORIZED {
            check_status(response, &url)?;
            return Ok(());
        }

        let challenge = self.challenge_from(&response)?;
        self.answer_challenge(&challenge)?;

        let response = self.authorize(self.http.get(&url)).send()?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(AppError::Unauthorized(format!(
                "could not authenticate to registry {}",
                self.reference.registry
            )));
        }
        check_status(response, &url)?;
        Ok(())
    }

    pub fn fetch_manifest(
        &mut self,
        reference: &str,
        list: bool,
    ) -> Result<FetchedManifest, AppError> {
        let key = (reference.to_string(), list);
        if let Some(cached) = self.manifests.get(&key) {
            return Ok(cached.clone());
        }

        let url = self.reference.manifest_url_for(reference);
        let accept = accept_header(list);
        let response = self.send(|http| http.get(&url).header(ACCEPT, accept.as_str()))?;
        let response = check_status(response, &url)?;

        let content_type = header_string(&response, CONTENT_TYPE.as_str());
        let digest = header_string(&response, "docker-content-digest");
        let body = response.bytes()?.to_vec();
        debug!(url, content_type = ?content_type, bytes = body.len(), "fetched manifest");

        let fetched = FetchedManifest { body, content_type, digest };
        self.manifests.insert(key, fetched.clone());
        Ok(fetched)
    }

    pub fn fetch_manifest_list(&mut self) -> Result<ManifestList, AppError> {
        let reference = self.reference.tag().to_string();
        let fetched = self.fetch_manifest(&reference, true)?;
        match fetched.kind()? {
            ManifestKind::List => Ok(serde_json::from_slice(&fetched.body)?),
            _ => Err(AppError::UnsupportedManifest(format!(
                "{} is a single-platform image without a manifest list",
                self.reference
            ))),
        }
    }

    /// Image manifest for `platform`, or for the registry default when `None`.
    pub fn resolve_manifest(
        &mut self,
        platform: Option<&Platform>,
    ) -> Result<ImageManifest, AppError> {
        let reference = self.reference.tag().to_string();
        let fetched = self.fetch_manifest(&reference, platform.is_some())?;

        match (fetched.kind()?, platform) {
            (ManifestKind::List, requested) => {
                let list: ManifestList = serde_json::from_slice(&fetched.body)?;
                let default = Platform::linux_amd64();
                self.select_from_list(&list, requested.unwrap_or(&default))
            }
            (ManifestKind::Image, Some(requested)) => {
                warn!(
                    image = %self.reference,
                    platform = %requested,
                    "registry returned a single-platform manifest; using it as is"
                );
                parse_image_manifest(&fetched.body)
            }
            (ManifestKind::Image, None) => parse_image_manifest(&fetched.body),
            (ManifestKind::Schema1, _) => Err(AppError::UnsupportedManifest(format!(
                "{} only provides a schema1 manifest",
                self.reference
            ))),
        }
    }

    fn select_from_list(
        &mut self,
        list: &ManifestList,
        platform: &Platform,
    ) -> Result<ImageManifest, AppError> {
        let entry = list.find(platform).ok_or_else(|| AppError::PlatformNotFound {
            platform: platform.to_string(),
            image: self.reference.to_string(),
            available: list.platforms().join(", "),
        })?;
        debug!(platform = %platform, digest = %entry.digest, "selected manifest from list");
        validate_digest(&entry.digest)?;

        let digest = entry.digest.clone();
        let fetched = self.fetch_manifest(&digest, false)?;
        match fetched.kind()? {
            ManifestKind::Image => parse_image_manifest(&fetched.body),
            _ => Err(AppError::UnsupportedManifest(format!(
                "manifest {digest} for {platform} is not an image manifest"
            ))),
        }
    }

    /// Layer descriptors of the image for `platform`.
    pub fn layer_digests(
        &mut self,
        platform: Option<&Platform>,
    ) -> Result<Vec<Descriptor>, AppError> {
        Ok(self.resolve_manifest(platform)?.layers)
    }

    /// Raw bytes of the image config blob, checked against its digest.
    pub fn fetch_config(&mut self, manifest: &ImageManifest) -> Result<Vec<u8>, AppError> {
        let digest = manifest.config.digest.clone();
        validate_digest(&digest)?;
        let url = self.reference.blob_url(&digest);
        let response = self.send(|http| http.get(&url))?;
        let bytes = check_status(response, &url)?.bytes()?.to_vec();

        let actual = sha256_digest(&bytes);
        if digest.starts_with("sha256:") && actual != digest {
            return Err(AppError::DigestMismatch { expected: digest, actual });
        }
        Ok(bytes)
    }

    pub fn blob_exists(&mut self, digest: &str) -> Result<bool, AppError> {
        validate_digest(digest)?;
        let url = self.reference.blob_url(digest);
        let response = self.send(|http| http.head(&url))?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(registry_error(response, &url)),
        }
    }

    pub fn open_blob(&mut self, digest: &str) -> Result<BlobReader, AppError> {
        validate_digest(digest)?;
        let url = self.reference.blob_url(digest);
        let response = self.send(|http| http.get(&url))?;
        let response = check_status(response, &url)?;
        let size = response.content_length();
        Ok(BlobReader { response, size })
    }

    /// Monolithic upload: open an upload session, then PUT the whole blob.
    pub fn upload_blob(&mut self, path: &Path, digest: &str, size: u64) -> Result<(), AppError> {
        let start_url = format!("{}/uploads/", self.reference.blobs_url());
        let response = self.send(|http| http.post(&start_url).body(Vec::<u8>::new()))?;
        let response = check_status(response, &start_url)?;
        let location = header_string(&response, LOCATION.as_str()).ok_or_else(|| {
            AppError::Registry {
                status: response.status().as_u16(),
                url: start_url.clone(),
                body: "upload session without a Location header".to_string(),
            }
        })?;

        let mut upload_url = self.resolve_location(&location)?;
        upload_url.query_pairs_mut().append_pair("digest", digest);
        debug!(url = %upload_url, digest, size, "uploading blob");

        let file = File::open(path)?;
        let response = self
            .authorize(self.http.put(upload_url.clone()))
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(Body::sized(file, size))
            .send()?;
        if response.status() != StatusCode::CREATED {
            return Err(registry_error(response, upload_url.as_str()));
        }
        Ok(())
    }

    /// Upload `manifest` under the reference's tag and return its digest.
    pub fn push_manifest(&mut self, manifest: &ImageManifest) -> Result<String, AppError> {
        let url = self.reference.manifest_url();
        let body = serde_json::to_vec_pretty(manifest)?;
        let media_type = manifest.media_type.clone().unwrap_or_else(|| SCHEMA2_MANIFEST.to_string());

        let response = self.send(|http| {
            http.put(&url).header(CONTENT_TYPE, media_type.as_str()).body(body.clone())
        })?;
        if response.status() != StatusCode::CREATED {
            return Err(registry_error(response, &url));
        }
        Ok(header_string(&response, "docker-content-digest")
            .unwrap_or_else(|| sha256_digest(&body)))
    }

    fn send<F>(&mut self, build: F) -> Result<Response, AppError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let response = self.authorize(build(&self.http)).send()?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = self.challenge_from(&response)?;
        self.answer_challenge(&challenge)?;

        let response = self.authorize(build(&self.http)).send()?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(AppError::Unauthorized(format!(
                "could not authenticate to registry {}",
                self.reference
            )));
        }
        Ok(response)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        if let Some(token) = &self.token {
            request.bearer_auth(token)
        } else if let Some(basic) = &self.basic {
            request.basic_auth(&basic.username, Some(&basic.password))
        } else {
            request
        }
    }

    fn challenge_from(&self, response: &Response) -> Result<Challenge, AppError> {
        let header = header_string(response, WWW_AUTHENTICATE.as_str()).ok_or_else(|| {
            AppError::Unauthorized(format!(
                "{} answered 401 without an authentication challenge",
                self.reference.registry
            ))
        })?;
        let challenge = Challenge::parse(&header)?;
        Ok(if self.push { challenge.with_push_scope() } else { challenge })
    }

    fn answer_challenge(&mut self, challenge: &Challenge) -> Result<(), AppError> {
        match challenge.scheme {
            AuthScheme::Bearer => {
                let token = fetch_token(&self.http, challenge, self.credentials.as_ref())?;
                self.token = Some(token);
                self.basic = None;
            }
            AuthScheme::Basic => {
                let credentials = self.credentials.clone().ok_or_else(|| {
                    AppError::Unauthorized(format!(
                        "{} requires a login, run `crpy login {}` first",
                        self.reference.registry, self.reference.registry
                    ))
                })?;
                self.basic = Some(credentials);
                self.token = None;
            }
        }
        info!("Authenticated at {}", self.reference);
        Ok(())
    }

    fn resolve_location(&self, location: &str) -> Result<Url, AppError> {
        let base =
            Url::parse(&self.reference.base_url()).map_err(|_| AppError::Url(location.to_string()))?;
        base.join(location).map_err(|_| AppError::Url(location.to_string()))
    }
}

/// Image manifest whose config and layer digests are all well formed.
fn parse_image_manifest(body: &[u8]) -> Result<ImageManifest, AppError> {
    let manifest: ImageManifest = serde_json::from_slice(body)?;
    validate_digest(&manifest.config.digest)?;
    for layer in &manifest.layers {
        validate_digest(&layer.digest)?;
    }
    Ok(manifest)
}

fn accept_header(list: bool) -> String {
    let mut types = vec![SCHEMA1_MANIFEST, SCHEMA2_MANIFEST, OCI_MANIFEST];
    if list {
        types.extend([SCHEMA2_MANIFEST_LIST, OCI_INDEX]);
    }
    types.join(", ")
}

fn header_string(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .filter(|value| !value.is_empty())
}

fn check_status(response: Response, url: &str) -> Result<Response, AppError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(registry_error(response, url))
    }
}

fn registry_error(response: Response, url: &str) -> AppError {
    let status = response.status().as_u16();
    let mut body = response.text().unwrap_or_default().trim().to_string();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push_str("...");
    }
    AppError::Registry { status, url: url.to_string(), body }
}
