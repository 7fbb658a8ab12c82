//! Parsing of image references such as `alpine`, `gcr.io/distroless/cc:latest`
//! or `http://localhost:5000/team/app@sha256:...`.

use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

pub const DOCKER_HUB: &str = "index.docker.io";
pub const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    Tag(String),
    Digest(String),
}

impl Reference {
    pub fn as_str(&self) -> &str {
        match self {
            Reference::Tag(tag) => tag,
            Reference::Digest(digest) => digest,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub reference: Reference,
    pub https: bool,
}

impl ImageReference {
    pub fn new(registry: &str, repository: &str, tag: &str) -> Self {
        ImageReference {
            registry: registry.to_string(),
            repository: repository.to_string(),
            reference: Reference::Tag(tag.to_string()),
            https: true,
        }
    }

    pub fn parse(input: &str) -> Result<Self, AppError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(AppError::invalid_reference(input, "empty reference"));
        }

        let (scheme, rest, has_scheme) = match trimmed.split_once("://") {
            Some((scheme, rest)) => (scheme, rest, true),
            None => ("https", trimmed, false),
        };
        if scheme != "https" && scheme != "http" {
            return Err(AppError::invalid_reference(input, format!("unsupported scheme '{scheme}'")));
        }

        let slashes = rest.matches('/').count();
        let first_segment = rest.split('/').next().unwrap_or_default();
        // `alpine`, `alpine:3` and `bitnami/postgres` live on Docker Hub, but
        // `myregistry.com/alpine` and `localhost:5000/alpine` name a registry.
        let hub_image = slashes == 0
            || (slashes == 1 && !first_segment.contains('.') && !first_segment.contains(':'));

        let (registry, remainder) = if !has_scheme && hub_image {
            let remainder =
                if rest.contains('/') { rest.to_string() } else { format!("library/{rest}") };
            (DOCKER_HUB.to_string(), remainder)
        } else {
            let (registry, remainder) = rest
                .split_once('/')
                .ok_or_else(|| AppError::invalid_reference(input, "missing repository"))?;
            let remainder = if registry.contains("docker.io") && !remainder.contains('/') {
                format!("library/{remainder}")
            } else {
                remainder.to_string()
            };
            (registry.to_string(), remainder)
        };

        if registry.is_empty() {
            return Err(AppError::invalid_reference(input, "missing registry"));
        }

        let (name, reference) = split_reference(&remainder)
            .map_err(|reason| AppError::invalid_reference(input, reason))?;
        let repository = name.trim_matches('/');
        if repository.is_empty() {
            return Err(AppError::invalid_reference(input, "missing repository"));
        }

        Ok(ImageReference {
            registry,
            repository: repository.to_string(),
            reference,
            https: scheme == "https",
        })
    }

    /// Reference to a registry without a repository, as given to `login`.
    pub fn registry_only(input: &str) -> Result<Self, AppError> {
        let trimmed = input.trim();
        let (scheme, rest) = trimmed.split_once("://").unwrap_or(("https", trimmed));
        if scheme != "https" && scheme != "http" {
            return Err(AppError::invalid_reference(input, format!("unsupported scheme '{scheme}'")));
        }
        let registry = rest.split('/').next().unwrap_or_default();
        if registry.is_empty() {
            return Err(AppError::invalid_reference(input, "missing registry"));
        }
        Ok(ImageReference {
            registry: registry.to_string(),
            repository: String::new(),
            reference: Reference::Tag(DEFAULT_TAG.to_string()),
            https: scheme == "https",
        })
    }

    pub fn scheme(&self) -> &'static str {
        if self.https { "https" } else { "http" }
    }

    /// The `/v2/` API root of the registry.
    pub fn base_url(&self) -> String {
        format!("{}://{}/v2/", self.scheme(), self.registry)
    }

    pub fn manifest_url(&self) -> String {
        self.manifest_url_for(self.reference.as_str())
    }

    pub fn manifest_url_for(&self, reference: &str) -> String {
        format!("{}://{}/v2/{}/manifests/{}", self.scheme(), self.registry, self.repository, reference)
    }

    pub fn blobs_url(&self) -> String {
        format!("{}://{}/v2/{}/blobs", self.scheme(), self.registry, self.repository)
    }

    pub fn blob_url(&self, digest: &str) -> String {
        format!("{}/{}", self.blobs_url(), digest)
    }

    /// Same repository, pinned to `digest`.
    pub fn with_digest(&self, digest: &str) -> Self {
        ImageReference { reference: Reference::Digest(digest.to_string()), ..self.clone() }
    }

    /// Tag, or digest for digest references; used in progress output.
    pub fn tag(&self) -> &str {
        self.reference.as_str()
    }
}

fn split_reference(remainder: &str) -> Result<(&str, Reference), String> {
    if let Some((name, digest)) = remainder.split_once('@') {
        if !digest.contains(':') || digest.ends_with(':') {
            return Err(format!("malformed digest '{digest}'"));
        }
        // `repo:tag@digest` pins by digest; the tag is informational only.
        let (name, _) = split_tag(name);
        return Ok((name, Reference::Digest(digest.to_string())));
    }

    match split_tag(remainder) {
        (name, Some(tag)) if tag.is_empty() => Err(format!("empty tag for '{name}'")),
        (_, Some(tag)) if tag.contains(':') => Err(format!("malformed tag '{tag}'")),
        (name, Some(tag)) => Ok((name, Reference::Tag(tag.to_string()))),
        (name, None) => Ok((name, Reference::Tag(DEFAULT_TAG.to_string()))),
    }
}

fn split_tag(name: &str) -> (&str, Option<&str>) {
    let last_segment = name.rfind('/').map(|idx| idx + 1).unwrap_or(0);
    match name[last_segment..].find(':') {
        Some(idx) => {
            let split = last_segment + idx;
            (&name[..split], Some(&name[split + 1..]))
        }
        None => (name, None),
    }
}

impl FromStr for ImageReference {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ImageReference::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reference {
            Reference::Tag(tag) => write!(f, "{}/{}:{}", self.registry, self.repository, tag),
            Reference::Digest(digest) => {
                write!(f, "{}/{}@{}", self.registry, self.repository, digest)
            }
        }
    }
}
