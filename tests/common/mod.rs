#![allow(dead_code)]

use crpy::digest::sha256_digest;
use crpy::model::{CONTAINER_CONFIG, Descriptor, ImageManifest, LAYER_TAR_GZIP, SCHEMA2_MANIFEST};
use mockito::{Matcher, Mock, ServerGuard};

pub const TOKEN: &str = "secret-token";

pub struct FakeImage {
    pub config: Vec<u8>,
    pub layers: Vec<Vec<u8>>,
}

impl FakeImage {
    pub fn new() -> Self {
        FakeImage {
            config: br#"{"architecture":"amd64","os":"linux","config":{"Cmd":["/bin/sh"]}}"#
                .to_vec(),
            layers: vec![b"first layer".to_vec(), b"second layer".to_vec()],
        }
    }

    pub fn config_digest(&self) -> String {
        sha256_digest(&self.config)
    }

    pub fn layer_digests(&self) -> Vec<String> {
        self.layers.iter().map(|layer| sha256_digest(layer)).collect()
    }

    pub fn manifest(&self) -> ImageManifest {
        let config =
            Descriptor::new(CONTAINER_CONFIG, self.config.len() as u64, self.config_digest());
        let layers = self
            .layers
            .iter()
            .map(|layer| Descriptor::new(LAYER_TAR_GZIP, layer.len() as u64, sha256_digest(layer)))
            .collect();
        ImageManifest::new(config, layers)
    }

    pub fn manifest_json(&self) -> String {
        serde_json::to_string(&self.manifest()).unwrap()
    }
}

pub fn challenge(server: &ServerGuard, repository: &str, action: &str) -> String {
    format!(
        r#"Bearer realm="{}/token",service="fake-registry",scope="repository:{}:{}""#,
        server.url(),
        repository,
        action
    )
}

pub fn bearer() -> String {
    format!("Bearer {TOKEN}")
}

pub struct ServedImage {
    pub manifest: Mock,
    pub config: Mock,
    pub layers: Vec<Mock>,
    pub auth: Vec<Mock>,
}

/// Serve `image` as `<repository>:<tag>` behind a bearer token challenge.
pub fn serve_image(
    server: &mut ServerGuard,
    repository: &str,
    tag: &str,
    image: &FakeImage,
) -> ServedImage {
    let challenge = challenge(server, repository, "pull");
    let auth = vec![
        server
            .mock("GET", Matcher::Regex(format!("^/v2/{repository}/")))
            .match_header("authorization", Matcher::Missing)
            .with_status(401)
            .with_header("www-authenticate", &challenge)
            .expect_at_least(0)
            .create(),
        server
            .mock("GET", "/token")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!(r#"{{"token":"{TOKEN}"}}"#))
            .expect_at_least(1)
            .create(),
    ];

    let manifest = server
        .mock("GET", format!("/v2/{repository}/manifests/{tag}").as_str())
        .match_header("authorization", bearer().as_str())
        .with_status(200)
        .with_header("content-type", SCHEMA2_MANIFEST)
        .with_body(image.manifest_json())
        .expect_at_least(1)
        .create();

    let config = server
        .mock("GET", format!("/v2/{repository}/blobs/{}", image.config_digest()).as_str())
        .match_header("authorization", bearer().as_str())
        .with_status(200)
        .with_body(&image.config)
        .expect_at_least(1)
        .create();

    let layers = image
        .layers
        .iter()
        .map(|layer| {
            server
                .mock("GET", format!("/v2/{repository}/blobs/{}", sha256_digest(layer)).as_str())
                .match_header("authorization", bearer().as_str())
                .with_status(200)
                .with_body(layer)
                .expect(1)
                .create()
        })
        .collect();

    ServedImage { manifest, config, layers, auth }
}
