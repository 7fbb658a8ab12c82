mod common;

use std::fs::File;
use std::io::{BufWriter, Write};

use assert_fs::prelude::*;
use common::{FakeImage, TOKEN, bearer, challenge, serve_image};
use crpy::archive::{ImageArchive, ImageArchiveWriter};
use crpy::auth::Credentials;
use crpy::cache::LayerCache;
use crpy::commands::pull::pull_image;
use crpy::commands::push::push_image;
use crpy::config::Settings;
use crpy::digest::sha256_digest;
use crpy::error::AppError;
use crpy::model::{
    CONTAINER_CONFIG, Descriptor, ImageManifest, LAYER_TAR_GZIP, OCI_INDEX, Platform, SCHEMA2_MANIFEST,
};
use crpy::reference::ImageReference;
use crpy::registry::RegistryClient;
use mockito::Matcher;

fn client_for(server: &mockito::ServerGuard, image: &str) -> RegistryClient {
    let reference =
        ImageReference::parse(&format!("http://{}/{}", server.host_with_port(), image)).unwrap();
    RegistryClient::new(reference, &Settings::default(), None).unwrap()
}

#[test]
fn pull_authenticates_and_writes_archive() {
    let mut server = mockito::Server::new();
    let image = FakeImage::new();
    let served = serve_image(&mut server, "library/alpine", "3.18", &image);

    let temp = assert_fs::TempDir::new().unwrap();
    let cache = LayerCache::new(temp.child("cache").path().to_path_buf());
    let output = temp.child("alpine.tar");

    let mut client = client_for(&server, "library/alpine:3.18");
    pull_image(&mut client, &cache, None, true, output.path()).unwrap();
    assert_eq!(client.token(), Some(TOKEN));

    let archive = ImageArchive::open(output.path()).unwrap();
    let expected_tag = format!("{}/library/alpine:3.18", server.host_with_port());
    assert_eq!(archive.entry().repo_tags, vec![expected_tag]);
    assert_eq!(std::fs::read(archive.config_path().unwrap()).unwrap(), image.config);
    let layers: Vec<Vec<u8>> = archive
        .layer_paths()
        .unwrap()
        .iter()
        .map(|path| std::fs::read(path).unwrap())
        .collect();
    assert_eq!(layers, image.layers);

    for layer in &served.layers {
        layer.assert();
    }
    assert_eq!(cache.entries().unwrap().len(), 2);
}

#[test]
fn second_pull_reuses_cached_layers() {
    let mut server = mockito::Server::new();
    let image = FakeImage::new();
    let served = serve_image(&mut server, "library/alpine", "latest", &image);

    let temp = assert_fs::TempDir::new().unwrap();
    let cache = LayerCache::new(temp.child("cache").path().to_path_buf());

    let mut first = client_for(&server, "library/alpine");
    pull_image(&mut first, &cache, None, true, temp.child("one.tar").path()).unwrap();
    let mut second = client_for(&server, "library/alpine");
    pull_image(&mut second, &cache, None, true, temp.child("two.tar").path()).unwrap();

    // each layer blob was downloaded exactly once
    for layer in &served.layers {
        layer.assert();
    }
    temp.child("two.tar").assert(predicates::path::is_file());
}

#[test]
fn pull_without_cache_leaves_cache_empty() {
    let mut server = mockito::Server::new();
    let image = FakeImage::new();
    let _served = serve_image(&mut server, "library/alpine", "latest", &image);

    let temp = assert_fs::TempDir::new().unwrap();
    let cache = LayerCache::new(temp.child("cache").path().to_path_buf());
    let mut client = client_for(&server, "library/alpine");
    pull_image(&mut client, &cache, None, false, temp.child("out.tar").path()).unwrap();

    assert!(cache.entries().unwrap().is_empty());
    assert_eq!(ImageArchive::open(temp.child("out.tar").path()).unwrap().entry().layers.len(), 2);
}

#[test]
fn corrupted_layer_fails_the_pull() {
    let mut server = mockito::Server::new();
    let mut image = FakeImage::new();
    image.layers = vec![b"good".to_vec()];
    let manifest = image.manifest();
    let _manifest = server
        .mock("GET", "/v2/team/app/manifests/latest")
        .with_header("content-type", SCHEMA2_MANIFEST)
        .with_body(serde_json::to_string(&manifest).unwrap())
        .create();
    let _config = server
        .mock("GET", format!("/v2/team/app/blobs/{}", image.config_digest()).as_str())
        .with_body(&image.config)
        .create();
    let _layer = server
        .mock("GET", format!("/v2/team/app/blobs/{}", sha256_digest(b"good")).as_str())
        .with_body("evil")
        .create();

    let temp = assert_fs::TempDir::new().unwrap();
    let cache = LayerCache::new(temp.child("cache").path().to_path_buf());
    let output = temp.child("app.tar");
    let mut client = client_for(&server, "team/app");

    let result = pull_image(&mut client, &cache, None, true, output.path());
    assert!(matches!(result, Err(AppError::DigestMismatch { .. })));
    output.assert(predicates::path::missing());
    assert!(cache.entries().unwrap().is_empty());
}

struct MultiPlatform {
    amd64: ImageManifest,
    arm64: ImageManifest,
    _mocks: Vec<mockito::Mock>,
}

fn platform_manifest(name: &str) -> ImageManifest {
    let config = format!(r#"{{"architecture":"{name}"}}"#);
    let layer = Descriptor::new(LAYER_TAR_GZIP, 4, sha256_digest(format!("{name} layer").as_bytes()));
    ImageManifest::new(
        Descriptor::new(CONTAINER_CONFIG, config.len() as u64, sha256_digest(config.as_bytes())),
        vec![layer],
    )
}

fn serve_multi_platform(server: &mut mockito::ServerGuard) -> MultiPlatform {
    let amd64 = platform_manifest("amd64");
    let arm64 = platform_manifest("arm64");
    let amd64_body = serde_json::to_string(&amd64).unwrap();
    let arm64_body = serde_json::to_string(&arm64).unwrap();
    let amd64_digest = sha256_digest(amd64_body.as_bytes());
    let arm64_digest = sha256_digest(arm64_body.as_bytes());

    let list = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": OCI_INDEX,
        "manifests": [
            {
                "mediaType": SCHEMA2_MANIFEST,
                "size": amd64_body.len(),
                "digest": amd64_digest,
                "platform": {"os": "linux", "architecture": "amd64"}
            },
            {
                "mediaType": SCHEMA2_MANIFEST,
                "size": arm64_body.len(),
                "digest": arm64_digest,
                "platform": {"os": "linux", "architecture": "arm64", "variant": "v8"}
            }
        ]
    });
    let mocks = vec![
        server
            .mock("GET", "/v2/library/multi/manifests/latest")
            .with_header("content-type", OCI_INDEX)
            .with_body(list.to_string())
            .create(),
        server
            .mock("GET", format!("/v2/library/multi/manifests/{amd64_digest}").as_str())
            .with_header("content-type", SCHEMA2_MANIFEST)
            .with_body(amd64_body)
            .create(),
        server
            .mock("GET", format!("/v2/library/multi/manifests/{arm64_digest}").as_str())
            .with_header("content-type", SCHEMA2_MANIFEST)
            .with_body(arm64_body)
            .create(),
    ];
    MultiPlatform { amd64, arm64, _mocks: mocks }
}

#[test]
fn resolves_requested_platform_from_index() {
    let mut server = mockito::Server::new();
    let served = serve_multi_platform(&mut server);

    let mut client = client_for(&server, "library/multi");
    let platform: Platform = "linux/arm64/v8".parse().unwrap();
    let manifest = client.resolve_manifest(Some(&platform)).unwrap();
    assert_eq!(manifest.config.digest, served.arm64.config.digest);

    let list = client.fetch_manifest_list().unwrap();
    assert_eq!(list.platforms(), vec!["linux/amd64", "linux/arm64/v8"]);
}

#[test]
fn index_without_platform_defaults_to_linux_amd64() {
    let mut server = mockito::Server::new();
    let served = serve_multi_platform(&mut server);

    let mut client = client_for(&server, "library/multi");
    let manifest = client.resolve_manifest(None).unwrap();
    assert_eq!(manifest.config.digest, served.amd64.config.digest);

    let layers = client.layer_digests(None).unwrap();
    assert_eq!(layers, served.amd64.layers);
}

#[test]
fn layer_digests_follow_the_requested_platform() {
    let mut server = mockito::Server::new();
    let served = serve_multi_platform(&mut server);

    let mut client = client_for(&server, "library/multi");
    let platform: Platform = "linux/arm64/v8".parse().unwrap();
    assert_eq!(client.layer_digests(Some(&platform)).unwrap(), served.arm64.layers);
}

#[test]
fn unknown_platform_lists_the_available_ones() {
    let mut server = mockito::Server::new();
    let _served = serve_multi_platform(&mut server);

    let mut client = client_for(&server, "library/multi");
    let platform: Platform = "windows/amd64".parse().unwrap();
    match client.resolve_manifest(Some(&platform)) {
        Err(err @ AppError::PlatformNotFound { .. }) => {
            let message = err.to_string();
            assert!(message.contains("windows/amd64"));
            assert!(message.contains("linux/arm64/v8"));
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn manifest_with_path_like_layer_digest_is_refused() {
    let mut server = mockito::Server::new();
    let temp = assert_fs::TempDir::new().unwrap();
    let victim = temp.child("victim.txt");
    let config = br#"{"os":"linux"}"#;

    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": SCHEMA2_MANIFEST,
        "config": {"mediaType": CONTAINER_CONFIG, "size": config.len(), "digest": sha256_digest(config)},
        "layers": [{"mediaType": LAYER_TAR_GZIP, "size": 6, "digest": victim.path().display().to_string()}]
    });
    let _manifest = server
        .mock("GET", "/v2/team/app/manifests/latest")
        .with_header("content-type", SCHEMA2_MANIFEST)
        .with_body(manifest.to_string())
        .create();
    let _config = server
        .mock("GET", format!("/v2/team/app/blobs/{}", sha256_digest(config)).as_str())
        .with_body(&config[..])
        .create();
    let _blobs = server
        .mock("GET", Matcher::Regex("^/v2/team/app/blobs/.*victim".to_string()))
        .with_body("PWNED")
        .create();

    let cache = LayerCache::new(temp.child("cache").path().to_path_buf());
    let output = temp.child("app.tar");
    let mut client = client_for(&server, "team/app");

    let result = pull_image(&mut client, &cache, None, true, output.path());
    assert!(matches!(result, Err(AppError::InvalidDigest { .. })), "got {result:?}");
    victim.assert(predicates::path::missing());
    output.assert(predicates::path::missing());
}

#[test]
fn second_rejection_is_reported_as_unauthorized() {
    let mut server = mockito::Server::new();
    let challenge = challenge(&server, "private/app", "pull");
    let _manifest = server
        .mock("GET", "/v2/private/app/manifests/latest")
        .with_status(401)
        .with_header("www-authenticate", &challenge)
        .create();
    let _token = server
        .mock("GET", "/token")
        .match_query(Matcher::Any)
        .with_body(r#"{"token":"useless"}"#)
        .create();

    let mut client = client_for(&server, "private/app");
    match client.resolve_manifest(None) {
        Err(AppError::Unauthorized(message)) => assert!(message.contains("could not authenticate")),
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn login_exchanges_credentials_for_a_token() {
    let mut server = mockito::Server::new();
    let challenge = format!(r#"Bearer realm="{}/token",service="fake-registry""#, server.url());
    let _probe = server
        .mock("GET", "/v2/")
        .match_header("authorization", Matcher::Missing)
        .with_status(401)
        .with_header("www-authenticate", &challenge)
        .create();
    let token = server
        .mock("GET", "/token")
        .match_query(Matcher::Any)
        .match_header("authorization", "Basic dXNlcjpwYXNz")
        .with_body(format!(r#"{{"token":"{TOKEN}"}}"#))
        .create();
    let authorized = server
        .mock("GET", "/v2/")
        .match_header("authorization", bearer().as_str())
        .with_status(200)
        .with_body("{}")
        .create();

    let reference =
        ImageReference::registry_only(&format!("http://{}", server.host_with_port())).unwrap();
    let mut client = RegistryClient::new(reference, &Settings::default(), None).unwrap();
    client.authenticate(Some(Credentials::new("user", "pass"))).unwrap();

    token.assert();
    authorized.assert();
}

#[test]
fn basic_challenge_uses_stored_credentials() {
    let mut server = mockito::Server::new();
    let _probe = server
        .mock("GET", "/v2/")
        .match_header("authorization", Matcher::Missing)
        .with_status(401)
        .with_header("www-authenticate", r#"Basic realm="Registry Realm""#)
        .create();
    let authorized = server
        .mock("GET", "/v2/")
        .match_header("authorization", "Basic dXNlcjpwYXNz")
        .with_status(200)
        .create();

    let reference =
        ImageReference::registry_only(&format!("http://{}", server.host_with_port())).unwrap();
    let mut client = RegistryClient::new(reference.clone(), &Settings::default(), None).unwrap();
    client.authenticate(Some(Credentials::new("user", "pass"))).unwrap();
    authorized.assert();

    let mut anonymous = RegistryClient::new(reference, &Settings::default(), None).unwrap();
    assert!(matches!(anonymous.authenticate(None), Err(AppError::Unauthorized(_))));
}

fn write_image_archive(dir: &assert_fs::TempDir, config: &[u8], layer: &[u8]) -> std::path::PathBuf {
    let blob = dir.child("layer-blob");
    blob.write_binary(layer).unwrap();
    let output = dir.child("image.tar");
    let mut writer = ImageArchiveWriter::new(BufWriter::new(File::create(output.path()).unwrap()));
    writer.add_config(&sha256_digest(config), config).unwrap();
    writer.add_layer(&sha256_digest(layer), blob.path()).unwrap();
    writer.finish(vec![]).unwrap().flush().unwrap();
    output.path().to_path_buf()
}

#[test]
fn push_uploads_missing_blobs_and_manifest() {
    let mut server = mockito::Server::new();
    let config = br#"{"os":"linux","architecture":"amd64"}"#.to_vec();
    let layer = b"plain tar layer".to_vec();
    let config_digest = sha256_digest(&config);
    let layer_digest = sha256_digest(&layer);

    let push_challenge = challenge(&server, "team/app", "pull");
    let _unauthorized = server
        .mock("HEAD", Matcher::Regex("^/v2/team/app/blobs/".to_string()))
        .match_header("authorization", Matcher::Missing)
        .with_status(401)
        .with_header("www-authenticate", &push_challenge)
        .create();
    let token = server
        .mock("GET", "/token")
        .match_query(Matcher::UrlEncoded("scope".into(), "repository:team/app:pull,push".into()))
        .with_body(format!(r#"{{"token":"{TOKEN}"}}"#))
        .create();
    let _config_missing = server
        .mock("HEAD", format!("/v2/team/app/blobs/{config_digest}").as_str())
        .match_header("authorization", bearer().as_str())
        .with_status(404)
        .create();
    let _layer_present = server
        .mock("HEAD", format!("/v2/team/app/blobs/{layer_digest}").as_str())
        .match_header("authorization", bearer().as_str())
        .with_status(200)
        .create();
    let session = server
        .mock("POST", "/v2/team/app/blobs/uploads/")
        .match_header("authorization", bearer().as_str())
        .with_status(202)
        .with_header("location", "/v2/team/app/blobs/uploads/session-1?_state=abc")
        .create();
    let upload = server
        .mock("PUT", "/v2/team/app/blobs/uploads/session-1")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("_state".into(), "abc".into()),
            Matcher::UrlEncoded("digest".into(), config_digest.clone()),
        ]))
        .match_header("content-type", "application/octet-stream")
        .match_body(String::from_utf8(config.clone()).unwrap().as_str())
        .with_status(201)
        .create();
    let manifest = server
        .mock("PUT", "/v2/team/app/manifests/v1")
        .match_header("content-type", SCHEMA2_MANIFEST)
        .match_body(Matcher::PartialJson(serde_json::json!({
            "schemaVersion": 2,
            "config": {"digest": config_digest, "mediaType": CONTAINER_CONFIG},
            "layers": [{
                "digest": layer_digest,
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar",
                "size": layer.len()
            }]
        })))
        .with_status(201)
        .with_header("docker-content-digest", "sha256:feedface")
        .create();

    let temp = assert_fs::TempDir::new().unwrap();
    let archive = write_image_archive(&temp, &config, &layer);
    let mut client = client_for(&server, "team/app:v1").for_push();
    let digest = push_image(&mut client, &archive).unwrap();

    assert_eq!(digest, "sha256:feedface");
    token.assert();
    session.assert();
    upload.assert();
    manifest.assert();
}

#[test]
fn push_rejects_non_image_files() {
    let server = mockito::Server::new();
    let temp = assert_fs::TempDir::new().unwrap();
    let bogus = temp.child("bogus.tar");
    bogus.write_str("hello").unwrap();

    let mut client = client_for(&server, "team/app:v1").for_push();
    assert!(matches!(push_image(&mut client, bogus.path()), Err(AppError::InvalidArchive(_))));
}

#[test]
fn push_declares_gzip_layers_as_compressed() {
    let mut server = mockito::Server::new();
    let config = br#"{"os":"linux"}"#.to_vec();
    let mut gzip_layer = vec![0x1f, 0x8b, 0x08, 0x00];
    gzip_layer.extend_from_slice(b"compressed payload");

    let _existing = server
        .mock("HEAD", Matcher::Regex("^/v2/team/app/blobs/sha256:".to_string()))
        .with_status(200)
        .create();
    let manifest = server
        .mock("PUT", "/v2/team/app/manifests/v2")
        .match_body(Matcher::PartialJson(serde_json::json!({
            "layers": [{
                "digest": sha256_digest(&gzip_layer),
                "mediaType": LAYER_TAR_GZIP,
                "size": gzip_layer.len()
            }]
        })))
        .with_status(201)
        .create();

    let temp = assert_fs::TempDir::new().unwrap();
    let archive = write_image_archive(&temp, &config, &gzip_layer);
    let mut client = client_for(&server, "team/app:v2").for_push();
    let digest = push_image(&mut client, &archive).unwrap();

    manifest.assert();
    // without a docker-content-digest header the digest is computed locally
    assert!(digest.starts_with("sha256:"));
}
