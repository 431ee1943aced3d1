//! The disk object store behind a real handler

use http::{HeaderMap, Method, StatusCode};
use http_body_util::BodyExt;
use r2_image_cache::{
    CloudflareConfig, DiskObjectStore, EdgeConfig, ImageHandler, MemoryKvStore,
};
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn handler(server: &MockServer, dir: &TempDir) -> ImageHandler {
    let config = EdgeConfig {
        ingest_on_miss: false,
        cloudflare: CloudflareConfig {
            api_base: server.uri(),
            image_delivery_url: server.uri(),
            account_id: "acc".to_string(),
            account_hash: "hash".to_string(),
            api_token: "token".to_string(),
        },
        ..Default::default()
    };
    let store = DiskObjectStore::new(dir.path()).await.unwrap();
    ImageHandler::new(Arc::new(config), Arc::new(store), Arc::new(MemoryKvStore::new())).unwrap()
}

#[tokio::test]
async fn test_cached_image_survives_restart() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/hash/dog/320x240"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "image/avif")
                .insert_header("cache-control", "public, max-age=31536000")
                .set_body_bytes(&b"avif-bytes"[..]),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();

    let first = handler(&server, &dir).await;
    let response = first
        .handle(&Method::GET, "/dog-320x240.avif", &HeaderMap::new())
        .await;
    assert_eq!(response.headers().get("x-r2-cache").unwrap(), "MISS");
    drop(first);

    // A fresh handler over the same directory serves from disk
    let second = handler(&server, &dir).await;
    let response = second
        .handle(&Method::GET, "/dog-320x240.avif", &HeaderMap::new())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-r2-cache").unwrap(), "HIT");
    assert_eq!(response.headers().get("content-type").unwrap(), "image/avif");
    assert_eq!(
        response.headers().get("cache-control").unwrap(),
        "public, max-age=31536000"
    );

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"avif-bytes");
}
