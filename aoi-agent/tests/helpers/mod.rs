//! Test Helper Utilities
//!
//! Shared utilities for testing aoi-agent: a scripted fake inference service,
//! synthetic PNG images and temporary agent configurations.

#![allow(dead_code)]

use aoi_agent::AgentConfig;
use aoi_common::config::TomlConfig;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{self, header, StatusCode};
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use base64::Engine;
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use serde_json::{json, Value};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;

/// One scripted reply of the fake inference service
#[derive(Debug, Clone)]
pub struct FakeResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub delay: Duration,
}

impl FakeResponse {
    pub fn json(value: Value) -> Self {
        Self {
            status: 200,
            content_type: Some("application/json".to_string()),
            body: serde_json::to_vec(&value).unwrap(),
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: Some("text/plain".to_string()),
            body: body.as_bytes().to_vec(),
            delay: Duration::ZERO,
        }
    }

    pub fn raw(content_type: Option<&str>, body: &[u8]) -> Self {
        Self {
            status: 200,
            content_type: content_type.map(String::from),
            body: body.to_vec(),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Clone)]
struct ServerState {
    script: Arc<Vec<FakeResponse>>,
    calls: Arc<AtomicUsize>,
}

/// Fake segmentation service on an ephemeral local port
///
/// Call N gets `script[N]`; once the script runs out the last entry repeats.
pub struct FakeInferenceServer {
    pub base_url: String,
    calls: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl FakeInferenceServer {
    pub async fn start(script: Vec<FakeResponse>) -> Self {
        assert!(!script.is_empty(), "script needs at least one response");
        let calls = Arc::new(AtomicUsize::new(0));
        let state = ServerState {
            script: Arc::new(script),
            calls: calls.clone(),
        };
        let app = Router::new()
            .route("/upload", post(upload))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            calls,
            handle,
        }
    }

    /// Requests received so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Drop for FakeInferenceServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn upload(State(state): State<ServerState>, _body: Bytes) -> Response {
    let n = state.calls.fetch_add(1, Ordering::SeqCst);
    let reply = state
        .script
        .get(n)
        .or_else(|| state.script.last())
        .cloned()
        .unwrap();

    if !reply.delay.is_zero() {
        tokio::time::sleep(reply.delay).await;
    }

    let mut builder = http::Response::builder().status(StatusCode::from_u16(reply.status).unwrap());
    if let Some(ct) = &reply.content_type {
        builder = builder.header(header::CONTENT_TYPE, ct.as_str());
    }
    builder.body(Body::from(reply.body)).unwrap()
}

/// Opaque RGB PNG of the given size
pub fn input_png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, image::Rgb([120, 120, 120]));
    encode_png(DynamicImage::ImageRgb8(img))
}

/// Grayscale label mask; each row is a slice of category labels
pub fn mask_png(rows: &[&[u8]]) -> Vec<u8> {
    let height = rows.len() as u32;
    let width = rows[0].len() as u32;
    let data: Vec<u8> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    let img = GrayImage::from_raw(width, height, data).unwrap();
    encode_png(DynamicImage::ImageLuma8(img))
}

/// Blank grayscale mask of the given size with a 2x2 label-1 square at (1, 1)
/// and a single label-3 pixel at (width - 1, height - 1)
pub fn sample_mask(width: u32, height: u32) -> Vec<u8> {
    let mut img = GrayImage::new(width, height);
    for (x, y) in [(1, 1), (2, 1), (1, 2), (2, 2)] {
        img.put_pixel(x, y, image::Luma([1]));
    }
    img.put_pixel(width - 1, height - 1, image::Luma([3]));
    encode_png(DynamicImage::ImageLuma8(img))
}

fn encode_png(img: DynamicImage) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    img.write_to(&mut cursor, ImageFormat::Png).unwrap();
    cursor.into_inner()
}

/// JSON success response carrying `mask` (and a copy as the overlay)
pub fn success_response(mask: &[u8], total_defects: u64) -> FakeResponse {
    let encoded = base64::engine::general_purpose::STANDARD.encode(mask);
    FakeResponse::json(json!({
        "success": true,
        "processing_time": 0.25,
        "total_defects": total_defects,
        "timestamp": "2024-03-01T10:00:00",
        "mask_image": encoded,
        "overlay_image": format!("data:image/png;base64,{}", encoded),
    }))
}

/// Agent configuration rooted in a temporary directory
///
/// Retries are fast and bounded: 3 attempts, 10/20/40 ms delays.
pub fn test_config(root: &TempDir, base_url: &str) -> AgentConfig {
    let mut toml = TomlConfig::default();
    toml.database.path = root.path().join("aoi.db");
    toml.storage.upload_dir = root.path().join("uploads");
    toml.storage.result_dir = root.path().join("results");
    toml.inference.base_url = base_url.to_string();
    toml.inference.timeout_secs = 5;
    toml.inference.max_attempts = 3;
    toml.inference.retry_delays_ms = vec![10, 20, 40];
    toml.batch.worker_limit = 2;
    toml.batch.item_timeout_secs = 30;
    AgentConfig::from_toml(&toml).unwrap()
}
