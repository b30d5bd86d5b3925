//! In-process stand-in for the generation endpoint.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use tokio::net::TcpListener;

/// One scripted answer.
#[derive(Clone, Debug)]
pub enum Reply {
    Status(u16),
    Png(Vec<u8>),
    Json(serde_json::Value),
    RateLimited { retry_after_secs: u64 },
    Delayed(Duration, Box<Reply>),
}

/// What the endpoint saw.
#[derive(Clone, Debug)]
pub struct Seen {
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Default)]
struct MockState {
    script: Mutex<VecDeque<Reply>>,
    seen: Mutex<Vec<Seen>>,
    hits: AtomicUsize,
}

impl MockState {
    /// Pop the next reply; the last one repeats forever.
    fn next(&self) -> Reply {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().unwrap_or(Reply::Status(404))
        }
    }
}

pub struct MockEndpoint {
    pub url: String,
    state: Arc<MockState>,
}

impl MockEndpoint {
    pub async fn start(script: Vec<Reply>) -> Self {
        let state = Arc::new(MockState {
            script: Mutex::new(script.into()),
            ..MockState::default()
        });
        let app = Router::new().fallback(handle).with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{addr}"),
            state,
        }
    }

    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.state.seen.lock().unwrap().clone()
    }
}

async fn handle(State(state): State<Arc<MockState>>, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    let mut reply = state.next();
    state.seen.lock().unwrap().push(Seen {
        path: uri.path().to_string(),
        headers,
        body,
    });
    state.hits.fetch_add(1, Ordering::SeqCst);

    while let Reply::Delayed(delay, inner) = reply {
        tokio::time::sleep(delay).await;
        reply = *inner;
    }

    match reply {
        Reply::Status(code) => (
            StatusCode::from_u16(code).unwrap(),
            format!("scripted status {code}"),
        )
            .into_response(),
        Reply::Png(bytes) => ([(header::CONTENT_TYPE, "image/png")], bytes).into_response(),
        Reply::Json(value) => Json(value).into_response(),
        Reply::RateLimited { retry_after_secs } => (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, retry_after_secs.to_string())],
            "slow down",
        )
            .into_response(),
        Reply::Delayed(..) => unreachable!(),
    }
}

pub fn solid_png(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    let image = image::RgbImage::from_pixel(width, height, image::Rgb(rgb));
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

pub fn red_png() -> Vec<u8> {
    solid_png(10, 10, [255, 0, 0])
}
