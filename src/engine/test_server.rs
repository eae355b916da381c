//! In-process HTTP server for probe and transfer tests

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{HeaderMap, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use futures_util::stream;
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use url::Url;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Answer HEAD requests (405 otherwise)
    pub head: bool,
    /// Honour `Range` and advertise `Accept-Ranges: bytes`
    pub ranges: bool,
    pub disposition: Option<String>,
    /// Bytes per body frame
    pub frame: usize,
    /// Pause between frames, to keep transfers in flight
    pub frame_delay: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            head: true,
            ranges: true,
            disposition: None,
            frame: 64 * 1024,
            frame_delay: Duration::ZERO,
        }
    }
}

#[derive(Clone)]
struct Shared {
    data: Arc<Vec<u8>>,
    options: ServerOptions,
    gets: Arc<AtomicUsize>,
}

pub struct TestServer {
    pub addr: SocketAddr,
    gets: Arc<AtomicUsize>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> Url {
        Url::parse(&format!("http://{}{}", self.addr, path)).unwrap()
    }

    /// GET requests served so far
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

pub async fn serve(data: Vec<u8>, options: ServerOptions) -> TestServer {
    let gets = Arc::new(AtomicUsize::new(0));
    let shared = Shared {
        data: Arc::new(data),
        options,
        gets: gets.clone(),
    };
    let app = Router::new()
        .route("/file.bin", get(file))
        .with_state(shared);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer { addr, gets }
}

fn parse_range(value: &str, len: u64) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end = if end.is_empty() {
        len.checked_sub(1)?
    } else {
        end.parse::<u64>().ok()?.min(len.checked_sub(1)?)
    };
    (start <= end).then_some((start, end))
}

async fn file(State(shared): State<Shared>, method: Method, headers: HeaderMap) -> Response {
    let opts = &shared.options;
    if method == Method::HEAD && !opts.head {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    if method == Method::GET {
        shared.gets.fetch_add(1, Ordering::SeqCst);
    }

    let len = shared.data.len() as u64;
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .filter(|_| opts.ranges);

    let (status, start, end) = match range {
        Some(value) => match parse_range(value, len) {
            Some((start, end)) => (StatusCode::PARTIAL_CONTENT, start, end),
            None => return StatusCode::RANGE_NOT_SATISFIABLE.into_response(),
        },
        None => (StatusCode::OK, 0, len.saturating_sub(1)),
    };
    let slice_len = if len == 0 { 0 } else { end - start + 1 };

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_LENGTH, slice_len);
    if opts.ranges {
        builder = builder.header(header::ACCEPT_RANGES, "bytes");
    }
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, end, len),
        );
    }
    if let Some(cd) = &opts.disposition {
        builder = builder.header(header::CONTENT_DISPOSITION, cd.as_str());
    }

    let data = shared.data.clone();
    let frame = opts.frame.max(1) as u64;
    let delay = opts.frame_delay;
    let frames = stream::unfold(start, move |offset| {
        let data = data.clone();
        async move {
            if slice_len == 0 || offset > end {
                return None;
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let upto = (offset + frame - 1).min(end);
            let bytes = data[offset as usize..=upto as usize].to_vec();
            Some((Ok::<_, std::io::Error>(bytes), upto + 1))
        }
    });

    builder.body(Body::from_stream(frames)).unwrap()
}
