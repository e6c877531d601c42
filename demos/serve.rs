//! Serve one local file with full range support.
//!
//!     cargo run --example serve -- path/to/file
//!
//! Then try it out:
//!
//!     curl -i http://localhost:3000/ -H 'Range: bytes=0-9,20-29'

use axum::http::header::RANGE;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use axum_ranged::{LocalBackend, Ranged};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "test/fixture.txt".to_string());

    let app = Router::new().route(
        "/",
        get(move |headers: HeaderMap| serve_file(path.clone(), headers)),
    );

    let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

async fn serve_file(path: String, headers: HeaderMap) -> impl IntoResponse {
    let range = headers
        .get(RANGE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let backend = LocalBackend::new(&path);
    let filename = backend.file_name().map(str::to_owned);

    let mut ranged = Ranged::new(range, backend);
    if let Some(filename) = filename {
        ranged = ranged.with_filename(filename);
    }
    ranged.try_respond().await
}
