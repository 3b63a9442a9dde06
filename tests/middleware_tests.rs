use axum::body::Body;
use axum::http::{header, Request};
use axum::middleware::from_fn;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use driftbox::middleware::{add_security_headers, no_store};
use tower::util::ServiceExt;

#[tokio::test]
async fn test_add_security_headers() {
    let app = Router::new()
        .route("/", get(|| async { "hello" }))
        .layer(from_fn(add_security_headers));

    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    let headers = response.headers();
    assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
    assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
    assert!(headers.get("content-security-policy").is_some());
}

#[tokio::test]
async fn test_no_store_keeps_explicit_cache_control() {
    let app = Router::new()
        .route("/plain", get(|| async { "status" }))
        .route(
            "/cached",
            get(|| async { ([(header::CACHE_CONTROL, "max-age=60")], "cached").into_response() }),
        )
        .layer(from_fn(no_store));

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/plain").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.headers().get(header::CACHE_CONTROL).unwrap(), "no-store");

    let response = app
        .oneshot(Request::builder().uri("/cached").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.headers().get(header::CACHE_CONTROL).unwrap(), "max-age=60");
}
