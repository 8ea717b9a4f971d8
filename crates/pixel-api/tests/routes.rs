use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{HeaderMap, Request, StatusCode, header},
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use pixel_api::{AppStateInner, SourceSecret, router};
use pixel_db::Database;
use pixel_feed::{Dispatcher, FeedState, shape::DEFAULT_BATCH_LIMIT};
use pixel_types::Table;

const SOURCE_ID: &str = "canvas";
const SECRET: &str = "s3cret";

fn app() -> Router {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let dispatcher = Dispatcher::new(db.head(Table::Users).unwrap(), db.head(Table::Cells).unwrap());
    let app = Arc::new(AppStateInner {
        db: db.clone(),
        dispatcher: dispatcher.clone(),
    });
    let feed = FeedState {
        db,
        dispatcher,
        source_id: SOURCE_ID.into(),
        long_poll: Duration::from_secs(5),
        batch_limit: DEFAULT_BATCH_LIMIT,
    };
    router(app, feed, SourceSecret(SECRET.into()))
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, headers, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn shape(query: &str) -> Request<Body> {
    Request::get(format!("/v1/shape?source_id={SOURCE_ID}&{query}"))
        .header(header::AUTHORIZATION, format!("Bearer {SECRET}"))
        .body(Body::empty())
        .unwrap()
}

fn user_body(id: &str, username: &str) -> Value {
    let now = chrono::Utc::now().to_rfc3339();
    json!({ "id": id, "username": username, "last_active": now, "created_at": now })
}

fn pixel_body(x: i32, y: i32, color: &str, user_id: &str) -> Value {
    json!({
        "x": x,
        "y": y,
        "color": color,
        "user_id": user_id,
        "last_updated": chrono::Utc::now().to_rfc3339(),
    })
}

fn offset_header(headers: &HeaderMap) -> i64 {
    headers["x-shape-offset"].to_str().unwrap().parse().unwrap()
}

fn changes(body: &Value) -> Vec<&Value> {
    body.as_array()
        .unwrap()
        .iter()
        .filter(|m| m["type"] == "change")
        .map(|m| &m["data"])
        .collect()
}

#[tokio::test]
async fn health_needs_no_auth() {
    let app = app();
    let resp = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn create_user_then_duplicate_username_conflicts() {
    let app = app();

    let (status, _, body) = send(&app, post_json("/api/users", user_body("u1", "ada"))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], true);
    assert_eq!(body["user"]["username"], "ada");

    let (status, _, body) = send(&app, post_json("/api/users", user_body("u2", "ada"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("ada"));
}

#[tokio::test]
async fn blank_username_is_rejected() {
    let app = app();
    let (status, _, body) = send(&app, post_json("/api/users", user_body("u1", "   "))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn invalid_color_is_rejected() {
    let app = app();
    send(&app, post_json("/api/users", user_body("u1", "ada"))).await;

    let (status, _, body) = send(&app, post_json("/api/pixels", pixel_body(1, 1, "red", "u1"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().is_some());
}

#[tokio::test]
async fn pixel_from_unknown_user_is_rejected() {
    let app = app();
    let (status, _, _) = send(&app, post_json("/api/pixels", pixel_body(1, 1, "#FF0000", "ghost"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn upserted_pixel_shows_in_snapshot() {
    let app = app();
    send(&app, post_json("/api/users", user_body("u1", "ada"))).await;

    let (status, _, cell) = send(&app, post_json("/api/pixels", pixel_body(5, 5, "#FF0000", "u1"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cell["color"], "#FF0000");
    send(&app, post_json("/api/pixels", pixel_body(5, 5, "#00FF00", "u1"))).await;

    let (status, headers, body) = send(&app, shape("table=cells&offset=-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.contains_key("x-shape-handle"));

    // One row per key: the second write replaced the first.
    let rows = changes(&body);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["value"]["color"], "#00FF00");
    assert_eq!(rows[0]["operation"], "insert");

    let last = body.as_array().unwrap().last().unwrap();
    assert_eq!(last["data"]["control"], "up-to-date");
    assert_eq!(last["data"]["offset"].as_i64().unwrap(), offset_header(&headers));

    // The writer's tally went up twice.
    let (_, _, users) = send(&app, shape("table=users&offset=-1")).await;
    assert_eq!(changes(&users)[0]["value"]["pixels_placed"], 2);
}

#[tokio::test]
async fn catch_up_returns_only_newer_entries() {
    let app = app();
    send(&app, post_json("/api/users", user_body("u1", "ada"))).await;
    send(&app, post_json("/api/pixels", pixel_body(0, 0, "#000000", "u1"))).await;

    let (_, headers, _) = send(&app, shape("table=cells&offset=-1")).await;
    let handle = headers["x-shape-handle"].to_str().unwrap().to_string();
    let offset = offset_header(&headers);

    send(&app, post_json("/api/pixels", pixel_body(1, 0, "#FFFFFF", "u1"))).await;

    let (status, headers, body) = send(&app, shape(&format!("table=cells&offset={offset}&handle={handle}"))).await;
    assert_eq!(status, StatusCode::OK);
    let rows = changes(&body);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["key"], json!({ "x": 1, "y": 0 }));
    assert_eq!(rows[0]["operation"], "insert");
    assert!(offset_header(&headers) > offset);
}

#[tokio::test]
async fn live_poll_wakes_on_commit() {
    let app = app();
    send(&app, post_json("/api/users", user_body("u1", "ada"))).await;

    let (_, headers, _) = send(&app, shape("table=cells&offset=-1")).await;
    let handle = headers["x-shape-handle"].to_str().unwrap().to_string();
    let offset = offset_header(&headers);

    let poll = {
        let app = app.clone();
        tokio::spawn(async move {
            send(&app, shape(&format!("table=cells&offset={offset}&handle={handle}&live=true"))).await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    send(&app, post_json("/api/pixels", pixel_body(3, 4, "#123456", "u1"))).await;

    let (status, _, body) = poll.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    let rows = changes(&body);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["value"]["color"], "#123456");
}

#[tokio::test]
async fn stale_handle_must_refetch() {
    let app = app();
    let (status, _, body) = send(&app, shape("table=cells&offset=0&handle=not-this-log")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body[0]["type"], "control");
    assert_eq!(body[0]["data"]["control"], "must-refetch");
}

#[tokio::test]
async fn offset_past_head_must_refetch() {
    let app = app();
    let (status, _, body) = send(&app, shape("table=cells&offset=999")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body[0]["data"]["control"], "must-refetch");
}

#[tokio::test]
async fn shape_requires_the_source_token() {
    let app = app();

    let missing = Request::get(format!("/v1/shape?source_id={SOURCE_ID}&table=cells"))
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, missing).await.0, StatusCode::UNAUTHORIZED);

    let wrong = Request::get(format!("/v1/shape?source_id={SOURCE_ID}&table=cells"))
        .header(header::AUTHORIZATION, "Bearer nope")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, wrong).await.0, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_source_and_table() {
    let app = app();

    let req = Request::get("/v1/shape?source_id=elsewhere&table=cells")
        .header(header::AUTHORIZATION, format!("Bearer {SECRET}"))
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, req).await.0, StatusCode::NOT_FOUND);

    assert_eq!(send(&app, shape("table=posts")).await.0, StatusCode::BAD_REQUEST);
}
