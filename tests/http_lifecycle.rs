//! Exercises the full HTTP dispatch pipeline (spec.md §4.E) end to end:
//! routing, method merging, middleware prefix resolution, and response
//! coercion, all through `kindling::testing::TestClient` rather than a
//! real socket.

use kindling::context::{self, User};
use kindling::error::Result;
use kindling::manifest::HttpMeta;
use kindling::request::Request;
use kindling::response::HandlerReturn;
use kindling::testing::TestClient;
use std::collections::HashMap;

#[kindling::get("/greet/:name")]
async fn greet(_req: Request, meta: HttpMeta) -> Result<HandlerReturn> {
    let name = meta.params.get("name").cloned().unwrap_or_default();
    HandlerReturn::json(serde_json::json!({ "greeting": format!("hello, {}", name) }))
}

#[kindling::post("/greet/:name")]
async fn rename(_req: Request, meta: HttpMeta) -> Result<HandlerReturn> {
    Ok(HandlerReturn::text(format!("renamed {}", meta.params["name"])))
}

#[kindling::get("/whoami")]
async fn whoami(_req: Request, meta: HttpMeta) -> Result<HandlerReturn> {
    match meta.user {
        Some(user) => HandlerReturn::json(serde_json::json!({ "id": user.id })),
        None => Ok(HandlerReturn::Response(kindling::response::Response::empty(401))),
    }
}

#[kindling::middleware(prefix = "/whoami")]
async fn authenticate(req: &Request) -> Result<Option<User>> {
    match req.header("Authorization") {
        Some(token) if !token.is_empty() => Ok(Some(User { id: token.to_string(), extra: HashMap::new() })),
        _ => Ok(None),
    }
}

#[kindling::post("/echo", cors)]
async fn echo(req: Request, _meta: HttpMeta) -> Result<HandlerReturn> {
    Ok(HandlerReturn::Raw(req.body, "application/octet-stream".to_string()))
}

#[kindling::get("/boom")]
async fn boom(_req: Request, _meta: HttpMeta) -> Result<HandlerReturn> {
    let _ = context::signal()?;
    Err(kindling::Error::Handler("deliberate failure".to_string()))
}

#[kindling::post("/strict", accepts = "application/json")]
async fn strict(_req: Request, _meta: HttpMeta) -> Result<HandlerReturn> {
    Ok(HandlerReturn::text("ok"))
}

#[kindling::get("/cached", etag, cache = 60)]
async fn cached(_req: Request, _meta: HttpMeta) -> Result<HandlerReturn> {
    HandlerReturn::json(serde_json::json!({ "v": 1 }))
}

#[kindling::get("/slow", timeout = 1)]
async fn slow(_req: Request, _meta: HttpMeta) -> Result<HandlerReturn> {
    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    Ok(HandlerReturn::text("done"))
}

#[tokio::test]
async fn routes_match_and_coerce_json() {
    let client = TestClient::new().unwrap();
    let response = client.get("/greet/ada").send().await;
    response.assert_ok();
    assert_eq!(response.header("Content-Type"), Some("application/json"));
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["greeting"], "hello, ada");
}

#[tokio::test]
async fn distinct_verbs_on_the_same_path_both_resolve() {
    let client = TestClient::new().unwrap();
    client.get("/greet/ada").send().await.assert_ok();
    let renamed = client.post("/greet/ada").send().await;
    renamed.assert_ok();
    assert_eq!(renamed.text(), "renamed ada");
}

#[tokio::test]
async fn unmatched_method_is_405() {
    let client = TestClient::new().unwrap();
    let response = client.put("/greet/ada").send().await;
    response.assert_status(405);
}

#[tokio::test]
async fn middleware_authenticate_gates_the_route() {
    let client = TestClient::new().unwrap();
    client.get("/whoami").send().await.assert_status(401);

    let response = client.get("/whoami").header("Authorization", "user-7").send().await;
    response.assert_ok();
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["id"], "user-7");
}

#[tokio::test]
async fn raw_body_round_trips_through_echo() {
    let client = TestClient::new().unwrap();
    let response = client.post("/echo").body(b"payload".to_vec()).send().await;
    response.assert_ok();
    assert_eq!(response.body(), b"payload");
    assert_eq!(response.header("Access-Control-Allow-Origin"), Some("*"));
}

#[tokio::test]
async fn handler_error_surfaces_as_500() {
    let client = TestClient::new().unwrap();
    client.get("/boom").send().await.assert_status(500);
}

#[tokio::test]
async fn cors_preflight_short_circuits_before_method_check() {
    let client = TestClient::new().unwrap();
    let response = client.options("/echo").send().await;
    response.assert_status(204);
    assert_eq!(response.header("Access-Control-Allow-Origin"), Some("*"));
    assert_eq!(response.header("Access-Control-Allow-Methods"), Some("POST"));
}

#[tokio::test]
async fn wrong_content_type_is_415() {
    let client = TestClient::new().unwrap();
    let response = client
        .post("/strict")
        .header("Content-Type", "text/plain")
        .body(b"x".to_vec())
        .send()
        .await;
    response.assert_status(415);
}

#[tokio::test]
async fn etag_and_cache_control_are_added_for_200_responses() {
    let client = TestClient::new().unwrap();
    let first = client.get("/cached").send().await;
    let second = client.get("/cached").send().await;
    first.assert_ok();
    assert!(first.header("ETag").is_some());
    assert_eq!(first.header("ETag"), second.header("ETag"));
    assert_eq!(first.header("Cache-Control"), Some("private, max-age=60, must-revalidate"));
}

#[tokio::test]
async fn timeout_elapses_and_reports_500_timed_out() {
    let client = TestClient::new().unwrap();
    let started = std::time::Instant::now();
    let response = client.get("/slow").send().await;
    response.assert_status(500);
    assert_eq!(response.text(), "Timed Out");
    assert!(started.elapsed() < std::time::Duration::from_secs(3));
}
