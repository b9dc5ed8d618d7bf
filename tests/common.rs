//! Shared helpers for HTTP integration tests.
//!
//! [`TestApp`] builds the router over an in-memory store and drives it
//! in-process with `tower::ServiceExt::oneshot`; no socket is bound.

#![allow(dead_code)]

use axum::Router;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, Request, StatusCode};
use http_body_util::BodyExt;
use std::sync::Arc;
use tower::ServiceExt;

use hengdang::config::Config;
use hengdang::daemon::engine::Engine;
use hengdang::daemon::http::{self, AppState};
use hengdang::daemon::store::Store;

pub const OWNER: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
pub const ADMIN_KEY: &str = "test-admin-key";

pub struct TestApp {
    pub state: Arc<AppState>,
    router: Router,
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("response body is not JSON")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

impl TestApp {
    /// App with an owner, an admin key and unsigned assertions allowed.
    pub async fn new() -> Self {
        let mut config = Config::default();
        config.auth.owner = Some(OWNER.to_string());
        config.auth.allow_unsigned = true;
        config.admin.key = Some(ADMIN_KEY.to_string());
        Self::with_config(config).await
    }

    pub async fn with_config(config: Config) -> Self {
        let engine = Engine::with_store(&config, Store::memory())
            .await
            .expect("Failed to build engine");
        let state = Arc::new(AppState::new(engine, &config));
        let router = http::router(state.clone());
        Self { state, router }
    }

    /// Mint a session for `owner` directly through the engine.
    pub async fn login(&self, owner: &str) -> String {
        self.state
            .engine
            .sessions()
            .create(owner, vec!["files".into()], None)
            .await
            .expect("Failed to create session")
            .session_id
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .into_body()
            .collect()
            .await
            .expect("Failed to read body")
            .to_bytes();
        TestResponse {
            status,
            headers,
            body,
        }
    }

    /// Send a request authenticated with `token`, plus extra headers.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        headers: &[(&str, &str)],
        body: impl Into<Body>,
    ) -> TestResponse {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        self.send(builder.body(body.into()).expect("valid request"))
            .await
    }

    pub async fn get(&self, uri: &str, token: &str) -> TestResponse {
        self.request(Method::GET, uri, Some(token), &[], Body::empty())
            .await
    }

    pub async fn put(&self, uri: &str, token: &str, body: &'static str) -> TestResponse {
        self.request(Method::PUT, uri, Some(token), &[], body).await
    }

    pub async fn delete(&self, uri: &str, token: &str) -> TestResponse {
        self.request(Method::DELETE, uri, Some(token), &[], Body::empty())
            .await
    }
}
