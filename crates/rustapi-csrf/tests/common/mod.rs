//! Cookie-aware test client driving a CSRF-protected tower stack.

#![allow(dead_code)]

use bytes::Bytes;
use cookie::Cookie;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use rustapi_csrf::{rotate_token, CsrfProtect, Request, Response, RouteGroup, RouteInfo};
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Mutex;
use tower::util::BoxCloneService;
use tower::{ServiceBuilder, ServiceExt};

pub const BLUEPRINT: &str = "test_csrf_bp";

pub fn another_csrf_test() -> &'static str {
    "another test"
}

/// Stand-in for the host router: tags each request with its route identity.
fn tag_route(mut req: Request) -> Request {
    let route = match req.uri().path() {
        "/ping" => RouteInfo::new("conftest.ping"),
        "/csrf-protected" => RouteInfo::new("conftest.csrf_test"),
        "/another-csrf-protect" => RouteInfo::for_handler(&another_csrf_test),
        "/csrf-protect-bp" => RouteGroup::new(BLUEPRINT).route("csrf_bp"),
        "/csrf-protect-bp-2" => RouteGroup::new(BLUEPRINT).route("csrf_bp_2"),
        "/login" => RouteInfo::new("conftest.login"),
        other => RouteInfo::new(other.to_string()),
    };
    req.extensions_mut().insert(route);
    req
}

async fn dispatch(req: Request) -> Result<Response, Infallible> {
    let mut res = match req.uri().path() {
        "/ping" => Response::new(Full::from("pong")),
        "/another-csrf-protect" => Response::new(Full::from(another_csrf_test())),
        _ => Response::new(Full::from("test")),
    };
    if req.uri().path() == "/login" {
        rotate_token(&mut res);
    }
    Ok(res)
}

/// Test client with a cookie jar, like a browser session.
pub struct TestClient {
    service: BoxCloneService<Request, Response, Infallible>,
    jar: Mutex<BTreeMap<String, String>>,
}

impl TestClient {
    pub fn new(csrf: CsrfProtect) -> Self {
        let service = ServiceBuilder::new()
            .map_request(tag_route)
            .layer(csrf.into_layer().expect("valid CSRF configuration"))
            .service_fn(dispatch);
        Self {
            service: BoxCloneService::new(service),
            jar: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn get(&self, path: &str) -> TestResponse {
        self.request(TestRequest::get(path)).await
    }

    pub async fn post_json<T: Serialize>(&self, path: &str, body: &T) -> TestResponse {
        self.request(TestRequest::post(path).json(body)).await
    }

    pub async fn request(&self, req: TestRequest) -> TestResponse {
        let mut builder = http::Request::builder().method(req.method).uri(req.uri);
        for (name, value) in req.headers.iter() {
            builder = builder.header(name, value);
        }
        let cookie_header = {
            let jar = self.jar.lock().unwrap();
            jar.iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; ")
        };
        if !cookie_header.is_empty() {
            builder = builder.header(header::COOKIE, cookie_header);
        }
        let request = builder
            .body(Full::new(req.body.unwrap_or_default()))
            .unwrap();

        let response = self.service.clone().oneshot(request).await.unwrap();
        let response = TestResponse::from_response(response).await;

        let mut jar = self.jar.lock().unwrap();
        for set_cookie in response.set_cookies() {
            let parsed = Cookie::parse(set_cookie).unwrap();
            jar.insert(parsed.name().to_string(), parsed.value().to_string());
        }
        response
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        self.jar.lock().unwrap().get(name).cloned()
    }

    pub fn set_cookie(&self, name: &str, value: &str) {
        self.jar
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
    }

    pub fn remove_cookie(&self, name: &str) {
        self.jar.lock().unwrap().remove(name);
    }
}

#[derive(Debug, Clone)]
pub struct TestRequest {
    method: Method,
    uri: String,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl TestRequest {
    fn new(method: Method, path: &str) -> Self {
        Self {
            method,
            uri: path.to_string(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(path: &str) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: &str) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Send to an absolute URL, e.g. `https://localhost`.
    pub fn base_url(mut self, base: &str) -> Self {
        self.uri = format!("{}{}", base.trim_end_matches('/'), self.uri);
        self
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(
            key.parse::<header::HeaderName>().unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
        self
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> Self {
        self.body = Some(Bytes::from(serde_json::to_vec(body).unwrap()));
        self.header("content-type", "application/json")
    }

    pub fn form(mut self, fields: &[(&str, &str)]) -> Self {
        self.body = Some(Bytes::from(serde_urlencoded::to_string(fields).unwrap()));
        self.header("content-type", "application/x-www-form-urlencoded")
    }
}

#[derive(Debug)]
pub struct TestResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl TestResponse {
    async fn from_response(response: Response) -> Self {
        let (parts, body) = response.into_parts();
        let body = body.collect().await.unwrap().to_bytes();
        Self {
            status: parts.status,
            headers: parts.headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    /// `message` field of a rejection body.
    pub fn message(&self) -> String {
        self.json()["message"].as_str().unwrap_or_default().to_string()
    }

    pub fn set_cookies(&self) -> Vec<&str> {
        self.headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    pub fn sets_cookie(&self, name: &str) -> bool {
        self.set_cookies()
            .iter()
            .any(|c| c.starts_with(&format!("{name}=")))
    }
}
