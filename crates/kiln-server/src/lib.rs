//! HTTP endpoint that hands build secrets to image builds.
//!
//! Routes (all `GET`):
//! - `/v1/ping` returns `"ok"` as JSON
//! - `/v1/version` returns the server version as JSON
//! - `/v1/secrets/{type}/{name}` returns the secret bytes as `text/plain`, or 400
//!   with the provider's error message
//!
//! With credentials configured every route requires HTTP basic auth.
//! The [`TestServer`] helper starts a server on a random port for integration testing.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kiln_schema::SecretProviders;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tiny_http::{Header, Method, Response, Server, StatusCode};
use tracing::{debug, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const REALM: &str = "Kiln secret service";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind secret server on {addr}: {message}")]
    Bind { addr: String, message: String },
}

/// Username and password required by the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    username: String,
    password: String,
}

impl BasicAuth {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_owned(),
            password: password.to_owned(),
        }
    }

    /// Whether an `Authorization` header value carries these credentials.
    pub fn matches(&self, header: &str) -> bool {
        let Some(encoded) = header.trim().strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        decoded
            .split_once(':')
            .is_some_and(|(user, pass)| user == self.username && pass == self.password)
    }
}

/// The secrets a build registered, plus optional credentials.
#[derive(Debug, Clone, Default)]
pub struct SecretService {
    providers: SecretProviders,
    auth: Option<BasicAuth>,
}

impl SecretService {
    pub fn new(providers: SecretProviders) -> Self {
        Self {
            providers,
            auth: None,
        }
    }

    #[must_use]
    pub fn with_auth(mut self, auth: BasicAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn providers(&self) -> &SecretProviders {
        &self.providers
    }
}

/// Split `/v1/secrets/{type}/{name}` into its two parameters.
pub fn parse_secret_route(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix("/v1/secrets/")?;
    let (kind, name) = rest.split_once('/')?;
    if kind.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some((kind, name))
}

fn respond_err(req: tiny_http::Request, code: u16, msg: &str) {
    let _ = req.respond(Response::from_string(msg).with_status_code(StatusCode(code)));
}

fn respond_json(req: tiny_http::Request, value: &str) {
    let header = Header::from_bytes("Content-Type", "application/json").expect("valid header");
    let body = serde_json::Value::String(value.to_owned()).to_string();
    let _ = req.respond(Response::from_string(body).with_header(header));
}

fn respond_text(req: tiny_http::Request, body: Vec<u8>) {
    let header = Header::from_bytes("Content-Type", "text/plain").expect("valid header");
    let _ = req.respond(Response::from_data(body).with_header(header));
}

fn respond_unauthorized(req: tiny_http::Request) {
    let header = Header::from_bytes(
        "WWW-Authenticate",
        format!("Basic realm=\"{REALM}\"").as_bytes(),
    )
    .expect("valid header");
    let _ = req.respond(
        Response::from_string("not authorized")
            .with_status_code(StatusCode(401))
            .with_header(header),
    );
}

fn authorized(service: &SecretService, req: &tiny_http::Request) -> bool {
    let Some(auth) = &service.auth else {
        return true;
    };
    req.headers()
        .iter()
        .find(|h| h.field.equiv("Authorization"))
        .is_some_and(|h| auth.matches(h.value.as_str()))
}

/// Handle a single HTTP request, dispatching to the appropriate route handler.
pub fn handle_request(service: &SecretService, req: tiny_http::Request) {
    let method = req.method().clone();
    let url = req.url().to_owned();
    debug!("{method} {url}");

    if !authorized(service, &req) {
        warn!("{method} {url}: rejected credentials");
        respond_unauthorized(req);
        return;
    }
    if method != Method::Get {
        respond_err(req, 405, "method not allowed");
        return;
    }

    if url == "/v1/ping" {
        respond_json(req, "ok");
    } else if url == "/v1/version" {
        respond_json(req, VERSION);
    } else if let Some((kind, name)) = parse_secret_route(&url) {
        match service.providers.lookup(kind, name) {
            Ok(secret) => {
                info!("serving {kind} secret '{name}'");
                respond_text(req, secret);
            }
            Err(e) => {
                warn!("secret {kind}/{name}: {e}");
                respond_err(req, 400, &e.to_string());
            }
        }
    } else {
        respond_err(req, 404, "not found");
    }
}

/// Start the server loop, blocking the current thread.
pub fn run_server(service: &SecretService, addr: &str) -> Result<(), ServerError> {
    let server = Server::http(addr).map_err(|e| ServerError::Bind {
        addr: addr.to_owned(),
        message: e.to_string(),
    })?;
    info!("secret server listening on {addr}");
    for request in server.incoming_requests() {
        handle_request(service, request);
    }
    Ok(())
}

/// A server running on a background thread, stopped by [`ServerHandle::shutdown`]
/// or on drop.
pub struct ServerHandle {
    pub port: u16,
    server: Arc<Server>,
    handle: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn spawn(service: SecretService, addr: &str) -> Result<Self, ServerError> {
        let server = Arc::new(Server::http(addr).map_err(|e| ServerError::Bind {
            addr: addr.to_owned(),
            message: e.to_string(),
        })?);
        let port = server.server_addr().to_ip().map_or(0, |a| a.port());
        info!("secret server listening on {addr} (port {port})");

        let srv = Arc::clone(&server);
        let handle = std::thread::spawn(move || {
            for request in srv.incoming_requests() {
                handle_request(&service, request);
            }
        });

        Ok(Self {
            port,
            server,
            handle: Some(handle),
        })
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A test helper that starts a secret server on a random port in a background thread.
///
/// The server listens on `127.0.0.1:{port}`. Drop the `TestServer` to stop it.
pub struct TestServer {
    pub url: String,
    pub port: u16,
    _handle: ServerHandle,
}

impl TestServer {
    pub fn start(service: SecretService) -> Self {
        let handle =
            ServerHandle::spawn(service, "127.0.0.1:0").expect("failed to bind test HTTP server");
        let port = handle.port;
        Self {
            url: format!("http://127.0.0.1:{port}"),
            port,
            _handle: handle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_secret_route_valid() {
        assert_eq!(
            parse_secret_route("/v1/secrets/file/ssh_key"),
            Some(("file", "ssh_key"))
        );
        assert_eq!(parse_secret_route("/v1/secrets/env/TOKEN"), Some(("env", "TOKEN")));
    }

    #[test]
    fn parse_secret_route_invalid() {
        assert!(parse_secret_route("/v1/secrets/file").is_none());
        assert!(parse_secret_route("/v1/secrets/file/").is_none());
        assert!(parse_secret_route("/v1/secrets//x").is_none());
        assert!(parse_secret_route("/v1/secrets/file/a/b").is_none());
        assert!(parse_secret_route("/v2/secrets/file/a").is_none());
    }

    #[test]
    fn basic_auth_matches_header() {
        let auth = BasicAuth::new("ci", "s3cret");
        let header = format!("Basic {}", STANDARD.encode("ci:s3cret"));
        assert!(auth.matches(&header));
        assert!(!auth.matches(&format!("Basic {}", STANDARD.encode("ci:wrong"))));
        assert!(!auth.matches("Bearer abc"));
        assert!(!auth.matches("Basic !!!"));
    }

    #[test]
    fn password_may_contain_colon() {
        let auth = BasicAuth::new("ci", "a:b");
        assert!(auth.matches(&format!("Basic {}", STANDARD.encode("ci:a:b"))));
    }
}
