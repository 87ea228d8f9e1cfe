//! JSON-over-HTTP client for a platform gateway
//!
//! The gateway fronts the real platform API and exposes three endpoints:
//!
//! - `POST /v1/login` with username, password and device fingerprint
//! - `POST /v1/publish` with bearer token, post type, caption and base64 media
//! - `GET /v1/media/recent?client_ref=<post id>` to find an earlier publish
//!
//! Failures are classified from the HTTP status and, when present, the
//! gateway's `error.code`.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::PlatformConfig;
use crate::credentials::Credentials;
use crate::error::PlatformError;
use crate::platforms::{Authenticator, PlatformResult, PublishPlatform, PublishRequest};
use crate::sessions::fingerprint::DeviceFingerprint;
use crate::types::{AuthState, Post, PostType};

/// Which call failed; the same status means different things per call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Login,
    Publish,
    Lookup,
}

#[derive(Serialize)]
struct LoginBody<'a> {
    username: &'a str,
    password: &'a str,
    device: &'a DeviceFingerprint,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
    #[serde(default)]
    cookies: BTreeMap<String, String>,
    expires_at: Option<i64>,
}

#[derive(Serialize)]
struct PublishBody<'a> {
    client_ref: &'a str,
    post_type: PostType,
    caption: Option<&'a str>,
    media: Vec<MediaBody<'a>>,
}

#[derive(Serialize)]
struct MediaBody<'a> {
    name: &'a str,
    data: String,
}

#[derive(Deserialize)]
struct PublishResponse {
    media_id: String,
}

#[derive(Deserialize)]
struct LookupResponse {
    media_id: Option<String>,
}

#[derive(Deserialize, Default)]
struct ErrorEnvelope {
    #[serde(default)]
    error: ErrorBody,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

pub struct HttpPlatform {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPlatform {
    pub fn new(config: &PlatformConfig) -> PlatformResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| PlatformError::Network(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read_error(kind: CallKind, response: reqwest::Response) -> PlatformError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let envelope: ErrorEnvelope = serde_json::from_str(&body).unwrap_or_default();
        let message = if envelope.error.message.is_empty() {
            body.chars().take(200).collect()
        } else {
            envelope.error.message
        };
        classify(kind, status, &envelope.error.code, &message)
    }
}

fn transport_error(e: reqwest::Error) -> PlatformError {
    if e.is_timeout() {
        PlatformError::Network(format!("request timed out: {}", e))
    } else {
        PlatformError::Network(e.to_string())
    }
}

/// Map a gateway failure onto the engine's error taxonomy
pub fn classify(kind: CallKind, status: StatusCode, code: &str, message: &str) -> PlatformError {
    match code {
        "login_required" if kind != CallKind::Login => {
            return PlatformError::SessionExpired(message.to_string())
        }
        "bad_password" | "invalid_user" | "checkpoint_required" | "challenge_required" => {
            return PlatformError::Authentication(message.to_string())
        }
        "account_suspended" | "account_disabled" => {
            return PlatformError::AccountSuspended(message.to_string())
        }
        "feedback_required" | "spam" => return PlatformError::RateLimit(message.to_string()),
        _ => {}
    }

    match status {
        StatusCode::UNAUTHORIZED => match kind {
            CallKind::Login => PlatformError::Authentication(message.to_string()),
            CallKind::Publish | CallKind::Lookup => {
                PlatformError::SessionExpired(message.to_string())
            }
        },
        StatusCode::FORBIDDEN => match kind {
            CallKind::Login => PlatformError::Authentication(message.to_string()),
            CallKind::Publish | CallKind::Lookup => {
                PlatformError::AccountSuspended(message.to_string())
            }
        },
        StatusCode::TOO_MANY_REQUESTS => PlatformError::RateLimit(message.to_string()),
        StatusCode::REQUEST_TIMEOUT => PlatformError::Network(message.to_string()),
        s if s.is_client_error() && kind == CallKind::Login => {
            PlatformError::Authentication(format!("{} ({})", message, s.as_u16()))
        }
        s if s.is_client_error() => PlatformError::ContentRejected(format!(
            "{} ({})",
            message,
            s.as_u16()
        )),
        s => PlatformError::Remote {
            code: if code.is_empty() {
                format!("http_{}", s.as_u16())
            } else {
                code.to_string()
            },
            message: message.to_string(),
            retryable: s.is_server_error(),
        },
    }
}

#[async_trait]
impl Authenticator for HttpPlatform {
    async fn login(
        &self,
        credentials: &Credentials,
        fingerprint: &DeviceFingerprint,
    ) -> PlatformResult<AuthState> {
        let body = LoginBody {
            username: &credentials.username,
            password: credentials.password().expose_secret(),
            device: fingerprint,
        };

        let response = self
            .client
            .post(self.url("/v1/login"))
            .header(reqwest::header::USER_AGENT, &fingerprint.user_agent)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(Self::read_error(CallKind::Login, response).await);
        }

        let parsed: LoginResponse = response.json().await.map_err(|e| PlatformError::Remote {
            code: "bad_response".to_string(),
            message: format!("login response not understood: {}", e),
            retryable: true,
        })?;

        Ok(AuthState {
            token: parsed.token,
            cookies: parsed.cookies,
            issued_at: chrono::Utc::now().timestamp(),
            expires_at: parsed.expires_at,
        })
    }
}

#[async_trait]
impl PublishPlatform for HttpPlatform {
    fn name(&self) -> &str {
        "http"
    }

    async fn publish(&self, request: &PublishRequest) -> PlatformResult<String> {
        let body = PublishBody {
            client_ref: &request.post_id,
            post_type: request.post_type,
            caption: request.caption.as_deref(),
            media: request
                .media
                .iter()
                .map(|m| MediaBody {
                    name: &m.reference,
                    data: STANDARD.encode(&m.bytes),
                })
                .collect(),
        };

        let mut builder = self
            .client
            .post(self.url("/v1/publish"))
            .bearer_auth(&request.auth_state.token)
            .json(&body);
        if let Some(fp) = &request.fingerprint {
            builder = builder
                .header(reqwest::header::USER_AGENT, &fp.user_agent)
                .header("X-Device-Id", &fp.device_id);
        }

        let response = builder.send().await.map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(Self::read_error(CallKind::Publish, response).await);
        }

        // The publish may have happened even if the body is garbled, so this
        // stays retryable and relies on the duplicate guard.
        let parsed: PublishResponse = response.json().await.map_err(|e| PlatformError::Remote {
            code: "bad_response".to_string(),
            message: format!("publish response not understood: {}", e),
            retryable: true,
        })?;

        Ok(parsed.media_id)
    }

    async fn find_recent_publish(
        &self,
        auth_state: &AuthState,
        post: &Post,
    ) -> PlatformResult<Option<String>> {
        let response = self
            .client
            .get(self.url("/v1/media/recent"))
            .bearer_auth(&auth_state.token)
            .query(&[("client_ref", post.id.as_str())])
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::read_error(CallKind::Lookup, response).await);
        }

        let parsed: LookupResponse = response.json().await.map_err(|e| PlatformError::Remote {
            code: "bad_response".to_string(),
            message: format!("lookup response not understood: {}", e),
            retryable: true,
        })?;

        Ok(parsed.media_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::MediaItem;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve exactly one canned HTTP response and hand back the raw request
    async fn one_shot_server(
        status_line: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64 * 1024];
            let mut request = Vec::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).to_string()
        });

        (format!("http://{}", addr), handle)
    }

    fn platform(base_url: &str) -> HttpPlatform {
        HttpPlatform::new(&PlatformConfig {
            base_url: base_url.to_string(),
            timeout_secs: 5,
            ..Default::default()
        })
        .unwrap()
    }

    fn request() -> PublishRequest {
        PublishRequest {
            account_id: "shop".to_string(),
            post_id: "post-123".to_string(),
            post_type: PostType::Carousel,
            auth_state: AuthState::new("tok-abc".to_string(), 0, None),
            fingerprint: Some(DeviceFingerprint::derive("salt", "shop")),
            media: vec![
                MediaItem {
                    reference: "a.jpg".to_string(),
                    bytes: b"AAA".to_vec(),
                },
                MediaItem {
                    reference: "b.jpg".to_string(),
                    bytes: b"BBB".to_vec(),
                },
            ],
            caption: Some("launch day".to_string()),
        }
    }

    #[test]
    fn test_classify_by_status() {
        let s = |code: u16| StatusCode::from_u16(code).unwrap();

        assert!(matches!(
            classify(CallKind::Login, s(401), "", "no"),
            PlatformError::Authentication(_)
        ));
        assert!(matches!(
            classify(CallKind::Publish, s(401), "", "no"),
            PlatformError::SessionExpired(_)
        ));
        assert!(matches!(
            classify(CallKind::Publish, s(403), "", "no"),
            PlatformError::AccountSuspended(_)
        ));
        assert!(matches!(
            classify(CallKind::Publish, s(429), "", "slow"),
            PlatformError::RateLimit(_)
        ));
        assert!(matches!(
            classify(CallKind::Publish, s(422), "", "bad media"),
            PlatformError::ContentRejected(_)
        ));
        assert!(matches!(
            classify(CallKind::Login, s(400), "", "unknown user"),
            PlatformError::Authentication(_)
        ));

        let server = classify(CallKind::Publish, s(503), "", "down");
        assert!(server.is_retryable());
        assert_eq!(server.code(), "http_503");
    }

    #[test]
    fn test_classify_by_error_code() {
        let ok = StatusCode::BAD_REQUEST;
        assert!(matches!(
            classify(CallKind::Login, ok, "challenge_required", "verify"),
            PlatformError::Authentication(_)
        ));
        assert!(matches!(
            classify(CallKind::Publish, ok, "login_required", "again"),
            PlatformError::SessionExpired(_)
        ));
        assert!(matches!(
            classify(CallKind::Publish, ok, "feedback_required", "spam"),
            PlatformError::RateLimit(_)
        ));
        assert!(matches!(
            classify(CallKind::Login, ok, "account_disabled", "gone"),
            PlatformError::AccountSuspended(_)
        ));
    }

    #[tokio::test]
    async fn test_publish_sends_media_and_parses_id() {
        let (base, server) = one_shot_server("200 OK", r#"{"media_id":"17900001"}"#).await;

        let media_id = platform(&base).publish(&request()).await.unwrap();
        assert_eq!(media_id, "17900001");

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /v1/publish"));
        assert!(raw.to_ascii_lowercase().contains("authorization: bearer tok-abc"));
        assert!(raw.contains(r#""client_ref":"post-123""#));
        assert!(raw.contains(r#""post_type":"carousel""#));
        assert!(raw.contains(&STANDARD.encode(b"AAA")));
    }

    #[tokio::test]
    async fn test_publish_error_envelope() {
        let (base, _server) = one_shot_server(
            "400 Bad Request",
            r#"{"error":{"code":"media_invalid","message":"aspect ratio"}}"#,
        )
        .await;

        let err = platform(&base).publish(&request()).await.unwrap_err();
        match err {
            PlatformError::ContentRejected(message) => assert!(message.contains("aspect ratio")),
            other => panic!("Expected ContentRejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_login_parses_auth_state() {
        let (base, server) = one_shot_server(
            "200 OK",
            r#"{"token":"t-1","cookies":{"sessionid":"abc"},"expires_at":4102444800}"#,
        )
        .await;

        let fp = DeviceFingerprint::derive("salt", "shop");
        let state = platform(&base)
            .login(&Credentials::new("shop_ig", "pw"), &fp)
            .await
            .unwrap();

        assert_eq!(state.token, "t-1");
        assert_eq!(state.cookies.get("sessionid").map(String::as_str), Some("abc"));
        assert_eq!(state.expires_at, Some(4102444800));

        let raw = server.await.unwrap();
        assert!(raw.contains(&fp.device_id));
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_network_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = platform(&format!("http://{}", addr))
            .publish(&request())
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Network(_)));
        assert!(err.is_retryable());
    }
}
