//! REST client for the compliance backend.
//!
//! `ApiClient` is constructed explicitly and handed to whatever needs it; there
//! is no process-wide client. Every call:
//! - attaches `Authorization: Bearer <token>` when the token store holds one,
//! - normalizes failures into `ApiError`,
//! - on 401, clears the token and broadcasts a forced logout through
//!   `SessionEvents` before returning the error.
//!
//! `DetectionApi` and `ViolationFeed` are the seams the detection pipeline and
//! the fallback poller depend on.

mod error;
mod violations;

pub use error::{ApiError, ApiErrorKind, FieldError};
pub use violations::{UserProfile, Violation, ViolationPage, ViolationQuery};

use anyhow::{anyhow, Context};
use rand::RngCore;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

use crate::detect::DetectFrameResponse;
use crate::notify::DomainFilter;
use crate::session::{SessionEvents, TokenStore};

pub const DETECT_FRAME_PATH: &str = "/api/v1/detection/detect-frame";
pub const VIOLATIONS_PATH: &str = "/api/v1/violations";
pub const CURRENT_USER_PATH: &str = "/api/v1/auth/me";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// One frame queued for inference.
#[derive(Clone, Debug)]
pub struct FrameSubmission {
    pub jpeg: Vec<u8>,
    pub confidence: f32,
    pub camera_id: Option<String>,
    pub domain_id: Option<String>,
}

pub trait DetectionApi: Send + Sync {
    fn detect_frame(&self, submission: &FrameSubmission) -> Result<DetectFrameResponse, ApiError>;
}

pub trait ViolationFeed: Send + Sync {
    /// Most recent violations visible under `domains`, newest first.
    fn recent_violations(
        &self,
        domains: &DomainFilter,
        limit: u32,
    ) -> Result<Vec<Violation>, ApiError>;
}

pub struct ApiClient {
    base_url: String,
    agent: ureq::Agent,
    tokens: Arc<dyn TokenStore>,
    session: SessionEvents,
}

impl ApiClient {
    pub fn new(
        base_url: &str,
        tokens: Arc<dyn TokenStore>,
        session: SessionEvents,
    ) -> anyhow::Result<Self> {
        let parsed = url::Url::parse(base_url).context("parse api base url")?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!(
                "api base url must be http(s), got '{}'",
                parsed.scheme()
            ));
        }
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent: build_agent(DEFAULT_TIMEOUT),
            tokens,
            session,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = build_agent(timeout);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn session(&self) -> &SessionEvents {
        &self.session
    }

    pub fn tokens(&self) -> &Arc<dyn TokenStore> {
        &self.tokens
    }

    /// `POST /api/v1/detection/detect-frame` with the frame as a multipart JPEG.
    pub fn detect_frame(
        &self,
        submission: &FrameSubmission,
    ) -> Result<DetectFrameResponse, ApiError> {
        let boundary = multipart_boundary();
        let body = multipart_body(&boundary, "file", "frame.jpg", "image/jpeg", &submission.jpeg);
        let mut request = self
            .request("POST", DETECT_FRAME_PATH)
            .query("confidence", &format!("{:.2}", submission.confidence))
            .set(
                "Content-Type",
                &format!("multipart/form-data; boundary={}", boundary),
            );
        if let Some(camera_id) = &submission.camera_id {
            request = request.query("camera_id", camera_id);
        }
        if let Some(domain_id) = &submission.domain_id {
            request = request.query("domain_id", domain_id);
        }
        let response = self.finish(request.send_bytes(&body))?;
        read_json(response, "detect-frame response")
    }

    /// `GET /api/v1/violations`.
    pub fn list_violations(&self, query: &ViolationQuery) -> Result<ViolationPage, ApiError> {
        let mut request = self.request("GET", VIOLATIONS_PATH);
        for (key, value) in query.pairs() {
            request = request.query(key, &value);
        }
        let response = self.finish(request.call())?;
        read_json(response, "violation list")
    }

    /// `PUT /api/v1/violations/{id}/acknowledge`.
    pub fn acknowledge_violation(&self, id: &str) -> Result<(), ApiError> {
        crate::validate_id("violation", id).map_err(|e| ApiError::Validation {
            message: e.to_string(),
            fields: vec![FieldError {
                field: "id".to_string(),
                message: e.to_string(),
            }],
        })?;
        let path = format!("{}/{}/acknowledge", VIOLATIONS_PATH, id);
        self.finish(self.request("PUT", &path).send_string(""))?;
        Ok(())
    }

    /// `GET /api/v1/auth/me`.
    pub fn current_user(&self) -> Result<UserProfile, ApiError> {
        let response = self.finish(self.request("GET", CURRENT_USER_PATH).call())?;
        read_json(response, "user profile")
    }

    fn request(&self, method: &str, path: &str) -> ureq::Request {
        let url = format!("{}{}", self.base_url, path);
        let request = self.agent.request(method, &url);
        match self.tokens.token() {
            Some(token) => request.set("Authorization", &format!("Bearer {}", token)),
            None => request,
        }
    }

    fn finish(
        &self,
        result: Result<ureq::Response, ureq::Error>,
    ) -> Result<ureq::Response, ApiError> {
        match result {
            Ok(response) => Ok(response),
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                let err = ApiError::from_status(status, &body);
                if status == 401 {
                    self.session.force_logout(self.tokens.as_ref());
                }
                Err(err)
            }
            Err(ureq::Error::Transport(transport)) => Err(ApiError::Network(transport.to_string())),
        }
    }
}

impl DetectionApi for ApiClient {
    fn detect_frame(&self, submission: &FrameSubmission) -> Result<DetectFrameResponse, ApiError> {
        ApiClient::detect_frame(self, submission)
    }
}

impl ViolationFeed for ApiClient {
    fn recent_violations(
        &self,
        domains: &DomainFilter,
        limit: u32,
    ) -> Result<Vec<Violation>, ApiError> {
        if domains.is_empty() {
            return Ok(self
                .list_violations(&ViolationQuery::recent(limit))?
                .into_items());
        }
        // The list endpoint filters by a single domain.
        let mut merged = Vec::new();
        for domain in domains.ids() {
            let query = ViolationQuery {
                domain_id: Some(domain.clone()),
                ..ViolationQuery::recent(limit)
            };
            merged.extend(self.list_violations(&query)?.into_items());
        }
        Ok(merged)
    }
}

fn build_agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(5))
        .timeout(timeout)
        .build()
}

fn read_json<T: DeserializeOwned>(response: ureq::Response, what: &str) -> Result<T, ApiError> {
    let body = response
        .into_string()
        .map_err(|e| ApiError::Network(format!("read {}: {}", what, e)))?;
    serde_json::from_str(&body).map_err(|e| ApiError::decode(&format!("decode {}", what), e))
}

fn multipart_boundary() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("ppe-monitor-{}", hex::encode(bytes))
}

fn multipart_body(
    boundary: &str,
    field: &str,
    filename: &str,
    content_type: &str,
    payload: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + 256);
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
            field, filename
        )
        .as_bytes(),
    );
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
    body.extend_from_slice(payload);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}
