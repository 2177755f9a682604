//! Pre-pipeline request validation and the error body returned to callers.
//!
//! These checks run before a `Pipeline` is entered; the pipelines themselves
//! never fail, so every `RequestError` originates here.

use serde::Serialize;
use thiserror::Error;

use super::perception::prompt::{DocumentHints, ExtractionStyle};
use super::perception::{AnalysisMode, UnitPayload};
use super::DocumentInput;
use crate::config::Settings;

const BYTES_PER_MB: u64 = 1024 * 1024;

pub const SUPPORTED_IMAGE_MIME: [&str; 2] = ["image/jpeg", "image/png"];

const PNG_SIGNATURE: &[u8] = &[0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];
const JPEG_SIGNATURE: &[u8] = &[0xff, 0xd8, 0xff];

/// Structured error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
    pub request_id: Option<String>,
}

/// Request rejected before any analysis ran.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("{0}")]
    UnprocessableInput(String),
    #[error("{0}")]
    UnsupportedFileType(String),
    #[error("{0}")]
    InvalidParameters(String),
}

impl RequestError {
    pub fn code(&self) -> &'static str {
        match self {
            RequestError::PayloadTooLarge(_) => "payload_too_large",
            RequestError::UnprocessableInput(_) => "unprocessable_input",
            RequestError::UnsupportedFileType(_) => "unsupported_file_type",
            RequestError::InvalidParameters(_) => "invalid_parameters",
        }
    }

    /// HTTP status an outer surface should answer with.
    pub fn status(&self) -> u16 {
        match self {
            RequestError::PayloadTooLarge(_) => 413,
            RequestError::UnprocessableInput(_) => 422,
            RequestError::UnsupportedFileType(_) | RequestError::InvalidParameters(_) => 400,
        }
    }

    pub fn to_body(&self, request_id: Option<&str>) -> ErrorBody {
        ErrorBody {
            error: ErrorDetail {
                code: self.code(),
                message: self.to_string(),
                request_id: request_id.map(str::to_string),
            },
        }
    }
}

/// Size and page limits applied to incoming requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLimits {
    pub max_image_mb: u64,
    pub max_document_mb: u64,
    pub max_pages: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_image_mb: 10,
            max_document_mb: 20,
            max_pages: 10,
        }
    }
}

impl RequestLimits {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_image_mb: settings.max_image_mb,
            max_document_mb: settings.max_document_mb,
            max_pages: settings.max_pdf_pages,
        }
    }

    /// Validate one uploaded image and wrap it as a payload.
    pub fn check_image(&self, bytes: Vec<u8>, mime_type: &str) -> Result<UnitPayload, RequestError> {
        let mime_type = mime_type.trim().to_ascii_lowercase();
        if !SUPPORTED_IMAGE_MIME.contains(&mime_type.as_str()) {
            return Err(RequestError::UnsupportedFileType(format!(
                "Unsupported content_type={mime_type}"
            )));
        }
        if bytes.len() as u64 > self.max_image_mb * BYTES_PER_MB {
            return Err(RequestError::PayloadTooLarge(format!(
                "Image exceeds max size of {}MB",
                self.max_image_mb
            )));
        }
        let signature = if mime_type == "image/png" {
            PNG_SIGNATURE
        } else {
            JPEG_SIGNATURE
        };
        if !bytes.starts_with(signature) {
            return Err(RequestError::UnprocessableInput(
                "Invalid or corrupted image".into(),
            ));
        }
        Ok(UnitPayload::new(bytes, mime_type))
    }

    /// Validate already-rendered document pages against the size and page limits.
    pub fn check_document(&self, pages: &[UnitPayload]) -> Result<(), RequestError> {
        if pages.is_empty() || pages.iter().any(UnitPayload::is_empty) {
            return Err(RequestError::UnprocessableInput(
                "Document contains no readable pages".into(),
            ));
        }
        let total: u64 = pages.iter().map(|p| p.len() as u64).sum();
        if total > self.max_document_mb * BYTES_PER_MB {
            return Err(RequestError::PayloadTooLarge(format!(
                "Document exceeds max size of {}MB",
                self.max_document_mb
            )));
        }
        Ok(())
    }

    /// Validate a whole document request: pages, optional page limit and
    /// optional extraction mode (default `full`).
    pub fn check_document_request(
        &self,
        pages: Vec<UnitPayload>,
        max_pages: Option<i64>,
        mode: Option<&str>,
        hints: DocumentHints,
    ) -> Result<DocumentInput, RequestError> {
        self.check_document(&pages)?;
        let max_pages = max_pages.map_or(Ok(self.max_pages), |n| self.check_max_pages(n))?;
        let style = mode.map_or(Ok(ExtractionStyle::default()), parse_document_mode)?;
        Ok(DocumentInput {
            pages,
            max_pages,
            style,
            hints,
        })
    }

    /// Caller-supplied page limit, capped by the configured one.
    pub fn check_max_pages(&self, requested: i64) -> Result<usize, RequestError> {
        if requested <= 0 {
            return Err(RequestError::InvalidParameters(
                "max_pages must be a positive integer".into(),
            ));
        }
        Ok(usize::try_from(requested).map_or(self.max_pages, |n| n.min(self.max_pages)))
    }
}

/// Image analysis mode from its wire name.
pub fn parse_image_mode(value: &str) -> Result<AnalysisMode, RequestError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "vlm" => Ok(AnalysisMode::Vlm),
        "baseline" => Ok(AnalysisMode::Baseline),
        other => Err(RequestError::InvalidParameters(format!(
            "mode must be one of: vlm, baseline (got '{other}')"
        ))),
    }
}

pub fn parse_document_mode(value: &str) -> Result<ExtractionStyle, RequestError> {
    ExtractionStyle::parse(value).ok_or_else(|| {
        RequestError::InvalidParameters("mode must be one of: fast, full".into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png(len: usize) -> Vec<u8> {
        let mut bytes = PNG_SIGNATURE.to_vec();
        bytes.resize(len.max(PNG_SIGNATURE.len()), 0);
        bytes
    }

    #[test]
    fn oversized_image_is_payload_too_large() {
        let limits = RequestLimits {
            max_image_mb: 1,
            ..RequestLimits::default()
        };
        let err = limits
            .check_image(png(BYTES_PER_MB as usize + 1), "image/png")
            .unwrap_err();
        assert_eq!(err.code(), "payload_too_large");
        assert_eq!(err.status(), 413);
        assert_eq!(err.to_string(), "Image exceeds max size of 1MB");
    }

    #[test]
    fn corrupted_image_is_unprocessable() {
        let err = RequestLimits::default()
            .check_image(b"not an image".to_vec(), "image/jpeg")
            .unwrap_err();
        assert_eq!(err.code(), "unprocessable_input");
        assert_eq!(err.status(), 422);
    }

    #[test]
    fn unsupported_mime_is_rejected() {
        let err = RequestLimits::default()
            .check_image(png(32), "image/gif")
            .unwrap_err();
        assert_eq!(err.code(), "unsupported_file_type");
    }

    #[test]
    fn valid_png_becomes_payload() {
        let payload = RequestLimits::default()
            .check_image(png(64), "IMAGE/PNG")
            .unwrap();
        assert_eq!(payload.mime_type(), "image/png");
        assert_eq!(payload.len(), 64);
    }

    #[test]
    fn document_checks() {
        let limits = RequestLimits {
            max_document_mb: 1,
            ..RequestLimits::default()
        };
        assert_eq!(
            limits.check_document(&[]).unwrap_err().code(),
            "unprocessable_input"
        );
        let big = vec![
            UnitPayload::png(vec![0u8; 600 * 1024]),
            UnitPayload::png(vec![0u8; 600 * 1024]),
        ];
        assert_eq!(
            limits.check_document(&big).unwrap_err().code(),
            "payload_too_large"
        );
        assert!(limits.check_document(&big[..1]).is_ok());
    }

    #[test]
    fn document_request_carries_mode_and_hints() {
        let limits = RequestLimits::default();
        let pages = vec![UnitPayload::png(vec![1u8; 8]), UnitPayload::png(vec![2u8; 8])];
        let hints = DocumentHints::new(Some("invoice".into()), vec!["total".into()]);

        let input = limits
            .check_document_request(pages.clone(), Some(1), Some("fast"), hints.clone())
            .unwrap();
        assert_eq!(input.style, ExtractionStyle::Fast);
        assert_eq!(input.max_pages, 1);
        assert_eq!(input.hints, hints);

        let input = limits
            .check_document_request(pages.clone(), None, None, DocumentHints::default())
            .unwrap();
        assert_eq!(input.style, ExtractionStyle::Full);
        assert_eq!(input.max_pages, 10);

        let err = limits
            .check_document_request(pages, None, Some("turbo"), DocumentHints::default())
            .unwrap_err();
        assert_eq!(err.to_string(), "mode must be one of: fast, full");
    }

    #[test]
    fn max_pages_must_be_positive_and_is_capped() {
        let limits = RequestLimits::default();
        assert_eq!(
            limits.check_max_pages(0).unwrap_err().code(),
            "invalid_parameters"
        );
        assert!(limits.check_max_pages(-3).is_err());
        assert_eq!(limits.check_max_pages(4).unwrap(), 4);
        assert_eq!(limits.check_max_pages(500).unwrap(), 10);
    }

    #[test]
    fn modes_parse() {
        assert_eq!(parse_image_mode("VLM").unwrap(), AnalysisMode::Vlm);
        assert_eq!(parse_image_mode("baseline").unwrap(), AnalysisMode::Baseline);
        assert!(parse_image_mode("document").is_err());
        assert_eq!(parse_document_mode("fast").unwrap(), ExtractionStyle::Fast);
        assert_eq!(
            parse_document_mode("turbo").unwrap_err().code(),
            "invalid_parameters"
        );
    }

    #[test]
    fn error_body_shape() {
        let body = RequestError::PayloadTooLarge("too big".into()).to_body(Some("req-1"));
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "error": {"code": "payload_too_large", "message": "too big", "request_id": "req-1"}
            })
        );
        let anonymous = serde_json::to_value(RequestError::InvalidParameters("x".into()).to_body(None))
            .unwrap();
        assert!(anonymous["error"]["request_id"].is_null());
    }
}
