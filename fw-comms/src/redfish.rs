// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Redfish (HTTPS + JSON) client for firmware upload and reset actions.

use crate::error::ProtocolError;
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::backoff::Constant;
use camino::Utf8Path;
use reqwest::multipart::Form;
use reqwest::multipart::Part;
use serde_json::Value;
use slog::debug;
use slog::info;
use slog::warn;
use slog::Logger;
use std::future::Future;
use std::time::Duration;

/// Multipart field name that carries the firmware image.
pub const UPDATE_FILE_FIELD: &str = "UpdateFile";

/// Management-protocol operations needed by the update pipeline.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// `GET` a resource; retried on transport errors.
    async fn get(&self, path: &str) -> Result<Value, ProtocolError>;

    /// Multipart upload of `file` plus one form field per top-level key of
    /// `payload`. An `error` object in a 2xx body is a hard failure.
    async fn post_file(
        &self,
        endpoint: &str,
        file: &Utf8Path,
        payload: &Value,
    ) -> Result<Value, ProtocolError>;

    /// `POST` a JSON action body (e.g., a reset). Not retried: actions are
    /// not idempotent.
    async fn post_action(
        &self,
        endpoint: &str,
        payload: &Value,
    ) -> Result<Value, ProtocolError>;
}

/// Configuration for retrying idempotent requests.
///
/// This is deliberately a fixed-delay, bounded policy: it sits underneath
/// the pipeline's own (much longer) deadlines, and exhausting it surfaces as
/// a single failed request.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub wait: Duration,
    pub request_timeout: Duration,
    /// Uploads stream tens of megabytes to a slow controller.
    pub upload_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            wait: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
            upload_timeout: Duration::from_secs(300),
        }
    }
}

pub struct RedfishClient {
    base_url: String,
    user: String,
    password: String,
    http: reqwest::Client,
    retry: RetryConfig,
    log: Logger,
}

impl RedfishClient {
    pub fn new(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        retry: RetryConfig,
        log: Logger,
    ) -> Result<Self, ProtocolError> {
        let base_url = format!("https://{host}:{port}");
        // Controllers ship with self-signed certificates.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(retry.request_timeout)
            .build()
            .map_err(|err| ProtocolError::Request {
                url: base_url.clone(),
                err,
            })?;
        let log = log.new(slog::o!("redfish" => base_url.clone()));
        Ok(Self {
            base_url,
            user: user.to_string(),
            password: password.to_string(),
            http,
            retry,
            log,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn with_retries<T, F, Fut>(
        &self,
        url: &str,
        mut op: F,
    ) -> Result<T, ProtocolError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, ProtocolError>> + Send,
        T: Send,
    {
        let mut backoff = Constant::new(self.retry.wait);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_transient() {
                return Err(err);
            }
            if attempt >= self.retry.max_attempts {
                return Err(ProtocolError::ExhaustedRetries {
                    url: url.to_string(),
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
            warn!(
                self.log, "request failed; retrying";
                "url" => url,
                "attempt" => attempt,
                &err,
            );
            let wait = backoff.next_backoff().unwrap_or(self.retry.wait);
            tokio::time::sleep(wait).await;
        }
    }

    async fn upload_once(
        &self,
        url: &str,
        file_name: &str,
        image: &[u8],
        payload: &Value,
    ) -> Result<Value, ProtocolError> {
        let request_err =
            |err| ProtocolError::Request { url: url.to_string(), err };

        let mut form = Form::new();
        for (key, value) in form_fields(payload) {
            form = form.text(key, value);
        }
        let part = Part::bytes(image.to_vec())
            .file_name(file_name.to_string())
            .mime_str("application/octet-stream")
            .map_err(request_err)?;
        form = form.part(UPDATE_FILE_FIELD, part);

        let response = self
            .http
            .post(url)
            .basic_auth(&self.user, Some(&self.password))
            .timeout(self.retry.upload_timeout)
            .multipart(form)
            .send()
            .await
            .map_err(request_err)?;
        decode_response(url, response).await
    }
}

#[async_trait]
impl ProtocolClient for RedfishClient {
    async fn get(&self, path: &str) -> Result<Value, ProtocolError> {
        let url = self.url(path);
        debug!(self.log, "GET"; "url" => &url);
        self.with_retries(&url, || async {
            let response = self
                .http
                .get(&url)
                .basic_auth(&self.user, Some(&self.password))
                .send()
                .await
                .map_err(|err| ProtocolError::Request {
                    url: url.clone(),
                    err,
                })?;
            decode_response(&url, response).await
        })
        .await
    }

    async fn post_file(
        &self,
        endpoint: &str,
        file: &Utf8Path,
        payload: &Value,
    ) -> Result<Value, ProtocolError> {
        let url = self.url(endpoint);
        let image = tokio::fs::read(file).await.map_err(|err| {
            ProtocolError::FirmwareFile { path: file.to_owned(), err }
        })?;
        let file_name = file.file_name().unwrap_or(file.as_str()).to_string();

        info!(
            self.log, "uploading firmware image";
            "file" => &file_name,
            "bytes" => image.len(),
            "url" => &url,
        );
        self.with_retries(&url, || {
            self.upload_once(&url, &file_name, &image, payload)
        })
        .await
    }

    async fn post_action(
        &self,
        endpoint: &str,
        payload: &Value,
    ) -> Result<Value, ProtocolError> {
        let url = self.url(endpoint);
        debug!(self.log, "POST"; "url" => &url, "payload" => %payload);
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.user, Some(&self.password))
            .json(payload)
            .send()
            .await
            .map_err(|err| ProtocolError::Request { url: url.clone(), err })?;
        decode_response(&url, response).await
    }
}

async fn decode_response(
    url: &str,
    response: reqwest::Response,
) -> Result<Value, ProtocolError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|err| ProtocolError::Request { url: url.to_string(), err })?;
    if !status.is_success() {
        return Err(ProtocolError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            body,
        });
    }
    parse_body(url, &body)
}

/// Parse a successful response body, rejecting Redfish error objects.
///
/// Reset actions commonly answer `204 No Content`; an empty body is `null`.
pub fn parse_body(url: &str, body: &str) -> Result<Value, ProtocolError> {
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    let value: Value = serde_json::from_str(body).map_err(|err| {
        ProtocolError::Decode { url: url.to_string(), err }
    })?;
    if let Some(error) = value.get("error") {
        return Err(ProtocolError::Application {
            url: url.to_string(),
            message: application_error_message(error),
        });
    }
    Ok(value)
}

fn application_error_message(error: &Value) -> String {
    let mut parts = Vec::new();
    if let Some(message) = error.get("message").and_then(Value::as_str) {
        parts.push(message.to_string());
    }
    if let Some(infos) =
        error.get("@Message.ExtendedInfo").and_then(Value::as_array)
    {
        parts.extend(
            infos
                .iter()
                .filter_map(|info| info.get("Message"))
                .filter_map(Value::as_str)
                .map(str::to_string),
        );
    }
    if parts.is_empty() {
        error.to_string()
    } else {
        parts.join("; ")
    }
}

/// Text form fields for an upload: one per top-level payload key, with
/// non-string values sent as JSON.
pub fn form_fields(payload: &Value) -> Vec<(String, String)> {
    let Some(fields) = payload.as_object() else {
        return Vec::new();
    };
    fields
        .iter()
        .map(|(key, value)| {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), text)
        })
        .collect()
}
