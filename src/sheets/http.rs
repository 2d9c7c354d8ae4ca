// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Google Sheets v4 REST client.
//!
//! Credential loading happens elsewhere; this client is handed a bearer
//! access token.

use crate::error::{LedgerError, Result};
use crate::sheets::{Row, RowStore};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Url};
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SheetsClient {
    base_url: String,
    spreadsheet_id: String,
    token: String,
    client: Client,
}

/// Map an HTTP failure onto the error taxonomy.
///
/// A deleted spreadsheet (404) is treated like revoked permission.
pub fn classify_status(status: u16, body: &str) -> LedgerError {
    let detail = format!("HTTP {status}: {}", body.trim());
    match status {
        401 | 403 | 404 => LedgerError::Authorization(detail),
        400 | 413 | 422 => LedgerError::MalformedData {
            sequence: None,
            reason: detail,
        },
        _ => LedgerError::TransientIo(detail),
    }
}

impl SheetsClient {
    pub fn new(
        base_url: impl Into<String>,
        spreadsheet_id: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let base_url = base_url.into();
        Url::parse(&base_url).map_err(|e| LedgerError::Config(format!("sheets endpoint {base_url}: {e}")))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            spreadsheet_id: spreadsheet_id.into(),
            token: token.into(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `{base}/spreadsheets/{id}{suffix}` followed by `extra` segments.
    fn url(&self, suffix: &str, extra: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| LedgerError::Config(format!("sheets endpoint {}: {e}", self.base_url)))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| LedgerError::Config(format!("sheets endpoint {} cannot be a base", self.base_url)))?;
            segments
                .pop_if_empty()
                .push("spreadsheets")
                .push(&format!("{}{}", self.spreadsheet_id, suffix));
            for seg in extra {
                segments.push(seg);
            }
        }
        Ok(url)
    }

    async fn send(&self, req: RequestBuilder) -> std::result::Result<(), (u16, String)> {
        let resp = req
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| (0, e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err((status.as_u16(), body))
    }
}

fn a1_range(worksheet: &str) -> String {
    format!("'{}'!A:C", worksheet.replace('\'', "''"))
}

#[async_trait]
impl RowStore for SheetsClient {
    async fn ensure_worksheet(&self, title: &str) -> Result<()> {
        let url = self.url(":batchUpdate", &[])?;
        let body = json!({
            "requests": [{ "addSheet": { "properties": { "title": title } } }]
        });

        match self.send(self.client.post(url).json(&body)).await {
            Ok(()) => {
                tracing::info!(worksheet = title, "Created worksheet");
                Ok(())
            }
            Err((400, body)) if body.contains("already exists") => Ok(()),
            Err((0, msg)) => Err(LedgerError::TransientIo(msg)),
            Err((status, body)) => Err(classify_status(status, &body)),
        }
    }

    async fn append_rows(&self, worksheet: &str, rows: &[Row]) -> Result<()> {
        let range = format!("{}:append", a1_range(worksheet));
        let url = self.url("", &["values", &range])?;
        let body = json!({ "majorDimension": "ROWS", "values": rows });

        let req = self
            .client
            .post(url)
            .query(&[("valueInputOption", "RAW"), ("insertDataOption", "INSERT_ROWS")])
            .json(&body);

        match self.send(req).await {
            Ok(()) => Ok(()),
            Err((0, msg)) => Err(LedgerError::TransientIo(msg)),
            Err((status, body)) => Err(classify_status(status, &body)),
        }
    }
}
