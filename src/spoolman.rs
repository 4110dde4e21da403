//! SpoolMan records and the HTTP publisher.
use std::time::Duration;

use metrics::counter;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::parser::{BambuTag, ParsedSpool};

pub const DEFAULT_SPOOLMAN_URL: &str = "http://localhost:8000/api/spools";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// g/cm3 by material family, matched as a prefix of the upper-cased material name.
const DENSITIES: &[(&str, f64)] = &[
    ("PLA", 1.24),
    ("PETG", 1.27),
    ("ABS", 1.04),
    ("ASA", 1.07),
    ("TPU", 1.21),
    ("PVA", 1.30),
    ("PA", 1.14),
    ("PC", 1.20),
];

pub fn density_for(material: &str) -> Option<f64> {
    let m = material.trim().to_ascii_uppercase();
    DENSITIES.iter().find(|(prefix, _)| m.starts_with(prefix)).map(|(_, d)| *d)
}

/// Compact record POSTed to SpoolMan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpoolRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spool_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub material: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight_grams: Option<u32>,
}

impl From<&ParsedSpool> for SpoolRecord {
    fn from(p: &ParsedSpool) -> Self {
        Self {
            spool_id: p.spool_id.clone(),
            material: p.material.clone(),
            color: p.color.clone(),
            weight_grams: p.weight_grams,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PayloadTemperatures {
    pub drying_temp_c: Option<u16>,
    pub drying_time_h: Option<u16>,
    pub bed_temp_c: Option<u16>,
    pub hotend_temp_min_c: Option<u16>,
    pub hotend_temp_max_c: Option<u16>,
}

/// Detailed filament document written next to each dump.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpoolmanPayload {
    pub uid: Option<String>,
    pub filament_type: Option<String>,
    pub detailed_filament_type: Option<String>,
    pub material_id: Option<String>,
    pub variant_id: Option<String>,
    pub color_hex: Vec<String>,
    pub spool_weight_g: Option<u16>,
    pub filament_length_m: Option<u16>,
    pub filament_diameter_mm: Option<f64>,
    pub spool_width_mm: Option<f64>,
    pub nozzle_diameter_mm: Option<f64>,
    pub temperatures: PayloadTemperatures,
    pub production_date: Option<String>,
    pub density_g_cm3: Option<f64>,
}

impl From<&BambuTag> for SpoolmanPayload {
    fn from(tag: &BambuTag) -> Self {
        let t = tag.temperatures.as_ref();
        let density = tag
            .filament_type
            .as_deref()
            .or(tag.detailed_filament_type.as_deref())
            .and_then(density_for);
        Self {
            uid: tag.uid.clone(),
            filament_type: tag.filament_type.clone(),
            detailed_filament_type: tag.detailed_filament_type.clone(),
            material_id: tag.material_id.clone(),
            variant_id: tag.variant_id.clone(),
            color_hex: tag.colors.clone(),
            spool_weight_g: tag.spool_weight_g,
            filament_length_m: tag.filament_length_m,
            filament_diameter_mm: tag.filament_diameter_mm,
            spool_width_mm: tag.spool_width_mm,
            nozzle_diameter_mm: tag.nozzle_diameter_mm,
            temperatures: PayloadTemperatures {
                drying_temp_c: t.map(|t| t.drying_temp_c),
                drying_time_h: t.map(|t| t.drying_time_h),
                bed_temp_c: t.map(|t| t.bed_temp_c),
                hotend_temp_min_c: t.map(|t| t.min_hotend_c),
                hotend_temp_max_c: t.map(|t| t.max_hotend_c),
            },
            production_date: tag.production_date.clone(),
            density_g_cm3: density,
        }
    }
}

/// Accepted publish.
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub status: u16,
    pub body: Option<Value>,
}

#[allow(async_fn_in_trait)]
pub trait Publisher {
    async fn publish(&self, record: &SpoolRecord) -> Result<Ack>;
}

pub struct SpoolmanClient {
    client: Client,
    url: String,
}

impl SpoolmanClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url: url.into() })
    }
}

impl Publisher for SpoolmanClient {
    async fn publish(&self, record: &SpoolRecord) -> Result<Ack> {
        info!(url = %self.url, spool_id = ?record.spool_id, "posting spool");
        let resp = match self.client.post(&self.url).json(record).send().await {
            Ok(resp) => resp,
            Err(e) => {
                counter!("spoolman.post.err").increment(1);
                error!(url = %self.url, error = %e, "spoolman post failed");
                return Err(e.into());
            }
        };
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        if !(200..300).contains(&status) {
            counter!("spoolman.post.err", "status" => status.to_string()).increment(1);
            error!(status, body = %text, "spoolman rejected spool");
            return Err(Error::Rejected { status, body: text });
        }
        counter!("spoolman.post.ok", "status" => status.to_string()).increment(1);
        info!(status, "spoolman accepted spool");
        Ok(Ack { status, body: serde_json::from_str(&text).ok() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::tests::bambu_dump;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-shot HTTP server: answers a single request and hands back its raw text.
    async fn serve_once(status_line: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/api/spools", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = sock.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let len = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + len {
                        break;
                    }
                }
            }
            let resp = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            sock.write_all(resp.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&buf).to_string()
        });
        (url, handle)
    }

    fn record() -> SpoolRecord {
        SpoolRecord { spool_id: Some("A1B2".into()), material: Some("PLA".into()), color: None, weight_grams: Some(1000) }
    }

    #[test]
    fn record_omits_absent_fields() {
        let json = serde_json::to_value(record()).unwrap();
        assert_eq!(json, serde_json::json!({"spool_id": "A1B2", "material": "PLA", "weight_grams": 1000}));
    }

    #[test]
    fn density_prefix_match() {
        assert_eq!(density_for("PLA Basic"), Some(1.24));
        assert_eq!(density_for("petg hf"), Some(1.27));
        assert_eq!(density_for("PA-CF"), Some(1.14));
        assert_eq!(density_for("PVA"), Some(1.30));
        assert_eq!(density_for("Support W"), None);
    }

    #[test]
    fn payload_from_layout() {
        let tag = crate::parser::parse_layout(&bambu_dump());
        let payload = SpoolmanPayload::from(&tag);
        assert_eq!(payload.density_g_cm3, Some(1.24));
        assert_eq!(payload.color_hex.len(), 2);
        assert_eq!(payload.temperatures.hotend_temp_max_c, Some(230));
        assert_eq!(payload.production_date.as_deref(), Some("2024-03-15 10:30"));
    }

    #[tokio::test]
    async fn posts_record_as_json() {
        let (url, server) = serve_once("201 Created", r#"{"id":7}"#).await;
        let client = SpoolmanClient::new(url, DEFAULT_TIMEOUT).unwrap();
        let ack = client.publish(&record()).await.unwrap();
        assert_eq!(ack.status, 201);
        assert_eq!(ack.body, Some(serde_json::json!({"id": 7})));

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/spools HTTP/1.1"));
        assert!(request.contains(r#""spool_id":"A1B2""#));
        assert!(!request.contains("color"));
    }

    #[tokio::test]
    async fn non_success_status_is_rejected() {
        let (url, server) = serve_once("422 Unprocessable Entity", r#"{"detail":"bad"}"#).await;
        let client = SpoolmanClient::new(url, DEFAULT_TIMEOUT).unwrap();
        let err = client.publish(&record()).await.unwrap_err();
        assert!(matches!(err, Error::Rejected { status: 422, .. }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_server_is_http_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/api/spools", listener.local_addr().unwrap());
        drop(listener);
        let client = SpoolmanClient::new(url, Duration::from_secs(1)).unwrap();
        assert!(matches!(client.publish(&record()).await, Err(Error::Http(_))));
    }
}
