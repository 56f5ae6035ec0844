use crate::model::DecodedEvent;

use async_compression::tokio::bufread::GzipDecoder;
use chrono::offset::Utc;
use tokio::io::{AsyncReadExt, BufReader};

use std::fmt;
use std::io::Cursor;

#[derive(Debug)]
pub struct DecodeError {
    what: String,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Error decoding push-port message: {}", self.what)
    }
}

/// One decoded push-port message: the cancellation events it carried and
/// counts of what was recognized but dropped.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DecodeSummary {
    pub events: Vec<DecodedEvent>,
    pub other_elements: u64,
}

// reason codes render as a generic formatted line; 104 is the one code
// this system gives fixed wording
fn format_reason(code: Option<&str>) -> Option<String> {
    let code = code?;
    match code {
        "104" => Some("Signal failure".to_string()),
        _ => Some(format!("Full cancellation - reason code {}", code)),
    }
}

async fn gunzip(body: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut decoder = GzipDecoder::new(BufReader::new(Cursor::new(body.to_vec())));
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .await
        .map_err(|e| DecodeError {
            what: format!("gzip: {}", e),
        })?;
    Ok(decompressed)
}

/// Decode one raw push-port frame body. Bodies are usually gzip-compressed
/// Pport XML; plain XML is accepted too. Only the cancellation-bearing
/// subset is turned into events, everything else is counted and dropped.
pub async fn decode(body: &[u8]) -> Result<DecodeSummary, DecodeError> {
    let xml_bytes = if body.starts_with(&[0x1f, 0x8b]) {
        gunzip(body).await?
    } else {
        body.to_vec()
    };
    let text = String::from_utf8_lossy(&xml_bytes).to_string();
    let document = roxmltree::Document::parse(&text).map_err(|e| DecodeError {
        what: format!("xml: {}", e),
    })?;

    let received_at = Utc::now();
    let mut summary = DecodeSummary::default();

    for update in document
        .descendants()
        .filter(|node| node.tag_name().name() == "uR")
    {
        for node in update.children().filter(|node| node.is_element()) {
            match node.tag_name().name() {
                "schedule" => {
                    let reason_code = node
                        .attribute("cancelReason")
                        .map(str::to_string)
                        .or_else(|| {
                            node.children()
                                .find(|child| child.tag_name().name() == "cancelReason")
                                .and_then(|child| child.text())
                                .map(|code| code.trim().to_string())
                        });
                    let has_cancelled_location = node.descendants().any(|location| {
                        location.attribute("isCancelled") == Some("true")
                    });
                    if reason_code.is_none() && !has_cancelled_location {
                        summary.other_elements += 1;
                        continue;
                    }
                    let Some(rid) = node.attribute("rid").filter(|rid| !rid.is_empty()) else {
                        summary.other_elements += 1;
                        continue;
                    };
                    summary.events.push(DecodedEvent {
                        rid: rid.to_string(),
                        train_service_code: node
                            .attribute("trainId")
                            .or_else(|| node.attribute("uid"))
                            .map(str::to_string),
                        reason_text: format_reason(reason_code.as_deref()),
                        reason_code,
                        received_at,
                    });
                }
                // an explicit deactivation is always a cancellation
                "deactivated" => {
                    let Some(rid) = node.attribute("rid").filter(|rid| !rid.is_empty()) else {
                        summary.other_elements += 1;
                        continue;
                    };
                    summary.events.push(DecodedEvent {
                        rid: rid.to_string(),
                        train_service_code: None,
                        reason_code: None,
                        reason_text: Some("Service deactivated".to_string()),
                        received_at,
                    });
                }
                _ => summary.other_elements += 1,
            }
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NS: &str = "http://www.thalesgroup.com/rtti/PushPort/v16";

    fn pport(inner: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><Pport xmlns="{}" ts="2025-12-01T17:45:00Z" version="16.0"><uR updateOrigin="Darwin">{}</uR></Pport>"#,
            NS, inner
        )
    }

    #[tokio::test]
    async fn cancelled_schedule_becomes_one_event() {
        let xml = pport(
            r#"<schedule rid="202512010000C12345" uid="C12345" trainId="1A23" ssd="2025-12-01" toc="VT"><OR tpl="EUSTON" ptd="18:00"/><cancelReason>104</cancelReason></schedule>"#,
        );
        let summary = decode(xml.as_bytes()).await.unwrap();
        assert_eq!(summary.events.len(), 1);
        let event = &summary.events[0];
        assert_eq!(event.rid, "202512010000C12345");
        assert_eq!(event.train_service_code.as_deref(), Some("1A23"));
        assert_eq!(event.reason_code.as_deref(), Some("104"));
        assert_eq!(event.reason_text.as_deref(), Some("Signal failure"));
    }

    #[tokio::test]
    async fn cancelled_location_counts_without_cancel_reason() {
        let xml = pport(
            r#"<schedule rid="202512010000C12345" uid="C12345"><IP tpl="MKTCENT" isCancelled="true"/></schedule>"#,
        );
        let summary = decode(xml.as_bytes()).await.unwrap();
        assert_eq!(summary.events.len(), 1);
        assert!(summary.events[0].reason_code.is_none());
    }

    #[tokio::test]
    async fn deactivated_schedule_is_always_a_cancellation() {
        let xml = pport(r#"<deactivated rid="202512017126987"/>"#);
        let summary = decode(xml.as_bytes()).await.unwrap();
        assert_eq!(summary.events.len(), 1);
        assert_eq!(summary.events[0].rid, "202512017126987");
        assert_eq!(
            summary.events[0].reason_text.as_deref(),
            Some("Service deactivated")
        );
    }

    #[tokio::test]
    async fn unrelated_elements_are_counted_and_dropped() {
        let xml = pport(
            r#"<TS rid="202512010000C12345"/><schedule rid="202512010000C67890" uid="C67890"><OR tpl="EUSTON"/></schedule>"#,
        );
        let summary = decode(xml.as_bytes()).await.unwrap();
        assert!(summary.events.is_empty());
        assert_eq!(summary.other_elements, 2);
    }

    #[tokio::test]
    async fn gzipped_bodies_are_decompressed() {
        use async_compression::tokio::bufread::GzipEncoder;

        let xml = pport(r#"<deactivated rid="202512017126987"/>"#);
        let mut encoder = GzipEncoder::new(BufReader::new(Cursor::new(xml.into_bytes())));
        let mut compressed = Vec::new();
        encoder.read_to_end(&mut compressed).await.unwrap();
        assert!(compressed.starts_with(&[0x1f, 0x8b]));

        let summary = decode(&compressed).await.unwrap();
        assert_eq!(summary.events.len(), 1);
    }

    #[tokio::test]
    async fn garbage_is_a_decode_error() {
        assert!(decode(b"not xml at all").await.is_err());
        assert!(decode(&[0x1f, 0x8b, 0x00, 0x01]).await.is_err());
    }

    #[tokio::test]
    async fn unknown_reason_code_gets_formatted_text() {
        let xml = pport(
            r#"<schedule rid="202512010000C12345" uid="C12345"><cancelReason>999</cancelReason></schedule>"#,
        );
        let summary = decode(xml.as_bytes()).await.unwrap();
        assert_eq!(
            summary.events[0].reason_text.as_deref(),
            Some("Full cancellation - reason code 999")
        );
    }
}
