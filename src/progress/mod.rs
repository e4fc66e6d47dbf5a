//! Out-of-band progress reporting from running remote scripts.
//!
//! A remote script is handed a callback URL and POSTs JSON status messages
//! to it while it works. This module provides:
//!
//! - [`ProgressMessage`], the wire schema, and [`ProgressEvent`], its validated
//!   tagged form
//! - [`hub`]: per-step endpoint registration and delivery
//! - [`server`]: the HTTP server that feeds the hub
//!
//! ## Wire format
//!
//! ```json
//! {"message": "remapping", "error": false, "finished": false,
//!  "total_units": 1000, "processed_units": 400}
//! ```
//!
//! `total_units` and `processed_units` are either both present or both
//! absent. The older `total_vnodes` / `processed_vnodes` names are accepted.

pub mod hub;
pub mod server;

pub use hub::{DeliveryError, ProgressEndpoint, ProgressHub};
pub use server::ProgressServer;

use crate::errors::PhaseError;
use serde::{Deserialize, Serialize};

/// A status message as POSTed by a remote script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressMessage {
    pub message: String,
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub finished: bool,
    #[serde(default, alias = "total_vnodes")]
    pub total_units: Option<u64>,
    #[serde(default, alias = "processed_vnodes")]
    pub processed_units: Option<u64>,
}

impl ProgressMessage {
    pub fn info(message: &str) -> Self {
        Self {
            message: message.to_string(),
            error: false,
            finished: false,
            total_units: None,
            processed_units: None,
        }
    }

    pub fn with_units(mut self, processed: u64, total: u64) -> Self {
        self.processed_units = Some(processed);
        self.total_units = Some(total);
        self
    }

    pub fn finished(message: &str) -> Self {
        Self {
            finished: true,
            ..Self::info(message)
        }
    }

    pub fn failed(message: &str) -> Self {
        Self {
            error: true,
            ..Self::info(message)
        }
    }
}

/// A validated progress message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Non-terminal status; never resolves a step.
    Info {
        message: String,
        units: Option<(u64, u64)>,
    },
    /// Terminal failure reported by the script.
    Failed { message: String },
    /// Terminal success reported by the script.
    Finished { message: String, total: Option<u64> },
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressEvent::Info { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            ProgressEvent::Info { message, .. }
            | ProgressEvent::Failed { message }
            | ProgressEvent::Finished { message, .. } => message,
        }
    }

    /// One-line rendering for the status display.
    pub fn describe(&self) -> String {
        match self {
            ProgressEvent::Info {
                message,
                units: Some((processed, total)),
            } => format!("remote status: {} ({} of {} units)", message, processed, total),
            ProgressEvent::Info { message, units: None } => format!("remote status: {}", message),
            ProgressEvent::Failed { message } => format!("script failed: {}", message),
            ProgressEvent::Finished {
                total: Some(total), ..
            } => format!("script finished ({} units)", total),
            ProgressEvent::Finished { total: None, .. } => "script finished".to_string(),
        }
    }
}

impl TryFrom<ProgressMessage> for ProgressEvent {
    type Error = PhaseError;

    fn try_from(msg: ProgressMessage) -> Result<Self, PhaseError> {
        if msg.error {
            return Ok(ProgressEvent::Failed {
                message: msg.message,
            });
        }

        let units = match (msg.processed_units, msg.total_units) {
            (Some(processed), Some(total)) => Some((processed, total)),
            (None, None) => None,
            (processed, total) => {
                return Err(PhaseError::ProtocolViolation(format!(
                    "processed_units ({:?}) and total_units ({:?}) must be both present or both absent",
                    processed, total
                )));
            }
        };

        if msg.finished {
            return Ok(ProgressEvent::Finished {
                message: msg.message,
                total: units.map(|(_, total)| total),
            });
        }

        Ok(ProgressEvent::Info {
            message: msg.message,
            units,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_info_with_units() {
        let msg: ProgressMessage = serde_json::from_str(
            r#"{"message": "remapping", "error": false, "finished": false,
                "total_units": 1000, "processed_units": 400}"#,
        )
        .unwrap();
        let event = ProgressEvent::try_from(msg).unwrap();
        assert_eq!(
            event,
            ProgressEvent::Info {
                message: "remapping".to_string(),
                units: Some((400, 1000)),
            }
        );
        assert!(!event.is_terminal());
        assert_eq!(event.describe(), "remote status: remapping (400 of 1000 units)");
    }

    #[test]
    fn test_decode_null_units_is_info() {
        let msg: ProgressMessage = serde_json::from_str(
            r#"{"message": "listing", "error": false, "finished": false,
                "total_units": null, "processed_units": null}"#,
        )
        .unwrap();
        let event = ProgressEvent::try_from(msg).unwrap();
        assert_eq!(event.describe(), "remote status: listing");
    }

    #[test]
    fn test_decode_legacy_vnode_names() {
        let msg: ProgressMessage = serde_json::from_str(
            r#"{"message": "done", "finished": true, "total_vnodes": 1000, "processed_vnodes": 1000}"#,
        )
        .unwrap();
        let event = ProgressEvent::try_from(msg).unwrap();
        assert_eq!(
            event,
            ProgressEvent::Finished {
                message: "done".to_string(),
                total: Some(1000),
            }
        );
        assert!(event.is_terminal());
    }

    #[test]
    fn test_partial_units_is_protocol_violation() {
        let msg = ProgressMessage {
            processed_units: Some(5),
            ..ProgressMessage::info("x")
        };
        let err = ProgressEvent::try_from(msg).unwrap_err();
        assert!(matches!(err, PhaseError::ProtocolViolation(_)));

        let msg = ProgressMessage {
            total_units: Some(5),
            finished: true,
            ..ProgressMessage::info("x")
        };
        assert!(ProgressEvent::try_from(msg).is_err());
    }

    #[test]
    fn test_error_takes_precedence_over_finished() {
        let msg = ProgressMessage {
            finished: true,
            ..ProgressMessage::failed("disk full")
        };
        let event = ProgressEvent::try_from(msg).unwrap();
        assert_eq!(
            event,
            ProgressEvent::Failed {
                message: "disk full".to_string()
            }
        );
        assert_eq!(event.describe(), "script failed: disk full");
    }

    #[test]
    fn test_builders_serialize_to_wire_names() {
        let json = serde_json::to_string(&ProgressMessage::info("x").with_units(1, 2)).unwrap();
        assert!(json.contains(r#""processed_units":1"#));
        assert!(json.contains(r#""total_units":2"#));
    }
}
