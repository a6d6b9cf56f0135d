use serde::{Deserialize, Serialize};

/// Carrier-reported call lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    Queued,
    Ringing,
    InProgress,
    Completed,
    Failed,
    Busy,
    NoAnswer,
}

impl CallStatus {
    /// The call has been answered or is actively ringing the callee.
    pub fn is_advancing(&self) -> bool {
        matches!(self, CallStatus::Ringing | CallStatus::InProgress)
    }

    /// No further status changes will arrive for this call.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Completed | CallStatus::Failed | CallStatus::Busy | CallStatus::NoAnswer
        )
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CallStatus::Queued => "queued",
            CallStatus::Ringing => "ringing",
            CallStatus::InProgress => "in-progress",
            CallStatus::Completed => "completed",
            CallStatus::Failed => "failed",
            CallStatus::Busy => "busy",
            CallStatus::NoAnswer => "no-answer",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for CallStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(CallStatus::Queued),
            "ringing" => Ok(CallStatus::Ringing),
            "in-progress" => Ok(CallStatus::InProgress),
            "completed" => Ok(CallStatus::Completed),
            "failed" => Ok(CallStatus::Failed),
            "busy" => Ok(CallStatus::Busy),
            "no-answer" => Ok(CallStatus::NoAnswer),
            other => Err(format!("unknown call status: {other}")),
        }
    }
}

/// One call resource as returned by the Calls endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Call {
    pub sid: String,
    pub status: CallStatus,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub date_created: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub recording_url: Option<String>,
}

/// Envelope Exotel wraps around a single call resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallResponse {
    #[serde(rename = "Call")]
    pub call: Call,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_connect_response() {
        let body = r#"{
            "Call": {
                "Sid": "abc123",
                "Status": "queued",
                "Direction": "outbound-api",
                "From": "08030752400",
                "To": "+919999999999",
                "DateCreated": "2024-05-01 10:00:00"
            }
        }"#;

        let parsed: CallResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.call.sid, "abc123");
        assert_eq!(parsed.call.status, CallStatus::Queued);
    }

    #[test]
    fn status_round_trips_through_display() {
        for status in [
            CallStatus::Queued,
            CallStatus::Ringing,
            CallStatus::InProgress,
            CallStatus::Completed,
            CallStatus::Failed,
            CallStatus::Busy,
            CallStatus::NoAnswer,
        ] {
            let text = status.to_string();
            assert_eq!(text.parse::<CallStatus>().unwrap(), status);
        }
    }

    #[test]
    fn advancing_and_terminal_partition() {
        assert!(CallStatus::Ringing.is_advancing());
        assert!(CallStatus::InProgress.is_advancing());
        assert!(!CallStatus::Queued.is_advancing());
        assert!(CallStatus::NoAnswer.is_terminal());
        assert!(!CallStatus::Ringing.is_terminal());
    }
}
