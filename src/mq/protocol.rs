//! Wire messages exchanged over the queues.
//!
//! Bodies are JSON. Byte fields travel as base64 strings and `timeTook` as
//! integer nanoseconds. The correlation id is message metadata, never part
//! of the body.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::runtime::RunResult;

/// Body of a message on the inbound queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
}

/// Body of a message on the outbound queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResponse {
    #[serde(with = "base64_bytes")]
    pub stdout: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    #[serde(with = "nanos")]
    pub time_took: Duration,
}

impl From<RunResult> for ExecutionResponse {
    fn from(r: RunResult) -> Self {
        Self {
            stdout: r.stdout,
            stderr: r.stderr,
            exit_code: r.exit_code,
            time_took: r.duration,
        }
    }
}

impl From<ExecutionResponse> for RunResult {
    fn from(r: ExecutionResponse) -> Self {
        Self {
            stdout: r.stdout,
            stderr: r.stderr,
            exit_code: r.exit_code,
            duration: r.time_took,
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    /// `null` decodes to empty, matching encoders that omit empty slices.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(d)?;
        encoded.map_or_else(
            || Ok(Vec::new()),
            |s| STANDARD.decode(s).map_err(serde::de::Error::custom),
        )
    }
}

mod nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let n = i64::deserialize(d)?;
        Ok(Duration::from_nanos(n.max(0).unsigned_abs()))
    }
}
