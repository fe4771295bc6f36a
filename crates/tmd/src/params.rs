//! Operational parameters each participant reads from its parameter key.
//!
//! The setup step writes one JSON document per participant before starting
//! it; the participant waits for the key with the rendezvous and decodes it
//! here.
//!
//! ```json
//! {"hostname": "h1.example.com", "group": "default",
//!  "tools": {"iostat": "--interval=3", "mpstat": ""}}
//! ```

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use tm_protocol::{Broker, Rendezvous};

use crate::error::{ParticipantError, Result};

/// Parameters of a Tool Meister.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMeisterParams {
    /// Host the Tool Meister runs on; reported in every status
    pub hostname: String,

    /// Tool group this Tool Meister serves
    pub group: String,

    /// Registered tools and their option strings
    #[serde(default)]
    pub tools: BTreeMap<String, String>,

    /// Fields used by other parts of the run setup
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Parameters of the Tool Data Sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSinkParams {
    /// Host the data sink runs on
    pub hostname: String,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ToolMeisterParams {
    pub fn parse(key: &str, raw: &str) -> Result<Self> {
        let params: Self = decode(key, raw)?;
        if params.group.is_empty() {
            return Err(ParticipantError::InvalidParams {
                key: key.to_string(),
                reason: "empty tool group".to_string(),
            });
        }
        Ok(params)
    }
}

impl DataSinkParams {
    pub fn parse(key: &str, raw: &str) -> Result<Self> {
        decode(key, raw)
    }
}

/// Waits for the parameter key to hold a value and returns it undecoded.
pub async fn fetch_params(
    broker: &dyn Broker,
    key: &str,
    prog: &str,
    cancel_token: CancellationToken,
) -> Result<String> {
    Rendezvous::new(broker, key, prog)
        .cancel_token(cancel_token)
        .wait()
        .await
        .map(|(raw, _stats)| raw)
        .map_err(|source| ParticipantError::Params {
            key: key.to_string(),
            source,
        })
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| ParticipantError::InvalidParams {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_meister_params() {
        let params = ToolMeisterParams::parse(
            "tm-default-h1",
            r#"{"hostname":"h1","group":"default","tools":{"iostat":"--interval=3"},"label":"web"}"#,
        )
        .unwrap();
        assert_eq!(params.hostname, "h1");
        assert_eq!(params.tools.get("iostat").map(String::as_str), Some("--interval=3"));
        assert_eq!(params.extra.get("label"), Some(&Value::from("web")));
    }

    #[test]
    fn test_tools_default_to_empty() {
        let params =
            ToolMeisterParams::parse("k", r#"{"hostname":"h1","group":"default"}"#).unwrap();
        assert!(params.tools.is_empty());
    }

    #[test]
    fn test_missing_group_is_invalid() {
        let err = ToolMeisterParams::parse("k", r#"{"hostname":"h1"}"#).unwrap_err();
        assert!(matches!(err, ParticipantError::InvalidParams { .. }));
        assert!(err.to_string().contains("group"));
    }

    #[test]
    fn test_empty_group_is_invalid() {
        assert!(ToolMeisterParams::parse("k", r#"{"hostname":"h1","group":""}"#).is_err());
    }

    #[tokio::test]
    async fn test_fetch_params_reads_key() {
        use tm_protocol::MemoryBroker;

        let broker = MemoryBroker::new();
        broker.set("tds", br#"{"hostname":"ctl"}"#).await.unwrap();
        let raw = fetch_params(&broker, "tds", "tool-data-sink", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(DataSinkParams::parse("tds", &raw).unwrap().hostname, "ctl");
    }

    #[tokio::test]
    async fn test_fetch_params_cancelled() {
        let broker = tm_protocol::MemoryBroker::new();
        let token = CancellationToken::new();
        token.cancel();
        let err = fetch_params(&broker, "absent", "tool-meister", token)
            .await
            .unwrap_err();
        assert!(matches!(err, ParticipantError::Params { .. }));
    }

    #[test]
    fn test_data_sink_params() {
        let params = DataSinkParams::parse("tds", r#"{"hostname":"ctl"}"#).unwrap();
        assert_eq!(params.hostname, "ctl");
        assert!(DataSinkParams::parse("tds", "[]").is_err());
    }
}
