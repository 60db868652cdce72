use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

/// A client operation against the store.
///
/// The JSON form (`{"op":"set","key":"k","value":"v"}`) is both the request
/// body accepted by the HTTP surface and the payload appended to the Raft log,
/// so a committed entry decodes back to exactly the command that was routed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Command {
    Get { key: String },
    Set { key: String, value: String },
}

impl Command {
    pub fn get(key: impl Into<String>) -> Self {
        Command::Get { key: key.into() }
    }

    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Command::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Command::Get { key } | Command::Set { key, .. } => key,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ClusterError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ClusterError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_round_trips_through_log_encoding() {
        let command = Command::set("x", "a value with spaces");
        let bytes = command.encode().unwrap();
        assert_eq!(Command::decode(&bytes).unwrap(), command);
    }

    #[test]
    fn decodes_client_wire_format() {
        let set = Command::decode(br#"{"op":"set","key":"k","value":"v"}"#).unwrap();
        assert_eq!(set, Command::set("k", "v"));

        let get = Command::decode(br#"{"op":"get","key":"k"}"#).unwrap();
        assert_eq!(get, Command::get("k"));
        assert_eq!(get.key(), "k");
    }

    #[test]
    fn get_encodes_without_value() {
        let bytes = Command::get("k").encode().unwrap();
        assert_eq!(bytes, br#"{"op":"get","key":"k"}"#);
    }

    #[test]
    fn rejects_malformed_commands() {
        assert!(matches!(
            Command::decode(br#"{"op":"delete","key":"k"}"#),
            Err(ClusterError::Decode(_))
        ));
        assert!(matches!(
            Command::decode(br#"{"op":"set","key":"k"}"#),
            Err(ClusterError::Decode(_))
        ));
        assert!(Command::decode(b"not json").is_err());
    }
}
