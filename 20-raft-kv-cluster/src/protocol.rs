//! Line parsing for the interactive client.
//!
//! Commands are case-insensitive; `set` takes the rest of the line as its
//! value so values may contain spaces.

use anyhow::{anyhow, bail, Result};

use crate::topology::NodeId;

pub const HELP: &str = "\
commands:
  get <key>              read a key from the leader
  set <key> <value...>   replicate a write through the leader
  leader                 show the current leader
  nodes                  show every node's status
  stop <node_id>         take a node out of service
  start <node_id>        bring a stopped node back
  help                   show this text
  quit | exit            leave the client";

#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Get { key: String },
    Set { key: String, value: String },
    Leader,
    Nodes,
    Stop { node: NodeId },
    Start { node: NodeId },
    Help,
    Exit,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            bail!("empty command");
        }

        let (word, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (trimmed, ""),
        };

        let cmd = match word.to_lowercase().as_str() {
            "g" => "get".to_string(),
            "put" | "p" => "set".to_string(),
            "l" => "leader".to_string(),
            "n" => "nodes".to_string(),
            "h" | "?" => "help".to_string(),
            "q" | "quit" | "e" => "exit".to_string(),
            other => other.to_string(),
        };

        match (cmd.as_str(), rest) {
            ("exit", "") => Ok(ConsoleCommand::Exit),
            ("help", "") => Ok(ConsoleCommand::Help),
            ("leader", "") => Ok(ConsoleCommand::Leader),
            ("nodes", "") => Ok(ConsoleCommand::Nodes),
            ("get", key) if !key.is_empty() && !key.contains(char::is_whitespace) => {
                Ok(ConsoleCommand::Get {
                    key: key.to_string(),
                })
            }
            ("get", _) => Err(anyhow!("usage: get <key>")),
            ("set", args) => match args.split_once(char::is_whitespace) {
                Some((key, value)) if !value.trim().is_empty() => Ok(ConsoleCommand::Set {
                    key: key.to_string(),
                    value: value.trim_start().to_string(),
                }),
                _ => Err(anyhow!("usage: set <key> <value>")),
            },
            ("stop", node) if !node.is_empty() => Ok(ConsoleCommand::Stop {
                node: node.parse()?,
            }),
            ("start", node) if !node.is_empty() => Ok(ConsoleCommand::Start {
                node: node.parse()?,
            }),
            ("stop" | "start", _) => Err(anyhow!("usage: {cmd} <node_id>")),
            ("exit" | "help" | "leader" | "nodes", _) => {
                Err(anyhow!("{cmd} takes no arguments"))
            }
            _ => Err(anyhow!("unknown command {word:?}, type `help` for a list")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_commands() {
        assert!(matches!(ConsoleCommand::parse("exit"), Ok(ConsoleCommand::Exit)));
        assert!(matches!(ConsoleCommand::parse("QUIT"), Ok(ConsoleCommand::Exit)));
        assert!(matches!(ConsoleCommand::parse("Leader"), Ok(ConsoleCommand::Leader)));
        assert!(matches!(ConsoleCommand::parse("NODES"), Ok(ConsoleCommand::Nodes)));
        assert!(matches!(ConsoleCommand::parse("HeLp"), Ok(ConsoleCommand::Help)));
    }

    #[test]
    fn test_aliases() {
        assert!(matches!(ConsoleCommand::parse("q"), Ok(ConsoleCommand::Exit)));
        assert!(matches!(ConsoleCommand::parse("l"), Ok(ConsoleCommand::Leader)));
        assert!(matches!(
            ConsoleCommand::parse("g foo"),
            Ok(ConsoleCommand::Get { key }) if key == "foo"
        ));
        assert!(matches!(
            ConsoleCommand::parse("put k v"),
            Ok(ConsoleCommand::Set { key, value }) if key == "k" && value == "v"
        ));
    }

    #[test]
    fn test_set_value_is_rest_of_line() {
        assert_eq!(
            ConsoleCommand::parse("set greeting hello   there world").unwrap(),
            ConsoleCommand::Set {
                key: "greeting".into(),
                value: "hello   there world".into(),
            }
        );
        // Keys keep their case.
        assert_eq!(
            ConsoleCommand::parse("SET Key Val").unwrap(),
            ConsoleCommand::Set {
                key: "Key".into(),
                value: "Val".into(),
            }
        );
    }

    #[test]
    fn test_lifecycle_commands_parse_node_ids() {
        assert_eq!(
            ConsoleCommand::parse("stop node3").unwrap(),
            ConsoleCommand::Stop {
                node: NodeId::new(3)
            }
        );
        assert_eq!(
            ConsoleCommand::parse("start 2").unwrap(),
            ConsoleCommand::Start {
                node: NodeId::new(2)
            }
        );
        assert!(ConsoleCommand::parse("stop banana").is_err());
        assert!(ConsoleCommand::parse("start").is_err());
    }

    #[test]
    fn test_invalid_commands() {
        assert!(ConsoleCommand::parse("").is_err());
        assert!(ConsoleCommand::parse("   ").is_err());
        assert!(ConsoleCommand::parse("INVALID").is_err());
        assert!(ConsoleCommand::parse("get").is_err());
        assert!(ConsoleCommand::parse("get two keys").is_err());
        assert!(ConsoleCommand::parse("set key").is_err());
        assert!(ConsoleCommand::parse("set").is_err());
        assert!(ConsoleCommand::parse("leader now").is_err());
    }
}
