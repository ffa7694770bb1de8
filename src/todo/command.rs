//! Commands carried in request payloads.
//!
//! Wire form is internally tagged by `op`:
//! ```text
//! {"op":"list"}
//! {"op":"get","id":"…"}
//! {"op":"create","todo":{"text":"…","done":false}}
//! {"op":"update","patch":{"id":"…","done":true}}
//! {"op":"delete","id":"…"}
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::todo::model::{NewTodo, TodoPatch};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    List,
    Get { id: String },
    Create { todo: NewTodo },
    Update { patch: TodoPatch },
    Delete { id: String },
}

impl Command {
    pub fn operation(&self) -> Operation {
        match self {
            Command::List => Operation::List,
            Command::Get { .. } => Operation::Get,
            Command::Create { .. } => Operation::Create,
            Command::Update { .. } => Operation::Update,
            Command::Delete { .. } => Operation::Delete,
        }
    }
}

/// Command kind without its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    List,
    Get,
    Create,
    Update,
    Delete,
}

impl Operation {
    pub const ALL: [Operation; 5] = [
        Operation::List,
        Operation::Get,
        Operation::Create,
        Operation::Update,
        Operation::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::List => "list",
            Operation::Get => "get",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| format!("unknown operation `{s}`"))
    }
}
