//! Chat turn types exchanged with the completion service.
//!
//! [`Chat`] is a closed set of roles. It serializes to the wire shape the completion service
//! expects (`{"role": ..., "content": ..., "function_call": ...}`) so that a streamed JSON
//! record can be merged delta-by-delta and converted back once the stream ends.

use serde::{Deserialize, Deserializer, Serialize};

/// One chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Chat {
    System {
        #[serde(default, deserialize_with = "null_as_empty")]
        content: String,
    },
    User {
        #[serde(default, deserialize_with = "null_as_empty")]
        content: String,
    },
    Assistant {
        #[serde(default, deserialize_with = "null_as_empty")]
        content: String,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "empty_call_as_none"
        )]
        function_call: Option<FunctionCall>,
    },
    Function {
        name: String,
        #[serde(default, deserialize_with = "null_as_empty")]
        content: String,
    },
}

/// A function invocation requested by the assistant.
///
/// `arguments` is kept as the raw JSON string because it arrives token by token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

/// Role discriminant, for matching without borrowing content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Function,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Function => "function",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Chat {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: content.into(),
            function_call: None,
        }
    }

    pub fn function(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Function {
            name: name.into(),
            content: content.into(),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Self::System { .. } => Role::System,
            Self::User { .. } => Role::User,
            Self::Assistant { .. } => Role::Assistant,
            Self::Function { .. } => Role::Function,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::System { content }
            | Self::User { content }
            | Self::Assistant { content, .. }
            | Self::Function { content, .. } => content,
        }
    }

    pub fn function_call(&self) -> Option<&FunctionCall> {
        match self {
            Self::Assistant { function_call, .. } => function_call.as_ref(),
            _ => None,
        }
    }

    /// The action this turn represents: the invoked function for assistant calls, the
    /// producing function for function results.
    pub fn action(&self) -> Option<&str> {
        match self {
            Self::Assistant {
                function_call: Some(call),
                ..
            } => Some(call.name.as_str()),
            Self::Function { name, .. } => Some(name.as_str()),
            _ => None,
        }
    }

    /// Same role (and function name), different content. Function calls are dropped.
    pub fn with_content(&self, content: impl Into<String>) -> Self {
        let content = content.into();
        match self {
            Self::System { .. } => Self::System { content },
            Self::User { .. } => Self::User { content },
            Self::Assistant { .. } => Self::Assistant {
                content,
                function_call: None,
            },
            Self::Function { name, .. } => Self::Function {
                name: name.clone(),
                content,
            },
        }
    }

    /// Plain-text rendering used when a turn is filed into memory as a document.
    pub fn render(&self) -> String {
        let mut text = format!("{}: {}", self.role(), self.content());
        if let Self::Function { name, .. } = self {
            text = format!("{} ({name}): {}", self.role(), self.content());
        }
        if let Some(call) = self.function_call() {
            text.push_str(&format!("\n-> {}({})", call.name, call.arguments));
        }
        text
    }
}

/// Schema of a function the completion service may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl FunctionSchema {
    /// Build a schema whose parameters are derived from a `JsonSchema` type.
    pub fn for_type<T: schemars::JsonSchema>(
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let parameters = serde_json::to_value(schemars::schema_for!(T))
            .unwrap_or_else(|_| serde_json::json!({"type": "object"}));
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

// Streams start with `"function_call": {}` or an empty name; neither is a real call.
fn empty_call_as_none<'de, D>(deserializer: D) -> Result<Option<FunctionCall>, D::Error>
where
    D: Deserializer<'de>,
{
    let call = Option::<FunctionCall>::deserialize(deserializer)?;
    Ok(call.filter(|c| !c.name.is_empty()))
}
