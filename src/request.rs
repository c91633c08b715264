//! Chat completion request types

use serde::{Deserialize, Serialize};

/// Role tag of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role
{   System
  , User
  , Assistant
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage
{   pub role: Role
  , pub content: String
}

impl ChatMessage
{   pub fn system(content: impl Into<String>) -> Self
    {   ChatMessage { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self
    {   ChatMessage { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self
    {   ChatMessage { role: Role::Assistant, content: content.into() }
    }
}

/// Streaming chat completion request, posted as the JSON body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest
{   /// Target model name
    pub model: String
  , pub messages: Vec<ChatMessage>
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>
  , /// Nucleus sampling threshold
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>
  , pub stream: bool
  , /// Forward-compatible parameters merged into the body
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>
}

impl ChatRequest
{   /// Streaming request with no sampling overrides
    pub fn new(
      model: impl Into<String>
    , messages: Vec<ChatMessage>
    ) -> Self
    {   ChatRequest
        {   model: model.into()
          , messages
          , temperature: None
          , top_p: None
          , max_tokens: None
          , stream: true
          , extra: serde_json::Map::new()
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self
    {   self.temperature = Some(temperature);
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self
    {   self.top_p = Some(top_p);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self
    {   self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_extra(
      mut self
    , key: impl Into<String>
    , value: serde_json::Value
    ) -> Self
    {   self.extra.insert(key.into(), value);
        self
    }
}
