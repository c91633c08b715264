//! Decoded server-sent-event payloads

use serde::{Deserialize, Serialize};

/// Data payload marking the end of the stream
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage
{   pub prompt_tokens: u64
  , pub completion_tokens: u64
  , pub total_tokens: u64
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDelta
{   #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkChoice
{   pub index: u32
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<ChunkDelta>
  , #[serde(default)]
    pub finish_reason: Option<String>
}

/// One `data:` payload of a chat completion stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatCompletionChunk
{   #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<u64>
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>
  , pub choices: Vec<ChunkChoice>
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>
}

impl ChatCompletionChunk
{   fn first_delta(&self) -> Option<&ChunkDelta>
    {   self.choices.first().and_then(|c| c.delta.as_ref())
    }

    /// Primary-channel text, if non-empty
    pub fn content(&self) -> Option<&str>
    {   self.first_delta()
          .and_then(|d| d.content.as_deref())
          .filter(|s| !s.is_empty())
    }

    /// Reasoning-channel text, if non-empty
    pub fn reasoning(&self) -> Option<&str>
    {   self.first_delta()
          .and_then(|d| d.reasoning_content.as_deref())
          .filter(|s| !s.is_empty())
    }

    pub fn role(&self) -> Option<&str>
    {   self.first_delta().and_then(|d| d.role.as_deref())
    }

    pub fn finish_reason(&self) -> Option<&str>
    {   self.choices.first()
          .and_then(|c| c.finish_reason.as_deref())
    }
}

/// Classification of one raw SSE data payload
#[derive(Debug, Clone, PartialEq)]
pub enum SseData
{   /// The `[DONE]` sentinel
    Done
  , /// Empty data, e.g. a keep-alive
    Empty
  , Fragment(Box<ChatCompletionChunk>)
  , /// Payload that failed to decode
    Malformed(String)
}

impl SseData
{   pub fn parse(data: &str) -> Self
    {   let data = data.trim();
        if data.is_empty()
        {   return SseData::Empty;
        }
        if data == DONE_SENTINEL
        {   return SseData::Done;
        }
        match serde_json::from_str::<ChatCompletionChunk>(data)
        {   Ok(chunk) => SseData::Fragment(Box::new(chunk))
          , Err(e) => SseData::Malformed(e.to_string())
        }
    }
}

/// Incremental UTF-8 decoder for the raw body. Invalid sequences
/// become U+FFFD; a sequence split across chunks is held until its
/// remaining bytes arrive.
#[derive(Debug, Default)]
pub struct LossyUtf8
{   pending: Vec<u8>
}

impl LossyUtf8
{   pub fn decode(&mut self, bytes: &[u8]) -> String
    {   self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop
        {   match std::str::from_utf8(rest)
            {   Ok(valid) => {
                  out.push_str(valid);
                  rest = &[];
                  break;
                }
              , Err(e) => {
                  let (valid, after) = rest.split_at(e.valid_up_to());
                  // checked by from_utf8 above
                  out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                  match e.error_len()
                  {   Some(len) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        rest = &after[len..];
                      }
                    , None => {
                        rest = after;
                        break;
                      }
                  }
                }
            }
        }
        self.pending = rest.to_vec();
        out
    }
}
