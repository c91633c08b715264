pub mod error;
pub mod config;
pub mod request;
pub mod fragment;
pub mod session;
pub mod processor;

pub use config::ProcessorConfig;
pub use error::{Error, Result};
pub use fragment::{ChatCompletionChunk, Usage};
pub use processor::StreamProcessor;
pub use request::{ChatMessage, ChatRequest, Role};

/*

streamchat: client side of a streaming chat completion against an
OpenAI-compatible gateway. One processor per chat surface; each send
opens a text/event-stream, decodes token deltas, and reports a typed
event sequence that always ends in exactly one Finish or Error.

streamchat/
├── src/
│   ├── lib.rs          # States, events, re-exports
│   ├── error.rs        # Error type
│   ├── config.rs       # Processor configuration
│   ├── request.rs      # Chat request body
│   ├── fragment.rs     # Decoded SSE payloads
│   ├── session.rs      # Per-instance state machine
│   └── processor.rs    # HTTP + SSE task, public handle
└── tests/              # Integration tests against a mock server

*/

/// STREAMCHAT API INTERFACE:

// ===== Events =====

pub type ProcessorEvents
  = tokio::sync::mpsc::UnboundedReceiver<ProcessorEvent>;
pub type ProcessorEventSender
  = tokio::sync::mpsc::UnboundedSender<ProcessorEvent>;

/// Everything a processor reports, in emission order
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorEvent
{   StateChange
    {   from: ProcessorState
      , to: ProcessorState
    }
  , /// First fragment of the cycle arrived
    Start
  , Delta(DeltaEvent)
  , Finish(FinishEvent)
  , Error
    {   message: String
    }
}

impl ProcessorEvent
{   /// Finish or Error
    pub fn is_terminal(&self) -> bool
    {   matches!(self, ProcessorEvent::Finish(_) | ProcessorEvent::Error { .. })
    }
}

/// One incremental piece of generated text
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaEvent
{   pub content: String
  , /// Role tag, "assistant" when the fragment has none
    pub role: String
  , /// Secondary (chain-of-thought) channel
    pub is_reasoning: bool
  , pub fragment: ChatCompletionChunk
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinishEvent
{   /// Finish reason from the stream, or the cancel reason
    pub reason: Option<String>
  , /// Last usage summary seen during the cycle
    pub usage: Option<Usage>
  , pub cancelled: bool
}

/// STREAMCHAT STRUCTURES:

/// Lifecycle of a processor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ProcessorState
{   #[default]
    Idle
  , Connecting
  , Connected
  , Responding
  , Finished
  , Error
  , Cancelled
}

impl ProcessorState
{   /// A request is connecting or streaming
    pub fn is_in_flight(self) -> bool
    {   matches!(
          self,
          ProcessorState::Connecting
            | ProcessorState::Connected
            | ProcessorState::Responding
        )
    }

    pub fn is_terminal(self) -> bool
    {   matches!(
          self,
          ProcessorState::Finished
            | ProcessorState::Error
            | ProcessorState::Cancelled
        )
    }

    /// `send` is accepted from here
    pub fn accepts_send(self) -> bool
    {   self == ProcessorState::Idle || self.is_terminal()
    }
}
