/// Custom error type for streamchat operations
/// Implements Clone for sending through channels
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error
{   /// `send` was called while a request is still in flight
    #[error("A request is already in flight (state: {state:?})")]
    RequestInFlight
    {   state: crate::ProcessorState
    }
  , /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(String)
  , /// Server answered the stream open with a non-2xx status
    #[error("API error {status}: {body}")]
    Api
    {   status: u16
      , body: String
    }
  , /// Stream failed mid-flight or SSE framing was invalid
    #[error("Stream error: {0}")]
    Stream(String)
  , /// Too many undecodable fragments in one cycle
    #[error("Too many malformed fragments: {0}")]
    TooManyMalformed(usize)
  , /// Failed to parse configuration or payload
    #[error("Parse error: {0}")]
    Parse(String)
  , /// Failed to read configuration from disk
    #[error("IO error: {0}")]
    Io(String)
  , /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String)
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<reqwest::Error> for Error
{   fn from(e: reqwest::Error) -> Self
    {   Error::Http(e.to_string())
    }
}

impl From<serde_json::Error> for Error
{   fn from(e: serde_json::Error) -> Self
    {   Error::Parse(e.to_string())
    }
}

impl From<std::io::Error> for Error
{   fn from(e: std::io::Error) -> Self
    {   Error::Io(e.to_string())
    }
}
