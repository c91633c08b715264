use std::sync::{Arc, Mutex, MutexGuard};
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use log::{debug, error, info, trace, warn};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ProcessorConfig;
use crate::error::Error;
use crate::fragment::{LossyUtf8, SseData, Usage};
use crate::request::ChatRequest;
use crate::session::{Flow, Session};
use crate::{ProcessorEvents, ProcessorState};

type SharedSession = Arc<Mutex<Session>>;

const TIMEOUT_REASON: &str = "request timeout";

fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session>
{   session.lock().unwrap_or_else(|e| e.into_inner())
}

/// Public stream processor handle - one per chat surface
pub struct StreamProcessor
{   config: Arc<ProcessorConfig>
  , http_client: reqwest::Client
  , session: SharedSession
}

impl StreamProcessor
{   /// Create a processor and the receiver for its events
    pub fn new(config: ProcessorConfig)
      -> (Self, ProcessorEvents)
    {   Self::with_client(config, reqwest::Client::new())
    }

    /// Same as `new`, reusing an existing HTTP client
    pub fn with_client(
      config: ProcessorConfig
    , http_client: reqwest::Client
    ) -> (Self, ProcessorEvents)
    {   debug!("Creating StreamProcessor for {}", config.url);
        let (events_tx, events_rx)
          = mpsc::unbounded_channel();
        let processor = StreamProcessor
        {   config: Arc::new(config)
          , http_client
          , session: Arc::new(Mutex::new(Session::new(events_tx)))
        };
        (processor, events_rx)
    }

    /// Start a streaming request - returns immediately.
    /// Must be called within a tokio runtime.
    pub fn send(&self, request: ChatRequest)
      -> Result<(), Error>
    {   let (cycle, token) = lock(&self.session).begin()
          .map_err(|e| {
            warn!("Rejected send: {}", e);
            e
          })?;
        debug!("send accepted, cycle {} model {}", cycle, request.model);

        let task = StreamTask
        {   session: Arc::clone(&self.session)
          , config: Arc::clone(&self.config)
          , http_client: self.http_client.clone()
          , cycle
          , token
        };
        tokio::spawn(async move {
          run_stream_loop(task, request).await
        });
        Ok(())
    }

    /// Abort the in-flight request, if any. Returns whether one was
    /// cancelled.
    pub fn cancel(&self, reason: Option<&str>) -> bool
    {   lock(&self.session).cancel(reason.map(str::to_string))
    }

    pub fn state(&self) -> ProcessorState
    {   lock(&self.session).state()
    }

    /// Primary-channel text received so far in this cycle
    pub fn response_text(&self) -> String
    {   lock(&self.session).response_text().to_string()
    }

    pub fn usage(&self) -> Option<Usage>
    {   lock(&self.session).usage().cloned()
    }
}

impl Drop for StreamProcessor
{   fn drop(&mut self)
    {   lock(&self.session).shutdown();
    }
}

/// Everything one cycle's task owns
struct StreamTask
{   session: SharedSession
  , config: Arc<ProcessorConfig>
  , http_client: reqwest::Client
  , cycle: u64
  , token: CancellationToken
}

impl StreamTask
{   /// Caller headers first; the fixed ones replace any duplicates
    fn build_request(&self, request: &ChatRequest)
      -> Result<reqwest::RequestBuilder, Error>
    {   let mut headers = HeaderMap::new();
        for (raw_name, raw_value) in &self.config.headers
        {   let name = HeaderName::from_bytes(raw_name.as_bytes())
              .map_err(|e| Error::InvalidConfiguration(
                format!("header name {}: {}", raw_name, e)
              ))?;
            let value = HeaderValue::from_str(raw_value)
              .map_err(|e| Error::InvalidConfiguration(
                format!("header {}: {}", raw_name, e)
              ))?;
            headers.insert(name, value);
        }
        if let Some(key) = &self.config.api_key
        {   let mut value = HeaderValue::from_str(&format!("Bearer {}", key))
              .map_err(|e| Error::InvalidConfiguration(
                format!("api key: {}", e)
              ))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));

        Ok(self.http_client
          .post(&self.config.url)
          .headers(headers)
          .json(request))
    }

    fn on_timeout(&self)
    {   if lock(&self.session).cancel_cycle(self.cycle, TIMEOUT_REASON)
        {   info!(
              "cycle {}: no response within {} ms",
              self.cycle, self.config.timeout_ms
            );
        }
    }

    /// Move to Error and schedule the return to Idle
    fn fail(&self, error: Error)
    {   let mut session = lock(&self.session);
        if !session.fail(self.cycle, &error)
        {   return;
        }
        error!("cycle {}: {}", self.cycle, error);

        let delay = self.config.error_reset_delay();
        let cycle = self.cycle;
        let shared = Arc::clone(&self.session);
        session.set_reset_task(tokio::spawn(async move {
          tokio::time::sleep(delay).await;
          lock(&shared).reset_to_idle(cycle);
        }));
    }
}

/// Drive one request cycle from connect to its terminal event.
///
/// Races the cancellation token and the timeout against the
/// connection, the error body of a non-2xx answer, and then each SSE
/// event. The timeout stays armed until the first fragment or sentinel
/// arrives. SSE framing errors stay fatal since the parser does not
/// advance past them.
async fn run_stream_loop(task: StreamTask, request: ChatRequest)
{   debug!("Starting stream loop for cycle {}", task.cycle);
    trace!("Request body: {:?}", request);

    let timeout = tokio::time::sleep(task.config.timeout());
    tokio::pin!(timeout);

    let pending = match task.build_request(&request)
    {   Ok(builder) => builder.send()
      , Err(e) => {
          task.fail(e);
          return;
        }
    };
    let response = tokio::select!
    { biased;
      _ = task.token.cancelled() => {
          debug!("cycle {} cancelled while connecting", task.cycle);
          return;
        }
    , _ = &mut timeout => {
          task.on_timeout();
          return;
        }
    , result = pending => result
    };

    let response = match response
    {   Ok(response) => response
      , Err(e) => {
          task.fail(Error::from(e));
          return;
        }
    };

    let status = response.status();
    trace!("Stream response status: {}", status);
    if !status.is_success()
    {   // the body read shares the cycle's deadline
        let body = tokio::select!
        { biased;
          _ = task.token.cancelled() => {
              debug!("cycle {} cancelled while reading error body", task.cycle);
              return;
            }
        , _ = &mut timeout => "Unknown error".to_string()
        , text = response.text() => {
              text.unwrap_or_else(|_| "Unknown error".to_string())
            }
        };
        task.fail(Error::Api
        {   status: status.as_u16()
          , body
        });
        return;
    }

    // invalid bytes reach the parser as U+FFFD and end up malformed
    let mut decoder = LossyUtf8::default();
    let events = response
      .bytes_stream()
      .map(move |chunk| chunk.map(|bytes| decoder.decode(&bytes)))
      .eventsource();
    tokio::pin!(events);
    let mut armed = true;

    loop
    { tokio::select!
      { biased;
        _ = task.token.cancelled() => {
            debug!("cycle {} cancelled mid-stream", task.cycle);
            return;
          }
      , _ = &mut timeout, if armed => {
            task.on_timeout();
            return;
          }
      , next = events.next() => {
            let event = match next
            {   Some(Ok(event)) => event
              , Some(Err(e)) => {
                  task.fail(Error::Stream(e.to_string()));
                  return;
                }
              , None => {
                  debug!("cycle {}: stream closed without terminal signal", task.cycle);
                  lock(&task.session).finish(task.cycle, None);
                  return;
                }
            };
            trace!("SSE data: {}", event.data);

            let flow = match SseData::parse(&event.data)
            {   SseData::Empty => Flow::Continue
              , SseData::Done => {
                  lock(&task.session).finish(task.cycle, None);
                  Flow::Stop
                }
              , SseData::Fragment(chunk) => {
                  armed = false;
                  lock(&task.session).on_fragment(task.cycle, *chunk)
                }
              , SseData::Malformed(reason) => {
                  warn!("cycle {}: discarding malformed fragment: {}", task.cycle, reason);
                  let over_cap = lock(&task.session).note_malformed(
                    task.cycle,
                    task.config.max_malformed_fragments
                  );
                  match over_cap
                  {   Some(e) => {
                        task.fail(e);
                        Flow::Stop
                      }
                    , None => Flow::Continue
                  }
                }
            };

            if flow == Flow::Stop
            {   return;
            }
          }
      }
    }
}
