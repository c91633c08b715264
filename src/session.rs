//! Per-instance session record and its state machine
//!
//! Every transition and every event is produced here while the caller
//! holds the session lock. A cycle number tags each `send`, so work left
//! over from an earlier cycle cannot touch a later one.

use log::{debug, info, trace};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::fragment::{ChatCompletionChunk, Usage};
use crate::{DeltaEvent, FinishEvent, ProcessorEvent, ProcessorEventSender, ProcessorState};

const DEFAULT_ROLE: &str = "assistant";

/// Whether the stream task should keep reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow
{   Continue
  , Stop
}

pub struct Session
{   state: ProcessorState
  , cycle: u64
  , response_text: String
  , usage: Option<Usage>
  , cancel_token: Option<CancellationToken>
  , reset_task: Option<JoinHandle<()>>
  , started: bool
  , malformed: usize
  , events: ProcessorEventSender
}

impl Session
{   pub fn new(events: ProcessorEventSender) -> Self
    {   Session
        {   state: ProcessorState::Idle
          , cycle: 0
          , response_text: String::new()
          , usage: None
          , cancel_token: None
          , reset_task: None
          , started: false
          , malformed: 0
          , events
        }
    }

    pub fn state(&self) -> ProcessorState
    {   self.state
    }

    pub fn response_text(&self) -> &str
    {   &self.response_text
    }

    pub fn usage(&self) -> Option<&Usage>
    {   self.usage.as_ref()
    }

    pub fn cycle(&self) -> u64
    {   self.cycle
    }

    fn emit(&self, event: ProcessorEvent)
    {   // receiver may be gone; the session keeps running regardless
        let _ = self.events.send(event);
    }

    fn transition(&mut self, to: ProcessorState)
    {   let from = self.state;
        debug!("cycle {}: {:?} -> {:?}", self.cycle, from, to);
        self.state = to;
        self.emit(ProcessorEvent::StateChange { from, to });
    }

    fn is_current(&self, cycle: u64) -> bool
    {   self.cycle == cycle && self.state.is_in_flight()
    }

    /// Start a new cycle. Fails without touching anything if a request
    /// is still in flight.
    pub fn begin(&mut self)
      -> Result<(u64, CancellationToken), Error>
    {   if !self.state.accepts_send()
        {   return Err(Error::RequestInFlight { state: self.state });
        }
        if let Some(reset) = self.reset_task.take()
        {   trace!("Aborting pending error reset");
            reset.abort();
        }
        self.cycle += 1;
        self.response_text.clear();
        self.usage = None;
        self.started = false;
        self.malformed = 0;
        let token = CancellationToken::new();
        self.cancel_token = Some(token.clone());
        self.transition(ProcessorState::Connecting);
        Ok((self.cycle, token))
    }

    /// Apply one decoded fragment
    pub fn on_fragment(
      &mut self
    , cycle: u64
    , chunk: ChatCompletionChunk
    ) -> Flow
    {   if !self.is_current(cycle)
        {   trace!("Dropping fragment for stale cycle {}", cycle);
            return Flow::Stop;
        }

        if !self.started
        {   self.started = true;
            self.transition(ProcessorState::Connected);
            self.transition(ProcessorState::Responding);
            self.emit(ProcessorEvent::Start);
        }

        if let Some(usage) = &chunk.usage
        {   self.usage = Some(usage.clone());
        }

        let role = chunk.role().unwrap_or(DEFAULT_ROLE).to_string();
        if let Some(content) = chunk.content()
        {   self.response_text.push_str(content);
            self.emit(ProcessorEvent::Delta(DeltaEvent
            {   content: content.to_string()
              , role: role.clone()
              , is_reasoning: false
              , fragment: chunk.clone()
            }));
        }
        if let Some(reasoning) = chunk.reasoning()
        {   self.emit(ProcessorEvent::Delta(DeltaEvent
            {   content: reasoning.to_string()
              , role
              , is_reasoning: true
              , fragment: chunk.clone()
            }));
        }

        match chunk.finish_reason()
        {   Some(reason) => {
              let reason = reason.to_string();
              self.finish(cycle, Some(reason));
              Flow::Stop
            }
          , None => Flow::Continue
        }
    }

    /// Count an undecodable fragment; past `cap` the cycle fails
    pub fn note_malformed(
      &mut self
    , cycle: u64
    , cap: Option<usize>
    ) -> Option<Error>
    {   if !self.is_current(cycle)
        {   return None;
        }
        self.malformed += 1;
        match cap
        {   Some(max) if self.malformed > max => {
              Some(Error::TooManyMalformed(self.malformed))
            }
          , _ => None
        }
    }

    /// Normal completion: sentinel, finish reason, or plain close
    pub fn finish(&mut self, cycle: u64, reason: Option<String>) -> bool
    {   if !self.is_current(cycle)
        {   return false;
        }
        self.cancel_token = None;
        self.transition(ProcessorState::Finished);
        self.emit(ProcessorEvent::Finish(FinishEvent
        {   reason
          , usage: self.usage.clone()
          , cancelled: false
        }));
        true
    }

    /// Abort whatever is in flight
    pub fn cancel(&mut self, reason: Option<String>) -> bool
    {   if !self.state.is_in_flight()
        {   return false;
        }
        info!("cycle {}: cancelled ({:?})", self.cycle, reason);
        if let Some(token) = self.cancel_token.take()
        {   token.cancel();
        }
        self.transition(ProcessorState::Cancelled);
        self.emit(ProcessorEvent::Finish(FinishEvent
        {   reason
          , usage: self.usage.clone()
          , cancelled: true
        }));
        true
    }

    /// Cancel only if `cycle` is still the one in flight
    pub fn cancel_cycle(&mut self, cycle: u64, reason: &str) -> bool
    {   if !self.is_current(cycle)
        {   return false;
        }
        self.cancel(Some(reason.to_string()))
    }

    /// Transport failure. Returns false when suppressed because the
    /// cycle already ended (e.g. the caller cancelled it).
    pub fn fail(&mut self, cycle: u64, error: &Error) -> bool
    {   if !self.is_current(cycle)
        {   debug!("Suppressing error for ended cycle {}: {}", cycle, error);
            return false;
        }
        if let Some(token) = self.cancel_token.take()
        {   token.cancel();
        }
        self.transition(ProcessorState::Error);
        self.emit(ProcessorEvent::Error { message: error.to_string() });
        true
    }

    pub fn set_reset_task(&mut self, task: JoinHandle<()>)
    {   if let Some(old) = self.reset_task.replace(task)
        {   old.abort();
        }
    }

    /// Scheduled return to idle after an error
    pub fn reset_to_idle(&mut self, cycle: u64)
    {   if self.cycle != cycle || self.state != ProcessorState::Error
        {   return;
        }
        self.reset_task = None;
        self.transition(ProcessorState::Idle);
    }

    /// Stop any in-flight work without emitting events
    pub fn shutdown(&mut self)
    {   if let Some(token) = self.cancel_token.take()
        {   token.cancel();
        }
        if let Some(reset) = self.reset_task.take()
        {   reset.abort();
        }
    }
}

#[cfg(test)]
mod tests
{   use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn chunk(value: serde_json::Value) -> ChatCompletionChunk
    {   serde_json::from_value(value).unwrap()
    }

    fn content(text: &str) -> ChatCompletionChunk
    {   chunk(json!({"choices": [{"index": 0, "delta": {"content": text}}]}))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ProcessorEvent>)
      -> Vec<ProcessorEvent>
    {   let mut out = vec![];
        while let Ok(event) = rx.try_recv()
        {   out.push(event);
        }
        out
    }

    fn without_state_changes(events: Vec<ProcessorEvent>) -> Vec<ProcessorEvent>
    {   events
          .into_iter()
          .filter(|e| !matches!(e, ProcessorEvent::StateChange { .. }))
          .collect()
    }

    fn terminal_count(events: &[ProcessorEvent]) -> usize
    {   events.iter().filter(|e| e.is_terminal()).count()
    }

    #[test]
    fn send_is_accepted_only_outside_a_cycle()
    {   use ProcessorState::*;
        for state in [Idle, Finished, Error, Cancelled]
        {   assert!(state.accepts_send(), "{:?}", state);
        }
        for state in [Connecting, Connected, Responding]
        {   assert!(!state.accepts_send(), "{:?}", state);
        }
    }

    #[test]
    fn begin_moves_to_connecting()
    {   let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new(tx);
        let (cycle, token) = session.begin().unwrap();
        assert_eq!(cycle, 1);
        assert!(!token.is_cancelled());
        assert_eq!(session.state(), ProcessorState::Connecting);
        assert_eq!(drain(&mut rx), vec![ProcessorEvent::StateChange
        {   from: ProcessorState::Idle
          , to: ProcessorState::Connecting
        }]);
    }

    #[test]
    fn reentrant_begin_is_rejected_without_mutation()
    {   let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new(tx);
        let (cycle, _token) = session.begin().unwrap();
        session.on_fragment(cycle, content("partial"));
        drain(&mut rx);

        let err = session.begin().unwrap_err();
        assert_eq!(err, Error::RequestInFlight { state: ProcessorState::Responding });
        assert_eq!(session.cycle(), cycle);
        assert_eq!(session.response_text(), "partial");
        assert_eq!(session.state(), ProcessorState::Responding);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn first_fragment_connects_and_starts_once()
    {   let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new(tx);
        let (cycle, _token) = session.begin().unwrap();
        drain(&mut rx);

        session.on_fragment(cycle, content("a"));
        session.on_fragment(cycle, content("b"));
        let events = drain(&mut rx);
        assert_eq!(events[0], ProcessorEvent::StateChange
        {   from: ProcessorState::Connecting
          , to: ProcessorState::Connected
        });
        assert_eq!(events[1], ProcessorEvent::StateChange
        {   from: ProcessorState::Connected
          , to: ProcessorState::Responding
        });
        assert_eq!(events[2], ProcessorEvent::Start);
        let starts = events.iter().filter(|e| **e == ProcessorEvent::Start).count();
        assert_eq!(starts, 1);
        assert_eq!(session.response_text(), "ab");
    }

    #[test]
    fn reasoning_is_flagged_and_not_accumulated()
    {   let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new(tx);
        let (cycle, _token) = session.begin().unwrap();
        session.on_fragment(cycle, chunk(json!({
          "choices": [{"index": 0, "delta": {"content": "x", "reasoning_content": "think"}}]
        })));

        let deltas: Vec<DeltaEvent> = drain(&mut rx)
          .into_iter()
          .filter_map(|e| match e
          {   ProcessorEvent::Delta(d) => Some(d)
            , _ => None
          })
          .collect();
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].content, "x");
        assert!(!deltas[0].is_reasoning);
        assert_eq!(deltas[0].role, "assistant");
        assert_eq!(deltas[1].content, "think");
        assert!(deltas[1].is_reasoning);
        assert_eq!(session.response_text(), "x");
    }

    #[test]
    fn finish_reason_ends_cycle_with_latched_usage()
    {   let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new(tx);
        let (cycle, token) = session.begin().unwrap();
        session.on_fragment(cycle, chunk(json!({
          "choices": [{"index": 0, "delta": {"content": "Hel"}}],
          "usage": {"prompt_tokens": 5, "completion_tokens": 1, "total_tokens": 6}
        })));
        let flow = session.on_fragment(cycle, chunk(json!({
          "choices": [{"index": 0, "delta": {"content": "lo"}, "finish_reason": "stop"}]
        })));

        assert_eq!(flow, Flow::Stop);
        assert!(!token.is_cancelled());
        assert_eq!(session.state(), ProcessorState::Finished);
        let events = without_state_changes(drain(&mut rx));
        assert_eq!(terminal_count(&events), 1);
        assert_eq!(events.last(), Some(&ProcessorEvent::Finish(FinishEvent
        {   reason: Some("stop".to_string())
          , usage: Some(Usage
            {   prompt_tokens: 5
              , completion_tokens: 1
              , total_tokens: 6
            })
          , cancelled: false
        })));
        assert_eq!(session.response_text(), "Hello");
    }

    #[test]
    fn only_one_terminal_event_per_cycle()
    {   let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new(tx);
        let (cycle, _token) = session.begin().unwrap();
        assert!(session.finish(cycle, None));
        assert!(!session.finish(cycle, None));
        assert!(!session.cancel(Some("late".to_string())));
        assert!(!session.fail(cycle, &Error::Stream("late".to_string())));
        assert_eq!(session.on_fragment(cycle, content("late")), Flow::Stop);
        assert_eq!(terminal_count(&drain(&mut rx)), 1);
        assert_eq!(session.response_text(), "");
    }

    #[test]
    fn cancel_fires_token_and_finish()
    {   let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new(tx);
        let (cycle, token) = session.begin().unwrap();
        session.on_fragment(cycle, content("one"));
        drain(&mut rx);

        assert!(session.cancel(Some("user stop".to_string())));
        assert!(token.is_cancelled());
        assert_eq!(session.state(), ProcessorState::Cancelled);
        let events = without_state_changes(drain(&mut rx));
        assert_eq!(events, vec![ProcessorEvent::Finish(FinishEvent
        {   reason: Some("user stop".to_string())
          , usage: None
          , cancelled: true
        })]);

        // errors surfacing from the abort are swallowed
        assert!(!session.fail(cycle, &Error::Stream("aborted".to_string())));
        assert_eq!(session.on_fragment(cycle, content("two")), Flow::Stop);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(session.response_text(), "one");
    }

    #[test]
    fn cancel_when_idle_is_noop()
    {   let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new(tx);
        assert!(!session.cancel(None));
        assert_eq!(session.state(), ProcessorState::Idle);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn stale_cycle_cannot_touch_new_one()
    {   let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new(tx);
        let (old, _) = session.begin().unwrap();
        session.cancel(None);
        let (new, _) = session.begin().unwrap();
        drain(&mut rx);

        assert_eq!(session.on_fragment(old, content("stale")), Flow::Stop);
        assert!(!session.cancel_cycle(old, "request timeout"));
        assert!(!session.fail(old, &Error::Http("stale".to_string())));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(session.state(), ProcessorState::Connecting);

        session.on_fragment(new, content("fresh"));
        assert_eq!(session.response_text(), "fresh");
    }

    #[test]
    fn error_then_reset_to_idle()
    {   let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new(tx);
        let (cycle, token) = session.begin().unwrap();
        assert!(session.fail(cycle, &Error::Api { status: 500, body: "boom".to_string() }));
        assert!(token.is_cancelled());
        assert_eq!(session.state(), ProcessorState::Error);

        session.reset_to_idle(cycle);
        assert_eq!(session.state(), ProcessorState::Idle);
        let events = drain(&mut rx);
        assert!(events.contains(&ProcessorEvent::Error
        {   message: "API error 500: boom".to_string()
        }));
        assert_eq!(events.last(), Some(&ProcessorEvent::StateChange
        {   from: ProcessorState::Error
          , to: ProcessorState::Idle
        }));
    }

    #[test]
    fn stale_reset_does_not_interrupt_new_cycle()
    {   let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = Session::new(tx);
        let (cycle, _) = session.begin().unwrap();
        session.fail(cycle, &Error::Http("refused".to_string()));
        session.begin().unwrap();
        session.reset_to_idle(cycle);
        assert_eq!(session.state(), ProcessorState::Connecting);
    }

    #[test]
    fn malformed_cap()
    {   let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = Session::new(tx);
        let (cycle, _) = session.begin().unwrap();
        assert!(session.note_malformed(cycle, None).is_none());
        assert!(session.note_malformed(cycle, Some(2)).is_none());
        assert_eq!(
          session.note_malformed(cycle, Some(2)),
          Some(Error::TooManyMalformed(3))
        );
        assert_eq!(session.state(), ProcessorState::Connecting);
    }

    #[test]
    fn begin_resets_text_and_usage()
    {   let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = Session::new(tx);
        let (cycle, _) = session.begin().unwrap();
        session.on_fragment(cycle, chunk(json!({
          "choices": [{"index": 0, "delta": {"content": "old"}, "finish_reason": "length"}],
          "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
        })));
        assert!(session.usage().is_some());

        session.begin().unwrap();
        assert_eq!(session.response_text(), "");
        assert!(session.usage().is_none());
    }
}
