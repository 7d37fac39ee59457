//! # Session Relay
//!
//! One relay task per connection. It owns the [`Session`] and processes
//! everything for that session strictly in order: inbound frames, pipeline
//! calls and outbound audio never overlap, which is what guarantees at most
//! one in-flight `transcribe`/`respond`/`synthesize` call per session.
//!
//! ## Channels:
//! - **inbound** (`mpsc::Receiver<Inbound>`): decoded frames from the socket
//!   actor, in receipt order.
//! - **outbound** (`mpsc::Sender<Outbound>`): frames for the socket actor to
//!   encode and send. Bounded, so a slow client applies backpressure.
//!
//! ## While a pipeline call is in flight:
//! - `stop` or `error` from the client cancels the call (the future is
//!   dropped, releasing the provider) and resets the session to `Idle`.
//! - A malformed frame cancels the call the same way and is reported to the
//!   client with `control(error)`.
//! - Any other frame is deferred and replayed in receipt order afterwards.
//! - Connection close or shutdown cancels the call and ends the task.
//!
//! ## Outbound protocol for one spoken reply:
//! ```text
//! text(reply) → control(start) → binary(batch)… → control(stop)
//! ```
//! Failures of any pipeline step send `control(error)` and return to `Idle`;
//! the connection stays open.

use crate::codec::{ControlKind, DecodeError, Frame};
use crate::pipeline::silence::SilenceDetector;
use crate::pipeline::{AudioStream, PipelineError, SpeechPipeline};
use crate::session::machine::Event;
use crate::session::registry::{SessionRegistry, SessionTicket};
use crate::session::{Session, SessionSettings, Speaker};
use crate::state::SessionCounters;
use actix_web::web::Bytes;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A decoded inbound frame, or the decode failure to report.
pub type Inbound = Result<Frame, DecodeError>;

/// Instructions for the socket actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(Frame),
    /// Close the connection with this reason
    Close(String),
}

/// Why a relay task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// The inbound channel closed (client went away)
    Disconnected,
    /// Cancelled by shutdown or by the socket actor stopping
    Cancelled,
    /// No inbound traffic for the idle timeout
    IdleTimeout,
    /// The outbound channel closed mid-conversation
    ClientGone,
}

impl RelayExit {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayExit::Disconnected => "disconnected",
            RelayExit::Cancelled => "cancelled",
            RelayExit::IdleTimeout => "idle_timeout",
            RelayExit::ClientGone => "client_gone",
        }
    }
}

enum Flow {
    Continue,
    Exit(RelayExit),
}

/// Outcome of a pipeline call raced against the session's other inputs.
enum Guarded<T> {
    Done(T),
    /// Cancelled by this inbound message
    Interrupted(Inbound),
    Exit(RelayExit),
}

/// Parked timer target used when no batch is pending.
const NO_DEADLINE: Duration = Duration::from_secs(24 * 60 * 60);

pub struct SessionRelay {
    session: Session,
    pipeline: Arc<SpeechPipeline>,
    registry: Arc<SessionRegistry>,
    counters: Arc<SessionCounters>,
    silence: SilenceDetector,
    inbound: mpsc::Receiver<Inbound>,
    outbound: mpsc::Sender<Outbound>,
    deferred: VecDeque<Inbound>,
}

impl SessionRelay {
    pub fn new(
        ticket: SessionTicket,
        settings: &SessionSettings,
        pipeline: Arc<SpeechPipeline>,
        registry: Arc<SessionRegistry>,
        counters: Arc<SessionCounters>,
        inbound: mpsc::Receiver<Inbound>,
        outbound: mpsc::Sender<Outbound>,
    ) -> Self {
        let silence = pipeline.silence_detector(settings.format);
        Self {
            session: Session::new(ticket, settings),
            pipeline,
            registry,
            counters,
            silence,
            inbound,
            outbound,
            deferred: VecDeque::new(),
        }
    }

    /// Drive the session until the connection ends. Unregisters the session
    /// before returning.
    pub async fn run(mut self) -> RelayExit {
        info!(session_id = %self.session.id, "Session relay started");

        let exit = loop {
            let next = match self.deferred.pop_front() {
                Some(frame) => frame,
                None => match self.wait_inbound().await {
                    Ok(frame) => frame,
                    Err(exit) => break exit,
                },
            };

            if let Flow::Exit(exit) = self.handle(next).await {
                break exit;
            }
        };

        self.session.output.clear();
        self.session.apply(Event::Disconnect);
        if exit == RelayExit::IdleTimeout {
            let _ = self.outbound.send(Outbound::Close("idle timeout".to_string())).await;
        }

        self.registry.unregister(&self.session.id);
        self.counters.session_closed();
        info!(
            session_id = %self.session.id,
            exit = exit.as_str(),
            turns = self.session.transcript.len(),
            transitions = self.session.transitions(),
            dropped_input_bytes = self.session.input.dropped_bytes(),
            "Session relay finished"
        );
        exit
    }

    async fn wait_inbound(&mut self) -> Result<Inbound, RelayExit> {
        let idle_deadline = self.session.idle_deadline();
        tokio::select! {
            biased;
            _ = self.session.cancel.cancelled() => Err(RelayExit::Cancelled),
            message = self.inbound.recv() => message.ok_or(RelayExit::Disconnected),
            _ = tokio::time::sleep_until(idle_deadline) => Err(RelayExit::IdleTimeout),
        }
    }

    async fn handle(&mut self, inbound: Inbound) -> Flow {
        self.session.touch();

        let frame = match inbound {
            Ok(frame) => frame,
            Err(err) => return self.malformed(err).await,
        };

        match frame {
            Frame::AudioChunk(chunk) => self.on_audio(chunk).await,
            Frame::TextMessage(text) => self.on_chat(text).await,
            Frame::Control(ControlKind::Start) => {
                self.session.apply(Event::Start);
                Flow::Continue
            }
            Frame::Control(ControlKind::Stop) => {
                if self.session.apply(Event::Stop).is_ignored() {
                    return Flow::Continue;
                }
                self.complete_utterance().await
            }
            Frame::Control(ControlKind::Error) => {
                self.session.apply(Event::Error);
                self.silence.reset();
                Flow::Continue
            }
        }
    }

    async fn on_audio(&mut self, chunk: Bytes) -> Flow {
        if self.session.apply(Event::Audio).is_ignored() {
            return Flow::Continue;
        }

        self.counters.audio_in(chunk.len());
        let dropped = self.session.input.append(&chunk);
        if dropped > 0 {
            debug!(session_id = %self.session.id, dropped, "Utterance exceeds buffer, dropping oldest audio");
        }

        if self.silence.observe(&chunk) {
            self.session.apply(Event::UtteranceBoundary);
            return self.complete_utterance().await;
        }
        Flow::Continue
    }

    async fn on_chat(&mut self, text: String) -> Flow {
        let text = text.trim();
        if text.is_empty() {
            return Flow::Continue;
        }
        if self.session.apply(Event::ChatText).is_ignored() {
            return Flow::Continue;
        }

        self.session.transcript.push(Speaker::User, text);
        self.respond_and_speak().await
    }

    /// Transcribing: send the buffered utterance to speech-to-text.
    async fn complete_utterance(&mut self) -> Flow {
        let audio = self.session.input.take();
        self.silence.reset();
        debug!(session_id = %self.session.id, bytes = audio.len(), "Utterance complete");

        let pipeline = self.pipeline.clone();
        match self.guarded(async move { pipeline.transcribe(audio).await }).await {
            Guarded::Exit(exit) => Flow::Exit(exit),
            Guarded::Interrupted(message) => self.interrupted(message).await,
            Guarded::Done(Err(err)) => {
                self.report(&err, "transcribe");
                self.fail(Event::TranscriptFailed).await
            }
            Guarded::Done(Ok(text)) => {
                self.session.apply(Event::TranscriptReady);
                self.session.transcript.push(Speaker::User, text);
                self.respond_and_speak().await
            }
        }
    }

    /// Thinking: get the reply text, send it, then open the synthesis stream.
    async fn respond_and_speak(&mut self) -> Flow {
        let pipeline = self.pipeline.clone();
        let turns = self.session.transcript.turns().to_vec();
        let reply = match self.guarded(async move { pipeline.respond(&turns).await }).await {
            Guarded::Exit(exit) => return Flow::Exit(exit),
            Guarded::Interrupted(message) => return self.interrupted(message).await,
            Guarded::Done(Err(err)) => {
                self.report(&err, "respond");
                return self.fail(Event::Error).await;
            }
            Guarded::Done(Ok(reply)) => reply,
        };

        self.session.transcript.push(Speaker::Agent, reply.clone());
        if !self.emit(Frame::TextMessage(reply.clone())).await {
            return Flow::Exit(RelayExit::ClientGone);
        }

        let pipeline = self.pipeline.clone();
        let stream = match self.guarded(async move { pipeline.synthesize(&reply).await }).await {
            Guarded::Exit(exit) => return Flow::Exit(exit),
            Guarded::Interrupted(message) => return self.interrupted(message).await,
            Guarded::Done(Err(err)) => {
                self.report(&err, "synthesize");
                return self.fail(Event::Error).await;
            }
            Guarded::Done(Ok(stream)) => stream,
        };

        self.speak(stream).await
    }

    /// Speaking: forward synthesized audio in debounced batches.
    async fn speak(&mut self, mut stream: AudioStream) -> Flow {
        let mut speaking = false;
        let mut ended = false;

        loop {
            if ended && self.session.output.is_empty() {
                return self.finish_speaking(speaking).await;
            }

            let deadline = self.session.output.deadline();
            let flush_at = deadline.unwrap_or_else(|| Instant::now() + NO_DEADLINE);

            tokio::select! {
                biased;
                _ = self.session.cancel.cancelled() => return Flow::Exit(RelayExit::Cancelled),
                _ = tokio::time::sleep_until(flush_at), if deadline.is_some() => {
                    if !self.flush().await {
                        return Flow::Exit(RelayExit::ClientGone);
                    }
                }
                item = stream.next(), if !ended => match item {
                    Some(Ok(chunk)) => {
                        if chunk.is_empty() {
                            continue;
                        }
                        if !speaking {
                            speaking = true;
                            self.session.apply(Event::FirstAudio);
                            if !self.emit(Frame::Control(ControlKind::Start)).await {
                                return Flow::Exit(RelayExit::ClientGone);
                            }
                        }
                        self.session.output.push(chunk, Instant::now());
                    }
                    Some(Err(err)) => {
                        // Deliver what already arrived before reporting
                        if !self.flush().await {
                            return Flow::Exit(RelayExit::ClientGone);
                        }
                        self.report(&err, "synthesize");
                        return self.fail(Event::Error).await;
                    }
                    None => ended = true,
                },
                message = self.inbound.recv() => match message {
                    None => return Flow::Exit(RelayExit::Disconnected),
                    Some(message) => {
                        self.session.touch();
                        if is_interrupt(&message) {
                            self.session.output.clear();
                            if let Err(err) = message {
                                return self.malformed(err).await;
                            }
                            self.session.apply(Event::Cancel);
                            if speaking && !self.emit(Frame::Control(ControlKind::Stop)).await {
                                return Flow::Exit(RelayExit::ClientGone);
                            }
                            return Flow::Continue;
                        }
                        self.deferred.push_back(message);
                    }
                },
            }
        }
    }

    async fn finish_speaking(&mut self, spoke: bool) -> Flow {
        if !spoke {
            let err = PipelineError::Rejected("synthesis produced no audio".to_string());
            self.report(&err, "synthesize");
            return self.fail(Event::Error).await;
        }

        self.session.apply(Event::SynthesisEnded);
        if self.emit(Frame::Control(ControlKind::Stop)).await {
            Flow::Continue
        } else {
            Flow::Exit(RelayExit::ClientGone)
        }
    }

    /// Await a pipeline call while still watching the connection.
    async fn guarded<T>(&mut self, call: impl Future<Output = T>) -> Guarded<T> {
        tokio::pin!(call);
        loop {
            tokio::select! {
                biased;
                _ = self.session.cancel.cancelled() => return Guarded::Exit(RelayExit::Cancelled),
                output = &mut call => return Guarded::Done(output),
                message = self.inbound.recv() => match message {
                    None => return Guarded::Exit(RelayExit::Disconnected),
                    Some(message) => {
                        self.session.touch();
                        if is_interrupt(&message) {
                            debug!(session_id = %self.session.id, "Pipeline call cancelled by client");
                            return Guarded::Interrupted(message);
                        }
                        self.deferred.push_back(message);
                    }
                },
            }
        }
    }

    async fn flush(&mut self) -> bool {
        match self.session.output.take() {
            Some(batch) => {
                self.counters.audio_out(batch.len());
                self.emit(Frame::AudioChunk(batch)).await
            }
            None => true,
        }
    }

    async fn emit(&self, frame: Frame) -> bool {
        self.outbound.send(Outbound::Frame(frame)).await.is_ok()
    }

    /// Reset to `Idle` through `event`, then tell the client.
    async fn fail(&mut self, event: Event) -> Flow {
        self.session.apply(event);
        self.session.output.clear();
        self.silence.reset();
        if self.emit(Frame::Control(ControlKind::Error)).await {
            Flow::Continue
        } else {
            Flow::Exit(RelayExit::ClientGone)
        }
    }

    /// Settle a pipeline call the client cancelled.
    async fn interrupted(&mut self, message: Inbound) -> Flow {
        match message {
            Err(err) => self.malformed(err).await,
            Ok(_) => {
                self.session.apply(Event::Cancel);
                Flow::Continue
            }
        }
    }

    async fn malformed(&mut self, err: DecodeError) -> Flow {
        self.counters.decode_error();
        warn!(session_id = %self.session.id, error = %err, "Malformed frame, resetting pipeline");
        self.fail(Event::Error).await
    }

    fn report(&self, err: &PipelineError, operation: &str) {
        self.counters.pipeline_error();
        warn!(session_id = %self.session.id, operation, error = %err, "Pipeline call failed");
    }
}

/// Messages that cancel an in-flight pipeline call instead of waiting for it.
fn is_interrupt(message: &Inbound) -> bool {
    matches!(
        message,
        Ok(Frame::Control(ControlKind::Stop | ControlKind::Error)) | Err(_)
    )
}
