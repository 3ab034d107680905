//! Channel data pump.
//!
//! A spawned task that drives the current sub-channel until it finishes. Each
//! pass drains the primary stream, then the extended stream, with
//! non-waiting reads until neither has data, handing every chunk to the sink
//! with its stream tag. Between passes the task waits for socket readiness
//! (or for another task to report progress), so the caller is never blocked
//! for the life of the exchange.
//!
//! End-of-stream, an exit status, or a receive error completes the pump and
//! tears the sub-channel down. A sink returning [`Flow::Stop`] or an explicit
//! [`PumpHandle::cancel`] only stops the pump; the channel stays open.

use crate::error::SessionError;
use crate::lifecycle::{ChannelId, ChannelState, WaitTarget};
use crate::observer::SessionEvent;
use crate::retry::classify;
use crate::shared::Shared;
use crate::Result;
use burrow_transport::{RawChannel, StreamTag, Transport, WaitOutcome};
use bytes::{Bytes, BytesMut};
use std::pin::pin;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Whether the pump should keep going after a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep pumping
    Continue,
    /// Stop the pump; the channel stays open
    Stop,
}

/// Receives tagged stream data from a pump.
///
/// Called on the pump task while it holds its drain lock: return
/// [`Flow::Stop`] rather than closing the session from inside.
pub trait ChannelSink: Send + 'static {
    /// Handle one chunk read from `tag`
    fn on_data(&mut self, tag: StreamTag, data: &[u8]) -> Flow;
}

impl<F> ChannelSink for F
where
    F: FnMut(StreamTag, &[u8]) -> Flow + Send + 'static,
{
    fn on_data(&mut self, tag: StreamTag, data: &[u8]) -> Flow {
        self(tag, data)
    }
}

/// Accumulates both streams in memory
#[derive(Debug, Default, Clone)]
pub struct BufferSink {
    stdout: BytesMut,
    stderr: BytesMut,
}

impl BufferSink {
    /// Bytes received on the primary stream so far
    pub fn stdout(&self) -> &[u8] {
        &self.stdout
    }

    /// Bytes received on the extended stream so far
    pub fn stderr(&self) -> &[u8] {
        &self.stderr
    }

    /// Split into `(stdout, stderr)`
    pub fn into_parts(self) -> (Bytes, Bytes) {
        (self.stdout.freeze(), self.stderr.freeze())
    }
}

impl ChannelSink for BufferSink {
    fn on_data(&mut self, tag: StreamTag, data: &[u8]) -> Flow {
        match tag {
            StreamTag::Primary => self.stdout.extend_from_slice(data),
            StreamTag::Extended => self.stderr.extend_from_slice(data),
        }
        Flow::Continue
    }
}

/// Why a pump completed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The remote sent end-of-stream
    EndOfStream,
    /// The remote reported an exit status before end-of-stream
    Exit(i32),
    /// Reading failed; the message describes the error
    Failed(String),
}

/// Pump state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpState {
    /// Waiting for socket readiness
    Armed,
    /// Reading both streams
    Draining,
    /// Handing a chunk to the sink
    Delivering,
    /// Finished; the channel was torn down
    Completed(Completion),
    /// Stopped by the caller, the sink, or teardown elsewhere
    Cancelled,
}

impl PumpState {
    /// True once the pump will not run again
    pub fn is_finished(&self) -> bool {
        matches!(self, PumpState::Completed(_) | PumpState::Cancelled)
    }
}

/// What a finished pump hands back
#[derive(Debug)]
pub struct PumpOutcome<S> {
    /// The sink, with whatever it accumulated
    pub sink: S,
    /// Final state
    pub state: PumpState,
    /// Exit status, if the remote sent one
    pub exit_status: Option<i32>,
}

/// Handle to a running pump
#[derive(Debug)]
pub struct PumpHandle<S> {
    channel: ChannelId,
    cancel: CancellationToken,
    state: watch::Receiver<PumpState>,
    task: JoinHandle<PumpOutcome<S>>,
}

impl<S> PumpHandle<S> {
    /// Channel this pump drives
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Stop the pump, leaving the channel open
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Current state
    pub fn state(&self) -> PumpState {
        self.state.borrow().clone()
    }

    /// Wait until the pump completes or is cancelled
    pub async fn finished(&mut self) -> PumpState {
        let finished = self
            .state
            .wait_for(PumpState::is_finished)
            .await
            .map(|state| state.clone());
        match finished {
            Ok(state) => state,
            Err(_) => self.state.borrow().clone(),
        }
    }

    /// Wait for the pump task and take its outcome
    pub async fn join(self) -> Result<PumpOutcome<S>> {
        match self.task.await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(SessionError::Cancelled),
        }
    }
}

enum Pass {
    Idle(WaitTarget),
    Stopped,
    Done(Completion),
    Cancelled,
}

struct Pump<T: Transport, S> {
    shared: Arc<Shared<T>>,
    channel: ChannelId,
    sink: S,
    cancel: CancellationToken,
    state: watch::Sender<PumpState>,
    buf: Vec<u8>,
}

impl<T: Transport, S: ChannelSink> Pump<T, S> {
    fn set(&self, state: PumpState) {
        self.state.send_replace(state);
    }

    async fn run(mut self) -> PumpOutcome<S> {
        let shared = self.shared.clone();
        debug!("Pump started on channel {}", self.channel);

        let state = loop {
            let mut progress = pin!(shared.progress.notified());
            progress.as_mut().enable();

            let target = match self.drain() {
                Pass::Idle(target) => target,
                Pass::Stopped => {
                    debug!("Sink stopped pump on channel {}", self.channel);
                    break PumpState::Cancelled;
                }
                Pass::Done(completion) => break PumpState::Completed(completion),
                Pass::Cancelled => break PumpState::Cancelled,
            };

            self.set(PumpState::Armed);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break PumpState::Cancelled,
                outcome = target.socket.wait_ready(target.directions, None) => {
                    if let WaitOutcome::Failed(e) = outcome {
                        break PumpState::Completed(Completion::Failed(e.to_string()));
                    }
                }
                _ = progress => trace!("Pump woken by progress"),
            }
        };

        let exit_status = self.finish(&state);
        debug!("Pump on channel {} finished: {:?}", self.channel, state);
        self.set(state.clone());

        PumpOutcome {
            sink: self.sink,
            state,
            exit_status,
        }
    }

    /// One draining pass under the pump lock
    fn drain(&mut self) -> Pass {
        let _pump = self.shared.pump_lock();
        self.set(PumpState::Draining);

        let mut delivered = false;
        loop {
            let mut progressed = false;
            for tag in [StreamTag::Primary, StreamTag::Extended] {
                loop {
                    let read = {
                        let mut handles = self.shared.lock();
                        if self.cancel.is_cancelled() {
                            return Pass::Cancelled;
                        }
                        let Some(channel) = handles.channel_with_id(self.channel) else {
                            return Pass::Cancelled;
                        };
                        channel.handle.read(tag, &mut self.buf)
                    };

                    match read {
                        Ok(0) => break,
                        Ok(n) => {
                            progressed = true;
                            self.shared.events.session(SessionEvent::Received(n));
                            self.set(PumpState::Delivering);
                            if self.sink.on_data(tag, &self.buf[..n]) == Flow::Stop {
                                return Pass::Stopped;
                            }
                            self.set(PumpState::Draining);
                        }
                        Err(e) if e.is_would_block() => break,
                        Err(e) => {
                            let err = classify(e);
                            warn!("Channel {}: read failed: {}", self.channel, err);
                            return Pass::Done(Completion::Failed(err.to_string()));
                        }
                    }
                }
            }
            if !progressed {
                break;
            }
            delivered = true;
        }

        if delivered {
            self.shared.progress.notify_waiters();
        }

        let mut handles = self.shared.lock();
        let Ok(target) = handles.wait_target() else {
            return Pass::Cancelled;
        };
        let Some(channel) = handles.channel_with_id(self.channel) else {
            return Pass::Cancelled;
        };

        let eof = channel.handle.eof();
        let exit = channel.handle.exit_status();
        match (exit, eof) {
            (Some(code), _) => channel.phase = ChannelState::ExitReceived(code),
            (None, true) => channel.phase = ChannelState::EofReceived,
            (None, false) => {}
        }

        if eof {
            Pass::Done(Completion::EndOfStream)
        } else if let Some(code) = exit {
            Pass::Done(Completion::Exit(code))
        } else {
            Pass::Idle(target)
        }
    }

    /// Tear the channel down on completion, or just release it on cancel
    fn finish(&self, state: &PumpState) -> Option<i32> {
        // A replacement pump holds a live token; only a cancelled one is ours.
        self.cancel.cancel();
        let exit_status = {
            let mut handles = self.shared.lock();
            handles.channel_with_id(self.channel).and_then(|channel| {
                if channel.pump.as_ref().is_some_and(CancellationToken::is_cancelled) {
                    channel.pump = None;
                }
                channel.handle.exit_status()
            })
        };

        if let PumpState::Completed(_) = state {
            self.shared.close_channel_if(self.channel);
        }
        exit_status
    }
}

impl<T: Transport> Shared<T> {
    /// Start a pump on the current channel, replacing any running one
    pub(crate) fn start_pump<S: ChannelSink>(self: &Arc<Self>, sink: S) -> Result<PumpHandle<S>> {
        let mut handles = self.lock();
        let control_cancel = handles.control()?.cancel.clone();
        let channel = handles.channel()?;

        if let Some(previous) = channel.pump.take() {
            debug!("Replacing pump on channel {}", channel.id);
            previous.cancel();
        }
        let cancel = control_cancel.child_token();
        channel.pump = Some(cancel.clone());
        let id = channel.id;
        drop(handles);

        let (tx, rx) = watch::channel(PumpState::Armed);
        let pump = Pump {
            shared: self.clone(),
            channel: id,
            sink,
            cancel: cancel.clone(),
            state: tx,
            buf: vec![0; self.config.buffer_size.max(1)],
        };

        Ok(PumpHandle {
            channel: id,
            cancel,
            state: rx,
            task: tokio::spawn(pump.run()),
        })
    }
}
