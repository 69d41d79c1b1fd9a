use std::{
  io::{self, Write},
  num::NonZeroUsize,
};

use streamchat_model_interface::StreamChatError;
use tokio::sync::mpsc;

/// Receives generated text while a response is being produced.
pub trait StreamCallback {
  /// Generated tokens between two flushes.
  fn interval(&self) -> NonZeroUsize;

  /// One flush event. `fragment` is the text that became visible since the
  /// previous flush and may be empty.
  fn on_fragment(&mut self, fragment: &str) -> Result<(), StreamChatError>;

  /// Called once after the last flush of a successful generation. `tail`
  /// is text the last flush still held back, usually empty.
  fn on_finish(&mut self, tail: &str) -> Result<(), StreamChatError>;
}

fn sink_error(source: io::Error) -> StreamChatError {
  StreamChatError::SinkError { source }
}

/// Writes every fragment to `W` and flushes it right away.
pub struct StreamToWriter<W: Write> {
  writer: W,
  interval: NonZeroUsize,
  flushes: usize,
}

pub type StreamToStdout = StreamToWriter<io::Stdout>;

impl StreamToWriter<io::Stdout> {
  pub fn stdout(interval: NonZeroUsize) -> StreamToStdout {
    StreamToWriter::new(io::stdout(), interval)
  }
}

impl<W: Write> StreamToWriter<W> {
  pub fn new(writer: W, interval: NonZeroUsize) -> StreamToWriter<W> {
    StreamToWriter {
      writer,
      interval,
      flushes: 0,
    }
  }

  pub fn flushes(&self) -> usize {
    self.flushes
  }

  pub fn into_inner(self) -> W {
    self.writer
  }
}

impl<W: Write> StreamCallback for StreamToWriter<W> {
  fn interval(&self) -> NonZeroUsize {
    self.interval
  }

  fn on_fragment(&mut self, fragment: &str) -> Result<(), StreamChatError> {
    self.flushes += 1;
    self.writer.write_all(fragment.as_bytes()).map_err(sink_error)?;
    self.writer.flush().map_err(sink_error)
  }

  fn on_finish(&mut self, tail: &str) -> Result<(), StreamChatError> {
    self.writer.write_all(tail.as_bytes()).map_err(sink_error)?;
    self.writer.write_all(b"\n").map_err(sink_error)?;
    self.writer.flush().map_err(sink_error)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
  Fragment(String),
  Finished(String),
}

/// Hands flush events to another task over a bounded channel.
///
/// Sending blocks the producing thread while the channel is full, so this
/// must be driven from a plain thread or `spawn_blocking`, never from inside
/// an async task.
pub struct ChannelStream {
  sender: mpsc::Sender<StreamEvent>,
  interval: NonZeroUsize,
}

impl ChannelStream {
  pub fn new(
    interval: NonZeroUsize,
    capacity: NonZeroUsize,
  ) -> (ChannelStream, mpsc::Receiver<StreamEvent>) {
    let (sender, receiver) = mpsc::channel(capacity.get());
    (ChannelStream { sender, interval }, receiver)
  }

  fn send(&self, event: StreamEvent) -> Result<(), StreamChatError> {
    self
      .sender
      .blocking_send(event)
      .map_err(|_| StreamChatError::SinkClosed)
  }
}

impl StreamCallback for ChannelStream {
  fn interval(&self) -> NonZeroUsize {
    self.interval
  }

  fn on_fragment(&mut self, fragment: &str) -> Result<(), StreamChatError> {
    self.send(StreamEvent::Fragment(fragment.to_string()))
  }

  fn on_finish(&mut self, tail: &str) -> Result<(), StreamChatError> {
    self.send(StreamEvent::Finished(tail.to_string()))
  }
}

/// Replays events from `receiver` into `sink` until every sender is gone.
/// Returns the number of fragments forwarded.
pub async fn forward<S: StreamCallback>(
  receiver: &mut mpsc::Receiver<StreamEvent>,
  sink: &mut S,
) -> Result<usize, StreamChatError> {
  let mut fragments = 0;
  while let Some(event) = receiver.recv().await {
    match event {
      StreamEvent::Fragment(fragment) => {
        fragments += 1;
        sink.on_fragment(&fragment)?;
      }
      StreamEvent::Finished(tail) => sink.on_finish(&tail)?,
    }
  }
  Ok(fragments)
}
