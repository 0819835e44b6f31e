use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use pin_project_lite::pin_project;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// The HTTP/2 connection preface sent by clients before the first frame.
pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const FLAG_END_HEADERS: u8 = 0x04;
const FLAG_PADDED: u8 = 0x08;
const FLAG_PRIORITY: u8 = 0x20;

/// One observed HTTP/2 frame, as recorded below the HTTP/2 server.
#[derive(Debug)]
pub struct FrameRecord {
  pub frame_type: u8,
  pub flags: u8,
  pub length: u32,
  pub stream_id: u32,
  pub decoded_headers: Option<Vec<(String, String)>>,
  pub data: Option<Vec<u8>>,
}

impl FrameRecord {
  pub fn type_name(&self) -> String {
    match self.frame_type {
      0 => "DATA".to_string(),
      1 => "HEADERS".to_string(),
      2 => "PRIORITY".to_string(),
      3 => "RST_STREAM".to_string(),
      4 => "SETTINGS".to_string(),
      5 => "PUSH_PROMISE".to_string(),
      6 => "PING".to_string(),
      7 => "GOAWAY".to_string(),
      8 => "WINDOW_UPDATE".to_string(),
      9 => "CONTINUATION".to_string(),
      other => format!("UNKNOWN_{other}"),
    }
  }

  pub fn to_json(&self) -> serde_json::Value {
    let mut value = json!({
      "type": self.type_name(),
      "flags": self.flags,
      "length": self.length,
      "stream_id": self.stream_id,
    });
    if let Some(headers) = &self.decoded_headers {
      let mut map = serde_json::Map::new();
      for (name, header_value) in headers {
        map.insert(name.clone(), json!(header_value));
      }
      value["decoded_headers"] = serde_json::Value::Object(map);
    }
    if let Some(data) = &self.data {
      value["data"] = json!(String::from_utf8_lossy(data));
    }
    value
  }
}

#[derive(Default)]
struct StreamCapture {
  sender: Option<UnboundedSender<Arc<FrameRecord>>>,
  buffer: Vec<Arc<FrameRecord>>,
  stopped: bool,
}

struct RequestIndexEntry {
  stream_id: u32,
  method: Option<String>,
  path: Option<String>,
  claimed: bool,
}

struct TapShared {
  preface_remaining: usize,
  pending: Vec<u8>,
  decoder: hpack::Decoder<'static>,
  header_fragments: HashMap<u32, Vec<u8>>,
  global_frames: Vec<Arc<FrameRecord>>,
  streams: HashMap<u32, StreamCapture>,
  requests: Vec<RequestIndexEntry>,
}

impl TapShared {
  fn new() -> Self {
    Self {
      preface_remaining: HTTP2_PREFACE.len(),
      pending: Vec::new(),
      decoder: hpack::Decoder::new(),
      header_fragments: HashMap::new(),
      global_frames: Vec::new(),
      streams: HashMap::new(),
      requests: Vec::new(),
    }
  }

  fn ingest(&mut self, mut bytes: &[u8]) {
    if self.preface_remaining > 0 {
      let skip = self.preface_remaining.min(bytes.len());
      self.preface_remaining -= skip;
      bytes = &bytes[skip..];
    }
    self.pending.extend_from_slice(bytes);

    loop {
      if self.pending.len() < 9 {
        return;
      }
      let length = ((self.pending[0] as usize) << 16) | ((self.pending[1] as usize) << 8) | self.pending[2] as usize;
      if self.pending.len() < 9 + length {
        return;
      }
      let frame_type = self.pending[3];
      let flags = self.pending[4];
      let stream_id =
        u32::from_be_bytes([self.pending[5], self.pending[6], self.pending[7], self.pending[8]]) & 0x7fff_ffff;
      let payload: Vec<u8> = self.pending[9..9 + length].to_vec();
      self.pending.drain(..9 + length);

      let record = self.build_record(frame_type, flags, length as u32, stream_id, payload);
      self.dispatch(Arc::new(record));
    }
  }

  fn build_record(&mut self, frame_type: u8, flags: u8, length: u32, stream_id: u32, payload: Vec<u8>) -> FrameRecord {
    let mut decoded_headers = None;
    let mut data = None;

    match frame_type {
      // DATA
      0 => {
        let mut body: &[u8] = &payload;
        if flags & FLAG_PADDED != 0 && !body.is_empty() {
          let pad_length = body[0] as usize;
          body = &body[1..];
          body = &body[..body.len().saturating_sub(pad_length)];
        }
        data = Some(body.to_vec());
      }
      // HEADERS and CONTINUATION carry header block fragments; HPACK state is
      // connection-wide, so every fragment must be decoded in wire order
      1 | 9 => {
        let mut fragment: &[u8] = &payload;
        if frame_type == 1 {
          if flags & FLAG_PADDED != 0 && !fragment.is_empty() {
            let pad_length = fragment[0] as usize;
            fragment = &fragment[1..];
            fragment = &fragment[..fragment.len().saturating_sub(pad_length)];
          }
          if flags & FLAG_PRIORITY != 0 && fragment.len() >= 5 {
            fragment = &fragment[5..];
          }
        }

        let accumulated = self.header_fragments.entry(stream_id).or_default();
        accumulated.extend_from_slice(fragment);

        if flags & FLAG_END_HEADERS != 0 {
          let block = self.header_fragments.remove(&stream_id).unwrap_or_default();
          if let Ok(headers) = self.decoder.decode(&block) {
            let headers: Vec<(String, String)> = headers
              .into_iter()
              .map(|(name, value)| {
                (
                  String::from_utf8_lossy(&name).to_string(),
                  String::from_utf8_lossy(&value).to_string(),
                )
              })
              .collect();
            self.index_request(stream_id, &headers);
            decoded_headers = Some(headers);
          }
        }
      }
      _ => {}
    }

    FrameRecord {
      frame_type,
      flags,
      length,
      stream_id,
      decoded_headers,
      data,
    }
  }

  fn index_request(&mut self, stream_id: u32, headers: &[(String, String)]) {
    let method = headers.iter().find(|(name, _)| name == ":method").map(|(_, v)| v.clone());
    let path = headers.iter().find(|(name, _)| name == ":path").map(|(_, v)| v.clone());
    if method.is_some() || path.is_some() {
      self.requests.push(RequestIndexEntry {
        stream_id,
        method,
        path,
        claimed: false,
      });
    }
  }

  fn dispatch(&mut self, record: Arc<FrameRecord>) {
    if record.stream_id == 0 {
      self.global_frames.push(record.clone());
      // The channel hop keeps delivery asynchronous with respect to the read
      for capture in self.streams.values() {
        if let Some(sender) = &capture.sender {
          sender.send(record.clone()).unwrap_or_default();
        }
      }
      return;
    }

    let capture = self.streams.entry(record.stream_id).or_default();
    if capture.stopped {
      return;
    }
    match &capture.sender {
      Some(sender) => {
        sender.send(record).unwrap_or_default();
      }
      None => capture.buffer.push(record),
    }
  }
}

/// A shared handle to a connection's frame tap.
#[derive(Clone)]
pub struct FrameTapHandle {
  shared: Arc<Mutex<TapShared>>,
}

impl FrameTapHandle {
  /// Subscribes to a stream's frames. Returns a snapshot of all global
  /// (stream 0) frames so far, the frames buffered for this stream (which are
  /// drained), and a receiver for everything that follows.
  #[allow(clippy::type_complexity)]
  pub fn subscribe(
    &self,
    stream_id: u32,
  ) -> (Vec<Arc<FrameRecord>>, Vec<Arc<FrameRecord>>, UnboundedReceiver<Arc<FrameRecord>>) {
    let mut shared = self.shared.lock().expect("frame tap lock poisoned");
    let global_frames = shared.global_frames.clone();
    let capture = shared.streams.entry(stream_id).or_default();
    capture.stopped = false;
    let buffered = std::mem::take(&mut capture.buffer);
    let (sender, receiver) = unbounded_channel();
    capture.sender = Some(sender);
    (global_frames, buffered, receiver)
  }

  /// Drops a stream's subscription and buffered frames entirely.
  pub fn remove(&self, stream_id: u32) {
    self.shared.lock().expect("frame tap lock poisoned").streams.remove(&stream_id);
  }

  /// Stops buffering and dispatching for a stream until a new subscription
  /// re-enables it.
  pub fn stop_capturing(&self, stream_id: u32) {
    let mut shared = self.shared.lock().expect("frame tap lock poisoned");
    let capture = shared.streams.entry(stream_id).or_default();
    capture.stopped = true;
    capture.sender = None;
    capture.buffer.clear();
  }

  /// Resolves the stream id of an observed request by method and path.
  ///
  /// The HTTP/2 server does not expose stream ids to request handlers, so
  /// handlers locate their own stream through the tap's request index. Each
  /// stream is handed out at most once.
  pub fn claim_stream(&self, method: &str, path: &str) -> Option<u32> {
    let mut shared = self.shared.lock().expect("frame tap lock poisoned");
    for entry in shared.requests.iter_mut() {
      if entry.claimed {
        continue;
      }
      let method_matches = entry.method.as_deref().is_none_or(|m| m == method);
      let path_matches = entry.path.as_deref().is_none_or(|p| p == path);
      if method_matches && path_matches {
        entry.claimed = true;
        return Some(entry.stream_id);
      }
    }
    None
  }
}

pin_project! {
  /// A transparent duplex wrapper that records the HTTP/2 frames read from
  /// the inner stream. The HTTP/2 server consumes bytes invisibly; this tap
  /// sits between the transport and the parser so frame-level telemetry stays
  /// available to request handlers.
  pub struct FrameTap<S> {
    shared: Arc<Mutex<TapShared>>,
    #[pin]
    inner: S,
  }
}

impl<S> FrameTap<S> {
  pub fn new(inner: S) -> Self {
    Self {
      shared: Arc::new(Mutex::new(TapShared::new())),
      inner,
    }
  }

  pub fn handle(&self) -> FrameTapHandle {
    FrameTapHandle {
      shared: self.shared.clone(),
    }
  }
}

impl<S: AsyncRead> AsyncRead for FrameTap<S> {
  fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
    let this = self.project();
    let filled_before = buf.filled().len();
    let result = this.inner.poll_read(cx, buf);
    if let Poll::Ready(Ok(())) = &result {
      let new_bytes = &buf.filled()[filled_before..];
      if !new_bytes.is_empty() {
        this.shared.lock().expect("frame tap lock poisoned").ingest(new_bytes);
      }
    }
    result
  }
}

impl<S: AsyncWrite> AsyncWrite for FrameTap<S> {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
    self.project().inner.poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    self.project().inner.poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    self.project().inner.poll_shutdown(cx)
  }
}
