//! Per-connection frame transport state machine.
//!
//! Readiness-based model: the event loop tells us when the socket is ready,
//! then we perform non-blocking read/write syscalls here. A channel turns a
//! raw duplex byte stream into discrete length-prefixed frames on the read
//! side and drains a FIFO queue of encoded frames on the write side, both
//! tolerant of partial I/O.
//!
//! The channel is generic over the stream so the state machine can be
//! driven by scripted in-memory streams in tests; in the daemon `S` is a
//! non-blocking `mio::net::TcpStream`.

use crate::codec::{self, HEADER_LEN};
use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::io::{self, Read, Write};

/// Where the read state machine is in the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    /// Expecting the 4 header bytes.
    ReadingLength,
    /// Expecting `declared_length - 4` payload bytes.
    ReadingPayload,
}

/// Channel lifecycle. `Closing` means a graceful shutdown was requested and
/// the channel closes once its write queue drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Open,
    Closing,
    Closed,
}

/// Outcome of draining one read-readiness event.
#[derive(Debug)]
pub struct ReadEvents {
    /// Frames completed during this event, in completion order.
    pub frames: Vec<Bytes>,
    /// The peer closed its end. Any partially accumulated frame has been
    /// discarded; it is never delivered.
    pub closed: bool,
}

/// Framed read/write state machine bound to one connection.
pub struct FrameChannel<S> {
    stream: S,
    state: ReadState,
    /// Bytes still needed to complete the current read state. Transition
    /// happens only when this reaches zero.
    remaining: usize,
    accum: BytesMut,
    write_queue: VecDeque<Bytes>,
    lifecycle: Lifecycle,
}

impl<S: Read + Write> FrameChannel<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            state: ReadState::ReadingLength,
            remaining: HEADER_LEN,
            accum: BytesMut::with_capacity(4096),
            write_queue: VecDeque::new(),
            lifecycle: Lifecycle::Open,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle == Lifecycle::Closed
    }

    /// Whether the channel needs write-readiness notifications. Interest
    /// should be dropped as soon as this turns false to avoid spurious
    /// wakeups.
    pub fn wants_write(&self) -> bool {
        !self.write_queue.is_empty()
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Drain one read-readiness event: read until the socket would block,
    /// feeding the state machine. All frames that complete are returned
    /// together; state transitions never suspend mid-step.
    pub fn handle_readable(&mut self) -> Result<ReadEvents> {
        let mut frames = Vec::new();
        if self.lifecycle == Lifecycle::Closed {
            return Ok(ReadEvents {
                frames,
                closed: true,
            });
        }

        let mut scratch = [0u8; 4096];
        loop {
            let want = self.remaining.min(scratch.len());
            match self.stream.read(&mut scratch[..want]) {
                Ok(0) => {
                    // Peer closed. An in-progress frame is discarded, not
                    // delivered as a partial.
                    self.close();
                    return Ok(ReadEvents {
                        frames,
                        closed: true,
                    });
                }
                Ok(n) => {
                    self.accum.extend_from_slice(&scratch[..n]);
                    self.remaining -= n;
                    if self.remaining == 0 {
                        self.advance(&mut frames)?;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.close();
                    return Err(Error::Io(e));
                }
            }
        }

        Ok(ReadEvents {
            frames,
            closed: false,
        })
    }

    /// Step the read state machine after `remaining` hit zero. Loops so a
    /// zero-length payload still emits its (empty) frame without another
    /// pass through the poller.
    fn advance(&mut self, frames: &mut Vec<Bytes>) -> Result<()> {
        loop {
            match self.state {
                ReadState::ReadingLength => {
                    let mut header = [0u8; HEADER_LEN];
                    header.copy_from_slice(&self.accum);
                    self.accum.clear();
                    let declared = match codec::decode_header(header) {
                        Ok(len) => len,
                        Err(e) => {
                            self.close();
                            return Err(e);
                        }
                    };
                    self.state = ReadState::ReadingPayload;
                    self.remaining = declared - HEADER_LEN;
                }
                ReadState::ReadingPayload => {
                    frames.push(self.accum.split().freeze());
                    self.state = ReadState::ReadingLength;
                    self.remaining = HEADER_LEN;
                }
            }
            if self.remaining > 0 {
                return Ok(());
            }
        }
    }

    /// Encode `payload` and append it to the tail of the write queue.
    pub fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        if self.lifecycle != Lifecycle::Open {
            return Err(Error::ConnectionClosed);
        }
        self.write_queue.push_back(Bytes::from(codec::encode(payload)?));
        Ok(())
    }

    /// Drain one write-readiness event. Pops head buffers and sends them; a
    /// short send puts the unsent suffix back at the head of the queue and
    /// stops until the next writability notification.
    pub fn handle_writable(&mut self) -> Result<()> {
        if self.lifecycle == Lifecycle::Closed {
            return Ok(());
        }

        while let Some(head) = self.write_queue.pop_front() {
            match self.stream.write(&head) {
                Ok(0) => {
                    self.close();
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write returned 0",
                    )));
                }
                Ok(n) if n < head.len() => {
                    self.write_queue.push_front(head.slice(n..));
                    break;
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.write_queue.push_front(head);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.write_queue.push_front(head);
                }
                Err(e) => {
                    self.close();
                    return Err(Error::Io(e));
                }
            }
        }

        if self.write_queue.is_empty() && self.lifecycle == Lifecycle::Closing {
            self.lifecycle = Lifecycle::Closed;
        }
        Ok(())
    }

    /// Request a graceful close: queued frames are still flushed, then the
    /// channel closes. Closes immediately when nothing is queued.
    pub fn shutdown(&mut self) {
        if self.lifecycle == Lifecycle::Open {
            if self.write_queue.is_empty() {
                self.lifecycle = Lifecycle::Closed;
            } else {
                self.lifecycle = Lifecycle::Closing;
            }
        }
    }

    /// Close immediately. Unsent queued bytes and any partially accumulated
    /// frame are discarded. Idempotent.
    pub fn close(&mut self) {
        self.write_queue.clear();
        self.accum.clear();
        self.lifecycle = Lifecycle::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory stream with scripted chunking so partial reads and short
    /// writes can be forced deterministically.
    struct ScriptedStream {
        input: Vec<u8>,
        pos: usize,
        /// Max bytes handed out per read call.
        read_chunk: usize,
        /// What to do once input runs dry: EOF or WouldBlock.
        eof_at_end: bool,
        written: Vec<u8>,
        /// Max bytes accepted per write call.
        write_cap: usize,
        write_err: Option<io::ErrorKind>,
    }

    impl ScriptedStream {
        fn new(input: &[u8]) -> Self {
            Self {
                input: input.to_vec(),
                pos: 0,
                read_chunk: usize::MAX,
                eof_at_end: false,
                written: Vec::new(),
                write_cap: usize::MAX,
                write_err: None,
            }
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos >= self.input.len() {
                if self.eof_at_end {
                    return Ok(0);
                }
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "dry"));
            }
            let n = buf
                .len()
                .min(self.read_chunk)
                .min(self.input.len() - self.pos);
            buf[..n].copy_from_slice(&self.input[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(kind) = self.write_err {
                return Err(io::Error::new(kind, "scripted failure"));
            }
            let n = buf.len().min(self.write_cap);
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn encoded(payload: &[u8]) -> Vec<u8> {
        codec::encode(payload).unwrap()
    }

    #[test]
    fn test_whole_frame_in_one_event() {
        let stream = ScriptedStream::new(&encoded(b"<epp/>"));
        let mut channel = FrameChannel::new(stream);

        let events = channel.handle_readable().unwrap();
        assert_eq!(events.frames.len(), 1);
        assert_eq!(&events.frames[0][..], b"<epp/>");
        assert!(!events.closed);
        assert_eq!(channel.lifecycle(), Lifecycle::Open);
    }

    #[test]
    fn test_byte_at_a_time_yields_one_frame() {
        let mut stream = ScriptedStream::new(&encoded(b"payload"));
        stream.read_chunk = 1;
        let mut channel = FrameChannel::new(stream);

        let events = channel.handle_readable().unwrap();
        assert_eq!(events.frames.len(), 1);
        assert_eq!(&events.frames[0][..], b"payload");
    }

    #[test]
    fn test_multiple_frames_in_one_event() {
        let mut input = encoded(b"first");
        input.extend_from_slice(&encoded(b""));
        input.extend_from_slice(&encoded(b"third"));
        let mut channel = FrameChannel::new(ScriptedStream::new(&input));

        let events = channel.handle_readable().unwrap();
        assert_eq!(events.frames.len(), 3);
        assert_eq!(&events.frames[0][..], b"first");
        assert!(events.frames[1].is_empty());
        assert_eq!(&events.frames[2][..], b"third");
    }

    #[test]
    fn test_zero_length_payload_emits_empty_frame() {
        let mut channel = FrameChannel::new(ScriptedStream::new(&encoded(b"")));

        let events = channel.handle_readable().unwrap();
        assert_eq!(events.frames.len(), 1);
        assert!(events.frames[0].is_empty());
    }

    #[test]
    fn test_undersized_header_is_protocol_error() {
        let mut channel = FrameChannel::new(ScriptedStream::new(&3u32.to_be_bytes()));

        let err = channel.handle_readable().unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(channel.lifecycle(), Lifecycle::Closed);
    }

    #[test]
    fn test_peer_close_discards_partial_frame() {
        // Header promises 10 payload bytes, only 3 arrive before EOF.
        let mut input = 14u32.to_be_bytes().to_vec();
        input.extend_from_slice(b"abc");
        let mut stream = ScriptedStream::new(&input);
        stream.eof_at_end = true;
        let mut channel = FrameChannel::new(stream);

        let events = channel.handle_readable().unwrap();
        assert!(events.closed);
        assert!(events.frames.is_empty());
        assert_eq!(channel.lifecycle(), Lifecycle::Closed);
    }

    #[test]
    fn test_frames_completed_before_eof_are_delivered() {
        let mut stream = ScriptedStream::new(&encoded(b"last words"));
        stream.eof_at_end = true;
        let mut channel = FrameChannel::new(stream);

        let events = channel.handle_readable().unwrap();
        assert!(events.closed);
        assert_eq!(events.frames.len(), 1);
        assert_eq!(&events.frames[0][..], b"last words");
    }

    #[test]
    fn test_write_fifo_under_one_byte_capacity() {
        let mut stream = ScriptedStream::new(b"");
        stream.write_cap = 1;
        let mut channel = FrameChannel::new(stream);

        channel.write_frame(b"F1").unwrap();
        channel.write_frame(b"F2").unwrap();

        // Each writability event makes one byte of progress.
        while channel.wants_write() {
            channel.handle_writable().unwrap();
        }

        let mut expected = encoded(b"F1");
        expected.extend_from_slice(&encoded(b"F2"));
        assert_eq!(channel.stream().written, expected);
    }

    #[test]
    fn test_write_interest_drops_when_drained() {
        let mut channel = FrameChannel::new(ScriptedStream::new(b""));
        assert!(!channel.wants_write());

        channel.write_frame(b"data").unwrap();
        assert!(channel.wants_write());

        channel.handle_writable().unwrap();
        assert!(!channel.wants_write());
        assert_eq!(channel.stream().written, encoded(b"data"));
    }

    #[test]
    fn test_shutdown_flushes_queue_then_closes() {
        let mut stream = ScriptedStream::new(b"");
        stream.write_cap = 3;
        let mut channel = FrameChannel::new(stream);

        channel.write_frame(b"goodbye").unwrap();
        channel.shutdown();
        assert_eq!(channel.lifecycle(), Lifecycle::Closing);

        while channel.wants_write() {
            channel.handle_writable().unwrap();
        }
        assert_eq!(channel.lifecycle(), Lifecycle::Closed);
        assert_eq!(channel.stream().written, encoded(b"goodbye"));
    }

    #[test]
    fn test_shutdown_with_empty_queue_closes_immediately() {
        let mut channel = FrameChannel::new(ScriptedStream::new(b""));
        channel.shutdown();
        assert_eq!(channel.lifecycle(), Lifecycle::Closed);
    }

    #[test]
    fn test_write_error_closes_channel() {
        let mut stream = ScriptedStream::new(b"");
        stream.write_err = Some(io::ErrorKind::BrokenPipe);
        let mut channel = FrameChannel::new(stream);

        channel.write_frame(b"frame").unwrap();
        let err = channel.handle_writable().unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(channel.lifecycle(), Lifecycle::Closed);
        assert!(!channel.wants_write());
    }

    #[test]
    fn test_write_frame_after_close_is_rejected() {
        let mut channel = FrameChannel::new(ScriptedStream::new(b""));
        channel.close();
        assert!(matches!(
            channel.write_frame(b"late"),
            Err(Error::ConnectionClosed)
        ));
    }
}
