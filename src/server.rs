//! mio event loop: accepts clients, pairs each with a backend connection,
//! and relays frames between the two until either side closes.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls through the frame channels.
//! Dispatch is run-to-completion; the only suspension point is the poll
//! call itself. One misbehaving connection never affects the others: a
//! protocol or I/O error tears down its own session only.

use crate::channel::FrameChannel;
use crate::config::Settings;
use crate::connector::{self, Handshake};
use crate::error::Error;
use crate::relay::{Phase, RelaySession, Side};
use bytes::Bytes;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 1024;

/// One registered connection: a frame channel plus its place in a session.
struct Entry {
    channel: FrameChannel<TcpStream>,
    side: Side,
    session: usize,
    /// Outbound connect still in flight (backend entries only).
    connecting: bool,
    /// Interest currently registered with the poller.
    interest: Interest,
}

/// The proxy daemon: listener, poller, and the connection/session tables.
pub struct Proxy {
    poll: Poll,
    listener: TcpListener,
    settings: Settings,
    entries: Slab<Entry>,
    sessions: Slab<RelaySession>,
    local_addr: SocketAddr,
}

impl Proxy {
    /// Bind the listener and set up the poller. No traffic is served until
    /// [`run`](Self::run).
    pub fn bind(settings: Settings) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(create_listener(settings.listen)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            poll,
            listener,
            settings,
            entries: Slab::new(),
            sessions: Slab::new(),
            local_addr,
        })
    }

    /// The address the listener actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Drive the event loop until the process exits.
    pub fn run(&mut self) -> io::Result<()> {
        info!(
            addr = %self.local_addr,
            backend = %self.settings.profile.backend_addr(),
            server = %self.settings.profile.name,
            "proxy listening"
        );

        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        loop {
            self.poll.poll(&mut events, None)?;

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_clients(),
                    Token(key) => {
                        self.handle_event(key, event.is_readable(), event.is_writable());
                    }
                }
            }
        }
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "accepted client connection");
                    if let Err(e) = self.start_session(stream) {
                        // Fail fast: the client socket is dropped, no retry.
                        warn!(peer = %peer, error = %e, "failed to start session");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(error = %e, "accept error");
                    break;
                }
            }
        }
    }

    /// Pair a freshly accepted client with a new backend connection and
    /// create the session that will drive the handshake.
    fn start_session(&mut self, client_stream: TcpStream) -> io::Result<()> {
        let backend_stream = connector::connect(&self.settings.profile)?;

        let client_key = self.entries.insert(Entry {
            channel: FrameChannel::new(client_stream),
            side: Side::Client,
            session: 0,
            connecting: false,
            interest: Interest::READABLE,
        });
        let backend_key = self.entries.insert(Entry {
            channel: FrameChannel::new(backend_stream),
            side: Side::Backend,
            session: 0,
            connecting: true,
            interest: Interest::READABLE.add(Interest::WRITABLE),
        });
        let session_key = self.sessions.insert(RelaySession::new(
            client_key,
            backend_key,
            Handshake::new(self.settings.profile.clone()),
        ));
        self.entries[client_key].session = session_key;
        self.entries[backend_key].session = session_key;

        if let Err(e) = self.register_pair(client_key, backend_key) {
            self.teardown_session(session_key, "registration failed");
            return Err(e);
        }

        debug!(session = session_key, "backend connect started");
        Ok(())
    }

    fn register_pair(&mut self, client_key: usize, backend_key: usize) -> io::Result<()> {
        for key in [client_key, backend_key] {
            let entry = &mut self.entries[key];
            let interest = entry.interest;
            self.poll
                .registry()
                .register(entry.channel.stream_mut(), Token(key), interest)?;
        }
        Ok(())
    }

    fn handle_event(&mut self, key: usize, readable: bool, writable: bool) {
        // The entry may have been torn down earlier in this event batch.
        if !self.entries.contains(key) {
            return;
        }

        if writable && self.entries[key].connecting {
            let session_key = self.entries[key].session;
            match self.finish_connect(key) {
                Ok(()) => {}
                Err(e) => {
                    warn!(session = session_key, error = %e, "backend connect failed");
                    self.teardown_session(session_key, "backend connect failed");
                    return;
                }
            }
        }

        if readable && self.entries.contains(key) && !self.entries[key].connecting {
            self.handle_readable(key);
        }

        if writable && self.entries.contains(key) && !self.entries[key].connecting {
            self.handle_writable(key);
        }

        if self.entries.contains(key) {
            self.update_interest(key);
        }
    }

    /// Resolve an in-flight outbound connect after a writability event.
    fn finish_connect(&mut self, key: usize) -> io::Result<()> {
        let entry = &mut self.entries[key];
        let stream = entry.channel.stream_mut();
        if let Some(e) = stream.take_error()? {
            return Err(e);
        }
        match stream.peer_addr() {
            Ok(_) => {
                entry.connecting = false;
                debug!(session = entry.session, "backend connected");
                Ok(())
            }
            // Spurious wakeup while the connect is still in flight.
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn handle_readable(&mut self, key: usize) {
        let (side, session_key) = {
            let entry = &self.entries[key];
            (entry.side, entry.session)
        };

        match self.entries[key].channel.handle_readable() {
            Ok(events) => {
                for frame in events.frames {
                    if !self.deliver(session_key, side, frame) {
                        return;
                    }
                }
                if events.closed {
                    debug!(session = session_key, side = ?side, "peer closed connection");
                    self.teardown_session(session_key, "peer closed");
                }
            }
            Err(e) => {
                match &e {
                    Error::Protocol(_) => {
                        warn!(session = session_key, side = ?side, error = %e, "protocol error")
                    }
                    _ => debug!(session = session_key, side = ?side, error = %e, "read failed"),
                }
                self.teardown_session(session_key, "read failed");
            }
        }
    }

    /// Feed one completed frame through the session and apply the
    /// resulting writes. Returns false when the session was torn down.
    fn deliver(&mut self, session_key: usize, from: Side, frame: Bytes) -> bool {
        if !self.sessions.contains(session_key) {
            return false;
        }
        let was_handshaking = self.sessions[session_key].phase() == Phase::Handshaking;

        let forwards = match self.sessions[session_key].on_frame(from, frame) {
            Ok(forwards) => forwards,
            Err(e) => {
                warn!(session = session_key, error = %e, "handshake failed");
                self.teardown_session(session_key, "handshake failed");
                return false;
            }
        };

        if was_handshaking && self.sessions[session_key].phase() == Phase::Relaying {
            info!(session = session_key, "session relaying");
        }

        for forward in forwards {
            let peer_key = self.sessions[session_key].key_for(forward.to);
            if let Err(e) = self.entries[peer_key].channel.write_frame(&forward.frame) {
                debug!(session = session_key, error = %e, "dropping frame for closed channel");
                self.teardown_session(session_key, "write to closed channel");
                return false;
            }
            self.update_interest(peer_key);
        }
        true
    }

    fn handle_writable(&mut self, key: usize) {
        let session_key = self.entries[key].session;
        if let Err(e) = self.entries[key].channel.handle_writable() {
            debug!(session = session_key, error = %e, "write failed");
            self.teardown_session(session_key, "write failed");
            return;
        }
        // A gracefully closing channel finishes once its queue drains.
        if self.entries[key].channel.is_closed() {
            self.teardown_session(session_key, "channel closed after flush");
        }
    }

    /// Keep registered interest in sync with what the channel needs: write
    /// interest only while bytes are queued (or a connect is pending).
    fn update_interest(&mut self, key: usize) {
        let entry = &mut self.entries[key];
        if entry.channel.is_closed() {
            return;
        }
        let desired = if entry.connecting || entry.channel.wants_write() {
            Interest::READABLE.add(Interest::WRITABLE)
        } else {
            Interest::READABLE
        };
        if desired != entry.interest {
            entry.interest = desired;
            if let Err(e) =
                self.poll
                    .registry()
                    .reregister(entry.channel.stream_mut(), Token(key), desired)
            {
                error!(error = %e, "reregister failed");
            }
        }
    }

    /// Close both channels of a session and drop all of its state. Closing
    /// either side always brings the other down with it; there is no
    /// half-torn-down session.
    fn teardown_session(&mut self, session_key: usize, reason: &str) {
        let Some(mut session) = self.sessions.try_remove(session_key) else {
            return;
        };
        session.close();
        debug!(session = session_key, reason, "session closed");

        for key in [session.client, session.backend] {
            if let Some(mut entry) = self.entries.try_remove(key) {
                let _ = self.poll.registry().deregister(entry.channel.stream_mut());
                entry.channel.close();
            }
        }
    }
}

/// Create a non-blocking TCP listener with address reuse.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerProfile;

    fn settings() -> Settings {
        Settings {
            listen: "127.0.0.1:0".parse().unwrap(),
            log_level: "info".to_string(),
            profile: ServerProfile {
                name: "test".to_string(),
                host: "127.0.0.1".to_string(),
                port: 700,
                username: "user".to_string(),
                password: "pass".to_string(),
                object_uris: vec![],
                extension_uris: vec![],
                lang: "en".to_string(),
            },
        }
    }

    #[test]
    fn test_bind_resolves_ephemeral_port() {
        let proxy = Proxy::bind(settings()).unwrap();
        assert_ne!(proxy.local_addr().port(), 0);
        assert!(proxy.local_addr().ip().is_loopback());
    }

    #[test]
    fn test_listener_is_reusable_after_drop() {
        let addr = {
            let proxy = Proxy::bind(settings()).unwrap();
            proxy.local_addr()
        };
        let mut settings = settings();
        settings.listen = addr;
        Proxy::bind(settings).unwrap();
    }
}
