//! Pairing of a client channel and a backend channel.
//!
//! A session is created as soon as a client is accepted and its backend
//! connect is started; it drives the backend handshake, then relays
//! completed frames verbatim between the two channels. The session itself
//! performs no I/O: it consumes frames and returns forwarding directives
//! for the event loop to apply, so the state machine stays testable
//! without sockets.

use crate::connector::{Handshake, Progress};
use crate::error::Result;
use bytes::Bytes;

/// Which half of a session a frame or event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Backend,
}

impl Side {
    pub fn peer(self) -> Self {
        match self {
            Self::Client => Self::Backend,
            Self::Backend => Self::Client,
        }
    }
}

/// Session lifecycle as observed from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Handshaking,
    Relaying,
    Closed,
}

enum SessionState {
    Handshaking(Handshake),
    Relaying,
    Closed,
}

/// A directive for the event loop: write `frame` to the channel on `to`.
#[derive(Debug)]
pub struct Forward {
    pub to: Side,
    pub frame: Bytes,
}

/// One client/backend pairing. There is no partial-session state: a session
/// either relays on both channels or is fully torn down.
pub struct RelaySession {
    /// Connection-registry key of the client channel.
    pub client: usize,
    /// Connection-registry key of the backend channel.
    pub backend: usize,
    state: SessionState,
    /// Client frames that arrived before the handshake finished, in
    /// arrival order.
    pending: Vec<Bytes>,
}

impl RelaySession {
    pub fn new(client: usize, backend: usize, handshake: Handshake) -> Self {
        Self {
            client,
            backend,
            state: SessionState::Handshaking(handshake),
            pending: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        match self.state {
            SessionState::Handshaking(_) => Phase::Handshaking,
            SessionState::Relaying => Phase::Relaying,
            SessionState::Closed => Phase::Closed,
        }
    }

    /// The registry key of the channel on `side`.
    pub fn key_for(&self, side: Side) -> usize {
        match side {
            Side::Client => self.client,
            Side::Backend => self.backend,
        }
    }

    /// The registry key of the channel opposite `side`.
    pub fn peer_key(&self, side: Side) -> usize {
        self.key_for(side.peer())
    }

    /// Feed one completed frame from `from` through the session, returning
    /// the writes the event loop must perform.
    ///
    /// During the handshake, client frames are buffered and backend frames
    /// drive the login exchange; completion forwards the stored greeting to
    /// the client followed by any buffered client frames. While relaying,
    /// every frame crosses to the opposite channel byte-identical. A closed
    /// session delivers nothing.
    pub fn on_frame(&mut self, from: Side, frame: Bytes) -> Result<Vec<Forward>> {
        match std::mem::replace(&mut self.state, SessionState::Closed) {
            SessionState::Closed => Ok(Vec::new()),
            SessionState::Relaying => {
                self.state = SessionState::Relaying;
                Ok(vec![Forward {
                    to: from.peer(),
                    frame,
                }])
            }
            SessionState::Handshaking(mut handshake) => match from {
                Side::Client => {
                    self.pending.push(frame);
                    self.state = SessionState::Handshaking(handshake);
                    Ok(Vec::new())
                }
                // A handshake error leaves the session Closed; the event
                // loop tears both channels down.
                Side::Backend => match handshake.on_frame(frame)? {
                    Progress::SendLogin(login) => {
                        self.state = SessionState::Handshaking(handshake);
                        Ok(vec![Forward {
                            to: Side::Backend,
                            frame: login,
                        }])
                    }
                    Progress::Complete { greeting } => {
                        self.state = SessionState::Relaying;
                        let mut out = Vec::with_capacity(1 + self.pending.len());
                        out.push(Forward {
                            to: Side::Client,
                            frame: greeting,
                        });
                        out.extend(self.pending.drain(..).map(|frame| Forward {
                            to: Side::Backend,
                            frame,
                        }));
                        Ok(out)
                    }
                },
            },
        }
    }

    /// Mark the session closed. Buffered frames are discarded; nothing is
    /// delivered afterwards.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerProfile;
    use crate::error::Error;

    const GREETING: &[u8] = b"<epp><greeting><svID>t</svID></greeting></epp>";

    fn success() -> Bytes {
        Bytes::from_static(b"<epp><response><result code=\"1000\"/></response></epp>")
    }

    fn session() -> RelaySession {
        let profile = ServerProfile {
            name: "test".to_string(),
            host: "epp.example.net".to_string(),
            port: 700,
            username: "user".to_string(),
            password: "pass".to_string(),
            object_uris: vec![],
            extension_uris: vec![],
            lang: "en".to_string(),
        };
        RelaySession::new(1, 2, Handshake::new(profile))
    }

    fn complete_handshake(s: &mut RelaySession) -> Vec<Forward> {
        s.on_frame(Side::Backend, Bytes::from_static(GREETING))
            .unwrap();
        s.on_frame(Side::Backend, success()).unwrap()
    }

    #[test]
    fn test_handshake_then_relaying() {
        let mut s = session();
        assert_eq!(s.phase(), Phase::Handshaking);

        let login = s
            .on_frame(Side::Backend, Bytes::from_static(GREETING))
            .unwrap();
        assert_eq!(login.len(), 1);
        assert_eq!(login[0].to, Side::Backend);
        assert_eq!(s.phase(), Phase::Handshaking);

        let out = s.on_frame(Side::Backend, success()).unwrap();
        assert_eq!(s.phase(), Phase::Relaying);
        // Greeting goes to the client once login is accepted.
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, Side::Client);
        assert_eq!(&out[0].frame[..], GREETING);
    }

    #[test]
    fn test_client_frames_buffered_until_relaying() {
        let mut s = session();
        assert!(s
            .on_frame(Side::Client, Bytes::from_static(b"early-1"))
            .unwrap()
            .is_empty());
        s.on_frame(Side::Backend, Bytes::from_static(GREETING))
            .unwrap();
        assert!(s
            .on_frame(Side::Client, Bytes::from_static(b"early-2"))
            .unwrap()
            .is_empty());

        let out = s.on_frame(Side::Backend, success()).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].to, Side::Client);
        assert_eq!(out[1].to, Side::Backend);
        assert_eq!(&out[1].frame[..], b"early-1");
        assert_eq!(out[2].to, Side::Backend);
        assert_eq!(&out[2].frame[..], b"early-2");
    }

    #[test]
    fn test_relaying_forwards_both_directions() {
        let mut s = session();
        complete_handshake(&mut s);

        let out = s
            .on_frame(Side::Client, Bytes::from_static(b"<check/>"))
            .unwrap();
        assert_eq!(out[0].to, Side::Backend);
        assert_eq!(&out[0].frame[..], b"<check/>");

        let out = s
            .on_frame(Side::Backend, Bytes::from_static(b"<chkData/>"))
            .unwrap();
        assert_eq!(out[0].to, Side::Client);
        assert_eq!(&out[0].frame[..], b"<chkData/>");
    }

    #[test]
    fn test_handshake_failure_closes_session() {
        let mut s = session();
        s.on_frame(Side::Backend, Bytes::from_static(GREETING))
            .unwrap();
        let err = s
            .on_frame(
                Side::Backend,
                Bytes::from_static(b"<epp><response><result code=\"2501\"/></response></epp>"),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
        assert_eq!(s.phase(), Phase::Closed);
    }

    #[test]
    fn test_no_frames_delivered_after_close() {
        let mut s = session();
        complete_handshake(&mut s);
        s.close();
        let out = s
            .on_frame(Side::Client, Bytes::from_static(b"late"))
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(s.phase(), Phase::Closed);
    }

    #[test]
    fn test_peer_key() {
        let s = session();
        assert_eq!(s.peer_key(Side::Client), 2);
        assert_eq!(s.peer_key(Side::Backend), 1);
    }
}
