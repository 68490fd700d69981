//! Backend connection establishment and the greeting/login handshake.
//!
//! An EPP server speaks first: after connect it sends a greeting frame.
//! The connector answers with a `<login>` command built from the configured
//! server profile and waits for the response before the connection is
//! handed to a relay session. Only the handshake state blocks; the event
//! loop keeps serving other sessions while a handshake is in flight.

use crate::config::ServerProfile;
use crate::error::{Error, Result};
use crate::frames::{self, LoginRequest};
use bytes::Bytes;
use mio::net::TcpStream;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

/// Start a non-blocking outbound connect to the profile's backend address.
///
/// The returned stream is connect-in-progress; the event loop learns the
/// outcome from the first writability event.
pub fn connect(profile: &ServerProfile) -> io::Result<TcpStream> {
    let addr = resolve_addr(&profile.backend_addr())?;
    TcpStream::connect(addr)
}

fn resolve_addr(addr: &str) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no usable address for '{addr}'"),
        )
    })
}

/// Handshake progress reported back to the event loop.
#[derive(Debug)]
pub enum Progress {
    /// The greeting arrived; the returned login frame must be written to
    /// the backend channel.
    SendLogin(Bytes),
    /// Login accepted. The stored greeting is released for delivery to the
    /// client, and the connection is ready to relay.
    Complete { greeting: Bytes },
}

enum HandshakeState {
    AwaitingGreeting,
    AwaitingLogin { greeting: Bytes },
    Done,
}

/// Greeting + login exchange on a freshly connected backend channel.
pub struct Handshake {
    state: HandshakeState,
    profile: ServerProfile,
    trid: String,
}

impl Handshake {
    pub fn new(profile: ServerProfile) -> Self {
        Self {
            state: HandshakeState::AwaitingGreeting,
            profile,
            trid: frames::new_trid(),
        }
    }

    /// The clTRID used on this handshake's login command.
    pub fn trid(&self) -> &str {
        &self.trid
    }

    /// Feed the next backend frame through the handshake.
    pub fn on_frame(&mut self, frame: Bytes) -> Result<Progress> {
        match std::mem::replace(&mut self.state, HandshakeState::Done) {
            HandshakeState::AwaitingGreeting => {
                if !contains(&frame, b"<greeting") {
                    return Err(Error::Handshake(
                        "backend did not open with a greeting frame".to_string(),
                    ));
                }
                let login = frames::login(
                    &LoginRequest {
                        username: &self.profile.username,
                        password: &self.profile.password,
                        object_uris: &self.profile.object_uris,
                        extension_uris: &self.profile.extension_uris,
                        lang: &self.profile.lang,
                    },
                    Some(&self.trid),
                );
                self.state = HandshakeState::AwaitingLogin { greeting: frame };
                Ok(Progress::SendLogin(Bytes::from(login)))
            }
            HandshakeState::AwaitingLogin { greeting } => match result_code(&frame) {
                Some(code) if login_succeeded(code) => Ok(Progress::Complete { greeting }),
                Some(code) => Err(Error::Handshake(format!(
                    "backend rejected login with result code {code}"
                ))),
                None => Err(Error::Handshake(
                    "login response carries no result code".to_string(),
                )),
            },
            HandshakeState::Done => Err(Error::Handshake(
                "unexpected frame after completed handshake".to_string(),
            )),
        }
    }
}

/// EPP result codes: 1xxx means success, everything else is a failure.
pub fn login_succeeded(code: u16) -> bool {
    (1000..2000).contains(&code)
}

/// Extract the first `<result code="...">` value from a response frame.
fn result_code(frame: &[u8]) -> Option<u16> {
    let text = std::str::from_utf8(frame).ok()?;
    let after_result = &text[text.find("<result")? + "<result".len()..];
    let after_code = &after_result[after_result.find("code=\"")? + "code=\"".len()..];
    let end = after_code.find('"')?;
    after_code[..end].parse().ok()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
