//! SASL layer: the frame exchange plus the PLAIN and ANONYMOUS responses.
//!
//! Only the exchange itself lives here; mechanisms with challenge rounds
//! are out of scope and fail the handshake explicitly.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::connection::Handshake;
use crate::encoding::Symbol;
use crate::error::{Error, Result};
use crate::frames::{Frame, FrameBody, SaslCode, SaslInit};

/// Protocol id in the AMQP header announcing the SASL layer.
pub(crate) const PROTOCOL_ID: u8 = 3;

/// Client-side SASL configuration.
#[derive(Clone, Debug)]
pub enum SaslConfig {
    /// The ANONYMOUS mechanism: no credentials.
    Anonymous,
    /// The PLAIN mechanism: authcid and password in the initial response.
    Plain {
        /// Authentication identity.
        username: String,
        /// Password.
        password: String,
    },
}

impl SaslConfig {
    fn mechanism(&self) -> Symbol {
        Symbol::from(match self {
            Self::Anonymous => "ANONYMOUS",
            Self::Plain { .. } => "PLAIN",
        })
    }

    fn initial_response(&self) -> Option<Bytes> {
        match self {
            Self::Anonymous => None,
            Self::Plain { username, password } => {
                // authzid NUL authcid NUL passwd
                let mut buf = BytesMut::with_capacity(username.len() + password.len() + 2);
                buf.put_u8(0);
                buf.put_slice(username.as_bytes());
                buf.put_u8(0);
                buf.put_slice(password.as_bytes());
                Some(buf.freeze())
            }
        }
    }
}

/// Run the Mechanisms → Init → Outcome exchange on a fresh SASL layer.
pub(crate) async fn negotiate<T>(
    handshake: &mut Handshake<T>,
    config: &SaslConfig,
    hostname: Option<&str>,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mechanism = config.mechanism();
    let offered = loop {
        match handshake.read_frame().await?.body {
            FrameBody::SaslMechanisms(m) => break m.mechanisms,
            FrameBody::Empty => {}
            other => {
                log::warn!("expected SaslMechanisms, got {}", other.name());
                return Err(Error::MalformedFrame("expected sasl-mechanisms"));
            }
        }
    };
    if !offered.contains(&mechanism) {
        return Err(Error::SaslMechanismUnavailable(mechanism));
    }

    handshake
        .write_frame(Frame::connection(FrameBody::SaslInit(SaslInit {
            mechanism,
            initial_response: config.initial_response(),
            hostname: hostname.map(str::to_owned),
        })))
        .await?;

    loop {
        match handshake.read_frame().await?.body {
            FrameBody::SaslOutcome(outcome) => {
                return match outcome.code {
                    SaslCode::Ok => Ok(()),
                    code => Err(Error::SaslFailed {
                        outcome: code.to_string(),
                    }),
                };
            }
            FrameBody::SaslChallenge(_) => {
                // PLAIN and ANONYMOUS are single-round mechanisms
                return Err(Error::SaslFailed {
                    outcome: "unexpected challenge".into(),
                });
            }
            FrameBody::Empty => {}
            other => {
                log::warn!("expected SaslOutcome, got {}", other.name());
                return Err(Error::MalformedFrame("expected sasl-outcome"));
            }
        }
    }
}
