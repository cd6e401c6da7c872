//! Just enough RADIUS (RFC 2865) to send Access-Request packets and
//! classify the replies.

use crate::exchange::{AccessRequest, AccessResponse, ExchangeError, ExchangeFuture, Exchanger};
use rand::Rng;
use std::fmt;
use std::future::pending;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::debug;

pub const HEADER_LEN: usize = 20;
pub const MAX_PACKET_LEN: usize = 4096;
const AUTHENTICATOR_LEN: usize = 16;
const MAX_ATTR_VALUE_LEN: usize = 253;
const MAX_PASSWORD_LEN: usize = 128;
/// Replies that fail validation before the exchange is abandoned.
const MAX_INVALID_PACKETS: usize = 10;

const ATTR_USER_NAME: u8 = 1;
const ATTR_USER_PASSWORD: u8 = 2;
const ATTR_NAS_IP_ADDRESS: u8 = 4;
const ATTR_CALLING_STATION_ID: u8 = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    AccessRequest,
    AccessAccept,
    AccessReject,
    AccountingRequest,
    AccountingResponse,
    AccessChallenge,
    StatusServer,
    StatusClient,
    DisconnectRequest,
    DisconnectAck,
    DisconnectNak,
    CoaRequest,
    CoaAck,
    CoaNak,
    Other(u8),
}

impl ResponseCode {
    pub fn as_u8(self) -> u8 {
        match self {
            ResponseCode::AccessRequest => 1,
            ResponseCode::AccessAccept => 2,
            ResponseCode::AccessReject => 3,
            ResponseCode::AccountingRequest => 4,
            ResponseCode::AccountingResponse => 5,
            ResponseCode::AccessChallenge => 11,
            ResponseCode::StatusServer => 12,
            ResponseCode::StatusClient => 13,
            ResponseCode::DisconnectRequest => 40,
            ResponseCode::DisconnectAck => 41,
            ResponseCode::DisconnectNak => 42,
            ResponseCode::CoaRequest => 43,
            ResponseCode::CoaAck => 44,
            ResponseCode::CoaNak => 45,
            ResponseCode::Other(code) => code,
        }
    }
}

impl From<u8> for ResponseCode {
    fn from(code: u8) -> Self {
        match code {
            1 => ResponseCode::AccessRequest,
            2 => ResponseCode::AccessAccept,
            3 => ResponseCode::AccessReject,
            4 => ResponseCode::AccountingRequest,
            5 => ResponseCode::AccountingResponse,
            11 => ResponseCode::AccessChallenge,
            12 => ResponseCode::StatusServer,
            13 => ResponseCode::StatusClient,
            40 => ResponseCode::DisconnectRequest,
            41 => ResponseCode::DisconnectAck,
            42 => ResponseCode::DisconnectNak,
            43 => ResponseCode::CoaRequest,
            44 => ResponseCode::CoaAck,
            45 => ResponseCode::CoaNak,
            other => ResponseCode::Other(other),
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResponseCode::AccessRequest => "Access-Request",
            ResponseCode::AccessAccept => "Access-Accept",
            ResponseCode::AccessReject => "Access-Reject",
            ResponseCode::AccountingRequest => "Accounting-Request",
            ResponseCode::AccountingResponse => "Accounting-Response",
            ResponseCode::AccessChallenge => "Access-Challenge",
            ResponseCode::StatusServer => "Status-Server",
            ResponseCode::StatusClient => "Status-Client",
            ResponseCode::DisconnectRequest => "Disconnect-Request",
            ResponseCode::DisconnectAck => "Disconnect-ACK",
            ResponseCode::DisconnectNak => "Disconnect-NAK",
            ResponseCode::CoaRequest => "CoA-Request",
            ResponseCode::CoaAck => "CoA-ACK",
            ResponseCode::CoaNak => "CoA-NAK",
            ResponseCode::Other(code) => return write!(f, "Code({code})"),
        };
        f.write_str(name)
    }
}

/// Passwords are padded with NULs to a multiple of 16 bytes.
fn hidden_password_len(len: usize) -> usize {
    len.div_ceil(AUTHENTICATOR_LEN).max(1) * AUTHENTICATOR_LEN
}

/// Wire size of the Access-Request built by [`encode_access_request`].
pub fn access_request_len(request: &AccessRequest) -> usize {
    let mut len = HEADER_LEN;
    len += 2 + request.username.len();
    len += 2 + hidden_password_len(request.password.len());
    len += 2 + 4;
    if let Some(id) = &request.calling_station_id {
        len += 2 + id.len();
    }
    len
}

/// User-Password hiding, RFC 2865 section 5.2.
fn hide_password(
    password: &[u8],
    secret: &[u8],
    authenticator: &[u8; AUTHENTICATOR_LEN],
) -> Result<Vec<u8>, ExchangeError> {
    if password.len() > MAX_PASSWORD_LEN {
        return Err(ExchangeError::Encode(format!(
            "password longer than {MAX_PASSWORD_LEN} bytes"
        )));
    }

    let mut hidden = password.to_vec();
    hidden.resize(hidden_password_len(password.len()), 0);

    let mut previous: Vec<u8> = authenticator.to_vec();
    for chunk in hidden.chunks_mut(AUTHENTICATOR_LEN) {
        let mut ctx = md5::Context::new();
        ctx.consume(secret);
        ctx.consume(&previous);
        let digest = ctx.compute();
        for (b, d) in chunk.iter_mut().zip(digest.iter()) {
            *b ^= d;
        }
        previous = chunk.to_vec();
    }
    Ok(hidden)
}

fn push_attribute(packet: &mut Vec<u8>, kind: u8, value: &[u8]) -> Result<(), ExchangeError> {
    if value.len() > MAX_ATTR_VALUE_LEN {
        return Err(ExchangeError::Encode(format!(
            "attribute {kind} value is {} bytes, limit is {MAX_ATTR_VALUE_LEN}",
            value.len()
        )));
    }
    packet.push(kind);
    packet.push((value.len() + 2) as u8);
    packet.extend_from_slice(value);
    Ok(())
}

/// Build an Access-Request datagram.
pub fn encode_access_request(
    request: &AccessRequest,
    secret: &[u8],
    identifier: u8,
    authenticator: [u8; AUTHENTICATOR_LEN],
) -> Result<Vec<u8>, ExchangeError> {
    let mut packet = Vec::with_capacity(access_request_len(request));
    packet.push(ResponseCode::AccessRequest.as_u8());
    packet.push(identifier);
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(&authenticator);

    push_attribute(&mut packet, ATTR_USER_NAME, request.username.as_bytes())?;
    let hidden = hide_password(request.password.as_bytes(), secret, &authenticator)?;
    push_attribute(&mut packet, ATTR_USER_PASSWORD, &hidden)?;
    push_attribute(&mut packet, ATTR_NAS_IP_ADDRESS, &request.nas_ip.octets())?;
    if let Some(id) = &request.calling_station_id {
        push_attribute(&mut packet, ATTR_CALLING_STATION_ID, id.as_bytes())?;
    }

    if packet.len() > MAX_PACKET_LEN {
        return Err(ExchangeError::Encode(format!(
            "packet is {} bytes, limit is {MAX_PACKET_LEN}",
            packet.len()
        )));
    }
    let len = (packet.len() as u16).to_be_bytes();
    packet[2..4].copy_from_slice(&len);
    Ok(packet)
}

/// Validate a reply against the request it answers.
///
/// Returns the response code and the packet length declared in the header.
pub fn decode_response(
    reply: &[u8],
    request: &[u8],
    secret: &[u8],
) -> Result<(ResponseCode, usize), ExchangeError> {
    if reply.len() < HEADER_LEN || request.len() < HEADER_LEN {
        return Err(ExchangeError::InvalidResponse(format!(
            "short packet ({} bytes)",
            reply.len()
        )));
    }

    let declared = u16::from_be_bytes([reply[2], reply[3]]) as usize;
    if declared < HEADER_LEN || declared > reply.len() {
        return Err(ExchangeError::InvalidResponse(format!(
            "length field {declared} does not match datagram of {} bytes",
            reply.len()
        )));
    }
    if reply[1] != request[1] {
        return Err(ExchangeError::InvalidResponse(format!(
            "identifier {} does not match request {}",
            reply[1], request[1]
        )));
    }

    let mut ctx = md5::Context::new();
    ctx.consume(&reply[..4]);
    ctx.consume(&request[4..HEADER_LEN]);
    ctx.consume(&reply[HEADER_LEN..declared]);
    ctx.consume(secret);
    let expected = ctx.compute();
    if expected.0[..] != reply[4..HEADER_LEN] {
        return Err(ExchangeError::InvalidResponse(
            "response authenticator mismatch".to_string(),
        ));
    }

    Ok((ResponseCode::from(reply[0]), declared))
}

/// Sends Access-Requests over UDP, one socket per exchange.
pub struct UdpExchanger {
    addr: SocketAddr,
    secret: Vec<u8>,
    /// Resend interval while no valid reply has arrived
    retransmit: Option<Duration>,
}

impl UdpExchanger {
    pub fn new(addr: SocketAddr, secret: impl Into<Vec<u8>>, retransmit: Duration) -> Self {
        Self {
            addr,
            secret: secret.into(),
            retransmit: (!retransmit.is_zero()).then_some(retransmit),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn round_trip(&self, request: &AccessRequest) -> Result<AccessResponse, ExchangeError> {
        let (identifier, authenticator) = {
            let mut rng = rand::thread_rng();
            (rng.gen::<u8>(), rng.gen::<[u8; AUTHENTICATOR_LEN]>())
        };
        let packet = encode_access_request(request, &self.secret, identifier, authenticator)?;

        let bind: SocketAddr = if self.addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(self.addr).await?;
        socket.send(&packet).await?;

        // An interval past what Instant can hold never fires.
        let mut ticker: Option<Interval> = self.retransmit.and_then(|every| {
            let first = Instant::now().checked_add(every)?;
            let mut ticker = interval_at(first, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some(ticker)
        });

        let mut buf = vec![0u8; MAX_PACKET_LEN];
        let mut invalid = 0usize;
        loop {
            let resend = async {
                match ticker.as_mut() {
                    Some(ticker) => {
                        ticker.tick().await;
                    }
                    None => pending::<()>().await,
                }
            };

            tokio::select! {
                received = socket.recv(&mut buf) => {
                    let n = received?;
                    match decode_response(&buf[..n], &packet, &self.secret) {
                        Ok((code, len)) => return Ok(AccessResponse { code, bytes_in: len }),
                        Err(e) => {
                            invalid += 1;
                            debug!("Ignoring reply from {}: {}", self.addr, e);
                            if invalid >= MAX_INVALID_PACKETS {
                                return Err(e);
                            }
                        }
                    }
                }
                _ = resend => {
                    debug!("Retransmitting request id={} to {}", identifier, self.addr);
                    socket.send(&packet).await?;
                }
            }
        }
    }
}

impl Exchanger for UdpExchanger {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn request_len(&self, request: &AccessRequest) -> usize {
        access_request_len(request)
    }

    fn exchange<'a>(&'a self, request: &'a AccessRequest) -> ExchangeFuture<'a> {
        Box::pin(self.round_trip(request))
    }
}
