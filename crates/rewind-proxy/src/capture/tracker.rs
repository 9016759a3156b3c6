//! Per-connection stream state
//!
//! A [`Tracker`] accumulates the bytes seen on one connection in both
//! directions and decides, from protocol framing, whether they form one
//! finished request/response exchange.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::protocol::{
    detect_protocol,
    http,
    postgres::{self, Frame},
    DecodeError, Protocol,
};

/// Identifies one observed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnId {
    /// A proxied TCP connection, keyed by both socket ends
    Socket { peer: SocketAddr, local: SocketAddr },
    /// An identifier assigned by an external capture source
    Raw(u64),
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnId::Socket { peer, local } => write!(f, "{}->{}", peer, local),
            ConnId::Raw(id) => write!(f, "#{}", id),
        }
    }
}

/// Bytes observed on one connection
#[derive(Debug)]
pub struct Tracker {
    conn_id: ConnId,
    /// Bytes received by the monitored peer (the request side)
    recv_buffer: Vec<u8>,
    /// Bytes sent by the monitored peer (the response side)
    sent_buffer: Vec<u8>,
    last_activity: Instant,
    protocol: Protocol,
    max_buffer_size: usize,
    overflowed: bool,
}

impl Tracker {
    pub fn new(conn_id: ConnId, max_buffer_size: usize) -> Self {
        Self {
            conn_id,
            recv_buffer: Vec::new(),
            sent_buffer: Vec::new(),
            last_activity: Instant::now(),
            protocol: Protocol::Unknown,
            max_buffer_size,
            overflowed: false,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn recv_buffer(&self) -> &[u8] {
        &self.recv_buffer
    }

    pub fn sent_buffer(&self) -> &[u8] {
        &self.sent_buffer
    }

    /// Append bytes received by the monitored peer
    pub fn append_received(&mut self, data: &[u8]) {
        self.last_activity = Instant::now();
        if !append_capped(
            &mut self.recv_buffer,
            data,
            self.max_buffer_size,
            &mut self.overflowed,
        ) {
            warn!(conn_id = %self.conn_id, "Receive buffer exceeded limit");
            return;
        }

        if self.protocol == Protocol::Unknown {
            self.protocol = detect_protocol(&self.recv_buffer);
            if self.protocol != Protocol::Unknown {
                debug!(conn_id = %self.conn_id, protocol = %self.protocol, "Detected protocol");
            }
        }
    }

    /// Append bytes sent by the monitored peer
    pub fn append_sent(&mut self, data: &[u8]) {
        self.last_activity = Instant::now();
        if !append_capped(
            &mut self.sent_buffer,
            data,
            self.max_buffer_size,
            &mut self.overflowed,
        ) {
            warn!(conn_id = %self.conn_id, "Send buffer exceeded limit");
        }
    }

    /// Whether both buffers hold exactly one finished exchange
    pub fn is_complete(&self) -> bool {
        if self.recv_buffer.is_empty() || self.sent_buffer.is_empty() || self.overflowed {
            return false;
        }

        match self.protocol {
            Protocol::Http1 => {
                matches!(http::try_parse_request(&self.recv_buffer), Ok(Some(_)))
                    && matches!(http::try_parse_response(&self.sent_buffer), Ok(Some(_)))
            }
            Protocol::PostgreSQL => self.postgres_turn_complete().unwrap_or(false),
            // No framing to go on; see is_quiescent
            Protocol::Unknown => false,
        }
    }

    /// Whether the buffers can never form a valid exchange
    pub fn is_malformed(&self) -> bool {
        if self.overflowed {
            return true;
        }

        match self.protocol {
            Protocol::Http1 => matches!(
                http::try_parse_request(&self.recv_buffer),
                Err(DecodeError::Http(_))
            ),
            Protocol::PostgreSQL => match self.postgres_turn_complete() {
                Err(e) => !e.is_incomplete(),
                Ok(_) => false,
            },
            Protocol::Unknown => false,
        }
    }

    /// No bytes appended for longer than `threshold`
    pub fn is_inactive(&self, threshold: Duration) -> bool {
        self.last_activity.elapsed() > threshold
    }

    /// Inactive with data on both sides
    ///
    /// Completion signal for streams that carry no protocol terminator.
    pub fn is_quiescent(&self, threshold: Duration) -> bool {
        !self.recv_buffer.is_empty() && !self.sent_buffer.is_empty() && self.is_inactive(threshold)
    }

    /// Whether the client buffer holds whole frames and the server has
    /// handed the turn back
    fn postgres_turn_complete(&self) -> Result<bool, DecodeError> {
        let requests = postgres::split_frontend(&self.recv_buffer)?;
        let expect_ssl = match requests.first() {
            Some(first) => matches!(
                postgres::parse_frontend_frame(first),
                Ok((Frame::SslRequest, _))
            ),
            None => false,
        };

        let responses = postgres::split_backend(&self.sent_buffer, expect_ssl)?;
        let last = match responses.last() {
            Some(last) => *last,
            None => return Ok(false),
        };

        let (frame, _) = postgres::parse_backend_frame(last, expect_ssl && responses.len() == 1)?;
        Ok(frame.ends_backend_turn())
    }
}

/// Append unless the result would exceed `limit`; returns false on overflow
fn append_capped(buffer: &mut Vec<u8>, data: &[u8], limit: usize, overflowed: &mut bool) -> bool {
    if *overflowed || buffer.len() + data.len() > limit {
        *overflowed = true;
        return false;
    }
    buffer.extend_from_slice(data);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::postgres::tests::{startup_message, tagged};

    fn tracker() -> Tracker {
        Tracker::new(ConnId::Raw(1), 1024)
    }

    #[test]
    fn test_conn_id_display() {
        let id = ConnId::Socket {
            peer: "127.0.0.1:5000".parse().unwrap(),
            local: "127.0.0.1:16789".parse().unwrap(),
        };
        assert_eq!(id.to_string(), "127.0.0.1:5000->127.0.0.1:16789");
        assert_eq!(ConnId::Raw(7).to_string(), "#7");
    }

    #[test]
    fn test_http_exchange_completes() {
        let mut t = tracker();
        t.append_received(b"GET /ping HTTP/1.1\r\nHost: svc\r\n\r\n");
        assert_eq!(t.protocol(), Protocol::Http1);
        assert!(!t.is_complete());

        t.append_sent(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\npo");
        assert!(!t.is_complete());

        t.append_sent(b"ng");
        assert!(t.is_complete());
        assert!(!t.is_malformed());
    }

    #[test]
    fn test_http_chunked_exchange_completes() {
        let mut t = tracker();
        t.append_received(b"GET / HTTP/1.1\r\nHost: svc\r\n\r\n");
        t.append_sent(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n");
        assert!(!t.is_complete());
        t.append_sent(b"0\r\n\r\n");
        assert!(t.is_complete());
    }

    #[test]
    fn test_http_bad_head_is_malformed() {
        let mut t = tracker();
        t.append_received(b"GET / HTTP/7.0\r\n\r\n");
        assert!(t.is_malformed());
    }

    #[test]
    fn test_postgres_turn_completes_on_ready_for_query() {
        let mut t = tracker();
        t.append_received(&tagged(b'Q', b"SELECT 1\0"));
        assert_eq!(t.protocol(), Protocol::PostgreSQL);

        t.append_sent(&tagged(b'T', &[0, 0]));
        assert!(!t.is_complete());

        t.append_sent(&tagged(b'C', b"SELECT 1\0"));
        t.append_sent(&tagged(b'Z', b"I"));
        assert!(t.is_complete());
    }

    #[test]
    fn test_postgres_startup_completes_on_auth_request() {
        let mut t = tracker();
        t.append_received(&startup_message(&[("user", "rewind")]));
        t.append_sent(&tagged(b'R', &[0, 0, 0, 5, 9, 9, 9, 9]));
        assert!(t.is_complete());
    }

    #[test]
    fn test_postgres_ssl_negotiation_completes() {
        let mut t = tracker();
        t.append_received(&[0, 0, 0, 8, 0x04, 0xd2, 0x16, 0x2f]);
        t.append_sent(b"N");
        assert!(t.is_complete());
    }

    #[test]
    fn test_postgres_impossible_length_is_malformed() {
        let mut t = tracker();
        t.append_received(&tagged(b'Q', b"SELECT 1\0"));
        t.append_sent(&[b'Z', 0, 0, 0, 1, b'I']);
        assert!(t.is_malformed());
        assert!(!t.is_complete());
    }

    #[test]
    fn test_partial_frame_is_not_malformed() {
        let mut t = tracker();
        let query = tagged(b'Q', b"SELECT 1\0");
        t.append_received(&query[..query.len() - 2]);
        t.append_sent(&tagged(b'Z', b"I"));
        assert!(!t.is_complete());
        assert!(!t.is_malformed());
    }

    #[test]
    fn test_overflow_is_malformed() {
        let mut t = Tracker::new(ConnId::Raw(2), 16);
        t.append_received(b"GET / HTTP/1.1\r\n");
        assert!(!t.is_malformed());
        t.append_received(b"X");
        assert!(t.is_malformed());
        assert_eq!(t.recv_buffer().len(), 16);
    }

    #[test]
    fn test_unknown_protocol_never_completes_by_framing() {
        let mut t = tracker();
        t.append_received(b"\x16\x03\x01\x02\x00\x01");
        t.append_sent(b"\x16\x03\x03");
        assert_eq!(t.protocol(), Protocol::Unknown);
        assert!(!t.is_complete());
        assert!(!t.is_malformed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity() {
        let mut t = tracker();
        t.append_received(b"ping");
        assert!(!t.is_inactive(Duration::from_secs(5)));
        assert!(!t.is_quiescent(Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(t.is_inactive(Duration::from_secs(5)));
        // Nothing sent back yet
        assert!(!t.is_quiescent(Duration::from_secs(5)));

        t.append_sent(b"pong");
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(t.is_quiescent(Duration::from_secs(5)));
    }
}
