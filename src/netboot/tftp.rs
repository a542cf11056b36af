//! Read-only TFTP client (RFC 1350) with the block size and transfer size
//! options (RFC 2348, RFC 2349).
use std::collections::HashMap;
use std::io::{self, ErrorKind, Read};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use reqwest::Url;

use super::fetch::{self, FetchError, SchemeClient};

pub const DEFAULT_PORT: u16 = 69;
const DEFAULT_BLOCK_SIZE: usize = 512;
// Largest block that fits an Ethernet frame after the IPv4, UDP and TFTP headers.
const PREFERRED_BLOCK_SIZE: usize = 1428;
const MAX_PACKET_SIZE: usize = 4 + 65464;

const OP_RRQ: u16 = 1;
const OP_DATA: u16 = 3;
const OP_ACK: u16 = 4;
const OP_ERROR: u16 = 5;
const OP_OACK: u16 = 6;

const ERR_UNDEFINED: u16 = 0;
const ERR_OPTION_REFUSED: u16 = 8;

type Result<T> = std::result::Result<T, TftpError>;

#[derive(Debug, thiserror::Error)]
pub enum TftpError {
    #[error("server error {code}: {message}")]
    Server { code: u16, message: String },
    #[error("malformed packet")]
    Malformed,
    #[error("unexpected packet with opcode {0}")]
    Unexpected(u16),
    #[error("no answer after {0} attempts")]
    TimedOut(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, PartialEq, Eq)]
enum Packet<'a> {
    Data { block: u16, payload: &'a [u8] },
    Ack(u16),
    Error { code: u16, message: String },
    OptionAck(HashMap<String, String>),
}

impl<'a> Packet<'a> {
    fn parse(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(TftpError::Malformed);
        }
        let opcode = be_u16(buf);
        let body = &buf[2..];
        match opcode {
            OP_DATA | OP_ACK | OP_ERROR if body.len() < 2 => Err(TftpError::Malformed),
            OP_DATA => Ok(Packet::Data {
                block: be_u16(body),
                payload: &body[2..],
            }),
            OP_ACK => Ok(Packet::Ack(be_u16(body))),
            OP_ERROR => Ok(Packet::Error {
                code: be_u16(body),
                message: fields(&body[2..]).into_iter().next().unwrap_or_default(),
            }),
            OP_OACK => Ok(Packet::OptionAck(
                fields(body)
                    .chunks_exact(2)
                    .map(|kv| (kv[0].to_ascii_lowercase(), kv[1].clone()))
                    .collect(),
            )),
            other => Err(TftpError::Unexpected(other)),
        }
    }

    fn opcode(&self) -> u16 {
        match self {
            Packet::Data { .. } => OP_DATA,
            Packet::Ack(_) => OP_ACK,
            Packet::Error { .. } => OP_ERROR,
            Packet::OptionAck(_) => OP_OACK,
        }
    }
}

fn be_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

// NUL terminated strings.
fn fields(body: &[u8]) -> Vec<String> {
    let body = body.strip_suffix(&[0u8]).unwrap_or(body);
    body.split(|&b| b == 0)
        .map(|f| String::from_utf8_lossy(f).into_owned())
        .collect()
}

fn read_request(path: &str, options: &[(&str, String)]) -> Vec<u8> {
    let mut buf = OP_RRQ.to_be_bytes().to_vec();
    let option_fields = options.iter().flat_map(|(k, v)| [*k, v.as_str()]);
    for field in [path, "octet"].into_iter().chain(option_fields) {
        buf.extend_from_slice(field.as_bytes());
        buf.push(0);
    }
    buf
}

fn ack(block: u16) -> Vec<u8> {
    [OP_ACK.to_be_bytes(), block.to_be_bytes()].concat()
}

fn error(code: u16, message: &str) -> Vec<u8> {
    let mut buf = [OP_ERROR.to_be_bytes(), code.to_be_bytes()].concat();
    buf.extend_from_slice(message.as_bytes());
    buf.push(0);
    buf
}

/// One transfer. The server answers from a fresh port, which becomes the
/// peer for the rest of the transfer.
struct Connection {
    socket: UdpSocket,
    server: SocketAddr,
    peer: Option<SocketAddr>,
    retries: usize,
    buf: Vec<u8>,
}

impl Connection {
    fn open(server: SocketAddr, timeout: Duration, retries: usize) -> Result<Self> {
        let local: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)?;
        socket.set_read_timeout(Some(timeout))?;
        Ok(Connection {
            socket,
            server,
            peer: None,
            retries,
            buf: vec![0u8; MAX_PACKET_SIZE],
        })
    }

    /// Sends `packet` and returns the length of the answer in `buf`.
    /// `packet` is sent again each time the answer times out.
    fn exchange(&mut self, packet: &[u8]) -> Result<usize> {
        for _ in 0..self.retries {
            self.socket
                .send_to(packet, self.peer.unwrap_or(self.server))?;
            loop {
                match self.socket.recv_from(&mut self.buf) {
                    Ok((len, from)) => match self.peer {
                        None if from.ip() == self.server.ip() => {
                            self.peer = Some(from);
                            return Ok(len);
                        }
                        Some(peer) if from == peer => return Ok(len),
                        _ => log::debug!("ignoring stray TFTP packet from {}", from),
                    },
                    Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                        break
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Err(TftpError::TimedOut(self.retries))
    }

    fn send(&self, packet: &[u8]) -> Result<()> {
        self.socket
            .send_to(packet, self.peer.unwrap_or(self.server))?;
        Ok(())
    }
}

/// Streams a file block by block, acknowledging each one as it is consumed.
pub struct TftpReader {
    conn: Connection,
    block_size: usize,
    block: u16,
    data: Vec<u8>,
    pos: usize,
    done: bool,
}

impl TftpReader {
    fn accept(&mut self, block: u16, payload: &[u8]) -> Result<()> {
        self.data.clear();
        self.data.extend_from_slice(payload);
        self.pos = 0;
        self.block = block;
        if payload.len() < self.block_size {
            self.done = true;
            self.conn.send(&ack(block))?;
        }
        Ok(())
    }

    fn next_block(&mut self) -> Result<()> {
        let expected = self.block.wrapping_add(1);
        loop {
            let len = self.conn.exchange(&ack(self.block))?;
            let (block, payload) = match Packet::parse(&self.conn.buf[..len])? {
                Packet::Data { block, payload } => (block, payload.to_vec()),
                Packet::Error { code, message } => return Err(TftpError::Server { code, message }),
                other => return Err(TftpError::Unexpected(other.opcode())),
            };
            // Anything else is a retransmission; acknowledging again is enough.
            if block == expected {
                return self.accept(block, &payload);
            }
        }
    }
}

impl Read for TftpReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        while self.pos == self.data.len() {
            if self.done {
                return Ok(0);
            }
            self.next_block()
                .map_err(|e| io::Error::new(ErrorKind::Other, e))?;
        }
        let n = out.len().min(self.data.len() - self.pos);
        out[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// `tftp://host[:port]/path` URLs. The size comes from the `tsize` option.
#[derive(Debug, Clone)]
pub struct TftpClient {
    timeout: Duration,
    retries: usize,
}

impl Default for TftpClient {
    fn default() -> Self {
        TftpClient {
            timeout: Duration::from_secs(5),
            retries: 5,
        }
    }
}

impl TftpClient {
    fn target(url: &Url) -> fetch::Result<(SocketAddr, String)> {
        let path = url.path().trim_start_matches('/');
        if path.is_empty() {
            return Err(FetchError::InvalidPath(url.clone()));
        }
        let server = url
            .socket_addrs(|| Some(DEFAULT_PORT))
            .map_err(|e| Self::tftp_err(url)(e.into()))?
            .into_iter()
            .next()
            .ok_or_else(|| FetchError::InvalidPath(url.clone()))?;
        Ok((server, path.to_owned()))
    }

    fn tftp_err(url: &Url) -> impl FnOnce(TftpError) -> FetchError + '_ {
        move |source| FetchError::Tftp {
            url: url.clone(),
            source,
        }
    }

    fn connect(&self, url: &Url, options: &[(&str, String)]) -> fetch::Result<(Connection, usize)> {
        let (server, path) = Self::target(url)?;
        let mut conn =
            Connection::open(server, self.timeout, self.retries).map_err(Self::tftp_err(url))?;
        let len = conn
            .exchange(&read_request(&path, options))
            .map_err(Self::tftp_err(url))?;
        Ok((conn, len))
    }
}

impl SchemeClient for TftpClient {
    fn size(&self, url: &Url) -> fetch::Result<u64> {
        let (conn, len) = self.connect(url, &[("tsize", "0".to_owned())])?;
        match Packet::parse(&conn.buf[..len]).map_err(Self::tftp_err(url))? {
            Packet::OptionAck(options) => {
                conn.send(&error(ERR_OPTION_REFUSED, "size query only"))
                    .map_err(Self::tftp_err(url))?;
                options
                    .get("tsize")
                    .and_then(|size| size.parse::<u64>().ok())
                    .ok_or_else(|| FetchError::UnknownSize(url.clone()))
            }
            Packet::Data { .. } => {
                conn.send(&error(ERR_UNDEFINED, "size query only"))
                    .map_err(Self::tftp_err(url))?;
                Err(FetchError::UnknownSize(url.clone()))
            }
            Packet::Error { code, message } => {
                Err(Self::tftp_err(url)(TftpError::Server { code, message }))
            }
            other => Err(Self::tftp_err(url)(TftpError::Unexpected(other.opcode()))),
        }
    }

    fn fetch(&self, url: &Url) -> fetch::Result<Box<dyn Read>> {
        let options = [("blksize", PREFERRED_BLOCK_SIZE.to_string())];
        let (conn, len) = self.connect(url, &options)?;

        let first = match Packet::parse(&conn.buf[..len]).map_err(Self::tftp_err(url))? {
            Packet::OptionAck(options) => {
                let block_size = options
                    .get("blksize")
                    .and_then(|size| size.parse::<usize>().ok())
                    .unwrap_or(DEFAULT_BLOCK_SIZE);
                Ok((block_size, None))
            }
            Packet::Data { block: 1, payload } => Ok((DEFAULT_BLOCK_SIZE, Some(payload.to_vec()))),
            Packet::Error { code, message } => Err(TftpError::Server { code, message }),
            other => Err(TftpError::Unexpected(other.opcode())),
        };
        let (block_size, payload) = first.map_err(Self::tftp_err(url))?;

        let mut reader = TftpReader {
            conn,
            block_size,
            block: 0,
            data: Vec::new(),
            pos: 0,
            done: false,
        };
        if let Some(payload) = payload {
            reader.accept(1, &payload).map_err(Self::tftp_err(url))?;
        }
        Ok(Box::new(reader))
    }
}
