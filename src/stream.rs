//! Buffered byte channel over a TCP socket with in-place TLS/DEFLATE/Snappy
//! upgrade.
//!
//! Grounded on the reference client's `Stream`: a page-sized recv loop
//! feeding an internal buffer, a lock around `send` to serialize writes,
//! and `consume_buffer` to carry already-read-but-unparsed bytes across an
//! upgrade. Here the buffer lives on `Stream` itself and is never touched
//! by a transport or compression swap, so "feeding the residue into the
//! new decoder" falls out for free: unconsumed bytes are always served
//! from `buffer` before any new bytes are pulled through the (possibly
//! just-upgraded) transport.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::{Compress, Decompress, FlushCompress, FlushDecompress};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::error::{NsqError, Result};

const RECV_CHUNK: usize = 16 * 1024;

/// Feed for `snap`'s `FrameDecoder`: bytes read off the wire are queued
/// here as they arrive, and drained as the decoder consumes them. Reading
/// an empty queue returns `WouldBlock` rather than `Ok(0)`, since the
/// framed format has no length prefix telling us to wait for the rest of
/// a chunk that hasn't arrived yet — `Ok(0)` would read as permanent EOF.
struct RawFeed {
    queue: VecDeque<u8>,
}

impl RawFeed {
    fn new() -> Self {
        RawFeed { queue: VecDeque::new() }
    }
}

impl Read for RawFeed {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.queue.is_empty() {
            return Err(std::io::Error::new(std::io::ErrorKind::WouldBlock, "no data buffered yet"));
        }
        let n = buf.len().min(self.queue.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.queue.pop_front().unwrap();
        }
        Ok(n)
    }
}

/// Feeds `input` through a persistent `Decompress`, looping until every
/// byte has been consumed (a single call may only partially drain its
/// input). Stops early if a call makes no progress at all, rather than
/// spinning forever on malformed input.
fn decompress_chunk(decompress: &mut Decompress, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let mut consumed = 0usize;
    while consumed < input.len() {
        let before_in = decompress.total_in();
        let before_out = decompress.total_out();
        decompress
            .decompress_vec(&input[consumed..], out, FlushDecompress::None)
            .map_err(|e| NsqError::SocketError(e.to_string()))?;
        let progressed_in = (decompress.total_in() - before_in) as usize;
        let progressed_out = decompress.total_out() - before_out;
        consumed += progressed_in;
        if progressed_in == 0 && progressed_out == 0 {
            break;
        }
    }
    Ok(())
}

enum Transport {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Transport {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Transport::Plain(s) => s.read(buf).await?,
            Transport::Tls(s) => s.read(buf).await?,
        };
        if n == 0 {
            return Err(NsqError::SocketError("connection closed".into()));
        }
        Ok(n)
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match self {
            Transport::Plain(s) => s.write_all(buf).await?,
            Transport::Tls(s) => s.write_all(buf).await?,
        };
        Ok(())
    }
}

/// Holds the persistent, stateful (de)compressor for whichever algorithm
/// was negotiated: a DEFLATE or Snappy stream is one continuous sequence
/// of blocks/frames across the connection's lifetime, not an independent
/// compressed document per socket read.
enum Compression {
    None,
    Deflate {
        decompress: Decompress,
        compress: Compress,
    },
    Snappy {
        decoder: snap::read::FrameDecoder<RawFeed>,
        encoder: snap::write::FrameEncoder<Vec<u8>>,
    },
}

/// The NSQ connection's byte-level transport: a TCP socket optionally
/// wrapped in TLS, optionally wrapped again in a compression layer.
pub struct Stream {
    transport: Option<Transport>,
    compression: Compression,
    buffer: BytesMut,
    deadline: Duration,
}

impl Stream {
    pub async fn connect(addr: &str, deadline: Duration) -> Result<Stream> {
        let tcp = timeout(deadline, TcpStream::connect(addr))
            .await
            .map_err(|_| NsqError::SocketError("connect timed out".into()))??;
        tcp.set_nodelay(true).ok();
        Ok(Stream {
            transport: Some(Transport::Plain(tcp)),
            compression: Compression::None,
            buffer: BytesMut::new(),
            deadline,
        })
    }

    fn transport_mut(&mut self) -> &mut Transport {
        self.transport.as_mut().expect("transport always present between calls")
    }

    /// Reads exactly `n` bytes, serving already-buffered residue first.
    pub async fn read_exact(&mut self, n: usize) -> Result<Bytes> {
        while self.buffer.len() < n {
            self.fill_buffer().await?;
        }
        Ok(self.buffer.split_to(n).freeze())
    }

    async fn fill_buffer(&mut self) -> Result<()> {
        let mut raw = vec![0u8; RECV_CHUNK];
        let n = timeout(self.deadline, self.transport_mut().read_chunk(&mut raw))
            .await
            .map_err(|_| NsqError::SocketError("read timed out".into()))??;
        raw.truncate(n);

        match &mut self.compression {
            Compression::None => {
                self.buffer.extend_from_slice(&raw);
            }
            Compression::Deflate { decompress, .. } => {
                let mut out = Vec::new();
                decompress_chunk(decompress, &raw, &mut out)?;
                self.buffer.extend_from_slice(&out);
            }
            Compression::Snappy { decoder, .. } => {
                decoder.get_mut().queue.extend(raw);
                let mut out = Vec::new();
                let mut chunk = [0u8; RECV_CHUNK];
                loop {
                    match decoder.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => out.extend_from_slice(&chunk[..n]),
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(NsqError::SocketError(e.to_string())),
                    }
                }
                self.buffer.extend_from_slice(&out);
            }
        }

        Ok(())
    }

    /// Atomically delivers the full payload; callers must hold the
    /// session-level write lock so no two sends interleave on the wire.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        let wire = match &mut self.compression {
            Compression::None => data.to_vec(),
            Compression::Deflate { compress, .. } => {
                let mut out = Vec::new();
                // Sync-flush every send: this is a request/response wire
                // protocol, so each command must land fully on the wire
                // rather than sitting in the compressor's internal buffer
                // waiting for more input to accumulate.
                compress
                    .compress_vec(data, &mut out, FlushCompress::Sync)
                    .map_err(|e| NsqError::SocketError(e.to_string()))?;
                out
            }
            Compression::Snappy { encoder, .. } => {
                encoder
                    .write_all(data)
                    .map_err(|e| NsqError::SocketError(e.to_string()))?;
                encoder.flush().map_err(|e| NsqError::SocketError(e.to_string()))?;
                std::mem::take(encoder.get_mut())
            }
        };
        timeout(self.deadline, self.transport_mut().write_all(&wire))
            .await
            .map_err(|_| NsqError::SocketError("write timed out".into()))??;
        Ok(())
    }

    /// Upgrades the raw socket to TLS. Must be called before any
    /// compression upgrade (§4.2 ordering). Buffered residue is
    /// untouched: it stays in `self.buffer` across the transport swap.
    pub async fn upgrade_to_tls(&mut self, connector: TlsConnector, domain: rustls::ServerName) -> Result<()> {
        let tcp = match self.transport.take() {
            Some(Transport::Plain(tcp)) => tcp,
            other => {
                self.transport = other;
                return Err(NsqError::Invalid);
            }
        };
        let tls = connector
            .connect(domain, tcp)
            .await
            .map_err(|e| NsqError::SocketError(e.to_string()))?;
        self.transport = Some(Transport::Tls(Box::new(tls)));
        Ok(())
    }

    pub fn upgrade_to_deflate(&mut self) {
        self.compression = Compression::Deflate {
            decompress: Decompress::new(false),
            compress: Compress::new(flate2::Compression::default(), false),
        };
    }

    pub fn upgrade_to_snappy(&mut self) {
        self.compression = Compression::Snappy {
            decoder: snap::read::FrameDecoder::new(RawFeed::new()),
            encoder: snap::write::FrameEncoder::new(Vec::new()),
        };
    }

    pub async fn close(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            match transport {
                Transport::Plain(s) => {
                    let _ = s.shutdown().await;
                }
                Transport::Tls(s) => {
                    let _ = s.shutdown().await;
                }
            }
        }
    }
}

pub fn default_tls_connector(danger_accept_invalid_certs: bool) -> Result<TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    let mut config = rustls::ClientConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| NsqError::SocketError(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    if danger_accept_invalid_certs {
        #[cfg(feature = "dangerous_configuration")]
        {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(danger::NoVerifier));
        }
    }

    Ok(TlsConnector::from(Arc::new(config)))
}

#[cfg(feature = "dangerous_configuration")]
mod danger {
    pub struct NoVerifier;

    impl rustls::client::ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls::Certificate,
            _intermediates: &[rustls::Certificate],
            _server_name: &rustls::ServerName,
            _scts: &mut dyn Iterator<Item = &[u8]>,
            _ocsp_response: &[u8],
            _now: std::time::SystemTime,
        ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
            Ok(rustls::client::ServerCertVerified::assertion())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deflate_round_trip() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut encoder = DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut decoder = DeflateDecoder::new(&compressed[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(&out, data);
    }

    #[test]
    fn snappy_round_trip() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut encoder = snap::write::FrameEncoder::new(Vec::new());
        encoder.write_all(data).unwrap();
        let compressed = encoder.into_inner().unwrap();

        let mut decoder = snap::read::FrameDecoder::new(&compressed[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(&out, data);
    }
}
