//! relays unresolved queries to the upstream resolver over UDP
//!
//! Many client queries can be in flight at once, and UDP gives no ordering,
//! so responses are correlated by transaction ID. Every outgoing query has
//! its ID rewritten to a value that is unique among the queries currently
//! pending; a single receive thread reads the upstream socket and routes
//! each response to the waiting worker through a channel. The pending map
//! doubles as the set of IDs in use, so an ID can never be handed out twice
//! while its query is outstanding.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use derive_more::{Display, Error, From};
use parking_lot::Mutex;
use rand::random;

/// How long each attempt waits for the upstream to answer.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Total attempts per forwarded query.
pub const MAX_RETRIES: usize = 3;

#[derive(Debug, Display, From, Error)]
pub enum RelayError {
    Io(std::io::Error),
    TimeOut,
    ChannelClosed,
}

type Result<T> = std::result::Result<T, RelayError>;

pub struct DnsRelay {
    socket: Arc<UdpSocket>,
    upstream: SocketAddr,
    pending: Arc<Mutex<HashMap<u16, Sender<Vec<u8>>>>>,
    attempt_timeout: Duration,
    max_retries: usize,
}

impl DnsRelay {
    /// Bind an ephemeral socket for upstream traffic. The relay does not
    /// receive anything until `run` starts the receive thread.
    pub fn new(upstream: SocketAddr) -> Result<DnsRelay> {
        DnsRelay::with_timing(upstream, QUERY_TIMEOUT, MAX_RETRIES)
    }

    pub fn with_timing(
        upstream: SocketAddr,
        attempt_timeout: Duration,
        max_retries: usize,
    ) -> Result<DnsRelay> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).map_err(|e| {
            log::error!("failed to bind upstream relay socket: {}", e);
            e
        })?;

        Ok(DnsRelay {
            socket: Arc::new(socket),
            upstream,
            pending: Arc::new(Mutex::new(HashMap::new())),
            attempt_timeout,
            max_retries,
        })
    }

    /// Start the receive thread. Until it runs, no forwarded query will
    /// ever see a response.
    pub fn run(&self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let socket = self.socket.try_clone().map_err(RelayError::Io)?;
        socket.set_read_timeout(Some(Duration::from_millis(500)))?;
        let pending = self.pending.clone();
        let upstream = self.upstream;

        std::thread::Builder::new()
            .name("DnsRelay-recv".into())
            .spawn(move || loop {
                let mut buf = [0u8; 4096];
                let (length, src) = match socket.recv_from(&mut buf) {
                    Ok(x) => x,
                    Err(_) => {
                        if shutdown.load(Ordering::Acquire) {
                            return;
                        }
                        continue;
                    }
                };

                if src != upstream {
                    log::debug!("discarding datagram from unexpected source {}", src);
                    continue;
                }

                // too short to carry a header: no response for this attempt
                if length < 12 {
                    log::debug!("discarding undersized upstream datagram ({} octets)", length);
                    continue;
                }

                let id = u16::from_be_bytes([buf[0], buf[1]]);
                match pending.lock().get(&id) {
                    Some(tx) => {
                        let _ = tx.send(buf[..length].to_vec());
                    }
                    None => {
                        log::debug!("discarding upstream response with unknown id {}", id);
                    }
                }
            })
            .map_err(RelayError::Io)?;

        Ok(())
    }

    /// Forward a raw query upstream and wait for the matching response.
    ///
    /// The returned bytes are the upstream response with the client's
    /// original transaction ID restored, ready to send back verbatim.
    /// Send failures surface immediately; a silent upstream is retried
    /// up to the attempt limit before reporting a timeout.
    pub fn forward(&self, query: &[u8]) -> Result<Vec<u8>> {
        if query.len() < 12 {
            return Err(RelayError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "query shorter than a DNS header",
            )));
        }

        let client_id = u16::from_be_bytes([query[0], query[1]]);
        let (relay_id, rx) = self.register();

        let mut outgoing = query.to_vec();
        outgoing[0..2].copy_from_slice(&relay_id.to_be_bytes());

        let result = self.exchange(&outgoing, &rx);
        self.release(relay_id);

        let mut response = result?;
        response[0..2].copy_from_slice(&client_id.to_be_bytes());

        Ok(response)
    }

    /// Pick a transaction ID not currently pending and register a return
    /// channel for it. IDs are drawn at random so in-flight queries are
    /// hard to spoof.
    fn register(&self) -> (u16, Receiver<Vec<u8>>) {
        let (tx, rx) = channel();
        let mut pending = self.pending.lock();

        loop {
            let candidate = random::<u16>();
            if !pending.contains_key(&candidate) {
                pending.insert(candidate, tx);
                return (candidate, rx);
            }
        }
    }

    fn release(&self, relay_id: u16) {
        self.pending.lock().remove(&relay_id);
    }

    fn exchange(&self, outgoing: &[u8], rx: &Receiver<Vec<u8>>) -> Result<Vec<u8>> {
        for _ in 0..self.max_retries {
            self.socket.send_to(outgoing, self.upstream)?;

            match rx.recv_timeout(self.attempt_timeout) {
                Ok(response) => return Ok(response),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(RelayError::ChannelClosed),
            }
        }

        Err(RelayError::TimeOut)
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Instant;

    /// A scripted upstream: answers every well-formed query by echoing its
    /// transaction ID in front of a fixed payload.
    fn spawn_fake_upstream(respond: bool) -> (SocketAddr, Arc<AtomicUsize>) {
        let socket = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        let addr = socket.local_addr().unwrap();
        let queries_seen = Arc::new(AtomicUsize::new(0));

        let seen = queries_seen.clone();
        thread::spawn(move || loop {
            let mut buf = [0u8; 512];
            let (length, src) = match socket.recv_from(&mut buf) {
                Ok(x) => x,
                Err(_) => return,
            };
            seen.fetch_add(1, Ordering::SeqCst);

            if respond && length >= 12 {
                let mut response = vec![0u8; 12];
                response[0] = buf[0];
                response[1] = buf[1];
                response[2] = 0x80; // QR=1
                let _ = socket.send_to(&response, src);
            }
        });

        (addr, queries_seen)
    }

    fn sample_query(id: u16) -> Vec<u8> {
        let mut query = vec![0u8; 12];
        query[0..2].copy_from_slice(&id.to_be_bytes());
        query[2] = 0x01; // RD
        query
    }

    #[test]
    fn test_forward_restores_client_id() {
        let (upstream, _seen) = spawn_fake_upstream(true);
        let relay = DnsRelay::with_timing(upstream, Duration::from_millis(500), 2).unwrap();
        relay.run(Arc::new(AtomicBool::new(false))).unwrap();

        let response = relay.forward(&sample_query(0x1234)).unwrap();

        assert_eq!(0x12, response[0]);
        assert_eq!(0x34, response[1]);
        assert_eq!(0, relay.pending_len());
    }

    #[test]
    fn test_concurrent_forwards_correlate() {
        let (upstream, _seen) = spawn_fake_upstream(true);
        let relay = Arc::new(
            DnsRelay::with_timing(upstream, Duration::from_millis(1000), 2).unwrap(),
        );
        relay.run(Arc::new(AtomicBool::new(false))).unwrap();

        let mut handles = Vec::new();
        for i in 0..16u16 {
            let relay = relay.clone();
            handles.push(thread::spawn(move || {
                let client_id = 0x4000 + i;
                let response = relay.forward(&sample_query(client_id)).unwrap();
                assert_eq!(client_id.to_be_bytes(), [response[0], response[1]]);
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(0, relay.pending_len());
    }

    #[test]
    fn test_silent_upstream_times_out() {
        let (upstream, seen) = spawn_fake_upstream(false);
        let relay = DnsRelay::with_timing(upstream, Duration::from_millis(100), 3).unwrap();
        relay.run(Arc::new(AtomicBool::new(false))).unwrap();

        let started = Instant::now();
        match relay.forward(&sample_query(7)) {
            Err(RelayError::TimeOut) => {}
            other => panic!("expected TimeOut, got {:?}", other),
        }

        // every attempt went out before the relay gave up
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(3, seen.load(Ordering::SeqCst));
        assert_eq!(0, relay.pending_len());
    }

    #[test]
    fn test_stray_datagrams_are_discarded() {
        // an upstream that first sends garbage with the wrong id, then the
        // real response
        let socket = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        let upstream = socket.local_addr().unwrap();

        thread::spawn(move || {
            let mut buf = [0u8; 512];
            let (_, src) = socket.recv_from(&mut buf).unwrap();

            let mut stray = vec![0u8; 12];
            stray[0] = buf[0].wrapping_add(1);
            stray[1] = buf[1];
            socket.send_to(&stray, src).unwrap();
            socket.send_to(&[0u8; 4], src).unwrap();

            let mut genuine = vec![0u8; 12];
            genuine[0] = buf[0];
            genuine[1] = buf[1];
            genuine[2] = 0x80;
            socket.send_to(&genuine, src).unwrap();
        });

        let relay = DnsRelay::with_timing(upstream, Duration::from_millis(1000), 2).unwrap();
        relay.run(Arc::new(AtomicBool::new(false))).unwrap();

        let response = relay.forward(&sample_query(0xBEEF)).unwrap();
        assert_eq!([0xBE, 0xEF], [response[0], response[1]]);
    }
}
