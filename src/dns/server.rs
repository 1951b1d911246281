//! UDP server loop: receives client queries and answers them from the
//! cache, the override table, or the upstream relay
//!
//! Datagrams are read on a single thread and handed to a fixed pool of
//! worker threads through a condvar-guarded queue, so a slow upstream
//! never blocks the receive path or queries from other clients.

use std::collections::VecDeque;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::Builder;
use std::time::{Duration, Instant};

use derive_more::{Display, Error, From};

use crate::dns::buffer::{BytePacketBuffer, PacketBuffer, VectorPacketBuffer};
use crate::dns::cache::{self, CacheKey, MAX_TTL};
use crate::dns::context::ServerContext;
use crate::dns::overrides::OverrideResult;
use crate::dns::protocol::{DnsPacket, DnsRecord, QueryType, ResultCode, TransientTtl};
use crate::dns::relay::RelayError;

#[derive(Debug, Display, From, Error)]
pub enum ServerError {
    Io(std::io::Error),
    Relay(RelayError),
}

type Result<T> = std::result::Result<T, ServerError>;

/// Common trait for DNS servers
pub trait DnsServer {
    /// Initialize the server and start listening
    ///
    /// This method should _NOT_ block. Rather, servers are expected to
    /// spawn threads to handle requests and return immediately.
    fn run_server(self) -> Result<()>;
}

/// Where an answer came from, for the per-query log line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AnswerSource {
    Cache,
    Local,
    Blackhole,
    Upstream,
}

impl fmt::Display for AnswerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            AnswerSource::Cache => write!(f, "cache"),
            AnswerSource::Local => write!(f, "local"),
            AnswerSource::Blackhole => write!(f, "blackhole"),
            AnswerSource::Upstream => write!(f, "upstream"),
        }
    }
}

/// Build a reply skeleton from the request: same transaction ID, opcode
/// and RD flag, with the question section echoed back.
fn build_reply(request: &DnsPacket, answers: Vec<DnsRecord>, rescode: ResultCode) -> DnsPacket {
    let mut packet = DnsPacket::new();
    packet.header.id = request.header.id;
    packet.header.opcode = request.header.opcode;
    packet.header.recursion_desired = request.header.recursion_desired;
    packet.header.recursion_available = true;
    packet.header.authoritative_answer = true;
    packet.header.response = true;
    packet.header.rescode = rescode;
    packet.questions = request.questions.clone();
    packet.answers = answers;
    packet
}

/// The sentinel answer for a blackholed name: the null address of the
/// queried family.
fn blackhole_answers(qname: &str, qtype: QueryType, ttl: u32) -> Vec<DnsRecord> {
    match qtype {
        QueryType::A => vec![DnsRecord::A {
            domain: qname.to_string(),
            addr: Ipv4Addr::UNSPECIFIED,
            ttl: TransientTtl(ttl),
        }],
        QueryType::Aaaa => vec![DnsRecord::Aaaa {
            domain: qname.to_string(),
            addr: Ipv6Addr::UNSPECIFIED,
            ttl: TransientTtl(ttl),
        }],
        _ => Vec::new(),
    }
}

/// The UDP server
///
/// Accepts DNS queries through UDP, and uses the `ServerContext` to
/// determine how to service the request. Packets are read on a single
/// thread, and parsed and answered on one of a fixed number of worker
/// threads.
pub struct DnsUdpServer {
    context: Arc<ServerContext>,
    request_queue: Arc<Mutex<VecDeque<(SocketAddr, Vec<u8>)>>>,
    request_cond: Arc<Condvar>,
    thread_count: usize,
}

impl DnsUdpServer {
    pub fn new(context: Arc<ServerContext>, thread_count: usize) -> DnsUdpServer {
        DnsUdpServer {
            context,
            request_queue: Arc::new(Mutex::new(VecDeque::new())),
            request_cond: Arc::new(Condvar::new()),
            thread_count,
        }
    }

    /// Send a minimal error response carrying only the transaction ID and
    /// the result code.
    fn send_error_response(
        socket: &UdpSocket,
        src: SocketAddr,
        query_id: u16,
        error_code: ResultCode,
    ) {
        let mut error_packet = DnsPacket::new();
        error_packet.header.id = query_id;
        error_packet.header.response = true;
        error_packet.header.rescode = error_code;

        Self::send_packet(socket, src, &mut error_packet);
    }

    fn send_packet(socket: &UdpSocket, src: SocketAddr, packet: &mut DnsPacket) {
        let mut res_buffer = VectorPacketBuffer::new();
        if let Err(e) = packet.write(&mut res_buffer) {
            log::warn!("failed to encode response for {}: {}", src, e);
            return;
        }

        let len = res_buffer.pos();
        let data = match res_buffer.get_range(0, len) {
            Ok(data) => data,
            Err(e) => {
                log::warn!("failed to read back response buffer: {}", e);
                return;
            }
        };

        if let Err(e) = socket.send_to(data, src) {
            log::error!("failed to send response to {}: {}", src, e);
        }
    }

    /// Perform the work for one query: steps cache, overrides, relay.
    fn process_request(
        socket: &UdpSocket,
        context: &Arc<ServerContext>,
        src: SocketAddr,
        data: &[u8],
    ) {
        let start = Instant::now();

        // too short to even carry a header: nothing to echo, drop it
        if data.len() < 12 {
            log::warn!("dropping undersized query from {} ({} octets)", src, data.len());
            return;
        }

        let mut req_buffer = BytePacketBuffer::new();
        req_buffer.buf[..data.len()].copy_from_slice(data);
        let request = match DnsPacket::from_buffer(&mut req_buffer) {
            Ok(packet) => {
                // section counts claiming data beyond the datagram read
                // into buffer padding; reject that as malformed too
                if req_buffer.pos > data.len() {
                    log::warn!("query from {} is shorter than its section counts claim", src);
                    let id = u16::from_be_bytes([data[0], data[1]]);
                    Self::send_error_response(socket, src, id, ResultCode::FORMERR);
                    return;
                }
                packet
            }
            Err(e) => {
                log::warn!("dropping malformed query from {}: {}", src, e);
                let id = u16::from_be_bytes([data[0], data[1]]);
                Self::send_error_response(socket, src, id, ResultCode::FORMERR);
                return;
            }
        };

        let question = match request.questions.first() {
            Some(question) => question.clone(),
            None => {
                log::warn!("query from {} carries no question", src);
                Self::send_error_response(socket, src, request.header.id, ResultCode::FORMERR);
                return;
            }
        };

        let qname = question.name.clone();
        let key = CacheKey::new(&qname, question.qtype, question.class);

        // cache first
        if let Some(cached) = context.cache.get(&key) {
            context.statistics.cache_hits.fetch_add(1, Ordering::Release);

            let answers = cached
                .answers
                .into_iter()
                .map(|rec| rec.with_ttl(cached.remaining_ttl))
                .collect();
            let mut packet = build_reply(&request, answers, ResultCode::NOERROR);
            Self::send_packet(socket, src, &mut packet);

            Self::log_query(src, &qname, question.qtype, AnswerSource::Cache, start);
            return;
        }

        // then the override table
        let overrides = context.overrides.current();
        match overrides.query(&qname, question.qtype) {
            OverrideResult::Hit(mut answers) => {
                if let Some(id) = overrides.internal_id(&qname) {
                    answers.push(DnsRecord::Txt {
                        domain: qname.clone(),
                        data: format!("internal-id:{}", id),
                        ttl: TransientTtl(context.cache_ttl),
                    });
                }

                context.cache.put(key, answers.clone(), context.cache_ttl);

                let mut packet = build_reply(&request, answers, ResultCode::NOERROR);
                Self::send_packet(socket, src, &mut packet);

                Self::log_query(src, &qname, question.qtype, AnswerSource::Local, start);
                return;
            }
            OverrideResult::Blackhole => {
                if context.blackhole_nxdomain {
                    let mut packet = build_reply(&request, Vec::new(), ResultCode::NXDOMAIN);
                    Self::send_packet(socket, src, &mut packet);
                } else {
                    let answers = blackhole_answers(&qname, question.qtype, context.cache_ttl);
                    context.cache.put(key, answers.clone(), context.cache_ttl);

                    let mut packet = build_reply(&request, answers, ResultCode::NOERROR);
                    Self::send_packet(socket, src, &mut packet);
                }

                Self::log_query(src, &qname, question.qtype, AnswerSource::Blackhole, start);
                return;
            }
            OverrideResult::Miss => {}
        }

        // finally the upstream
        context
            .statistics
            .upstream_queries
            .fetch_add(1, Ordering::Release);

        match context.relay.forward(data) {
            Ok(response) => {
                // pass the upstream response through verbatim; the relay
                // already restored the client's transaction ID
                if let Err(e) = socket.send_to(&response, src) {
                    log::error!("failed to send response to {}: {}", src, e);
                }

                Self::cache_upstream_response(context, key, &response);
                Self::log_query(src, &qname, question.qtype, AnswerSource::Upstream, start);
            }
            Err(RelayError::TimeOut) => {
                log::warn!("upstream query for {} timed out", qname);
                Self::send_error_response(socket, src, request.header.id, ResultCode::SERVFAIL);
            }
            Err(e) => {
                log::warn!("relay failed for {}: {}", qname, e);
                Self::send_error_response(socket, src, request.header.id, ResultCode::SERVFAIL);
            }
        }
    }

    /// Parse a relayed response and cache its answers. Responses that do
    /// not parse, carry an error code or answer nothing are forwarded to
    /// the client but not cached.
    fn cache_upstream_response(context: &Arc<ServerContext>, key: CacheKey, response: &[u8]) {
        if response.len() > 512 {
            return;
        }

        let mut res_buffer = BytePacketBuffer::new();
        res_buffer.buf[..response.len()].copy_from_slice(response);

        let parsed = match DnsPacket::from_buffer(&mut res_buffer) {
            Ok(packet) => {
                if res_buffer.pos > response.len() {
                    log::warn!(
                        "upstream response for {} is shorter than its section counts claim",
                        key.qname
                    );
                    return;
                }
                packet
            }
            Err(e) => {
                log::warn!("upstream response for {} does not parse: {}", key.qname, e);
                return;
            }
        };

        if parsed.header.rescode != ResultCode::NOERROR || parsed.answers.is_empty() {
            return;
        }

        if let Some(min_ttl) = parsed.min_answer_ttl() {
            let ttl = min_ttl.clamp(cache::MIN_TTL, MAX_TTL.min(context.cache_ttl));
            context.cache.put(key, parsed.answers, ttl);
        }
    }

    fn log_query(
        src: SocketAddr,
        qname: &str,
        qtype: QueryType,
        source: AnswerSource,
        start: Instant,
    ) {
        log::debug!(
            "{} {} {:?} source={} elapsed={}ms",
            src,
            qname,
            qtype,
            source,
            start.elapsed().as_millis()
        );
    }

    /// Spawn a worker thread feeding off the shared request queue.
    fn spawn_request_handler(&self, thread_id: usize, socket: UdpSocket) -> std::io::Result<()> {
        let context = self.context.clone();
        let request_cond = self.request_cond.clone();
        let request_queue = self.request_queue.clone();

        let name = format!("DnsUdpServer-request-{}", thread_id);
        Builder::new().name(name).spawn(move || loop {
            let job = {
                let mut queue = match request_queue.lock() {
                    Ok(queue) => queue,
                    Err(_) => return,
                };

                loop {
                    if let Some(job) = queue.pop_front() {
                        break Some(job);
                    }
                    if context.is_shutdown() {
                        break None;
                    }
                    queue = match request_cond
                        .wait_timeout(queue, Duration::from_millis(500))
                    {
                        Ok((guard, _)) => guard,
                        Err(_) => return,
                    };
                }
            };

            match job {
                Some((src, data)) => Self::process_request(&socket, &context, src, &data),
                None => return,
            }
        })?;

        Ok(())
    }

    /// Spawn the thread that reads client datagrams and fills the queue.
    fn spawn_incoming_handler(self, socket: UdpSocket) -> std::io::Result<()> {
        Builder::new()
            .name("DnsUdpServer-incoming".into())
            .spawn(move || loop {
                if self.context.is_shutdown() {
                    self.request_cond.notify_all();
                    return;
                }

                let mut req_buffer = BytePacketBuffer::new();
                let (length, src) = match socket.recv_from(&mut req_buffer.buf) {
                    Ok(x) => x,
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        continue;
                    }
                    Err(e) => {
                        log::error!("failed to read from client socket: {}", e);
                        continue;
                    }
                };

                self.context
                    .statistics
                    .query_count
                    .fetch_add(1, Ordering::Release);

                match self.request_queue.lock() {
                    Ok(mut queue) => {
                        queue.push_back((src, req_buffer.buf[..length].to_vec()));
                        self.request_cond.notify_one();
                    }
                    Err(e) => {
                        log::error!("failed to enqueue request: {}", e);
                    }
                }
            })?;

        Ok(())
    }
}

impl DnsServer for DnsUdpServer {
    fn run_server(self) -> Result<()> {
        let socket = UdpSocket::bind(self.context.local_addr).map_err(|e| {
            log::error!("failed to bind {}: {}", self.context.local_addr, e);
            e
        })?;
        socket.set_read_timeout(Some(Duration::from_millis(500)))?;

        self.context.relay.run(self.context.shutdown.clone())?;

        cache::spawn_sweeper(
            self.context.cache.clone(),
            self.context.sweep_interval,
            self.context.shutdown.clone(),
        )?;

        for thread_id in 0..self.thread_count {
            self.spawn_request_handler(thread_id, socket.try_clone()?)?;
        }

        log::info!(
            "dns server listening on {} with {} workers, forwarding to {}",
            self.context.local_addr,
            self.thread_count,
            self.context.upstream_addr
        );

        self.spawn_incoming_handler(socket)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use crate::dns::protocol::DnsQuestion;

    fn sample_request() -> DnsPacket {
        let mut request = DnsPacket::new();
        request.header.id = 0xABCD;
        request.header.recursion_desired = true;
        request
            .questions
            .push(DnsQuestion::new("www.example.com".to_string(), QueryType::A));
        request
    }

    #[test]
    fn test_build_reply_echoes_request() {
        let request = sample_request();
        let answers = vec![DnsRecord::A {
            domain: "www.example.com".to_string(),
            addr: "10.0.0.1".parse().unwrap(),
            ttl: TransientTtl(60),
        }];

        let reply = build_reply(&request, answers, ResultCode::NOERROR);

        assert_eq!(0xABCD, reply.header.id);
        assert!(reply.header.response);
        assert!(reply.header.recursion_desired);
        assert!(reply.header.recursion_available);
        assert_eq!(ResultCode::NOERROR, reply.header.rescode);
        assert_eq!(request.questions, reply.questions);
        assert_eq!(1, reply.answers.len());
    }

    #[test]
    fn test_build_reply_servfail() {
        let request = sample_request();
        let reply = build_reply(&request, Vec::new(), ResultCode::SERVFAIL);

        assert_eq!(ResultCode::SERVFAIL, reply.header.rescode);
        assert!(reply.answers.is_empty());
    }

    #[test]
    fn test_blackhole_answers() {
        let a = blackhole_answers("ads.example.com", QueryType::A, 60);
        match &a[0] {
            DnsRecord::A { addr, .. } => assert_eq!(Ipv4Addr::UNSPECIFIED, *addr),
            other => panic!("expected A record, got {:?}", other),
        }

        let aaaa = blackhole_answers("ads.example.com", QueryType::Aaaa, 60);
        match &aaaa[0] {
            DnsRecord::Aaaa { addr, .. } => assert_eq!(Ipv6Addr::UNSPECIFIED, *addr),
            other => panic!("expected AAAA record, got {:?}", other),
        }
    }

    #[test]
    fn test_reply_roundtrips_on_the_wire() {
        let request = sample_request();
        let mut reply = build_reply(
            &request,
            vec![DnsRecord::A {
                domain: "www.example.com".to_string(),
                addr: "10.0.0.1".parse().unwrap(),
                ttl: TransientTtl(60),
            }],
            ResultCode::NOERROR,
        );

        let mut buffer = VectorPacketBuffer::new();
        reply.write(&mut buffer).unwrap();
        buffer.seek(0).unwrap();

        let parsed = DnsPacket::from_buffer(&mut buffer).unwrap();
        assert_eq!(0xABCD, parsed.header.id);
        assert_eq!(1, parsed.answers.len());
        assert_eq!(1, parsed.questions.len());
    }
}
