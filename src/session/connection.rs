//! The per-socket session task.

use std::any::{Any, TypeId};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::TimeDelta;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use super::handshake::{clock_offset, HANDSHAKE_HEADER};
use super::{Phase, Phases, SessionContext, SessionError, SessionId};
use crate::hooks::{FrameInfo, Hooks};
use crate::packet::{codec, CodecError, PacketSchema, Record};
use crate::timer::EventId;

/// Initial receive buffer size.
pub const RECV_BUFFER_SIZE: usize = 4 * 1024;

/// Why a session was asked to close from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Requested,
    IdleTimeout,
    Shutdown,
}

enum Command {
    Send(Arc<PacketSchema>, Record),
    Close(CloseReason),
}

/// Cloneable, thread-safe way to reach a session from outside its task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    tx: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Send(schema, _) => write!(f, "Send({})", schema.name()),
            Command::Close(reason) => write!(f, "Close({reason:?})"),
        }
    }
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Queue a record for the session to encode and send, in order with
    /// everything else it sends.
    pub fn send(&self, schema: Arc<PacketSchema>, record: Record) -> Result<(), SessionError> {
        self.tx
            .send(Command::Send(schema, record))
            .map_err(|_| SessionError::Closed)
    }

    /// Ask the session to close. Returns false if it is already gone.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.tx.send(Command::Close(reason)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Session state for a single client connection
pub struct Session<P: Phases> {
    id: SessionId,
    peer: SocketAddr,
    phase: Phase<P>,
    in_sequence: u8,
    out_sequence: u8,
    clock_offset: TimeDelta,
    nonce: u32,
    handshake_time: u32,
    send_queue: VecDeque<Bytes>,
    ctx: Arc<SessionContext<P>>,
    handle: SessionHandle,
    commands: Option<mpsc::UnboundedReceiver<Command>>,
    idle_timer: Option<EventId>,
    close_requested: bool,
    fault: Option<CodecError>,
    attachments: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl<P: Phases> Session<P> {
    pub fn new(id: SessionId, peer: SocketAddr, ctx: Arc<SessionContext<P>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            id,
            peer,
            phase: Phase::Handshake,
            in_sequence: 0,
            out_sequence: 0,
            clock_offset: TimeDelta::zero(),
            nonce: 0,
            handshake_time: 0,
            send_queue: VecDeque::new(),
            ctx,
            handle: SessionHandle { id, tx },
            commands: Some(rx),
            idle_timer: None,
            close_requested: false,
            fault: None,
            attachments: HashMap::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn phase(&self) -> Phase<P> {
        self.phase
    }

    pub fn clock_offset(&self) -> TimeDelta {
        self.clock_offset
    }

    /// Next expected incoming counter.
    pub fn in_sequence(&self) -> u8 {
        self.in_sequence
    }

    /// Counter the next sequenced outgoing frame will carry.
    pub fn out_sequence(&self) -> u8 {
        self.out_sequence
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn context(&self) -> &Arc<SessionContext<P>> {
        &self.ctx
    }

    /// Current server tick in milliseconds.
    pub fn server_time(&self) -> u32 {
        self.ctx.clock.now_ms()
    }

    /// Convert a server tick into the client's clock using the handshake offset.
    pub fn to_client_time(&self, server_ms: u32) -> u32 {
        (i64::from(server_ms) - self.clock_offset.num_milliseconds()) as u32
    }

    /// Frames waiting to be written.
    pub fn queued(&self) -> usize {
        self.send_queue.len()
    }

    /// Encode `record` now and append it to the send queue.
    ///
    /// A record that does not fit its schema is a programming error: it is
    /// logged, returned, and the session closes once the current handler
    /// returns.
    pub fn send(&mut self, schema: &PacketSchema, record: Record) -> Result<(), SessionError> {
        if self.phase.is_closed() {
            return Err(SessionError::Closed);
        }
        if !schema.direction().is_outgoing() {
            return Err(self.fail(CodecError::SchemaMismatch {
                schema: schema.name(),
                reason: "schema is not outgoing".into(),
            }));
        }

        self.ctx.hooks.before_encode(self.id, schema, &record);
        let sequence = schema.has_sequence().then_some(self.out_sequence);
        let bytes = codec::encode(schema, &record, sequence).map_err(|e| self.fail(e))?;
        if sequence.is_some() {
            self.out_sequence = self.out_sequence.wrapping_add(1);
        }

        self.ctx.hooks.after_encode(&FrameInfo {
            session: self.id,
            header: schema.header(),
            sub_header: schema.sub_header(),
            len: bytes.len(),
        });
        self.send_queue.push_back(bytes);
        Ok(())
    }

    /// Move to the next application phase and tell the client.
    pub fn advance(&mut self, next: P) -> Result<(), SessionError> {
        match self.phase {
            Phase::Active(current) if current.can_advance_to(next) => self.enter(next),
            from => Err(SessionError::IllegalTransition {
                from: from.to_string(),
                to: format!("{next:?}"),
            }),
        }
    }

    /// Close after flushing what is already queued.
    pub fn close(&mut self) {
        self.close_requested = true;
    }

    pub fn is_closing(&self) -> bool {
        self.close_requested || self.phase.is_closed()
    }

    pub fn attach<T: Any + Send + Sync>(&mut self, value: T) {
        self.attachments.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn attachment<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.attachments.get(&TypeId::of::<T>())?.downcast_ref()
    }

    pub fn attachment_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        self.attachments.get_mut(&TypeId::of::<T>())?.downcast_mut()
    }

    pub fn detach<T: Any + Send + Sync>(&mut self) -> Option<T> {
        let boxed = self.attachments.remove(&TypeId::of::<T>())?;
        boxed.downcast().ok().map(|b| *b)
    }

    pub(crate) fn hooks(&self) -> &Hooks {
        &self.ctx.hooks
    }

    /// Verify and advance the incoming counter.
    pub(crate) fn check_sequence(&mut self, got: Option<u8>) -> Result<(), SessionError> {
        let Some(got) = got else {
            return Ok(());
        };
        if got != self.in_sequence {
            return Err(SessionError::Desync {
                expected: self.in_sequence,
                got,
            });
        }
        self.in_sequence = self.in_sequence.wrapping_add(1);
        Ok(())
    }

    /// Drive the connection until it closes. Consumes the session.
    pub async fn run<S>(mut self, stream: S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let Some(mut commands) = self.commands.take() else {
            return Err(SessionError::Closed);
        };
        let (mut reader, mut writer) = tokio::io::split(stream);
        tracing::info!("[session] [open] id={} peer={}", self.id, self.peer);

        let result = match self.begin_handshake() {
            Ok(()) => self.drive(&mut reader, &mut writer, &mut commands).await,
            Err(e) => Err(e),
        };

        self.finish(&result);
        let _ = writer.shutdown().await;
        result
    }

    async fn drive<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut rbuf = BytesMut::with_capacity(RECV_BUFFER_SIZE);
        loop {
            self.flush(writer).await?;
            if self.close_requested {
                return Ok(());
            }

            tokio::select! {
                read = reader.read_buf(&mut rbuf) => {
                    if read? == 0 {
                        tracing::debug!("[session] [eof] id={} buffered={}", self.id, rbuf.len());
                        return Ok(());
                    }
                    while let Some(frame) = self.next_frame(&mut rbuf)? {
                        self.process(frame).await?;
                        self.reset_idle_timer();
                        if let Some(fault) = self.fault.take() {
                            return Err(fault.into());
                        }
                        self.flush(writer).await?;
                        if self.close_requested {
                            return Ok(());
                        }
                    }
                }
                cmd = commands.recv() => match cmd {
                    Some(Command::Send(schema, record)) => self.send(&schema, record)?,
                    Some(Command::Close(reason)) => {
                        tracing::info!("[session] [close] id={} reason={:?}", self.id, reason);
                        if reason == CloseReason::IdleTimeout {
                            // Nothing owed to a client that went quiet.
                            self.send_queue.clear();
                        }
                        self.close_requested = true;
                    }
                    None => return Ok(()),
                }
            }
        }
    }

    /// Cut one complete frame off the front of `buf`, if one is buffered.
    ///
    /// The header byte (and sub-header when the registry says that header
    /// carries one) picks the schema; the schema then decides how many bytes
    /// make up the frame.
    fn next_frame(&self, buf: &mut BytesMut) -> Result<Option<Bytes>, SessionError> {
        let Some(&header) = buf.first() else {
            return Ok(None);
        };
        let registry = &self.ctx.registry;

        let schema = match self.phase {
            Phase::Handshake if header != HANDSHAKE_HEADER => {
                return Err(SessionError::HandshakeFailure(format!(
                    "expected handshake echo, got header {header:#04X}"
                )));
            }
            Phase::Handshake => registry.handshake_schema(),
            Phase::Active(_) => {
                let sub_header = match registry.uses_sub_header(header) {
                    None => return Err(SessionError::UnknownPacket { header, sub_header: None }),
                    Some(false) => None,
                    Some(true) => match buf.get(1) {
                        Some(&sub) => Some(sub),
                        None => return Ok(None),
                    },
                };
                &registry
                    .resolve(header, sub_header)
                    .ok_or(SessionError::UnknownPacket { header, sub_header })?
                    .schema
            }
            Phase::Closed => return Err(SessionError::Closed),
        };

        let Some(len) = codec::frame_len(schema, buf, self.ctx.limits.max_frame_size)? else {
            return Ok(None);
        };
        if buf.len() < len {
            return Ok(None);
        }
        Ok(Some(buf.split_to(len).freeze()))
    }

    async fn process(&mut self, frame: Bytes) -> Result<(), SessionError> {
        match self.phase {
            Phase::Handshake => self.complete_handshake(&frame),
            Phase::Active(_) => {
                let registry = Arc::clone(&self.ctx.registry);
                registry.dispatch(self, frame).await
            }
            Phase::Closed => Err(SessionError::Closed),
        }
    }

    fn begin_handshake(&mut self) -> Result<(), SessionError> {
        self.nonce = rand::random::<u32>();
        self.handshake_time = self.ctx.clock.now_ms();
        let schema = Arc::clone(self.ctx.registry.handshake_schema());
        let record = Record::new()
            .with("handshake", self.nonce)
            .with("time", self.handshake_time)
            .with("delta", 0u32);
        self.send(&schema, record)?;
        self.reset_idle_timer();
        Ok(())
    }

    fn complete_handshake(&mut self, frame: &[u8]) -> Result<(), SessionError> {
        let schema = Arc::clone(self.ctx.registry.handshake_schema());
        let info = FrameInfo {
            session: self.id,
            header: HANDSHAKE_HEADER,
            sub_header: None,
            len: frame.len(),
        };
        self.ctx.hooks.before_decode(&info);
        let decoded = codec::decode(&schema, frame)
            .map_err(|e| SessionError::HandshakeFailure(e.to_string()))?;
        self.ctx.hooks.after_decode(&info, &decoded.record);

        let field = |name: &str| {
            decoded
                .record
                .u32(name)
                .ok_or_else(|| SessionError::HandshakeFailure(format!("missing {name}")))
        };
        let echo = field("handshake")?;
        if echo != self.nonce {
            return Err(SessionError::HandshakeFailure(format!(
                "nonce mismatch: sent={:08X} got={:08X}",
                self.nonce, echo
            )));
        }
        self.clock_offset = clock_offset(self.handshake_time, field("time")?, field("delta")?);
        tracing::debug!(
            "[session] [handshake] id={} offset_ms={}",
            self.id,
            self.clock_offset.num_milliseconds()
        );
        self.enter(P::entry())
    }

    fn enter(&mut self, next: P) -> Result<(), SessionError> {
        let from = self.phase;
        self.phase = Phase::Active(next);
        tracing::debug!("[session] [phase] id={} from={} to={:?}", self.id, from, next);
        let schema = Arc::clone(self.ctx.registry.phase_schema());
        self.send(&schema, Record::new().with("phase", next.code()))
    }

    fn reset_idle_timer(&mut self) {
        let scheduler = &self.ctx.scheduler;
        if let Some(old) = self.idle_timer.take() {
            scheduler.cancel(old);
        }
        let timeout = match self.phase {
            Phase::Handshake => self.ctx.limits.handshake_timeout,
            _ => self.ctx.limits.idle_timeout,
        };
        let handle = self.handle.clone();
        let id = scheduler.enqueue(
            move || {
                if handle.close(CloseReason::IdleTimeout) {
                    tracing::warn!("[session] [timeout] id={}", handle.id());
                }
                std::time::Duration::ZERO
            },
            timeout,
        );
        self.idle_timer = Some(id);
    }

    fn fail(&mut self, err: CodecError) -> SessionError {
        tracing::error!("[session] [encode_bug] id={} {}", self.id, err);
        self.fault = Some(err.clone());
        SessionError::Codec(err)
    }

    async fn flush<W>(&mut self, writer: &mut W) -> Result<(), SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        if self.send_queue.is_empty() {
            return Ok(());
        }
        while let Some(frame) = self.send_queue.pop_front() {
            writer.write_all(&frame).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    fn finish(&mut self, result: &Result<(), SessionError>) {
        if let Some(timer) = self.idle_timer.take() {
            self.ctx.scheduler.cancel(timer);
        }
        self.send_queue.clear();
        self.phase = Phase::Closed;
        match result {
            Ok(()) => tracing::info!("[session] [closed] id={} peer={}", self.id, self.peer),
            Err(e) => tracing::warn!("[session] [closed] id={} peer={} error={}", self.id, self.peer, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{handler_fn, RegistryBuilder};
    use crate::packet::{FieldSpec, IntWidth};
    use crate::session::SessionLimits;
    use crate::timer::Scheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum TestPhase {
        Lobby,
        Play,
    }

    impl Phases for TestPhase {
        fn entry() -> Self {
            TestPhase::Lobby
        }

        fn can_advance_to(self, next: Self) -> bool {
            matches!((self, next), (TestPhase::Lobby, TestPhase::Play))
        }

        fn code(self) -> u8 {
            match self {
                TestPhase::Lobby => 1,
                TestPhase::Play => 2,
            }
        }
    }

    struct Harness {
        client: DuplexStream,
        task: tokio::task::JoinHandle<Result<(), SessionError>>,
        hits: Arc<AtomicUsize>,
        scheduler: Arc<Scheduler>,
        handle: SessionHandle,
        offset: Arc<std::sync::Mutex<Option<TimeDelta>>>,
    }

    fn ping_schema() -> Arc<PacketSchema> {
        PacketSchema::builder("ping", 0x10)
            .incoming()
            .sequenced()
            .field(FieldSpec::u8("n"))
            .build()
            .unwrap()
    }

    fn start() -> Harness {
        start_with(SessionLimits::default())
    }

    fn start_with(limits: SessionLimits) -> Harness {
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();
        let go = PacketSchema::builder("go", 0x20).incoming().build().unwrap();
        let say = PacketSchema::builder("say", 0x21)
            .incoming()
            .field(FieldSpec::size("len", IntWidth::U8, "text"))
            .field(FieldSpec::text("text"))
            .build()
            .unwrap();
        let fail = PacketSchema::builder("fail", 0x22).incoming().build().unwrap();
        let clock = PacketSchema::builder("clock", 0x23).incoming().build().unwrap();
        let clock_reply = PacketSchema::builder("clock_reply", 0x40)
            .outgoing()
            .field(FieldSpec::u32("server"))
            .field(FieldSpec::u32("client"))
            .build()
            .unwrap();
        let offset = Arc::new(std::sync::Mutex::new(None));
        let seen_offset = offset.clone();
        let registry = RegistryBuilder::new()
            .register(
                ping_schema(),
                handler_fn(move |_s: &mut Session<TestPhase>, _r: Record| {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .register(
                go,
                handler_fn(|s: &mut Session<TestPhase>, _r: Record| Ok(s.advance(TestPhase::Play)?)),
            )
            .register_in(
                say,
                handler_fn(|s: &mut Session<TestPhase>, _r: Record| {
                    s.close();
                    Ok(())
                }),
                &[TestPhase::Play],
            )
            .register(
                fail,
                handler_fn(|_s: &mut Session<TestPhase>, _r: Record| anyhow::bail!("handler broke")),
            )
            .register(
                clock,
                handler_fn(move |s: &mut Session<TestPhase>, _r: Record| {
                    *seen_offset.lock().unwrap() = Some(s.clock_offset());
                    let now = s.server_time();
                    let client = s.to_client_time(now);
                    s.send(&clock_reply, Record::new().with("server", now).with("client", client))?;
                    Ok(())
                }),
            )
            .build()
            .unwrap();

        let scheduler = Arc::new(Scheduler::new());
        let ctx = Arc::new(SessionContext::new(Arc::new(registry), scheduler.clone()).with_limits(limits));
        let (client, server) = tokio::io::duplex(4096);
        let session = Session::new(SessionId::new(1), "127.0.0.1:9".parse().unwrap(), ctx);
        let handle = session.handle();
        let task = tokio::spawn(session.run(server));
        Harness { client, task, hits, scheduler, handle, offset }
    }

    async fn handshake(client: &mut DuplexStream, delta: u32) {
        let mut hs = [0u8; 13];
        client.read_exact(&mut hs).await.unwrap();
        assert_eq!(hs[0], HANDSHAKE_HEADER);
        let mut echo = hs;
        echo[9..13].copy_from_slice(&delta.to_le_bytes());
        client.write_all(&echo).await.unwrap();

        let mut phase = [0u8; 2];
        client.read_exact(&mut phase).await.unwrap();
        assert_eq!(phase, [0xFE, 1]);
    }

    async fn assert_closed(client: &mut DuplexStream) {
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty(), "unexpected bytes after close: {rest:?}");
    }

    #[tokio::test]
    async fn test_sequenced_frames_dispatch_in_order() {
        let mut h = start();
        handshake(&mut h.client, 0).await;
        for seq in 0..5u8 {
            h.client.write_all(&[0x10, seq, seq]).await.unwrap();
        }
        // Unsequenced probe so the counter check is known to be done.
        h.client.write_all(&[0x20]).await.unwrap();
        let mut phase = [0u8; 2];
        h.client.read_exact(&mut phase).await.unwrap();
        assert_eq!(phase, [0xFE, 2]);
        assert_eq!(h.hits.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_handshake_offset_shifts_outbound_times() {
        let mut h = start();
        let mut hs = [0u8; 13];
        h.client.read_exact(&mut hs).await.unwrap();
        let server_time = u32::from_le_bytes(hs[5..9].try_into().unwrap());

        // Client clock 500ms behind, 20ms round trip.
        let mut echo = hs;
        echo[5..9].copy_from_slice(&server_time.wrapping_sub(500).to_le_bytes());
        echo[9..13].copy_from_slice(&20u32.to_le_bytes());
        h.client.write_all(&echo).await.unwrap();
        let mut phase = [0u8; 2];
        h.client.read_exact(&mut phase).await.unwrap();

        h.client.write_all(&[0x23]).await.unwrap();
        let mut reply = [0u8; 9];
        h.client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], 0x40);

        assert_eq!(*h.offset.lock().unwrap(), Some(TimeDelta::milliseconds(490)));
        let server = u32::from_le_bytes(reply[1..5].try_into().unwrap());
        let client = u32::from_le_bytes(reply[5..9].try_into().unwrap());
        assert_eq!(server.wrapping_sub(client), 490);
    }

    #[tokio::test]
    async fn test_replayed_counter_is_desync() {
        let mut h = start();
        handshake(&mut h.client, 0).await;
        h.client.write_all(&[0x10, 0, 0]).await.unwrap();
        h.client.write_all(&[0x10, 1, 1]).await.unwrap();
        h.client.write_all(&[0x10, 1, 1]).await.unwrap();
        let result = h.task.await.unwrap();
        assert!(matches!(result, Err(SessionError::Desync { expected: 2, got: 1 })));
        assert_eq!(h.hits.load(Ordering::SeqCst), 2);
        assert_closed(&mut h.client).await;
    }

    #[tokio::test]
    async fn test_bad_nonce_fails_handshake() {
        let mut h = start();
        let mut hs = [0u8; 13];
        h.client.read_exact(&mut hs).await.unwrap();
        hs[1] ^= 0xFF;
        h.client.write_all(&hs).await.unwrap();
        let result = h.task.await.unwrap();
        assert!(matches!(result, Err(SessionError::HandshakeFailure(_))));
    }

    #[tokio::test]
    async fn test_frames_before_handshake_are_rejected() {
        let mut h = start();
        let mut hs = [0u8; 13];
        h.client.read_exact(&mut hs).await.unwrap();
        h.client.write_all(&[0x10, 0, 0]).await.unwrap();
        let result = h.task.await.unwrap();
        assert!(matches!(result, Err(SessionError::HandshakeFailure(_))));
    }

    #[tokio::test]
    async fn test_unknown_header_closes() {
        let mut h = start();
        handshake(&mut h.client, 0).await;
        h.client.write_all(&[0x99]).await.unwrap();
        let result = h.task.await.unwrap();
        assert!(matches!(
            result,
            Err(SessionError::UnknownPacket { header: 0x99, sub_header: None })
        ));
    }

    #[tokio::test]
    async fn test_handler_error_keeps_connection_open() {
        let mut h = start();
        handshake(&mut h.client, 0).await;
        h.client.write_all(&[0x22]).await.unwrap();
        h.client.write_all(&[0x10, 0, 0]).await.unwrap();
        h.client.write_all(&[0x20]).await.unwrap();
        let mut phase = [0u8; 2];
        h.client.read_exact(&mut phase).await.unwrap();
        assert_eq!(phase, [0xFE, 2]);
        assert_eq!(h.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_out_of_phase_frame_is_dropped_not_fatal() {
        let mut h = start();
        handshake(&mut h.client, 0).await;
        // `say` is only accepted in Play; in Lobby it is consumed and ignored.
        h.client.write_all(&[0x21, 2, b'h', b'i']).await.unwrap();
        h.client.write_all(&[0x20]).await.unwrap();
        let mut phase = [0u8; 2];
        h.client.read_exact(&mut phase).await.unwrap();
        assert_eq!(phase, [0xFE, 2]);
        // Now in Play: `say` closes the session.
        h.client.write_all(&[0x21, 2, b'h', b'i']).await.unwrap();
        assert!(h.task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_oversized_dynamic_frame_is_invalid_length() {
        let limits = SessionLimits { max_frame_size: 16, ..SessionLimits::default() };
        let mut h = start_with(limits);
        handshake(&mut h.client, 0).await;
        h.client.write_all(&[0x20]).await.unwrap();
        let mut phase = [0u8; 2];
        h.client.read_exact(&mut phase).await.unwrap();
        // Rejected from the size prefix alone, before the body arrives.
        h.client.write_all(&[0x21, 0xC8]).await.unwrap();
        let result = h.task.await.unwrap();
        assert!(matches!(
            result,
            Err(SessionError::Codec(CodecError::InvalidLength { header: 0x21, declared: 200, .. }))
        ));
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let mut h = start();
        handshake(&mut h.client, 0).await;
        h.client.write_all(&[0x10]).await.unwrap();
        tokio::task::yield_now().await;
        h.client.write_all(&[0x00]).await.unwrap();
        tokio::task::yield_now().await;
        h.client.write_all(&[0x00, 0x20]).await.unwrap();
        let mut phase = [0u8; 2];
        h.client.read_exact(&mut phase).await.unwrap();
        assert_eq!(h.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_idle_timer_closes_session() {
        let mut h = start();
        handshake(&mut h.client, 0).await;
        assert_eq!(h.scheduler.pending(), 1);
        h.scheduler.tick(Duration::from_secs(61));
        assert!(h.task.await.unwrap().is_ok());
        assert_closed(&mut h.client).await;
        assert_eq!(h.scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn test_handle_send_and_close() {
        let mut h = start();
        handshake(&mut h.client, 0).await;
        let handle = h.handle.clone();
        let notice = PacketSchema::builder("notice", 0x30)
            .outgoing()
            .sequenced()
            .field(FieldSpec::u16("code"))
            .build()
            .unwrap();

        handle.send(notice.clone(), Record::new().with("code", 0x0102u16)).unwrap();
        handle.send(notice, Record::new().with("code", 0x0304u16)).unwrap();
        let mut out = [0u8; 8];
        h.client.read_exact(&mut out).await.unwrap();
        assert_eq!(out, [0x30, 0x02, 0x01, 0, 0x30, 0x04, 0x03, 1]);

        assert!(handle.close(CloseReason::Requested));
        assert!(h.task.await.unwrap().is_ok());
        assert!(handle.is_closed());
        assert!(matches!(
            handle.send(PacketSchema::builder("x", 0x31).outgoing().build().unwrap(), Record::new()),
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_attachments_by_type() {
        let registry = RegistryBuilder::<TestPhase>::new().build().unwrap();
        let ctx = Arc::new(SessionContext::new(Arc::new(registry), Arc::new(Scheduler::new())));
        let mut session = Session::new(SessionId::new(7), "127.0.0.1:9".parse().unwrap(), ctx);

        session.attach(42u32);
        session.attach(String::from("hero"));
        *session.attachment_mut::<u32>().unwrap() += 1;
        assert_eq!(session.attachment::<u32>(), Some(&43));
        assert_eq!(session.detach::<String>().as_deref(), Some("hero"));
        assert!(session.attachment::<String>().is_none());
    }
}
