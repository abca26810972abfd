use crate::events::{Events, PacketContext};
use crate::packet::{ids, Packet, PacketError, PacketReader, PacketWriter};
use log::{debug, error, info, trace, warn};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// 代理公告使用的聊天位置（游戏信息栏）。
const MESSAGE_POSITION: i8 = 2;

/// 一个代表会话标识的类型。
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct SessionId(u64);

impl SessionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for SessionId {
    fn from(val: u64) -> Self {
        Self(val)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 一个代表会话协议阶段的枚举，仅用于观察。
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionState {
    Status = 1,
    Login = 2,
    Play = 3,
}

impl From<u8> for SessionState {
    fn from(val: u8) -> Self {
        match val {
            2 => Self::Login,
            3 => Self::Play,
            _ => Self::Status,
        }
    }
}

/// 一个代表会话两端地址的类型。
#[derive(Copy, Clone, Debug)]
pub struct SessionPeers {
    pub client: SocketAddr,
    pub server: SocketAddr,
}

// 由 `run()` 交给转发循环的读取端
struct SessionIo {
    client: PacketReader<BoxedReader>,
    server: PacketReader<BoxedReader>,
}

/// 一个代表连接写入端的类型，由转发循环、处理器注入和 `send_message` 共享。
struct Connection {
    name: &'static str,
    writer: tokio::sync::Mutex<Option<PacketWriter<BoxedWriter>>>,
}

impl Connection {
    fn new(name: &'static str, writer: BoxedWriter) -> Self {
        Self {
            name,
            writer: tokio::sync::Mutex::new(Some(PacketWriter::new(writer))),
        }
    }

    async fn send(&self, packet: &Packet, closer: &CancellationToken) -> Result<(), PacketError> {
        let mut guard = self.writer.lock().await;
        let result = match guard.as_mut() {
            Some(writer) if !closer.is_cancelled() => {
                tokio::select! {
                    biased;
                    _ = closer.cancelled() => Err(PacketError::Closed),
                    r = writer.write_packet(packet) => r,
                }
            }
            _ => Err(PacketError::Closed),
        };
        // kill() 拿不到锁时由持有者释放写入端
        if closer.is_cancelled() {
            guard.take();
        }
        result
    }

    fn try_close(&self) {
        if let Ok(mut guard) = self.writer.try_lock() {
            guard.take();
        }
    }
}

/// 一个代表代理会话的类型，包含客户端连接及其上游连接。
pub struct Session {
    id: SessionId,
    peers: SessionPeers,
    start_time: SystemTime,
    started: Instant,
    state: AtomicU8,
    events: Arc<Events>,
    client: Connection,
    server: Connection,
    io: Mutex<Option<SessionIo>>,
    closer: CancellationToken,
    closed: AtomicBool,
}

impl Session {
    /// 基于已接收的客户端连接和已连接的上游创建会话。
    /// 调用 `run()` 之前不会转发任何数据。
    pub fn open<C, S>(
        id: SessionId,
        client: C,
        server: S,
        peers: SessionPeers,
        events: Arc<Events>,
    ) -> Arc<Self>
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (client_reader, client_writer) = tokio::io::split(client);
        let (server_reader, server_writer) = tokio::io::split(server);
        let client_reader: BoxedReader = Box::new(client_reader);
        let server_reader: BoxedReader = Box::new(server_reader);

        info!("[{}] accepted connection from {}", id, peers.client);
        info!("[{}] connected to backend on {}", id, peers.server);

        Arc::new(Self {
            id,
            peers,
            start_time: SystemTime::now(),
            started: Instant::now(),
            state: AtomicU8::new(SessionState::Status as u8),
            events,
            client: Connection::new("client", Box::new(client_writer)),
            server: Connection::new("server", Box::new(server_writer)),
            io: Mutex::new(Some(SessionIo {
                client: PacketReader::new(client_reader),
                server: PacketReader::new(server_reader),
            })),
            closer: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peers(&self) -> SessionPeers {
        self.peers
    }

    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn state(&self) -> SessionState {
        SessionState::from(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SessionState) {
        let prev = SessionState::from(self.state.swap(state as u8, Ordering::SeqCst));
        if prev != state {
            debug!("[{}] state {:?} -> {:?}", self.id, prev, state);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 会话被要求关闭时返回。
    pub async fn closed(&self) {
        self.closer.cancelled().await
    }

    /// 双向转发数据包，直到任意一端结束。
    ///
    /// 会话已经启动或已被关闭时立即返回。
    pub async fn run(self: Arc<Self>) {
        let io = self
            .io
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(io) = io else {
            debug!("[{}] session already started or closed", self.id);
            return;
        };

        let t1 = tokio::task::spawn(Self::client_to_server(Arc::clone(&self), io.client));
        let t2 = tokio::task::spawn(Self::server_to_client(Arc::clone(&self), io.server));
        let _r = t1.await;
        let _r = t2.await;
        self.close("relay finished");
        debug!("[{}] both pumps exited", self.id);
    }

    /// 强制关闭两端连接，可以重复调用。
    pub fn kill(&self) {
        self.close("killed");
    }

    fn close(&self, reason: &str) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.closer.cancel();
        // 未启动的会话仍持有读取端
        let _io = self
            .io
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.client.try_close();
        self.server.try_close();
        info!(
            "[{}] session with {} closed: {} (uptime {:?})",
            self.id,
            self.peers.client,
            reason,
            self.uptime()
        );
    }

    /// 向客户端发送由代理产生的聊天消息。
    pub async fn send_message(&self, text: &str) {
        let packet = chat_packet(text);
        if let Err(err) = self.client.send(&packet, &self.closer).await {
            error!("[{}] unable to send message to client: {}", self.id, err);
        }
    }

    async fn read_next(&self, reader: &mut PacketReader<BoxedReader>, from: &str) -> Option<Packet> {
        loop {
            let r = tokio::select! {
                biased;
                _ = self.closer.cancelled() => return None,
                r = reader.read_packet() => r,
            };
            match r {
                Ok(packet) => {
                    trace!("[{}] {} -> 0x{:X} ({} bytes)", self.id, from, packet.id, packet.len());
                    return Some(packet);
                }
                Err(err) if err.is_closed() => {
                    debug!("[{}] {} closed the stream", self.id, from);
                    return None;
                }
                Err(err) if err.is_fatal() => {
                    warn!("[{}] unable to read packet from {}: {}", self.id, from, err);
                    return None;
                }
                Err(err) => {
                    warn!("[{}] unable to read packet from {}: {}", self.id, from, err);
                }
            }
        }
    }

    // 连接无法继续写入时返回 false
    async fn forward(&self, conn: &Connection, packet: &Packet) -> bool {
        match conn.send(packet, &self.closer).await {
            Ok(()) => true,
            Err(PacketError::Closed) => false,
            // 编码阶段被拒绝，没有数据写出
            Err(err @ PacketError::PacketTooLarge(..)) => {
                warn!("[{}] unable to send packet to {}: {}", self.id, conn.name, err);
                true
            }
            // 可能已经写出部分帧，对端已失去同步
            Err(err) => {
                warn!("[{}] unable to send packet to {}: {}", self.id, conn.name, err);
                false
            }
        }
    }

    async fn client_to_server(self: Arc<Self>, mut reader: PacketReader<BoxedReader>) {
        while let Some(packet) = self.read_next(&mut reader, "client").await {
            self.observe_serverbound(&packet);
            if !self.forward(&self.server, &packet).await {
                break;
            }
        }
        self.close("client to server relay ended");
    }

    async fn server_to_client(self: Arc<Self>, mut reader: PacketReader<BoxedReader>) {
        'outer: while let Some(packet) = self.read_next(&mut reader, "server").await {
            self.observe_clientbound(&packet);

            let mut ctx = PacketContext::new(self.id);
            // 处理器出错只做记录，数据包照常转发
            if let Err(err) = self.events.dispatch(&packet, &mut ctx) {
                warn!("[{}] PacketHandlerError: {}", self.id, err);
            }
            let (client_out, server_out, disconnect) = ctx.into_parts();
            for injected in server_out.into_packets() {
                if !self.forward(&self.server, &injected).await {
                    break 'outer;
                }
            }
            for injected in client_out.into_packets() {
                if !self.forward(&self.client, &injected).await {
                    break 'outer;
                }
            }

            if packet.id == ids::UPDATE_TIME {
                trace!("[{}] suppressed 0x{:X} from server", self.id, packet.id);
            } else if !self.forward(&self.client, &packet).await {
                break;
            }

            if disconnect {
                info!("[{}] disconnect requested by handler", self.id);
                break;
            }
        }
        self.close("server to client relay ended");
    }

    fn observe_serverbound(&self, packet: &Packet) {
        if packet.id != ids::HANDSHAKE || self.state() != SessionState::Status {
            return;
        }
        let handshake = read_handshake(packet);
        match handshake {
            Ok((protocol, host, port, next)) => {
                debug!(
                    "[{}] handshake protocol {} for {}:{} next state {}",
                    self.id, protocol, host, port, next
                );
                if next == SessionState::Login as i32 {
                    if protocol != crate::PROTO_VERSION {
                        warn!(
                            "[{}] client logs in with protocol {}, packet ids are for {}",
                            self.id,
                            protocol,
                            crate::PROTO_VERSION
                        );
                    }
                    self.set_state(SessionState::Login);
                }
            }
            Err(err) => debug!("[{}] unreadable handshake: {}", self.id, err),
        }
    }

    fn observe_clientbound(&self, packet: &Packet) {
        match (self.state(), packet.id) {
            (SessionState::Login, ids::LOGIN_SUCCESS) => self.set_state(SessionState::Play),
            (SessionState::Login, ids::SET_COMPRESSION) => {
                warn!("[{}] upstream enabled compression, which is not supported", self.id)
            }
            _ => {}
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peers", &self.peers)
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// (协议版本, 主机, 端口, 下一阶段)
fn read_handshake(packet: &Packet) -> Result<(i32, String, u16, i32), PacketError> {
    let mut r = packet.reader();
    let protocol = r.get_varint()?;
    let host = r.get_string()?;
    let port = r.get_u16()?;
    let next = r.get_varint()?;
    Ok((protocol, host, port, next))
}

/// 构造携带 `text` 纯文本组件的客户端聊天数据包。
pub fn chat_packet(text: &str) -> Packet {
    let component = serde_json::json!({ "text": text }).to_string();
    Packet::builder(ids::CHAT_CLIENTBOUND)
        .put_string(&component)
        .put_i8(MESSAGE_POSITION)
        .put_uuid(0)
        .build()
}
