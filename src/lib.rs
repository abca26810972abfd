mod config;
mod control;
mod error;
mod events;
mod hooks;
mod network;
mod packet;
mod proxy;
mod session;

pub use config::{
    Endpoint, ProxyConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_LOCAL_HOST, DEFAULT_LOCAL_PORT,
    DEFAULT_REMOTE_HOST, DEFAULT_REMOTE_PORT,
};
pub use control::{control_channel, Command, Message, Reporter};
pub use error::ProxyError;
pub use events::{
    BoxError, Events, HandlerError, HandlerRegistry, HandlerResult, Outbox, PacketContext,
    PacketHandler,
};
pub use hooks::{ChatMessage, GameEvents, HOOK_PRIORITY};
pub use network::Network;
pub use packet::{
    ids, put_varint, varint_len, FieldReader, Packet, PacketBuilder, PacketCodec, PacketError,
    PacketReader, PacketWriter, MAX_PACKET_SIZE, MAX_STRING_LEN,
};
pub use proxy::Proxy;
pub use session::{chat_packet, Session, SessionId, SessionPeers, SessionState};

/// [`ids`] 中数据包 id 对应的协议版本。
pub const PROTO_VERSION: i32 = 754;
