use crate::packet::Packet;
use crate::session::SessionId;
use log::trace;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};

/// 一个代表处理器回调异常的类型。
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// 一个代表单次处理器调用结果的类型。
pub type HandlerResult = Result<(), BoxError>;

type HandlerFn = dyn Fn(&mut PacketContext, &Packet) -> HandlerResult + Send + Sync;

/// 一个代表处理器待发送数据包队列的类型。
#[derive(Debug, Default)]
pub struct Outbox {
    packets: Vec<Packet>,
}

impl Outbox {
    /// 将 `packet` 加入此连接的发送队列。
    pub fn write_packet(&mut self, packet: Packet) {
        self.packets.push(packet);
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub(crate) fn into_packets(self) -> Vec<Packet> {
        self.packets
    }
}

/// 一个代表数据包所属会话上下文的类型。
///
/// 写入 `client()` 的数据包会在当前数据包之前送达，
/// 写入 `server()` 的数据包会发往上游。
#[derive(Debug)]
pub struct PacketContext {
    session: SessionId,
    client: Outbox,
    server: Outbox,
    disconnect: bool,
}

impl PacketContext {
    pub fn new(session: SessionId) -> Self {
        Self {
            session,
            client: Outbox::default(),
            server: Outbox::default(),
            disconnect: false,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    /// 下游（客户端）连接。
    pub fn client(&mut self) -> &mut Outbox {
        &mut self.client
    }

    /// 上游（服务器）连接。
    pub fn server(&mut self) -> &mut Outbox {
        &mut self.server
    }

    /// 请求会话在处理完此数据包后关闭两端连接。
    pub fn disconnect(&mut self) {
        self.disconnect = true;
    }

    pub fn is_disconnect_requested(&self) -> bool {
        self.disconnect
    }

    pub(crate) fn into_parts(self) -> (Outbox, Outbox, bool) {
        (self.client, self.server, self.disconnect)
    }
}

/// 一个代表数据包处理器的类型。
///
/// 没有 id 的处理器为通用处理器，会收到所有数据包。
/// 优先级数值越小越先执行。
#[derive(Clone)]
pub struct PacketHandler {
    pub id: Option<i32>,
    pub priority: i32,
    f: Arc<HandlerFn>,
}

impl PacketHandler {
    pub fn new<F>(id: i32, priority: i32, f: F) -> Self
    where
        F: Fn(&mut PacketContext, &Packet) -> HandlerResult + Send + Sync + 'static,
    {
        Self {
            id: Some(id),
            priority,
            f: Arc::new(f),
        }
    }

    pub fn generic<F>(priority: i32, f: F) -> Self
    where
        F: Fn(&mut PacketContext, &Packet) -> HandlerResult + Send + Sync + 'static,
    {
        Self {
            id: None,
            priority,
            f: Arc::new(f),
        }
    }

    pub fn call(&self, ctx: &mut PacketContext, packet: &Packet) -> HandlerResult {
        (self.f)(ctx, packet)
    }
}

impl fmt::Debug for PacketHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketHandler")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// 一个代表处理器异常的类型，附带出错数据包的 id。
#[derive(Debug)]
pub struct HandlerError {
    pub id: i32,
    pub source: BoxError,
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle packet 0x{:X} error: {}", self.id, self.source)
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

// (优先级, 插入序号) 保证相同优先级按插入顺序执行
type Bucket = BTreeMap<(i32, u64), PacketHandler>;

/// 一个代表按优先级排序的处理器表的类型。
#[derive(Clone, Debug, Default)]
pub struct HandlerRegistry {
    generic: Bucket,
    handlers: HashMap<i32, Bucket>,
    seq: u64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按 id 将 `handler` 加入对应的处理器组。
    pub fn register(&mut self, handler: PacketHandler) {
        let key = (handler.priority, self.next_seq());
        match handler.id {
            Some(id) => {
                self.handlers.entry(id).or_default().insert(key, handler);
            }
            None => {
                self.generic.insert(key, handler);
            }
        }
    }

    /// 忽略 id，将 `handler` 加入通用处理器组。
    pub fn register_generic(&mut self, handler: PacketHandler) {
        let key = (handler.priority, self.next_seq());
        self.generic.insert(key, handler);
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    pub fn len(&self) -> usize {
        self.generic.len() + self.handlers.values().map(|b| b.len()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 返回处理 `id` 数据包的全部处理器，按调用顺序排列。
    pub fn handlers_for(&self, id: i32) -> impl Iterator<Item = &PacketHandler> {
        self.generic
            .values()
            .chain(self.handlers.get(&id).into_iter().flat_map(|b| b.values()))
    }

    /// 依次调用 `packet` 的处理器，遇到第一个错误即停止。
    pub fn dispatch(&self, packet: &Packet, ctx: &mut PacketContext) -> Result<(), HandlerError> {
        for handler in self.handlers_for(packet.id) {
            trace!("dispatch 0x{:X} to {:?}", packet.id, handler);
            handler.call(ctx, packet).map_err(|source| HandlerError {
                id: packet.id,
                source,
            })?;
        }
        Ok(())
    }
}

/// 一个代表事件总线的类型，由代理的所有会话共享。
///
/// 注册时替换为新的处理器表副本，分发时不持有锁，
/// 因此处理器内部也可以注册新的处理器。
#[derive(Debug, Default)]
pub struct Events {
    registry: RwLock<Arc<HandlerRegistry>>,
}

impl Events {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F: FnOnce(&mut HandlerRegistry)>(&self, f: F) {
        let mut guard = self
            .registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(Arc::make_mut(&mut *guard));
    }

    /// 注册指定类型的处理器，没有 id 的处理器视为通用处理器。
    pub fn add_listener<I: IntoIterator<Item = PacketHandler>>(&self, listeners: I) {
        self.update(|registry| {
            for l in listeners {
                registry.register(l);
            }
        });
    }

    /// 注册接收所有数据包的通用处理器，忽略其 id。
    ///
    /// 通用处理器总是先于指定类型的处理器执行。
    pub fn add_generic<I: IntoIterator<Item = PacketHandler>>(&self, listeners: I) {
        self.update(|registry| {
            for l in listeners {
                registry.register_generic(l);
            }
        });
    }

    /// 返回当前的处理器表。
    pub fn snapshot(&self) -> Arc<HandlerRegistry> {
        let guard = self
            .registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&*guard)
    }

    pub fn dispatch(&self, packet: &Packet, ctx: &mut PacketContext) -> Result<(), HandlerError> {
        self.snapshot().dispatch(packet, ctx)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
