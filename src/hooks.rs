//! 基于数据包处理器的游戏事件钩子。
//!
//! 每个钩子只解码所需的字段，然后交给用户回调。
use crate::events::{Events, HandlerResult, PacketHandler};
use crate::packet::ids;
use std::sync::Arc;

/// 钩子处理器的注册优先级。
pub const HOOK_PRIORITY: i32 = 64;

type Hook0 = Arc<dyn Fn() -> HandlerResult + Send + Sync>;
type Hook1<T> = Arc<dyn Fn(T) -> HandlerResult + Send + Sync>;

/// 一个代表上游聊天消息的类型。
#[derive(Clone, Debug, PartialEq)]
pub struct ChatMessage {
    /// 原始 JSON 聊天组件。
    pub json: String,
    pub position: i8,
    pub sender: u128,
}

/// 一个代表游戏事件回调集合的类型。
#[derive(Clone, Default)]
pub struct GameEvents {
    game_start: Option<Hook0>,
    chat: Option<Hook1<ChatMessage>>,
    kick: Option<Hook1<String>>,
    health_change: Option<Hook1<f32>>,
    death: Option<Hook0>,
}

impl GameEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// 上游发送加入游戏时调用。
    pub fn on_game_start<F>(mut self, f: F) -> Self
    where
        F: Fn() -> HandlerResult + Send + Sync + 'static,
    {
        self.game_start = Some(Arc::new(f));
        self
    }

    pub fn on_chat<F>(mut self, f: F) -> Self
    where
        F: Fn(ChatMessage) -> HandlerResult + Send + Sync + 'static,
    {
        self.chat = Some(Arc::new(f));
        self
    }

    /// 接收被踢出时的原始 JSON 原因。
    pub fn on_kick<F>(mut self, f: F) -> Self
    where
        F: Fn(String) -> HandlerResult + Send + Sync + 'static,
    {
        self.kick = Some(Arc::new(f));
        self
    }

    pub fn on_health_change<F>(mut self, f: F) -> Self
    where
        F: Fn(f32) -> HandlerResult + Send + Sync + 'static,
    {
        self.health_change = Some(Arc::new(f));
        self
    }

    /// 生命值更新为零或以下时调用。
    pub fn on_death<F>(mut self, f: F) -> Self
    where
        F: Fn() -> HandlerResult + Send + Sync + 'static,
    {
        self.death = Some(Arc::new(f));
        self
    }

    /// 为每个已设置的钩子注册处理器。
    pub fn attach(&self, events: &Events) {
        let mut handlers = Vec::new();

        if let Some(f) = self.game_start.clone() {
            handlers.push(PacketHandler::new(ids::JOIN_GAME, HOOK_PRIORITY, move |_, _| f()));
        }

        if let Some(f) = self.chat.clone() {
            handlers.push(PacketHandler::new(ids::CHAT_CLIENTBOUND, HOOK_PRIORITY, move |_, p| {
                let mut r = p.reader();
                let msg = ChatMessage {
                    json: r.get_string()?,
                    position: r.get_i8()?,
                    sender: r.get_uuid()?,
                };
                f(msg)
            }));
        }

        if let Some(f) = self.kick.clone() {
            handlers.push(PacketHandler::new(ids::KICK_DISCONNECT, HOOK_PRIORITY, move |_, p| {
                f(p.reader().get_string()?)
            }));
        }

        if self.health_change.is_some() || self.death.is_some() {
            let health_change = self.health_change.clone();
            let death = self.death.clone();
            handlers.push(PacketHandler::new(ids::UPDATE_HEALTH, HOOK_PRIORITY, move |_, p| {
                let mut r = p.reader();
                let health = r.get_f32()?;
                let _food = r.get_varint()?;
                let _saturation = r.get_f32()?;
                if let Some(f) = health_change.as_ref() {
                    f(health)?;
                }
                if let Some(f) = death.as_ref() {
                    if health <= 0.0 {
                        f()?;
                    }
                }
                Ok(())
            }));
        }

        events.add_listener(handlers);
    }
}
