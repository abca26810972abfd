use crate::config::ProxyConfig;
use crate::control::{control_channel, Command, Message, Reporter};
use crate::error::ProxyError;
use crate::events::Events;
use crate::network::Network;
use log::{debug, error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;

/// 一个代表代理协调者的类型，持有事件总线、网络和控制通道。
pub struct Proxy {
    config: ProxyConfig,
    events: Arc<Events>,
    network: Network,
    reporter: Reporter,
    rx: Mutex<UnboundedReceiver<Message>>,
}

impl Proxy {
    pub fn new(config: ProxyConfig) -> Self {
        let (reporter, rx) = control_channel();
        let events = Arc::new(Events::new());
        let network = Network::new(config.clone(), Arc::clone(&events), reporter.clone());
        Self {
            config,
            events,
            network,
            reporter,
            rx: Mutex::new(rx),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// 用于注册处理器的事件总线。
    pub fn events(&self) -> &Arc<Events> {
        &self.events
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    /// 返回控制通道的上报端。
    pub fn reporter(&self) -> Reporter {
        self.reporter.clone()
    }

    /// 绑定监听端点并开始接收客户端。
    pub async fn start(&self) -> Result<SocketAddr, ProxyError> {
        info!("relaying {} -> {}", self.config.local, self.config.remote);
        self.network.load().await
    }

    /// 启动代理并持续服务，直到收到停止或失败消息。
    pub async fn load(&self) -> Result<(), ProxyError> {
        if let Err(err) = self.start().await {
            // 错误已经上报到控制通道，由 wait() 处理
            debug!("startup aborted: {}", err);
        }
        self.wait().await
    }

    /// 处理控制消息，直到收到 `Stop` 或 `Fail`。
    pub async fn wait(&self) -> Result<(), ProxyError> {
        let mut rx = self.rx.lock().await;
        while let Some(msg) = rx.recv().await {
            match msg.command {
                Command::Stop => {
                    info!("stop requested: {}", msg.message);
                    return Ok(());
                }
                Command::Fail => {
                    error!("internal server error: {}", msg.message);
                    error!("stopping server");
                    self.network.kill();
                    return Err(ProxyError::Failed(msg.message));
                }
            }
        }
        Ok(())
    }

    /// 停止接收，关闭所有会话和控制通道。
    pub fn kill(&self) {
        self.network.kill();
        self.reporter.report(Message::stop("normal stop"));
        if self.reporter.close() {
            info!("server stopped");
        }
    }

    /// 将 `text` 作为聊天消息发送给所有会话。
    ///
    /// 每个会话单独使用一个任务发送，停止读取的客户端只会延迟它自己。
    /// 返回发送的会话数量。
    pub fn broadcast(&self, text: &str) -> usize {
        let sessions = self.network.sessions();
        debug!("broadcast to {} sessions: {}", sessions.len(), text);
        let text: Arc<str> = Arc::from(text);
        for session in &sessions {
            let session = Arc::clone(session);
            let text = Arc::clone(&text);
            tokio::task::spawn(async move { session.send_message(&text).await });
        }
        sessions.len()
    }
}
