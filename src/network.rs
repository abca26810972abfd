use crate::config::{Endpoint, ProxyConfig};
use crate::control::{Message, Reporter};
use crate::error::ProxyError;
use crate::events::Events;
use crate::session::{Session, SessionId, SessionPeers};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::io::{Error, ErrorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const LISTEN_BACKLOG: u32 = 1024;
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

type SessionSet = HashMap<SessionId, Arc<Session>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct NetworkInner {
    config: ProxyConfig,
    events: Arc<Events>,
    sessions: Mutex<SessionSet>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl NetworkInner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        'outer: loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("shutdown requested, stop accepting");
                    break 'outer;
                }
                r = listener.accept() => match r {
                    Ok((socket, addr)) => {
                        // 在接收循环之外连接上游
                        tokio::task::spawn(Arc::clone(&self).resolve_accepted(socket, addr));
                    }
                    Err(err) => {
                        warn!("failed to accept connection: {}", err);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
            }
        }
        info!("listener loop exited");
    }

    async fn dial(&self) -> Result<TcpStream, Error> {
        let remote = &self.config.remote;
        let connect = TcpStream::connect((remote.host.as_str(), remote.port));
        let socket = timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| Error::new(ErrorKind::TimedOut, "connect timed out"))??;
        if let Err(err) = socket.set_nodelay(true) {
            debug!("set_nodelay on backend connection failed: {}", err);
        }
        Ok(socket)
    }

    async fn resolve_accepted(self: Arc<Self>, client: TcpStream, client_addr: SocketAddr) {
        debug!("client {} connected", client_addr);
        if let Err(err) = client.set_nodelay(true) {
            debug!("set_nodelay on {} failed: {}", client_addr, err);
        }

        // 连接上游失败时直接关闭客户端连接
        let server = match self.dial().await {
            Ok(server) => server,
            Err(err) => {
                warn!(
                    "failed to connect to backend {} for {}: {}",
                    self.config.remote, client_addr, err
                );
                return;
            }
        };
        let server_addr = match server.peer_addr() {
            Ok(addr) => addr,
            Err(err) => {
                warn!("backend connection for {} lost: {}", client_addr, err);
                return;
            }
        };

        let id = SessionId::from(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let peers = SessionPeers {
            client: client_addr,
            server: server_addr,
        };
        let session = Session::open(id, client, server, peers, Arc::clone(&self.events));
        {
            let mut sessions = lock(&self.sessions);
            if self.shutdown.is_cancelled() {
                drop(sessions);
                session.kill();
                return;
            }
            sessions.insert(id, Arc::clone(&session));
        }

        Arc::clone(&session).run().await;

        if lock(&self.sessions).remove(&id).is_some() {
            debug!("[{}] removed from session set", id);
        }
    }
}

/// 一个代表监听循环与会话集合的类型。
pub struct Network {
    inner: Arc<NetworkInner>,
    reporter: Reporter,
    started: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Network {
    pub fn new(config: ProxyConfig, events: Arc<Events>, reporter: Reporter) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                config,
                events,
                sessions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
            reporter,
            started: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// 绑定监听端点并开始接收客户端。
    ///
    /// 绑定失败会以 `Command::Fail` 上报到控制通道并返回错误，不会重试。
    pub async fn load(&self) -> Result<SocketAddr, ProxyError> {
        match self.start_listening().await {
            Ok(addr) => Ok(addr),
            Err(err) => {
                self.reporter.report(Message::fail(err.to_string()));
                Err(err)
            }
        }
    }

    async fn start_listening(&self) -> Result<SocketAddr, ProxyError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ProxyError::AlreadyStarted);
        }
        let listener = bind(&self.inner.config.local).await?;
        let addr = listener
            .local_addr()
            .map_err(|err| ProxyError::Bind(self.inner.config.local.to_string(), err))?;
        info!("listening on {}", addr);

        let task = tokio::task::spawn(NetworkInner::accept_loop(Arc::clone(&self.inner), listener));
        *lock(&self.task) = Some(task);
        *lock(&self.local_addr) = Some(addr);
        Ok(addr)
    }

    /// 停止接收并关闭所有会话。
    pub fn kill(&self) {
        self.inner.shutdown.cancel();
        for session in self.sessions() {
            session.kill();
        }
    }

    /// 等待监听循环在 `kill()` 之后退出。
    pub async fn join(&self) {
        let task = lock(&self.task).take();
        if let Some(task) = task {
            let _r = task.await;
        }
    }

    pub fn events(&self) -> &Arc<Events> {
        &self.inner.events
    }

    /// 返回当前会话的快照。
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        lock(&self.inner.sessions).values().cloned().collect()
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        lock(&self.inner.sessions).get(&id).cloned()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn bind(endpoint: &Endpoint) -> Result<TcpListener, ProxyError> {
    let name = endpoint.to_string();
    let addr = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|err| ProxyError::Resolve(name.clone(), err))?
        .next()
        .ok_or_else(|| {
            ProxyError::Resolve(name.clone(), Error::new(ErrorKind::NotFound, "no address"))
        })?;
    let bind_err = |err| ProxyError::Bind(name.clone(), err);
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_err)?;
    socket.set_reuseaddr(true).map_err(bind_err)?;
    socket.bind(addr).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{control_channel, Command};

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let (reporter, mut rx) = control_channel();
        let config = ProxyConfig::new(
            Endpoint::new("127.0.0.1", port),
            Endpoint::new("127.0.0.1", 1),
        );
        let network = Network::new(config, Arc::new(Events::new()), reporter);
        let err = network.load().await.unwrap_err();
        assert!(matches!(err, ProxyError::Bind(..)));
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.command, Command::Fail);
        assert!(msg.message.starts_with("failed to bind"));
    }

    #[tokio::test]
    async fn load_twice_is_rejected() {
        let (reporter, _rx) = control_channel();
        let config = ProxyConfig::new(
            Endpoint::new("127.0.0.1", 0),
            Endpoint::new("127.0.0.1", 1),
        );
        let network = Network::new(config, Arc::new(Events::new()), reporter);
        let addr = network.load().await.unwrap();
        assert_eq!(network.local_addr(), Some(addr));
        assert!(matches!(
            network.load().await,
            Err(ProxyError::AlreadyStarted)
        ));
        network.kill();
        network.join().await;
    }
}
