use std::fmt;
use std::time::Duration;

pub const DEFAULT_LOCAL_HOST: &str = "0.0.0.0";
pub const DEFAULT_LOCAL_PORT: u16 = 25566;
pub const DEFAULT_REMOTE_HOST: &str = "127.0.0.1";
pub const DEFAULT_REMOTE_PORT: u16 = 25565;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// 一个代表主机与端口的类型。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new<T: Into<String>>(host: T, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// 一个代表代理配置的类型，包含监听地址和上游地址。
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub local: Endpoint,
    pub remote: Endpoint,
    /// 为单个客户端连接上游的超时时间。
    pub connect_timeout: Duration,
}

impl ProxyConfig {
    pub fn new(local: Endpoint, remote: Endpoint) -> Self {
        Self {
            local,
            remote,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::new(
            Endpoint::new(DEFAULT_LOCAL_HOST, DEFAULT_LOCAL_PORT),
            Endpoint::new(DEFAULT_REMOTE_HOST, DEFAULT_REMOTE_PORT),
        )
    }
}
