use std::fmt;

/// 一个代表代理整体异常的枚举。
#[derive(Debug)]
pub enum ProxyError {
    /// 无法解析端点地址。
    Resolve(String, std::io::Error),
    /// 无法绑定监听端点。
    Bind(String, std::io::Error),
    /// 代理已经启动过。
    AlreadyStarted,
    /// 子系统通过控制通道上报了致命错误。
    Failed(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Resolve(addr, err) => write!(f, "failed to resolve {} [{}]", addr, err),
            ProxyError::Bind(addr, err) => write!(f, "failed to bind {} [{}]", addr, err),
            ProxyError::AlreadyStarted => write!(f, "already started"),
            ProxyError::Failed(msg) => write!(f, "internal server error: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Resolve(_, err) | ProxyError::Bind(_, err) => Some(err),
            _ => None,
        }
    }
}
