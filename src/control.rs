use log::debug;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// 一个代表控制命令的枚举。
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// 停止整个代理。
    Stop,
    /// 上报致命错误，代理同样会停止。
    Fail,
}

/// 一个代表控制消息的类型，包含命令和说明文本。
#[derive(Clone, Debug)]
pub struct Message {
    pub command: Command,
    pub message: String,
}

impl Message {
    pub fn new<T: Into<String>>(command: Command, message: T) -> Self {
        Self {
            command,
            message: message.into(),
        }
    }

    pub fn stop<T: Into<String>>(message: T) -> Self {
        Self::new(Command::Stop, message)
    }

    pub fn fail<T: Into<String>>(message: T) -> Self {
        Self::new(Command::Fail, message)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.command, self.message)
    }
}

/// 一个代表控制通道发送端的类型。
///
/// 所有克隆共享同一个发送端，`close()` 之后整个通道关闭，
/// 之后的上报会被直接丢弃而不会出错。
#[derive(Clone, Debug)]
pub struct Reporter {
    tx: Arc<Mutex<Option<UnboundedSender<Message>>>>,
}

impl Reporter {
    /// 向协调者发送 `msg`，通道已经关闭时返回 `false`。
    pub fn report(&self, msg: Message) -> bool {
        let guard = self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.send(msg).is_ok(),
            None => {
                debug!("control channel closed, dropping {}", msg);
                false
            }
        }
    }

    /// 关闭通道，只有第一次调用生效并返回 `true`。
    pub fn close(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }
}

/// 创建控制通道：多个上报端，一个接收端。
pub fn control_channel() -> (Reporter, UnboundedReceiver<Message>) {
    let (tx, rx) = unbounded_channel();
    (
        Reporter {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_once_and_report_after_close() {
        let (reporter, mut rx) = control_channel();
        let other = reporter.clone();
        assert!(other.report(Message::fail("bind")));
        assert!(reporter.report(Message::stop("normal stop")));
        assert!(reporter.close());
        assert!(!other.close());
        assert!(other.is_closed());
        assert!(!other.report(Message::stop("late")));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.command, Command::Fail);
        assert_eq!(first.message, "bind");
        assert_eq!(rx.recv().await.unwrap().command, Command::Stop);
        assert!(rx.recv().await.is_none());
    }
}
