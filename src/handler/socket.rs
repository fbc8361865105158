//! Traits for abstracting over stream listeners and accepted connections.
//!
//! 用于抽象流式监听器与已接受连接的trait。

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

#[cfg(unix)]
use std::os::fd::AsRawFd;
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
#[cfg(windows)]
use std::os::windows::io::AsRawSocket;

/// 平台原生的套接字句柄
/// Platform-native socket handle
#[cfg(unix)]
pub type RawHandle = std::os::fd::RawFd;
#[cfg(windows)]
pub type RawHandle = std::os::windows::io::RawSocket;

/// An accepted, connected stream.
///
/// 已接受的连接流。
#[async_trait(?Send)]
pub trait Connection: 'static {
    /// Cleanly shuts down the write half so the peer observes EOF.
    /// 干净地关闭写半部分，使对端观察到EOF。
    async fn shutdown(&mut self) -> io::Result<()>;

    /// Releases the socket. The default implementation drops it.
    /// 释放套接字。默认实现直接丢弃。
    fn close(self) -> io::Result<()>
    where
        Self: Sized,
    {
        drop(self);
        Ok(())
    }

    /// Native handle of the underlying socket, if any.
    fn file_handle(&self) -> Option<RawHandle>;

    /// Filesystem path for Unix-domain sockets.
    fn path(&self) -> Option<PathBuf> {
        None
    }

    /// Human readable peer description used in logs.
    /// 用于日志的对端描述。
    fn peer(&self) -> String;
}

/// A listener that hands out connections.
///
/// 产生连接的监听器。
#[async_trait(?Send)]
pub trait Listener {
    type Conn: Connection;

    /// Accepts the next pending connection.
    /// 接受下一个挂起的连接。
    async fn accept(&self) -> io::Result<Self::Conn>;

    /// Description of the local endpoint used in logs.
    fn local_description(&self) -> String;
}

#[async_trait(?Send)]
impl Connection for TcpStream {
    async fn shutdown(&mut self) -> io::Result<()> {
        AsyncWriteExt::shutdown(self).await
    }

    fn file_handle(&self) -> Option<RawHandle> {
        #[cfg(unix)]
        return Some(self.as_raw_fd());
        #[cfg(windows)]
        return Some(self.as_raw_socket());
    }

    fn peer(&self) -> String {
        self.peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "tcp:unknown".to_string())
    }
}

#[async_trait(?Send)]
impl Listener for TcpListener {
    type Conn = TcpStream;

    async fn accept(&self) -> io::Result<TcpStream> {
        TcpListener::accept(self).await.map(|(stream, _)| stream)
    }

    fn local_description(&self) -> String {
        self.local_addr()
            .map(|addr| format!("tcp://{addr}"))
            .unwrap_or_else(|_| "tcp://unknown".to_string())
    }
}

#[cfg(unix)]
#[async_trait(?Send)]
impl Connection for UnixStream {
    async fn shutdown(&mut self) -> io::Result<()> {
        AsyncWriteExt::shutdown(self).await
    }

    fn file_handle(&self) -> Option<RawHandle> {
        Some(self.as_raw_fd())
    }

    fn path(&self) -> Option<PathBuf> {
        self.local_addr()
            .ok()
            .and_then(|addr| addr.as_pathname().map(|p| p.to_path_buf()))
    }

    fn peer(&self) -> String {
        self.peer_addr()
            .map(|addr| format!("{addr:?}"))
            .unwrap_or_else(|_| "unix:unknown".to_string())
    }
}

#[cfg(unix)]
#[async_trait(?Send)]
impl Listener for UnixListener {
    type Conn = UnixStream;

    async fn accept(&self) -> io::Result<UnixStream> {
        UnixListener::accept(self).await.map(|(stream, _)| stream)
    }

    fn local_description(&self) -> String {
        match self.local_addr() {
            Ok(addr) => match addr.as_pathname() {
                Some(path) => format!("unix://{}", path.display()),
                None => "unix://unnamed".to_string(),
            },
            Err(_) => "unix://unknown".to_string(),
        }
    }
}

/// Owns at most one connection and guarantees it is closed exactly once.
///
/// 最多持有一个连接，并保证其只被关闭一次。
pub struct OwnedSocket<C> {
    conn: Option<C>,
}

impl<C> Default for OwnedSocket<C> {
    fn default() -> Self {
        Self { conn: None }
    }
}

impl<C: Connection> fmt::Debug for OwnedSocket<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.conn {
            Some(conn) => write!(f, "OwnedSocket({})", conn.peer()),
            None => f.write_str("OwnedSocket(closed)"),
        }
    }
}

impl<C: Connection> OwnedSocket<C> {
    pub fn new(conn: C) -> Self {
        Self { conn: Some(conn) }
    }

    /// Takes ownership of a freshly accepted connection.
    ///
    /// # Panics
    ///
    /// If a connection is still open: it would be leaked without being closed.
    #[track_caller]
    pub fn attach(&mut self, conn: C) {
        assert!(self.conn.is_none(), "socket attached while another is still open");
        self.conn = Some(conn);
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    pub fn get_mut(&mut self) -> Option<&mut C> {
        self.conn.as_mut()
    }

    pub fn get(&self) -> Option<&C> {
        self.conn.as_ref()
    }

    /// Best-effort graceful shutdown; `None` when nothing is open.
    pub async fn shutdown(&mut self) -> Option<io::Result<()>> {
        match self.conn.as_mut() {
            Some(conn) => Some(conn.shutdown().await),
            None => None,
        }
    }

    /// Closes the connection. Returns `None` if it was already closed, so a
    /// second call never touches the socket again.
    ///
    /// 关闭连接。已关闭时返回 `None`，因此第二次调用不会再触碰套接字。
    pub fn close(&mut self) -> Option<io::Result<()>> {
        self.conn.take().map(Connection::close)
    }

    pub fn file_handle(&self) -> Option<RawHandle> {
        self.conn.as_ref().and_then(Connection::file_handle)
    }

    pub fn peer(&self) -> Option<String> {
        self.conn.as_ref().map(Connection::peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_tcp_listener_accepts_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert_eq!(listener.local_description(), format!("tcp://{addr}"));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let conn = Listener::accept(&listener).await.unwrap();
        assert!(conn.file_handle().is_some());
        assert_eq!(conn.path(), None);

        let mut socket = OwnedSocket::new(conn);
        assert!(socket.is_open());
        assert!(socket.shutdown().await.unwrap().is_ok());

        // 对端读到EOF
        // The peer reads EOF
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);

        assert!(socket.close().unwrap().is_ok());
        assert!(socket.close().is_none());
        assert!(socket.shutdown().await.is_none());
        assert!(socket.file_handle().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_listener_reports_path() {
        let path = std::env::temp_dir().join(format!("expiry-reactor-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();
        assert_eq!(listener.local_description(), format!("unix://{}", path.display()));

        let _client = UnixStream::connect(&path).await.unwrap();
        let conn = Listener::accept(&listener).await.unwrap();
        assert_eq!(conn.path(), Some(path.clone()));
        assert!(conn.file_handle().is_some());

        let mut socket = OwnedSocket::new(conn);
        assert!(socket.close().unwrap().is_ok());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    #[should_panic(expected = "still open")]
    fn test_attach_over_open_socket_panics() {
        struct Dummy;
        #[async_trait(?Send)]
        impl Connection for Dummy {
            async fn shutdown(&mut self) -> io::Result<()> {
                Ok(())
            }
            fn file_handle(&self) -> Option<RawHandle> {
                None
            }
            fn peer(&self) -> String {
                "dummy".into()
            }
        }

        let mut socket = OwnedSocket::new(Dummy);
        socket.attach(Dummy);
    }
}
