use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio::net::{TcpStream, UnixStream};

#[cfg(feature = "tls")]
use tokio_native_tls::TlsStream;

/// The connection's byte stream: plain TCP, TLS over TCP, or a Unix domain
/// socket. A single enum (rather than `Box<dyn AsyncRead + AsyncWrite>`)
/// keeps [`crate::tokio::conn::Conn`] free of an indirection on every read.
pub enum Stream {
    Tcp(BufReader<TcpStream>),
    #[cfg(feature = "tls")]
    Tls(BufReader<TlsStream<TcpStream>>),
    Unix(BufReader<UnixStream>),
}

impl Stream {
    pub fn tcp(stream: TcpStream) -> Self {
        Self::Tcp(BufReader::new(stream))
    }

    pub fn unix(stream: UnixStream) -> Self {
        Self::Unix(BufReader::new(stream))
    }

    #[cfg(feature = "tls")]
    pub async fn upgrade_to_tls(self, host: &str) -> std::io::Result<Self> {
        let tcp = match self {
            Self::Tcp(buf_reader) => buf_reader.into_inner(),
            #[cfg(feature = "tls")]
            Self::Tls(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "Already using TLS",
                ));
            }
            Self::Unix(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "TLS not supported for Unix sockets",
                ));
            }
        };

        let connector = native_tls::TlsConnector::new()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let connector = tokio_native_tls::TlsConnector::from(connector);
        let tls_stream = connector
            .connect(host, tcp)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        Ok(Self::Tls(BufReader::new(tls_stream)))
    }
}

// All variants wrap `BufReader<T>` for `Unpin` `T`, so `Pin::get_mut` is safe
// to call: projecting to the inner reader never moves anything.
impl AsyncRead for Stream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(reader) => Pin::new(reader).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            Self::Tls(reader) => Pin::new(reader).poll_read(cx, buf),
            Self::Unix(reader) => Pin::new(reader).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(reader) => Pin::new(reader.get_mut()).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            Self::Tls(reader) => Pin::new(reader.get_mut()).poll_write(cx, buf),
            Self::Unix(reader) => Pin::new(reader.get_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(reader) => Pin::new(reader.get_mut()).poll_flush(cx),
            #[cfg(feature = "tls")]
            Self::Tls(reader) => Pin::new(reader.get_mut()).poll_flush(cx),
            Self::Unix(reader) => Pin::new(reader.get_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(reader) => Pin::new(reader.get_mut()).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            Self::Tls(reader) => Pin::new(reader.get_mut()).poll_shutdown(cx),
            Self::Unix(reader) => Pin::new(reader.get_mut()).poll_shutdown(cx),
        }
    }
}
