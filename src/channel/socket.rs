// SPDX-License-Identifier: AGPL-3.0-or-later

//! Socket channel (spec §4.1 "Socket (C3)"): a TCP stream or a single-
//! datagram-per-call UDP channel, with an optional SOCKS4/5 CONNECT
//! handshake. The TCP half splits the stream behind a
//! `tokio::sync::Mutex` and sets `set_nodelay`; UDP enforces the
//! negotiated MTU per datagram.

use std::net::SocketAddr;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream, UdpSocket,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex,
};
use tokio_socks::tcp::Socks5Stream;

use crate::{
    channel::{Channel, ChannelState},
    error::C12Error,
};

/// Optional SOCKS proxy chaining in front of the real target (spec §4.1).
#[derive(Debug, Clone)]
pub enum ProxyConfig {
    None,
    Socks5 { proxy: SocketAddr, username: Option<String>, password: Option<String> },
}

pub struct TcpChannel {
    state: ChannelState,
    target: SocketAddr,
    proxy: ProxyConfig,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl TcpChannel {
    pub fn new(target: SocketAddr, proxy: ProxyConfig) -> Self {
        Self {
            state: ChannelState::default(),
            target,
            proxy,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }
}

impl Channel for TcpChannel {
    fn state(&self) -> &ChannelState {
        &self.state
    }

    async fn connect(&self) -> Result<(), C12Error> {
        let stream = match &self.proxy {
            ProxyConfig::None => TcpStream::connect(self.target)
                .await
                .map_err(|e| C12Error::SocketError(e.to_string()))?,
            ProxyConfig::Socks5 { proxy, username, password } => {
                let connected = match (username, password) {
                    (Some(u), Some(p)) => {
                        Socks5Stream::connect_with_password(*proxy, self.target, u, p).await
                    },
                    _ => Socks5Stream::connect(*proxy, self.target).await,
                }
                .map_err(|e| C12Error::ProxySocketError(e.to_string()))?;
                connected.into_inner()
            },
        };
        stream.set_nodelay(true).map_err(|e| C12Error::SocketError(e.to_string()))?;

        let (r, w) = stream.into_split();
        *self.reader.lock().await = Some(r);
        *self.writer.lock().await = Some(w);
        self.state.connected.store(true, std::sync::atomic::Ordering::Release);
        self.state.emit(crate::counters::MonitorEvent::ChannelConnect);
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(mut w) = self.writer.lock().await.take() {
            let _ = w.shutdown().await;
        }
        self.reader.lock().await.take();
        self.state.connected.store(false, std::sync::atomic::Ordering::Release);
        self.state.emit(crate::counters::MonitorEvent::ChannelDisconnect);
    }

    async fn write_buffer(&self, bytes: &[u8]) -> Result<(), C12Error> {
        if self.state.cancel.is_set() {
            return Err(C12Error::OperationCancelled);
        }
        let mut guard = self.writer.lock().await;
        let w = guard.as_mut().ok_or(C12Error::ChannelDisconnectedUnexpectedly)?;
        let timeout_millis = self.state.write_timeout_millis.load(std::sync::atomic::Ordering::SeqCst);
        tokio::time::timeout(
            std::time::Duration::from_millis(timeout_millis),
            w.write_all(bytes),
        )
        .await
        .map_err(|_| C12Error::ChannelReadTimeout)?
        .map_err(|e| C12Error::SocketError(e.to_string()))?;
        drop(guard);
        self.state.record_tx(bytes.len());
        Ok(())
    }

    async fn flush_output_buffer(&self, _hint_bytes_in_fifo: usize) -> Result<(), C12Error> {
        let mut guard = self.writer.lock().await;
        let w = guard.as_mut().ok_or(C12Error::ChannelDisconnectedUnexpectedly)?;
        w.flush().await.map_err(|e| C12Error::SocketError(e.to_string()))
    }

    async fn read_buffer(&self, n: usize) -> Result<Vec<u8>, C12Error> {
        if self.state.cancel.is_set() {
            return Err(C12Error::OperationCancelled);
        }
        let mut buf = vec![0u8; n];
        let timeout_millis = self.state.read_timeout_millis.load(std::sync::atomic::Ordering::SeqCst);
        let mut guard = self.reader.lock().await;
        let r = guard.as_mut().ok_or(C12Error::ChannelDisconnectedUnexpectedly)?;
        let res = tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_millis(timeout_millis)) => Err(C12Error::ChannelReadTimeout),
            res = r.read_exact(&mut buf) => res.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    C12Error::SocketClosedByPeer
                } else {
                    C12Error::SocketError(e.to_string())
                }
            }),
        };
        drop(guard);
        res?;
        self.state.record_rx(n);
        Ok(buf)
    }

    async fn do_read_cancellable(
        &self,
        max: usize,
        timeout_millis: u64,
        allow_partial: bool,
    ) -> Result<Vec<u8>, C12Error> {
        if !allow_partial {
            return self.read_buffer(max).await;
        }
        let mut buf = vec![0u8; max.max(1)];
        let mut guard = self.reader.lock().await;
        let r = guard.as_mut().ok_or(C12Error::ChannelDisconnectedUnexpectedly)?;
        let res = tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_millis(timeout_millis)) => return Ok(Vec::new()),
            res = r.read(&mut buf) => res,
        };
        drop(guard);
        let n = res.map_err(|e| C12Error::SocketError(e.to_string()))?;
        buf.truncate(n);
        self.state.record_rx(n);
        Ok(buf)
    }

    async fn clear_input_buffer(&self) {
        // A TCP stream has no discrete "input buffer" to clear the way a
        // UART FIFO does; nothing to do.
    }
}

/// UDP channel: exactly one datagram consumed/produced per read/write
/// (spec §4.1 "Socket (C3)").
pub struct UdpChannel {
    state: ChannelState,
    socket: UdpSocket,
    mtu: usize,
}

impl UdpChannel {
    pub fn new(socket: UdpSocket, mtu: usize) -> Self {
        Self { state: ChannelState::default(), socket, mtu }
    }
}

impl Channel for UdpChannel {
    fn state(&self) -> &ChannelState {
        &self.state
    }

    async fn connect(&self) -> Result<(), C12Error> {
        self.state.connected.store(true, std::sync::atomic::Ordering::Release);
        self.state.emit(crate::counters::MonitorEvent::ChannelConnect);
        Ok(())
    }

    async fn disconnect(&self) {
        self.state.connected.store(false, std::sync::atomic::Ordering::Release);
        self.state.emit(crate::counters::MonitorEvent::ChannelDisconnect);
    }

    async fn write_buffer(&self, bytes: &[u8]) -> Result<(), C12Error> {
        if bytes.len() > self.mtu {
            return Err(C12Error::PacketTooBig);
        }
        self.socket.send(bytes).await.map_err(|e| C12Error::SocketError(e.to_string()))?;
        self.state.record_tx(bytes.len());
        Ok(())
    }

    async fn flush_output_buffer(&self, _hint_bytes_in_fifo: usize) -> Result<(), C12Error> {
        Ok(())
    }

    async fn read_buffer(&self, n: usize) -> Result<Vec<u8>, C12Error> {
        let timeout_millis = self.state.read_timeout_millis.load(std::sync::atomic::Ordering::SeqCst);
        let mut buf = vec![0u8; self.mtu];
        let len = tokio::time::timeout(
            std::time::Duration::from_millis(timeout_millis),
            self.socket.recv(&mut buf),
        )
        .await
        .map_err(|_| C12Error::ChannelReadTimeout)?
        .map_err(|e| C12Error::SocketError(e.to_string()))?;
        self.state.record_rx(len);
        buf.truncate(len);
        if buf.len() < n {
            return Err(C12Error::InboundPacketDataLengthBad);
        }
        Ok(buf)
    }

    async fn do_read_cancellable(
        &self,
        max: usize,
        timeout_millis: u64,
        allow_partial: bool,
    ) -> Result<Vec<u8>, C12Error> {
        let mut buf = vec![0u8; max.max(self.mtu)];
        match tokio::time::timeout(
            std::time::Duration::from_millis(timeout_millis),
            self.socket.recv(&mut buf),
        )
        .await
        {
            Ok(Ok(len)) => {
                buf.truncate(len);
                self.state.record_rx(len);
                Ok(buf)
            },
            Ok(Err(e)) => Err(C12Error::SocketError(e.to_string())),
            Err(_) if allow_partial => Ok(Vec::new()),
            Err(_) => Err(C12Error::ChannelReadTimeout),
        }
    }

    async fn clear_input_buffer(&self) {
        let mut scratch = [0u8; 2048];
        while self.socket.try_recv(&mut scratch).is_ok() {}
    }
}
