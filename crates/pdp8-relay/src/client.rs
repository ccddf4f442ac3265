use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};

use log::warn;

/// Longest inbound line accepted; a disk image upload fits comfortably.
pub const MAX_LINE: usize = 4 * 1024 * 1024;

/// Default limit on unsent output per client.
pub const MAX_BACKLOG: usize = 4 * MAX_LINE;

pub enum ReadState {
    Alive,
    Disconnected,
}

/// One connected observer with its framing buffers.
pub struct Client {
    pub addr: SocketAddr,
    stream: TcpStream,
    rx_buf: Vec<u8>,
    tx_queue: VecDeque<u8>,
    max_backlog: usize,
    /// A line was refused because the client stopped reading.
    overflowed: bool,
    /// Skipping the rest of an oversized line.
    discarding: bool,
}

impl Client {
    pub fn new(stream: TcpStream, addr: SocketAddr, max_backlog: usize) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let _ = stream.set_nodelay(true);
        Ok(Self {
            addr,
            stream,
            rx_buf: Vec::new(),
            tx_queue: VecDeque::new(),
            max_backlog,
            overflowed: false,
            discarding: false,
        })
    }

    /// Queues one line. Once the backlog limit is hit nothing more is queued
    /// and the client is marked for disconnection.
    pub fn queue_line(&mut self, line: &str) {
        if self.overflowed {
            return;
        }
        if self.tx_queue.len() + line.len() + 1 > self.max_backlog {
            self.overflowed = true;
            return;
        }
        self.tx_queue.extend(line.as_bytes());
        self.tx_queue.push_back(b'\n');
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn poll_read(&mut self) -> io::Result<ReadState> {
        let mut temp = [0u8; 4096];
        loop {
            match self.stream.read(&mut temp) {
                Ok(0) => return Ok(ReadState::Disconnected),
                Ok(n) => {
                    self.rx_buf.extend_from_slice(&temp[..n]);
                    if n < temp.len() {
                        return Ok(ReadState::Alive);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadState::Alive),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Complete lines received so far, without their terminators. Lines that
    /// are not UTF-8 or exceed [`MAX_LINE`] are logged and dropped.
    pub fn drain_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut start = 0usize;
        while let Some(len) = self.rx_buf[start..].iter().position(|&b| b == b'\n') {
            let end = start + len;
            if self.discarding {
                self.discarding = false;
            } else {
                let raw = &self.rx_buf[start..end];
                let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
                match std::str::from_utf8(raw) {
                    Ok(line) if line.trim().is_empty() => {}
                    Ok(line) => lines.push(line.to_string()),
                    Err(e) => warn!("Relay: {} sent a non-UTF-8 line: {e}", self.addr),
                }
            }
            start = end + 1;
        }
        self.rx_buf.drain(..start);

        if self.rx_buf.len() > MAX_LINE {
            warn!(
                "Relay: {} sent a line over {MAX_LINE} bytes, dropping it",
                self.addr
            );
            self.rx_buf.clear();
            self.discarding = true;
        }
        lines
    }

    pub fn flush(&mut self) -> io::Result<()> {
        while !self.tx_queue.is_empty() {
            let (front, _) = self.tx_queue.as_slices();
            match self.stream.write(front) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket closed while writing",
                    ));
                }
                Ok(written) => {
                    self.tx_queue.drain(..written);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
