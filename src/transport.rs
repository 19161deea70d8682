//! Thin wrapper over real loopback TCP: the only part of this crate that
//! touches raw bytes. Kept separate from `subnet.rs` so the handshake logic
//! in `proto.rs` and the virtnet wiring never need to know it's TCP.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};

use anyhow::{bail, Context, Result};
use socket2::{Domain, Socket, Type};

pub const MAX_LINE: usize = 1024;

/// A connected real stream, read and written a line at a time for the
/// handshake and then handed off whole to the caller.
#[derive(Debug)]
pub struct Conn {
    stream: TcpStream,
}

impl Conn {
    pub fn from_stream(stream: TcpStream) -> Self {
        Conn { stream }
    }

    pub fn dial(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).with_context(|| format!("dial {addr}"))?;
        Ok(Conn { stream })
    }

    /// Reads one line up to `MAX_LINE` bytes, including the trailing `\n`.
    /// EOF before a newline is an error.
    pub fn recv_line(&mut self) -> Result<String> {
        let mut line = Vec::with_capacity(128);
        let mut byte = [0u8; 1];
        loop {
            if line.len() >= MAX_LINE {
                bail!("line exceeds {MAX_LINE} bytes");
            }
            let n = self.stream.read(&mut byte)?;
            if n == 0 {
                bail!("unexpected EOF");
            }
            line.push(byte[0]);
            if byte[0] == b'\n' {
                break;
            }
        }
        String::from_utf8(line).context("handshake line is not valid utf-8")
    }

    pub fn send_line(&mut self, line: &str) -> Result<()> {
        self.stream.write_all(line.as_bytes())?;
        Ok(())
    }

    pub fn local_addr(&self) -> Result<String> {
        Ok(self.stream.local_addr()?.to_string())
    }

    pub fn peer_addr(&self) -> Result<String> {
        Ok(self.stream.peer_addr()?.to_string())
    }

    pub fn try_clone(&self) -> Result<Self> {
        Ok(Conn {
            stream: self.stream.try_clone()?,
        })
    }
}

impl virtnet::RawStream for Conn {
    fn close(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stream.write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }
}

/// `TcpStream` is readable/writable through a shared reference (the platform
/// socket call needs no exclusivity), so `Conn` is too — this is what lets
/// application code call [`virtnet::Conn::raw`], which only ever hands out
/// `&Conn`, to actually move bytes.
impl Read for &Conn {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        (&self.stream).read(buf)
    }
}

impl Write for &Conn {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        (&self.stream).write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        (&self.stream).flush()
    }
}

/// Binds a real loopback listener with the backlog the serve loop expects.
/// std's `TcpListener::bind` has no way to ask for a specific backlog, so
/// this goes through `socket2` to call `listen(2)` directly.
pub fn bind_loopback(backlog: u32) -> Result<TcpListener> {
    let addr: SocketAddr = "127.0.0.1:0".parse().expect("valid loopback address");
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}
