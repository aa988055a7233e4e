//! Offline stand-ins for the HTTP host and the game server used by unit tests.

use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use zip::write::SimpleFileOptions;

use crate::protocol::{OPCODE_INFO, encode_query};

#[derive(Clone, Debug)]
pub enum Reply {
    Body {
        status: u16,
        content_type: &'static str,
        body: Vec<u8>,
        send_length: bool,
    },
    /// Zero bytes trickled out in `chunk`-sized writes until `total` is reached.
    Slow {
        total: u64,
        chunk: usize,
        delay: Duration,
    },
}

impl Reply {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Reply::Body {
            status: 200,
            content_type: "application/octet-stream",
            body: body.into(),
            send_length: true,
        }
    }

    pub fn json(body: impl Into<String>) -> Self {
        Reply::Body {
            status: 200,
            content_type: "application/json",
            body: body.into().into_bytes(),
            send_length: true,
        }
    }

    pub fn status(status: u16) -> Self {
        Reply::Body {
            status,
            content_type: "text/plain",
            body: b"nope".to_vec(),
            send_length: true,
        }
    }
}

pub struct HttpServer {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl HttpServer {
    pub async fn start(routes: Vec<(&str, Reply)>) -> Self {
        let routes: Arc<HashMap<String, Reply>> = Arc::new(
            routes
                .into_iter()
                .map(|(path, reply)| (path.to_owned(), reply))
                .collect(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let routes = routes.clone();
                tokio::spawn(async move {
                    let _ = respond(stream, &routes).await;
                });
            }
        });
        Self { addr, task }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn respond(mut stream: TcpStream, routes: &HashMap<String, Reply>) -> std::io::Result<()> {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        let read = stream.read(&mut buf).await?;
        if read == 0 {
            return Ok(());
        }
        request.extend_from_slice(&buf[..read]);
    }
    let head = String::from_utf8_lossy(&request);
    let path = head.split_whitespace().nth(1).unwrap_or("/").to_owned();

    match routes.get(&path).cloned().unwrap_or_else(|| Reply::status(404)) {
        Reply::Body {
            status,
            content_type,
            body,
            send_length,
        } => {
            let mut head = format!(
                "HTTP/1.1 {status} X\r\nContent-Type: {content_type}\r\nConnection: close\r\n"
            );
            if send_length {
                head.push_str(&format!("Content-Length: {}\r\n", body.len()));
            }
            head.push_str("\r\n");
            stream.write_all(head.as_bytes()).await?;
            stream.write_all(&body).await?;
        }
        Reply::Slow {
            total,
            chunk,
            delay,
        } => {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/zip\r\nConnection: close\r\nContent-Length: {total}\r\n\r\n"
            );
            stream.write_all(head.as_bytes()).await?;
            let block = vec![0u8; chunk];
            let mut sent = 0u64;
            while sent < total {
                let n = chunk.min((total - sent) as usize);
                stream.write_all(&block[..n]).await?;
                stream.flush().await?;
                sent += n as u64;
                tokio::time::sleep(delay).await;
            }
        }
    }
    stream.shutdown().await
}

/// UDP server that answers every datagram with `reply`, or stays silent when `None`.
pub async fn udp_responder(reply: Option<Vec<u8>>) -> (SocketAddr, JoinHandle<()>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let mut buf = [0u8; 512];
        while let Ok((_, peer)) = socket.recv_from(&mut buf).await {
            if let Some(reply) = &reply {
                let _ = socket.send_to(reply, peer).await;
            }
        }
    });
    (addr, task)
}

/// A well-formed `'i'` reply with the password flag set.
pub fn info_packet(players: u16, max: u16, hostname: &[u8]) -> Vec<u8> {
    let mut packet = encode_query("127.0.0.1", 7777, OPCODE_INFO).unwrap();
    packet.push(1);
    packet.extend_from_slice(&players.to_le_bytes());
    packet.extend_from_slice(&max.to_le_bytes());
    packet.extend_from_slice(&(hostname.len() as u32).to_le_bytes());
    packet.extend_from_slice(hostname);
    packet
}

/// Build a stored (uncompressed) zip with the given members in memory.
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, data) in entries {
        if name.ends_with('/') {
            writer.add_directory(*name, options).unwrap();
        } else {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
    }
    writer.finish().unwrap().into_inner()
}

pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    std::fs::write(path, zip_bytes(entries)).unwrap();
}

pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    format!("{:x}", Sha256::digest(data))
}
