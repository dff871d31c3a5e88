//! Minimal keep-alive target for local runs:
//! `cargo run --example echo_target` then
//! `bitflipper 127.0.0.1 localhost -p 8080 --no-capture`.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn serve(mut stream: TcpStream) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 16 * 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);

        while let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let request: Vec<u8> = buf.drain(..end + 4).collect();
            let path = request
                .split(|&b| b == b' ')
                .nth(1)
                .unwrap_or_default()
                .strip_prefix(b"/")
                .unwrap_or_default()
                .to_vec();

            let head = format!(
                "HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nContent-Length: {}\r\n\r\n",
                path.len()
            );
            stream.write_all(head.as_bytes()).await?;
            stream.write_all(&path).await?;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let addr = "127.0.0.1:8080";
    let listener = TcpListener::bind(addr).await?;
    println!("Echo target listening on {}", addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(e) = serve(stream).await {
                eprintln!("Connection from {} ended: {}", peer, e);
            }
        });
    }
}
