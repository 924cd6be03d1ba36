// ABOUTME: Standalone example that speaks the handshake as a client against a running guacd
// ABOUTME: Connects, selects the demo protocol, and prints the server's replies before disconnecting

use guac_core::socket::{SocketReader, SocketWriter};
use std::time::Duration;
use tokio::net::TcpStream;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:4822".to_string());

    println!("connecting to {addr}");
    let stream = TcpStream::connect(&addr).await?;
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = SocketReader::new(read_half);
    let mut writer = SocketWriter::new(write_half);

    writer.write_string(b"6.select,4.demo;").await?;
    writer.flush().await?;
    print_reply(&mut reader).await?;

    writer
        .write_string(b"4.size,4.1024,3.768,2.96;")
        .await?;
    writer.flush().await?;

    writer.write_string(b"5.audio;").await?;
    writer.flush().await?;

    writer.write_string(b"5.video;").await?;
    writer.flush().await?;

    writer.write_string(b"5.image,9.image/png;").await?;
    writer.flush().await?;

    writer.write_string(b"7.connect,4.1024,3.768;").await?;
    writer.flush().await?;
    print_reply(&mut reader).await?;

    writer.write_string(b"10.disconnect;").await?;
    writer.flush().await?;

    Ok(())
}

async fn print_reply(
    reader: &mut SocketReader<tokio::io::ReadHalf<TcpStream>>,
) -> Result<(), Box<dyn std::error::Error>> {
    match reader.read_instruction(Duration::from_secs(5)).await? {
        Some(instr) => println!("<- {} {:?}", instr.opcode(), instr.args()),
        None => println!("<- (connection closed)"),
    }
    Ok(())
}
