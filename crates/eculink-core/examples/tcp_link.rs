//! Connect to a device (or a firmware simulator) listening on a TCP port
//! and stream RPM to stdout.
//!
//! Run with `cargo run -p eculink-core --example tcp_link -- 127.0.0.1:29001`.

use std::env;
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use eculink_core::connection::{ConnectionBuilder, DeviceProfile};
use eculink_core::protocol::TcpChannel;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let addr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:29001".to_string());
    let stream = TcpStream::connect(&addr).with_context(|| format!("connecting to {}", addr))?;

    let connection = ConnectionBuilder::new(
        Box::new(TcpChannel::new(stream)),
        DeviceProfile::standard(),
    )
    .on_console_text(|text| print!("{}", text))
    .build()?;

    if !connection.connect() {
        anyhow::bail!("device at {} did not answer", addr);
    }

    for _ in 0..20 {
        thread::sleep(Duration::from_millis(500));
        if connection.is_closed() {
            anyhow::bail!("connection lost");
        }
        let rpm = connection.sensors().latest("rpm").unwrap_or(0.0);
        println!("rpm = {:.0}", rpm);
    }

    connection.close();
    Ok(())
}
