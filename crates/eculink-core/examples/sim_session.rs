//! Complete session against the in-process simulated device: connect, read
//! telemetry, patch one tune byte, run a console command.
//!
//! Run with `cargo run -p eculink-core --example sim_session`.

use std::thread;
use std::time::Duration;

use anyhow::Result;
use eculink_core::connection::{ConnectionBuilder, ConnectionConfig, DeviceProfile};
use eculink_core::sim::SimEcu;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let profile = DeviceProfile::standard();
    let (sim, link) = SimEcu::start(profile.total_config_size, profile.outputs_size)?;
    sim.set_rpm(850);
    sim.set_rpm_jitter(40);
    sim.push_console_line("firmware 2026.08 ready");

    let connection = ConnectionBuilder::new(Box::new(link), profile)
        .config(ConnectionConfig {
            poll_period: Duration::from_millis(50),
            ..ConnectionConfig::default()
        })
        .on_console_text(|text| print!("console: {}", text))
        .build()?;

    if !connection.connect() {
        anyhow::bail!("could not connect to the simulated device");
    }

    // Let a few telemetry snapshots arrive
    thread::sleep(Duration::from_secs(1));
    let sensors = connection.sensors();
    println!("rpm            = {:?}", sensors.latest("rpm"));
    println!("seconds        = {:?}", sensors.latest("seconds"));

    // Patch one byte of the tune and push it to the device
    let mut tune = connection
        .configuration()
        .ok_or_else(|| anyhow::anyhow!("no configuration"))?;
    tune.as_mut_bytes()[42] = 7;
    connection.upload_changes(&tune)?;
    println!("device byte 42 = {}", sim.image()[42]);

    if connection.send_text_command("set idle 900") {
        anyhow::bail!("console command was never acknowledged");
    }
    println!("device saw     = {:?}", sim.text_commands());

    connection.close();
    Ok(())
}
