use anyhow::Result;

use hive_daemon::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init("hive-daemon")?;
    hive_daemon::server::run().await
}
