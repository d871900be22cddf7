use anyhow::Result;

use vantage_daemon::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = telemetry::init("vantage-daemon")?;
    vantage_daemon::server::run().await
}
