#[tokio::main]
async fn main() -> anyhow::Result<()> {
    wattlog_lib::run().await
}
