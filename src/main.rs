#[tokio::main]
async fn main() -> anyhow::Result<()> {
    surveillance_map_lib::run().await
}
