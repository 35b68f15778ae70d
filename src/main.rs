#[tokio::main]
async fn main() -> anyhow::Result<()> {
    zengate_lib::run().await
}
