#[tokio::main]
async fn main() -> eyre::Result<()> {
    hl7_inbound::run().start().await
}
