#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tienda_admin_lib::run().await
}
