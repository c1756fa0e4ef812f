#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tap_node::run_node().await
}
