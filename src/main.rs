#[tokio::main]
async fn main() {
    if let Err(err) = console_server::app::run().await {
        tracing::error!(error = %err, "console server stopped");
        eprintln!("console-server: {err}");
        std::process::exit(1);
    }
}
