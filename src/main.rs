use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Load .env early; ignore if missing.
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .with_target(false)
        .init();

    if let Err(err) = hexo_sync::run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
