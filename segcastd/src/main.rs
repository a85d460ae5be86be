use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = segcastd::Cli::parse();
    if let Err(err) = segcastd::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
