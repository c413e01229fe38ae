use clap::Parser;

#[tokio::main]
async fn main() {
    let opts = spectre::cli::Opts::parse();
    let code = spectre::app::run(opts).await;
    std::process::exit(code);
}
