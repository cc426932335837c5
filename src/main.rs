use botwarden::core::terminal;

#[tokio::main]
async fn main() {
    if let Err(e) = botwarden::cli::run_main().await {
        terminal::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
