use std::env;

#[tokio::main]
async fn main() -> offline_sync::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().skip(1).collect();

    #[cfg(feature = "cli")]
    {
        let parsed = match offline_sync::cli::parse_args(&args) {
            Ok(parsed) => parsed,
            Err(message) => {
                eprintln!("Error: {message}");
                eprintln!();
                offline_sync::cli::print_usage();
                std::process::exit(1);
            }
        };
        offline_sync::cli::run(parsed).await
    }
    #[cfg(not(feature = "cli"))]
    {
        let _ = args;
        eprintln!("CLI support not compiled in");
        std::process::exit(1);
    }
}
