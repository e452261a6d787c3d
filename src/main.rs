use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = mcphub::Cli::parse();
    mcphub::init_tracing(cli.log_format, cli.log_file.as_deref());

    let code = match mcphub::run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("mcphub: {e:#}");
            1
        }
    };

    // The stdin reader is a blocking thread the runtime would wait on.
    std::process::exit(code);
}
