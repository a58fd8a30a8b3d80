use clap::Parser;
use tracing::error;

use hemmer_provider_puppetca::{
    data_sources::data_sources, init_logging, new_factory, provider_address,
    resources::resources, serve, ServeOptions, PROVIDER_NAME, PROVIDER_VERSION,
};

/// Hemmer provider plugin for the Puppet certificate authority.
///
/// Normally launched by the host, not by hand.
#[derive(Debug, Parser)]
#[command(name = "hemmer-provider-puppetca")]
struct Cli {
    /// Wait for a debugger to attach and print reattach instructions
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    let factory = new_factory(PROVIDER_NAME, PROVIDER_VERSION, data_sources(), resources());
    let options = ServeOptions::new(provider_address(PROVIDER_NAME)).with_debug(cli.debug);

    if let Err(e) = serve(factory, options).await {
        error!(error = %e, "Provider exited");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
