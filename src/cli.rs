use clap::{Parser, Subcommand};

/// Vision Gateway — device authentication and rate-limited AI key vending
#[derive(Parser)]
#[command(name = "visiongw", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to bind
        #[arg(short, long, default_value = "8443")]
        port: u16,
    },

    /// Compute the demo fingerprint for a set of request signals
    /// (useful when correlating usage-tracking documents with a device)
    Fingerprint {
        #[arg(long)]
        ip: String,
        #[arg(long, default_value = "")]
        user_agent: String,
        /// device_info JSON as the client would send it
        #[arg(long, default_value = "{}")]
        device_info: String,
    },
}
