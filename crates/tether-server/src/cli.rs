use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "tether-server", about = "Tether real-time event gateway")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/tether.toml")]
    pub config: String,

    /// Bind address (overrides config)
    #[arg(long)]
    pub bind: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Issue an identity token signed with the configured secret
    IssueToken {
        /// Identifier entries as KEY=VALUE pairs. Must include the stable
        /// identifier key (default "id").
        #[arg(short, long = "identifier", value_name = "KEY=VALUE")]
        identifiers: Vec<String>,
    },
}
