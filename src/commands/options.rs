use std::net::Ipv4Addr;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(StructOpt, Clone, Debug)]
#[structopt(
    name = "driftd",
    about = "Distributed runtime that executes applications as fleets of migratable proclets"
)]
pub struct DriftOptions {
    #[structopt(subcommand)]
    pub cmd: DriftSubCommand,
}

#[derive(StructOpt, Clone, Debug)]
pub enum DriftSubCommand {
    /// Run the cluster controller.
    Controller {
        /// Address to listen on, e.g. 0.0.0.0:9500.
        #[structopt(default_value = "0.0.0.0:9500")]
        listen: String,
    },
    /// Run a server node hosting proclets.
    Server {
        /// Path to the JSON runtime configuration.
        #[structopt(parse(from_os_str))]
        config: PathBuf,
        /// Logical process to join; 0 allocates a fresh one.
        #[structopt(long, default_value = "0")]
        lpid: u32,
        /// Address this node advertises to its peers.
        #[structopt(long, default_value = "127.0.0.1")]
        ip: Ipv4Addr,
    },
}
