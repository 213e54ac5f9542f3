use crate::commands::options::{DriftOptions, DriftSubCommand};
use crate::commands::DriftCommand;
use crate::config::Config;
use crate::runtime::{Runtime, RuntimeMode};
use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

pub struct ServerCommand {
    config: PathBuf,
    lpid: u32,
    ip: Ipv4Addr,
}

impl ServerCommand {
    pub fn new(options: &DriftOptions) -> ServerCommand {
        match options.cmd.clone() {
            DriftSubCommand::Server { config, lpid, ip } => ServerCommand { config, lpid, ip },
            _ => panic!("Unexpected DriftSubCommand variant. Not a `Server` variant!"),
        }
    }
}

impl DriftCommand for ServerCommand {
    fn run(&mut self) -> io::Result<()> {
        let cfg = Config::load(&self.config)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{}", e)))?;
        let rt = Runtime::init(&cfg, RuntimeMode::Server, self.lpid, self.ip)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("{}", e)))?;
        // Serve until killed; the runtime's workers carry the load.
        loop {
            if rt.is_done() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(200));
        }
    }
}
