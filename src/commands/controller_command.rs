use crate::commands::options::{DriftOptions, DriftSubCommand};
use crate::commands::DriftCommand;
use crate::ctrl::server::ControllerServer;
use std::io;

pub struct ControllerCommand {
    listen: String,
}

impl ControllerCommand {
    pub fn new(options: &DriftOptions) -> ControllerCommand {
        match options.cmd.clone() {
            DriftSubCommand::Controller { listen } => ControllerCommand { listen },
            _ => panic!("Unexpected DriftSubCommand variant. Not a `Controller` variant!"),
        }
    }
}

impl DriftCommand for ControllerCommand {
    fn run(&mut self) -> io::Result<()> {
        let addr = self
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{}", e)))?;
        let server = ControllerServer::bind(addr)?;
        server.run();
        Ok(())
    }
}
