use drift::commands::controller_command::ControllerCommand;
use drift::commands::options::{DriftOptions, DriftSubCommand};
use drift::commands::server_command::ServerCommand;
use drift::commands::DriftCommand;
use structopt::StructOpt;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let options = DriftOptions::from_args();
    let result = match options.cmd {
        DriftSubCommand::Controller { .. } => ControllerCommand::new(&options).run(),
        DriftSubCommand::Server { .. } => ServerCommand::new(&options).run(),
    };
    if let Err(err) = result {
        eprintln!("driftd: {}", err);
        std::process::exit(1);
    }
}
