use std::{io, path::PathBuf};

use clap::{Parser, Subcommand};
use ipk_unpack::{Extractor, LogEventHandler};

#[derive(Parser, Debug)]
struct Args {
    /// Package file.
    package: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the `control` file.
    Control,

    /// Extract the metadata files to a directory.
    ControlFiles {
        /// Prefix for the names of the extracted files.
        #[arg(short, long, default_value = "")]
        prefix: String,

        target: PathBuf,
    },

    /// Extract the data files to a directory.
    Data { target: PathBuf },

    /// Print the paths of the data files.
    List,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let extractor = Extractor::new(&args.package).event_handler(LogEventHandler);

    match args.command {
        Command::Control => extractor.control_file_to_stream(&mut io::stdout().lock())?,

        Command::ControlFiles { prefix, target } => {
            extractor.control_files_to_dir_with_prefix(&target, prefix)?
        }

        Command::Data { target } => extractor.data_files_to_dir(&target)?,

        Command::List => extractor.data_file_names_to_stream(&mut io::stdout().lock())?,
    }

    Ok(())
}
