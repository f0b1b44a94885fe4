use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "casbridge")]
#[command(
    about = "Expose a content-addressed project store as a mountable filesystem for transfer agents"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Mount a bridge filesystem serving one transfer request")]
    Mount {
        #[arg(help = "Path to mount the bridge on")]
        mount_path: PathBuf,

        #[arg(long, help = "Transfer request this mount is associated with")]
        transfer_request_id: i64,
    },
    #[command(about = "Run the supervising daemon: control plane, shared mount, task monitor")]
    Daemon,
}
