use {
    clap::Parser,
    log::info,
    std::path::PathBuf,
    tnfs::{
        fcall::{MAX_ROOT, TNFSD_PORT},
        io_err, res,
    },
    tokio::fs,
};

mod config;
mod directory;
mod dispatch;
mod file;
mod server;
mod session;
mod traverse;
mod utils;

use crate::server::{Server, ServerConfig};

#[derive(Debug, clap::Parser)]
struct Cli {
    /// Directory to serve as the TNFS root
    root: PathBuf,

    /// UDP and TCP port to listen on
    #[arg(short, long, default_value_t = TNFSD_PORT)]
    port: u16,

    /// Append log output to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

async fn tnfsd_main(Cli { root, port, .. }: Cli) -> tnfs::Result<i32> {
    if !fs::metadata(&root).await?.is_dir() {
        return res!(io_err!(InvalidInput, "root must be a directory"));
    }
    let realroot = fs::canonicalize(&root).await?;
    if realroot.as_os_str().len() > MAX_ROOT {
        return res!(io_err!(InvalidInput, "root path too long"));
    }

    info!("serving {} on port {}", realroot.display(), port);
    Server::new(ServerConfig {
        root,
        realroot,
        port,
    })
    .run()
    .await
    .and(Ok(0))
}

// One thread: every request is handled to completion on the same event
// loop, so per-session ordering needs no further coordination.
#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let mut logger = env_logger::Builder::from_default_env();
    if let Some(path) = &cli.log_file {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                logger.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => {
                eprintln!("Error: cannot open log file {}: {}", path.display(), e);
                std::process::exit(1);
            }
        }
    }
    logger.init();

    let exit_code = tnfsd_main(cli).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}
