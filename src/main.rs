mod cli;
mod logger;
mod spinner;

use anyhow::Result;
use tracing::{error, info};

fn main() -> Result<()> {
    let cli = cli::parse();
    logger::init(cli.verbose)?;
    info!(args = ?std::env::args().collect::<Vec<_>>(), "cephbox start");

    match cli::run(cli) {
        Ok(result) => {
            info!("cephbox finished successfully");
            Ok(result)
        }
        Err(err) => {
            error!(error = ?err, "cephbox failed");
            Err(err)
        }
    }
}
