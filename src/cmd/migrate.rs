//! `kiln migrate`.

use anyhow::{Context, Result};

use kiln::config::KilnConfig;
use kiln::store::Db;

pub fn cmd_migrate(config: &KilnConfig) -> Result<()> {
    let path = &config.database.path;
    Db::open(path, config.database.busy_timeout())
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    println!("Database ready at {}", path.display());
    Ok(())
}
