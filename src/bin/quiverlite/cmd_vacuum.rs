use anyhow::{Context, Result};
use std::path::PathBuf;

use QuiverLite::VacuumSummary;

use super::util::open_storage;

/// CLI: vacuum — переписать файл компактно (требует writer, эксклюзивный lock).
pub fn exec(path: PathBuf, json: bool) -> Result<()> {
    let mut stg = open_storage(&path, false)?;
    let sum: VacuumSummary = stg
        .vacuum()
        .with_context(|| format!("vacuum {}", path.display()))?;
    stg.close()?;

    if json {
        println!("{}", serde_json::to_string(&sum)?);
        return Ok(());
    }

    println!("Vacuum summary:");
    println!("  tables       = {}", sum.tables);
    println!("  records      = {}", sum.records);
    println!("  pages        = {} -> {}", sum.pages_before, sum.pages_after);
    println!("  bytes        = {} -> {}", sum.bytes_before, sum.bytes_after);
    println!("  elapsed      = {} ms", sum.millis);
    Ok(())
}
