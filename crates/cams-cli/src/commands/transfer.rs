//! Export and import of the whole catalog

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use cams_core::{Catalog, RecordSet};

use crate::output::Output;
use crate::prompt::confirm;
use crate::remote::Remote;

/// Write the catalog as a JSON array (`-` for stdout)
pub fn export(catalog: &Catalog, path: PathBuf, output: &Output) -> Result<()> {
    let records = catalog.records()?;
    let json = records
        .to_json_pretty()
        .context("Failed to encode catalog")?;

    if path == Path::new("-") {
        println!("{}", json);
        return Ok(());
    }

    std::fs::write(&path, json)
        .with_context(|| format!("Failed to write export file: {:?}", path))?;
    output.success(&format!(
        "Exported {} record(s) to {}",
        records.len(),
        path.display()
    ));
    Ok(())
}

/// Replace the catalog with the records in a JSON file
pub async fn import(
    catalog: &Catalog,
    remote: &mut Remote,
    path: PathBuf,
    yes: bool,
    output: &Output,
) -> Result<()> {
    let records = read_records(&path)?;

    let existing = catalog.count()?;
    if existing > 0
        && !yes
        && !confirm(&format!(
            "Replace {} existing record(s) with {} imported?",
            existing,
            records.len()
        ))?
    {
        output.message("Cancelled. Use --yes to skip confirmation.");
        return Ok(());
    }

    let count = records.len();
    let records = catalog.replace_all(records)?;
    remote.push(records, output).await;

    output.success(&format!("Imported {} record(s)", count));
    Ok(())
}

fn read_records(path: &Path) -> Result<RecordSet> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read import file: {:?}", path))?;
    RecordSet::from_json(&bytes)
        .with_context(|| format!("Import file is not a record array: {:?}", path))
}
