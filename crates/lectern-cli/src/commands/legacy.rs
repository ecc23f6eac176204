use std::path::Path;

use lectern_core::sync::{import_legacy, SqliteLegacyImporter};

use crate::commands::common::open_store;
use crate::error::CliError;

pub async fn run_import_legacy(legacy_path: &Path, db_path: &Path) -> Result<(), CliError> {
    if !legacy_path.is_file() {
        return Err(CliError::LegacyStoreMissing(
            legacy_path.display().to_string(),
        ));
    }

    let store = open_store(db_path).await?;
    let report = import_legacy(&store, &SqliteLegacyImporter::new(legacy_path)).await?;
    if report.already_complete {
        println!("Legacy import already completed");
    } else {
        println!(
            "Imported {} document(s), skipped {}",
            report.imported, report.skipped
        );
    }
    Ok(())
}
