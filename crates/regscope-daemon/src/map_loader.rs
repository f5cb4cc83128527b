//! Register map files

use anyhow::{Context, Result};
use regscope_core::RegisterMap;
use std::path::Path;
use tracing::info;

/// Read, parse and validate a register map JSON file
pub fn load_register_map(path: &Path) -> Result<RegisterMap> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read register map {}", path.display()))?;
    let map = RegisterMap::from_json(&content)
        .with_context(|| format!("Failed to parse register map {}", path.display()))?;
    map.validate()
        .with_context(|| format!("Invalid register map {}", path.display()))?;

    info!(
        path = %path.display(),
        name = %map.name,
        registers = map.registers.len(),
        "Loaded register map"
    );
    Ok(map)
}
