mod apply;
mod validate;

pub use apply::ApplyCommand;
pub use validate::ValidateCommand;

use anyhow::Context;
use std::io::Read;
use std::path::PathBuf;

/// Read the spec from a file, or from stdin when the flag is `-`.
pub(crate) fn read_spec_file(file: &str) -> Result<String, anyhow::Error> {
    if file == "-" {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("reading campaign spec from stdin")?;
        return Ok(raw);
    }

    std::fs::read_to_string(file).with_context(|| format!("cannot open file {:?}", file))
}

/// `CAMPAIGNS_TMP_DIR` wins over the platform temp dir; the `--tmp` flag
/// wins over both.
pub(crate) fn default_temp_dir() -> PathBuf {
    std::env::var_os("CAMPAIGNS_TMP_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}

pub(crate) fn default_cache_dir() -> PathBuf {
    std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache")))
        .unwrap_or_else(std::env::temp_dir)
        .join("campaigner")
        .join("cache")
}
