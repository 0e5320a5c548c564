//! Write buffers to disk, creating parent directories on the way.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::error::EvalResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    Overwrite,
    Append,
}

/// Write `contents` to `path`.
pub fn write_to_file(
    contents: impl AsRef<[u8]>,
    path: &Path,
    mode: WriteMode,
) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut file = match mode {
        WriteMode::Overwrite => OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?,
        WriteMode::Append => OpenOptions::new().append(true).create(true).open(path)?,
    };
    file.write_all(contents.as_ref())?;
    file.flush()
}

/// Serialize `value` as pretty JSON and write it to `path`.
pub fn save_json<T: Serialize + ?Sized>(value: &T, path: &Path) -> EvalResult<()> {
    let text = serde_json::to_string_pretty(value)?;
    write_to_file(text, path, WriteMode::Overwrite)?;
    Ok(())
}
