use std::fmt::Display;
use std::fs;
use std::time::Instant;

use camino::Utf8Path;
use console::Style;

use crate::error::{IoContext, Result};

const ANSI_BLUE: Style = Style::new().blue();

pub(crate) fn as_overhead(s: Instant) -> impl Display {
    let e = Instant::now();
    let f = format!("(+{}ms)", e.duration_since(s).as_millis());
    ANSI_BLUE.apply_to(f)
}

/// Write `bytes` to `path` through a sibling temp file and a rename, so a
/// reader never observes a half-written record.
pub(crate) fn write_atomic(path: &Utf8Path, bytes: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent()
        && !dir.as_str().is_empty()
    {
        fs::create_dir_all(dir).at(dir)?;
    }

    let file_name = path.file_name().unwrap_or("record");
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));

    fs::write(&tmp, bytes).at(&tmp)?;
    fs::rename(&tmp, path).at(path)?;

    Ok(())
}

/// Delete a directory (if it exists) and recreate it empty.
pub(crate) fn clear_dir(dir: &Utf8Path) -> Result<()> {
    if fs::metadata(dir).is_ok() {
        fs::remove_dir_all(dir).at(dir)?;
    }

    fs::create_dir_all(dir).at(dir)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let path = root.join("nested/record.json");

        write_atomic(&path, b"{}").unwrap();
        write_atomic(&path, b"{\"a\":1}").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"a\":1}");
        let names: Vec<_> = root
            .join("nested")
            .read_dir_utf8()
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string())
            .collect();
        assert_eq!(names, vec!["record.json"]);
    }

    #[test]
    fn clear_dir_empties_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        fs::create_dir_all(root.join("dst/a/b")).unwrap();
        fs::write(root.join("dst/top.txt"), "top").unwrap();
        fs::write(root.join("dst/a/b/deep.txt"), "deep").unwrap();

        clear_dir(&root.join("dst")).unwrap();
        assert_eq!(root.join("dst").read_dir_utf8().unwrap().count(), 0);

        clear_dir(&root.join("fresh")).unwrap();
        assert!(root.join("fresh").is_dir());
    }
}
