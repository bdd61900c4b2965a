use std::fs::{self, File};
use std::io::{self, BufReader};

use camino::Utf8Path;
use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};

use crate::error::{IoContext, ReproError, Result};

/// How a fetched file ends up in the interim directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnpackAction {
    Zip,
    Tgz,
    Tar,
    Gz,
    Tbz2,
    Compress,
    Copy,
}

impl UnpackAction {
    /// Guess the action from a file name.
    pub fn infer(file_name: &str) -> Self {
        let lower = file_name.to_ascii_lowercase();

        if lower.ends_with(".zip") {
            UnpackAction::Zip
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            UnpackAction::Tgz
        } else if lower.ends_with(".tar.bz2") || lower.ends_with(".tbz2") {
            UnpackAction::Tbz2
        } else if lower.ends_with(".tar") {
            UnpackAction::Tar
        } else if lower.ends_with(".gz") {
            UnpackAction::Gz
        } else if lower.ends_with(".z") {
            UnpackAction::Compress
        } else {
            UnpackAction::Copy
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnpackAction::Zip => "zip",
            UnpackAction::Tgz => "tgz",
            UnpackAction::Tar => "tar",
            UnpackAction::Gz => "gz",
            UnpackAction::Tbz2 => "tbz2",
            UnpackAction::Compress => "compress",
            UnpackAction::Copy => "copy",
        }
    }
}

/// Unpack `src` into the directory `dst`.
pub fn unpack(action: UnpackAction, src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    fs::create_dir_all(dst).at(dst)?;
    tracing::debug!("unpacking {} into {} ({})", src, dst, action.as_str());

    match action {
        UnpackAction::Zip => {
            let file = File::open(src).at(src)?;
            let mut archive = zip::ZipArchive::new(BufReader::new(file)).map_err(|e| {
                ReproError::engine(format!("Couldn't read zip archive '{src}': {e}"))
            })?;
            archive.extract(dst).map_err(|e| {
                ReproError::engine(format!("Couldn't extract zip archive '{src}': {e}"))
            })?;
        }
        UnpackAction::Tgz => {
            let file = File::open(src).at(src)?;
            tar::Archive::new(GzDecoder::new(BufReader::new(file)))
                .unpack(dst)
                .at(src)?;
        }
        UnpackAction::Tbz2 => {
            let file = File::open(src).at(src)?;
            tar::Archive::new(BzDecoder::new(BufReader::new(file)))
                .unpack(dst)
                .at(src)?;
        }
        UnpackAction::Tar => {
            let file = File::open(src).at(src)?;
            tar::Archive::new(BufReader::new(file)).unpack(dst).at(src)?;
        }
        UnpackAction::Gz => {
            let file_name = src.file_name().unwrap_or("unpacked.gz");
            let stem = file_name
                .strip_suffix(".gz")
                .or_else(|| file_name.strip_suffix(".GZ"))
                .unwrap_or(file_name);
            let out_path = dst.join(stem);

            let file = File::open(src).at(src)?;
            let mut decoder = GzDecoder::new(BufReader::new(file));
            let mut out = File::create(&out_path).at(&out_path)?;
            io::copy(&mut decoder, &mut out).at(src)?;
        }
        UnpackAction::Copy => {
            let file_name = src
                .file_name()
                .ok_or_else(|| ReproError::engine(format!("'{src}' has no file name")))?;
            let out_path = dst.join(file_name);
            fs::copy(src, &out_path).at(src)?;
        }
        UnpackAction::Compress => {
            return Err(ReproError::engine(format!(
                "Unpack action '{}' is not supported for '{}'",
                action.as_str(),
                src
            )));
        }
    }

    Ok(())
}
