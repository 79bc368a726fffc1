// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! `wtar`/`unwtar`: tar+bzip2 packing of a directory into a single
//! archive, split into `.wtar.aa`, `.wtar.ab`, … parts when the packed
//! size exceeds [`SPLIT_THRESHOLD`].

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use thiserror::Error;

/// Archives larger than 100 MiB are split into lettered parts, mirroring
/// the source's split-archive convention.
pub const SPLIT_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Pack `src` (a file or directory) into `trg` (defaulting to
/// `<src>.wtar`), splitting into `.wtar.aa`, `.wtar.ab`, … parts if the
/// packed size exceeds [`SPLIT_THRESHOLD`].
pub fn wtar(src: &Path, trg: Option<&Path>) -> Result<(), Error> {
    let target = trg
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("{}.wtar", src.display())));

    let packed = fs::File::create(&target).map_err(|e| Error::Io(target.display().to_string(), e))?;
    let encoder = BzEncoder::new(packed, Compression::best());
    let mut builder = tar::Builder::new(encoder);

    let name = src
        .file_name()
        .ok_or_else(|| Error::InvalidPath(src.display().to_string()))?;

    if src.is_dir() {
        builder
            .append_dir_all(name, src)
            .map_err(|e| Error::Io(src.display().to_string(), e))?;
    } else {
        let mut file = fs::File::open(src).map_err(|e| Error::Io(src.display().to_string(), e))?;
        builder
            .append_file(name, &mut file)
            .map_err(|e| Error::Io(src.display().to_string(), e))?;
    }

    let encoder = builder.into_inner().map_err(|e| Error::Io(target.display().to_string(), e))?;
    encoder.finish().map_err(|e| Error::Io(target.display().to_string(), e))?;

    split_if_needed(&target)
}

fn split_if_needed(target: &Path) -> Result<(), Error> {
    let size = fs::metadata(target).map_err(|e| Error::Io(target.display().to_string(), e))?.len();
    if size <= SPLIT_THRESHOLD {
        return Ok(());
    }

    let mut input = fs::File::open(target).map_err(|e| Error::Io(target.display().to_string(), e))?;
    let mut buf = vec![0u8; SPLIT_THRESHOLD as usize];
    let mut part = 0usize;

    loop {
        let read = input.read(&mut buf).map_err(|e| Error::Io(target.display().to_string(), e))?;
        if read == 0 {
            break;
        }
        let suffix = part_suffix(part);
        let part_path = target.with_extension(format!("wtar.{suffix}"));
        fs::write(&part_path, &buf[..read]).map_err(|e| Error::Io(part_path.display().to_string(), e))?;
        part += 1;
    }

    fs::remove_file(target).map_err(|e| Error::Io(target.display().to_string(), e))
}

fn part_suffix(index: usize) -> String {
    let first = (b'a' + (index / 26) as u8) as char;
    let second = (b'a' + (index % 26) as u8) as char;
    format!("{first}{second}")
}

/// Unpack a `.wtar` or the first split part (`.wtar.aa`) of `src` into
/// `trg` (defaulting to `src` with the `.wtar[...]` suffix stripped).
/// `no_artifacts` removes the archive (and any split parts) after a
/// successful unpack.
pub fn unwtar(src: &Path, trg: Option<&Path>, no_artifacts: bool) -> Result<(), Error> {
    let target_dir = trg.map(PathBuf::from).unwrap_or_else(|| strip_wtar_suffix(src));
    fs::create_dir_all(&target_dir).map_err(|e| Error::Io(target_dir.display().to_string(), e))?;

    let parts = collect_parts(src)?;
    let mut concatenated = Vec::new();
    for part in &parts {
        let mut buf = Vec::new();
        fs::File::open(part)
            .and_then(|mut f| f.read_to_end(&mut buf))
            .map_err(|e| Error::Io(part.display().to_string(), e))?;
        concatenated.extend(buf);
    }

    let decoder = BzDecoder::new(concatenated.as_slice());
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(&target_dir)
        .map_err(|e| Error::Io(target_dir.display().to_string(), e))?;

    if no_artifacts {
        for part in &parts {
            let _ = fs::remove_file(part);
        }
    }

    Ok(())
}

fn strip_wtar_suffix(src: &Path) -> PathBuf {
    let name = src.to_string_lossy();
    let stripped = name
        .strip_suffix(".wtar")
        .or_else(|| {
            let pos = name.rfind(".wtar.")?;
            Some(&name[..pos])
        })
        .unwrap_or(&name);
    PathBuf::from(stripped)
}

fn collect_parts(src: &Path) -> Result<Vec<PathBuf>, Error> {
    let name = src.to_string_lossy();
    if !name.ends_with(".wtar.aa") {
        return Ok(vec![src.to_path_buf()]);
    }

    let base = name.trim_end_matches(".aa").to_string();
    let dir = src.parent().unwrap_or_else(|| Path::new("."));
    let mut parts = Vec::new();
    let mut index = 0usize;
    loop {
        let candidate = PathBuf::from(format!("{base}.{}", part_suffix(index)));
        if candidate.exists() {
            parts.push(candidate);
            index += 1;
        } else {
            break;
        }
    }
    if parts.is_empty() {
        return Err(Error::Io(
            dir.display().to_string(),
            std::io::Error::new(std::io::ErrorKind::NotFound, "no split parts found"),
        ));
    }
    Ok(parts)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error at {0}")]
    Io(String, #[source] std::io::Error),
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn wtar_then_unwtar_round_trips_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("payload");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("a.txt"), b"hello").unwrap();
        fs::write(src.join("nested/b.txt"), b"world").unwrap();

        let archive = dir.path().join("payload.wtar");
        wtar(&src, Some(&archive)).unwrap();
        assert!(archive.exists());

        let out = dir.path().join("out");
        unwtar(&archive, Some(&out), false).unwrap();

        assert_eq!(fs::read(out.join("payload/a.txt")).unwrap(), b"hello");
        assert_eq!(fs::read(out.join("payload/nested/b.txt")).unwrap(), b"world");
    }

    #[test]
    fn part_suffix_cycles_through_letters() {
        assert_eq!(part_suffix(0), "aa");
        assert_eq!(part_suffix(1), "ab");
        assert_eq!(part_suffix(26), "ba");
    }
}
